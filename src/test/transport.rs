use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use parking_lot::RwLock;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;
use tracing::debug;

use crate::error::TransportError;
use crate::router::ID_FIELD;
use crate::traits::Transport;
use crate::types::Progress;
use crate::types::ProgressSink;
use crate::types::TransportRequest;
use crate::types::TransportResponse;
use crate::types::Verb;

/// What the next call gets instead of a regular answer.
#[derive(Debug, Clone)]
pub enum Scripted {
    Fail(TransportError),
    Respond(u16, String),
}

/// Entity store living in memory, speaking the wire format of the entity manager.
///
/// Every request is recorded. Calls take [`latency`](Self::with_latency) to complete, which makes it possible to
/// observe how many of them overlap.
#[derive(Debug)]
pub struct MockTransport {
    latency:  Duration,
    entities: RwLock<Map<String, Value>>,
    hidden:   RwLock<HashSet<String>>,
    scripted: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<TransportRequest>>,
    active:   AtomicUsize,
    peak:     AtomicUsize,
    next_id:  AtomicUsize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            latency:  Duration::from_millis(50),
            entities: RwLock::new(Map::new()),
            hidden:   RwLock::new(HashSet::new()),
            scripted: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            active:   AtomicUsize::new(0),
            peak:     AtomicUsize::new(0),
            next_id:  AtomicUsize::new(1),
        }
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Seed the store. Every entity gets its id as the `_id` field.
    pub fn with_entities<I, S>(self, entities: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        for (id, entity) in entities {
            self.insert(id.into(), entity);
        }
        self
    }

    /// `count` entities named `{prefix}{n}`.
    pub fn with_generated(self, prefix: &str, count: usize) -> Self {
        self.with_entities((0..count).map(|n| (format!("{prefix}{n}"), json!({ "n": n }))))
    }

    pub fn insert(&self, id: String, mut entity: Value) {
        if let Value::Object(fields) = &mut entity {
            fields.insert(ID_FIELD.to_string(), Value::String(id.clone()));
        }
        self.entities.write().insert(id, entity);
    }

    /// The entity stays in the store but batch reads won't return it.
    pub fn hide(&self, id: impl Into<String>) {
        self.hidden.write().insert(id.into());
    }

    pub fn script(&self, scripted: Scripted) {
        self.scripted.lock().push_back(scripted);
    }

    pub fn fail_next(&self, error: TransportError) {
        self.script(Scripted::Fail(error));
    }

    pub fn respond_next(&self, status: u16, body: impl Into<String>) {
        self.script(Scripted::Respond(status, body.into()));
    }

    pub fn entity(&self, id: &str) -> Option<Value> {
        self.entities.read().get(id).cloned()
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Requests of the given verb.
    pub fn requests_of(&self, verb: Verb) -> Vec<TransportRequest> {
        self.requests.lock().iter().filter(|r| r.verb == verb).cloned().collect()
    }

    /// Ids asked for by every batch read, in the order the reads were sent.
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.requests_of(Verb::Read)
            .iter()
            .filter_map(|r| r.json_body())
            .filter_map(|body| {
                body.get("ids").and_then(Value::as_array).map(|ids| {
                    ids.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
            })
            .collect()
    }

    /// Highest number of calls that were in progress simultaneously.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn answer(&self, request: &TransportRequest) -> TransportResponse {
        let body = request.json_body().unwrap_or(Value::Null);
        let (status, answer) = match request.verb {
            Verb::Read => self.read(&request.url, &body),
            Verb::Create => self.create(body),
            Verb::Update => self.update(&request.url, &body),
            Verb::Delete => self.delete(&request.url, &body),
        };
        TransportResponse::json(status, &answer)
    }

    fn read(&self, url: &str, body: &Value) -> (u16, Value) {
        let entities = self.entities.read();
        let hidden = self.hidden.read();

        if let Some(ids) = body.get("ids").and_then(Value::as_array) {
            let found = ids
                .iter()
                .filter_map(Value::as_str)
                .filter(|id| !hidden.contains(*id))
                .filter_map(|id| entities.get(id).map(|e| (id.to_string(), e.clone())))
                .collect::<Map<_, _>>();
            (200, Value::Object(found))
        }
        else if let Some(query) = body.get("query") {
            let found = entities
                .values()
                .filter(|e| matches(e, query))
                .cloned()
                .collect::<Vec<_>>();
            (200, Value::Array(found))
        }
        else {
            match entities.get(last_segment(url)) {
                Some(entity) => (200, entity.clone()),
                None => (404, json!({ "error": "not found" })),
            }
        }
    }

    fn create(&self, body: Value) -> (u16, Value) {
        let items = match body {
            Value::Array(items) => items,
            other => vec![other],
        };
        let ids = items
            .into_iter()
            .map(|item| {
                let id = item
                    .get(ID_FIELD)
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("new-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
                self.insert(id.clone(), item);
                Value::String(id)
            })
            .collect::<Vec<_>>();
        (200, json!({ "ids": ids }))
    }

    // Ids addressed by a write: explicit ids, a query, or the last segment of the url.
    fn targets(&self, url: &str, body: &Value) -> Vec<String> {
        let entities = self.entities.read();
        if let Some(ids) = body.get("ids").and_then(Value::as_array) {
            ids.iter().filter_map(Value::as_str).map(str::to_string).collect()
        }
        else if let Some(query) = body.get("query") {
            entities
                .iter()
                .filter(|(_, e)| matches(e, query))
                .map(|(id, _)| id.clone())
                .collect()
        }
        else {
            vec![last_segment(url).to_string()]
        }
    }

    fn update(&self, url: &str, body: &Value) -> (u16, Value) {
        let targets = self.targets(url, body);
        let update = body.get("update").and_then(Value::as_object).cloned().unwrap_or_default();
        let mut entities = self.entities.write();
        let mut updated = 0;
        for id in targets {
            if let Some(Value::Object(fields)) = entities.get_mut(&id) {
                fields.extend(update.clone());
                updated += 1;
            }
        }
        (200, json!({ "updated": updated }))
    }

    fn delete(&self, url: &str, body: &Value) -> (u16, Value) {
        let targets = self.targets(url, body);
        let mut entities = self.entities.write();
        let deleted = targets.iter().filter(|id| entities.remove(id.as_str()).is_some()).count();
        (200, json!({ "deleted": deleted }))
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        request: TransportRequest,
        progress: ProgressSink,
    ) -> Result<TransportResponse, TransportError> {
        self.requests.lock().push(request.clone());
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        debug!(verb = %request.verb, url = %request.url, active, "mock call started");

        tokio::time::sleep(self.latency).await;

        let scripted = self.scripted.lock().pop_front();
        let outcome = match scripted {
            Some(Scripted::Fail(err)) => Err(err),
            Some(Scripted::Respond(status, body)) => Ok(TransportResponse::new(status, body)),
            None => Ok(self.answer(&request)),
        };

        if let Ok(response) = &outcome {
            let size = response.body.len() as u64;
            progress.report(Progress {
                loaded: size,
                total:  Some(size),
            });
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

fn last_segment(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

fn matches(entity: &Value, query: &Value) -> bool {
    match query.as_object() {
        Some(query) => query.iter().all(|(field, expected)| entity.get(field) == Some(expected)),
        None => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn serves_wire_format() {
        let transport = MockTransport::new().with_entities([("a", json!({ "kind": "wall" })), ("b", json!({}))]);

        let request = TransportRequest::new(Verb::Read, "/api").with_body(json!({ "ids": ["a", "zz"] }).to_string());
        let response = transport.send(request, ProgressSink::new()).await.unwrap();
        let body: Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body, json!({ "a": { "kind": "wall", "_id": "a" } }));

        let request = TransportRequest::new(Verb::Read, "/api").with_body(json!({ "query": { "kind": "wall" } }).to_string());
        let response = transport.send(request, ProgressSink::new()).await.unwrap();
        let body: Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body.as_array().map(Vec::len), Some(1));

        let request = TransportRequest::new(Verb::Delete, "/api/b");
        transport.send(request, ProgressSink::new()).await.unwrap();
        assert!(transport.entity("b").is_none());
        assert_eq!(transport.request_count(), 3);
        assert_eq!(transport.batches(), vec![vec!["a".to_string(), "zz".to_string()]]);
    }

    #[tokio::test(start_paused = true)]
    async fn scripted_answers() {
        let transport = MockTransport::new();
        transport.fail_next(TransportError::timeout("too slow"));
        transport.respond_next(503, "busy");

        let request = TransportRequest::new(Verb::Read, "/api/x");
        assert!(transport.send(request.clone(), ProgressSink::new()).await.is_err());
        assert_eq!(transport.send(request.clone(), ProgressSink::new()).await.unwrap().status, 503);
        assert_eq!(transport.send(request, ProgressSink::new()).await.unwrap().status, 404);
    }
}
