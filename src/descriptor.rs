use std::time::Instant;

use serde_json::json;
use serde_json::Map;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::FetchError;
use crate::types::OpKind;
use crate::types::ProgressSink;
use crate::types::ResponseBody;
use crate::types::ResponseType;
use crate::types::Selector;
use crate::types::TransportRequest;

pub(crate) type Reply = oneshot::Sender<Result<ResponseBody, FetchError>>;

// How a finished request gets back to whoever asked for it.
#[derive(Debug)]
pub(crate) enum Completion {
    // An aggregated batch read. Results go into the cache; callers are resolved by the waiting registry.
    Bunch { keys: Vec<String> },
    // Everything else: the caller gets the routed response as is.
    Reply(Reply),
}

/// Kind, url and payload of an operation, before it gets an id and a place in the queue.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Target {
    pub(crate) kind:    OpKind,
    pub(crate) url:     String,
    pub(crate) payload: Option<Value>,
}

#[derive(Debug)]
pub(crate) struct RequestDescriptor {
    pub(crate) id:            u64,
    pub(crate) created_at:    Instant,
    pub(crate) kind:          OpKind,
    pub(crate) url:           String,
    pub(crate) payload:       Option<Value>,
    pub(crate) response_type: ResponseType,
    pub(crate) progress:      ProgressSink,
    pub(crate) completion:    Completion,
}

impl RequestDescriptor {
    pub(crate) fn new(
        id: u64,
        target: Target,
        response_type: ResponseType,
        progress: ProgressSink,
        completion: Completion,
    ) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            kind: target.kind,
            url: target.url,
            payload: target.payload,
            response_type,
            progress,
            completion,
        }
    }

    /// The caller dropped its end before the request was sent.
    pub(crate) fn is_retracted(&self) -> bool {
        matches!(&self.completion, Completion::Reply(reply) if reply.is_closed())
    }

    pub(crate) fn transport_request(&self) -> TransportRequest {
        TransportRequest {
            verb:          self.kind.verb(),
            url:           self.url.clone(),
            body:          self.payload.as_ref().map(|p| encode_body(p, self.response_type)),
            response_type: self.response_type,
        }
    }
}

// JSON responses get JSON bodies. Otherwise a string payload is sent raw.
fn encode_body(payload: &Value, response_type: ResponseType) -> String {
    match (response_type, payload) {
        (ResponseType::Json, p) => p.to_string(),
        (_, Value::String(raw)) => raw.clone(),
        (_, p) => p.to_string(),
    }
}

fn item_url(base: &str, id: &str) -> String {
    format!("{}/{id}", base.trim_end_matches('/'))
}

fn target(kind: OpKind, url: impl Into<String>, payload: Option<Value>) -> Target {
    Target {
        kind,
        url: url.into(),
        payload,
    }
}

fn with_projection(mut payload: Map<String, Value>, projection: Option<Value>) -> Value {
    if let Some(projection) = projection {
        payload.insert("projection".to_string(), projection);
    }
    Value::Object(payload)
}

pub(crate) fn create(base: &str, data: Value) -> Result<Target, FetchError> {
    match data {
        Value::Object(_) => Ok(target(OpKind::CreateOne, base, Some(data))),
        Value::Array(ref items) if items.is_empty() => Err(FetchError::InvalidInput("nothing to create".to_string())),
        Value::Array(_) => Ok(target(OpKind::CreateMany, base, Some(data))),
        other => Err(FetchError::InvalidInput(format!("cannot create an entity from {other}"))),
    }
}

pub(crate) fn read_many(base: &str, ids: &[String]) -> Target {
    target(OpKind::ReadMany, base, Some(json!({ "ids": ids })))
}

/// Where for a non-empty query, All otherwise.
pub(crate) fn read_query(base: &str, query: Option<Map<String, Value>>, projection: Option<Value>) -> Target {
    let query = query.unwrap_or_default();
    let kind = if query.is_empty() {
        OpKind::ReadAll
    }
    else {
        OpKind::ReadWhere
    };
    let mut payload = Map::new();
    payload.insert("query".to_string(), Value::Object(query));
    target(kind, base, Some(with_projection(payload, projection)))
}

pub(crate) fn update(base: &str, selector: Selector, update: Value) -> Target {
    match selector {
        Selector::One(id) => target(OpKind::UpdateOne, item_url(base, &id), Some(json!({ "update": update }))),
        Selector::Many(ids) => target(OpKind::UpdateMany, base, Some(json!({ "ids": ids, "update": update }))),
        Selector::Where(query) => target(OpKind::UpdateWhere, base, Some(json!({ "query": query, "update": update }))),
        Selector::All => target(OpKind::UpdateAll, base, Some(json!({ "query": {}, "update": update }))),
    }
}

pub(crate) fn delete(base: &str, selector: Selector) -> Target {
    match selector {
        Selector::One(id) => target(OpKind::DeleteOne, item_url(base, &id), None),
        Selector::Many(ids) => target(OpKind::DeleteMany, base, Some(json!({ "ids": ids }))),
        Selector::Where(query) => target(OpKind::DeleteWhere, base, Some(json!({ "query": query }))),
        Selector::All => target(OpKind::DeleteAll, base, Some(json!({ "query": {} }))),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::Verb;

    fn query(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn read_payloads() {
        let t = read_many("/api/objects", &["a".to_string(), "b".to_string()]);
        assert_eq!(t.kind, OpKind::ReadMany);
        assert_eq!(t.payload, Some(json!({ "ids": ["a", "b"] })));

        let t = read_query("/api/objects", Some(query(json!({ "kind": "wall" }))), Some(json!({ "name": 1 })));
        assert_eq!(t.kind, OpKind::ReadWhere);
        assert_eq!(t.payload, Some(json!({ "query": { "kind": "wall" }, "projection": { "name": 1 } })));

        let t = read_query("/api/objects", None, None);
        assert_eq!(t.kind, OpKind::ReadAll);
        assert_eq!(t.payload, Some(json!({ "query": {} })));
    }

    #[test]
    fn write_payloads() {
        let t = update("/api/objects/", Selector::One("a".into()), json!({ "name": "x" }));
        assert_eq!(t.kind, OpKind::UpdateOne);
        assert_eq!(t.url, "/api/objects/a");
        assert_eq!(t.payload, Some(json!({ "update": { "name": "x" } })));

        let t = update("/api/objects", Selector::Many(vec!["a".into(), "b".into()]), json!({ "v": 1 }));
        assert_eq!(t.payload, Some(json!({ "ids": ["a", "b"], "update": { "v": 1 } })));

        let t = update("/api/objects", Selector::All, json!({ "v": 1 }));
        assert_eq!(t.kind, OpKind::UpdateAll);
        assert_eq!(t.payload, Some(json!({ "query": {}, "update": { "v": 1 } })));

        let t = delete("/api/objects", Selector::One("a".into()));
        assert_eq!((t.kind, t.url.as_str(), t.payload), (OpKind::DeleteOne, "/api/objects/a", None));

        let t = delete("/api/objects", Selector::Where(query(json!({ "v": 1 }))));
        assert_eq!(t.kind, OpKind::DeleteWhere);
        assert_eq!(t.payload, Some(json!({ "query": { "v": 1 } })));
    }

    #[test]
    fn create_shapes() {
        assert_eq!(create("/c", json!({ "a": 1 })).unwrap().kind, OpKind::CreateOne);
        assert_eq!(create("/c", json!([{ "a": 1 }, { "a": 2 }])).unwrap().kind, OpKind::CreateMany);
        assert!(create("/c", json!([])).is_err());
        assert!(create("/c", json!("nope")).is_err());
    }

    #[test]
    fn body_encoding() {
        let (tx, _rx) = oneshot::channel();
        let descriptor = RequestDescriptor::new(
            1,
            read_many("/api/objects", &["a".to_string()]),
            ResponseType::Json,
            ProgressSink::new(),
            Completion::Reply(tx),
        );
        let request = descriptor.transport_request();
        assert_eq!(request.verb, Verb::Read);
        assert_eq!(request.json_body(), Some(json!({ "ids": ["a"] })));

        assert_eq!(encode_body(&json!("raw bytes"), ResponseType::Blob), "raw bytes");
        assert_eq!(encode_body(&json!("raw bytes"), ResponseType::Json), "\"raw bytes\"");
    }
}
