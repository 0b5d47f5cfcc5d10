use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use strum::AsRefStr;
use strum::Display;
use tokio::sync::mpsc;

use crate::error::FetchError;

/// A fetched entity. Entities are plain data, shared between the cache and every caller that asked for them.
pub type Entity = Arc<Value>;

/// Entities by their identifiers.
pub type EntityMap = HashMap<String, Entity>;

/// Where progress events of a request are delivered to.
pub type ProgressSender = mpsc::UnboundedSender<Progress>;

/// HTTP-like verb of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
pub enum Verb {
    #[strum(serialize = "POST")]
    Create,
    #[strum(serialize = "GET")]
    Read,
    #[strum(serialize = "PUT")]
    Update,
    #[strum(serialize = "DELETE")]
    Delete,
}

/// Operation kind of a request descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum OpKind {
    CreateOne,
    CreateMany,
    ReadOne,
    ReadMany,
    ReadWhere,
    ReadAll,
    UpdateOne,
    UpdateMany,
    UpdateWhere,
    UpdateAll,
    DeleteOne,
    DeleteMany,
    DeleteWhere,
    DeleteAll,
}

impl OpKind {
    pub fn verb(&self) -> Verb {
        match self {
            Self::CreateOne | Self::CreateMany => Verb::Create,
            Self::ReadOne | Self::ReadMany | Self::ReadWhere | Self::ReadAll => Verb::Read,
            Self::UpdateOne | Self::UpdateMany | Self::UpdateWhere | Self::UpdateAll => Verb::Update,
            Self::DeleteOne | Self::DeleteMany | Self::DeleteWhere | Self::DeleteAll => Verb::Delete,
        }
    }
}

/// Declared content type of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    #[default]
    Json,
    ArrayBuffer,
    Blob,
    Text,
    Default,
}

/// Order in which the dispatcher takes queued requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueDiscipline {
    /// Oldest request first.
    #[default]
    Fifo,
    /// Most recently submitted request first.
    Lifo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub loaded: u64,
    pub total:  Option<u64>,
}

/// Fan-out of progress events to everybody interested in a request.
///
/// Subscribers whose receiving end is gone are dropped on the next report.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    subscribers: Arc<Mutex<Vec<ProgressSender>>>,
}

impl ProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_subscribers(subscribers: Vec<ProgressSender>) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(subscribers)),
        }
    }

    pub fn subscribe(&self, subscriber: ProgressSender) {
        self.subscribers.lock().push(subscriber);
    }

    pub fn report(&self, progress: Progress) {
        self.subscribers.lock().retain(|tx| tx.send(progress).is_ok());
    }

    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.lock().is_empty()
    }
}

impl From<Option<ProgressSender>> for ProgressSink {
    fn from(subscriber: Option<ProgressSender>) -> Self {
        Self::with_subscribers(subscriber.into_iter().collect())
    }
}

/// What a transport is asked to do. Two requests with equal verb, url and body are considered duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportRequest {
    pub verb:          Verb,
    pub url:           String,
    pub body:          Option<String>,
    pub response_type: ResponseType,
}

impl TransportRequest {
    pub fn new(verb: Verb, url: impl Into<String>) -> Self {
        Self {
            verb,
            url: url.into(),
            body: None,
            response_type: ResponseType::default(),
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_response_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Parse the body back into JSON, if there is one and it is JSON.
    pub fn json_body(&self) -> Option<Value> {
        self.body.as_deref().and_then(|b| serde_json::from_str(b).ok())
    }
}

/// A completed transport call: status code and raw body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body:   Vec<u8>,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn json(status: u16, body: &Value) -> Self {
        Self::new(status, body.to_string())
    }
}

/// A response body parsed according to its declared type.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    Bytes(Vec<u8>),
    Text(String),
}

impl ResponseBody {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_json(self) -> Option<Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }
}

/// Which entities an operation targets.
///
/// This is the typed counterpart of passing "an id, a list of ids, or a query object" around: the shape is sniffed
/// once, when a selector is built, and every operation dispatches on the variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    One(String),
    Many(Vec<String>),
    Where(Map<String, Value>),
    All,
}

impl Selector {
    /// A single id becomes [`Selector::One`], more become [`Selector::Many`]. Duplicates are collapsed, first
    /// occurrence wins.
    pub fn ids<I, S>(ids: I) -> Result<Self, FetchError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut ids = ids
            .into_iter()
            .map(Into::into)
            .filter(|id| seen.insert(id.clone()))
            .collect::<Vec<String>>();

        match ids.len() {
            0 => Err(FetchError::InvalidInput("empty list of ids".to_string())),
            1 => Ok(Self::One(ids.remove(0))),
            _ => Ok(Self::Many(ids)),
        }
    }

    /// An empty query means "all".
    pub fn query(query: Map<String, Value>) -> Self {
        if query.is_empty() {
            Self::All
        }
        else {
            Self::Where(query)
        }
    }

    /// Identifiers addressed by this selector, empty for queries.
    pub fn keys(&self) -> Vec<String> {
        match self {
            Self::One(id) => vec![id.clone()],
            Self::Many(ids) => ids.clone(),
            Self::Where(_) | Self::All => Vec::new(),
        }
    }
}

impl From<&str> for Selector {
    fn from(id: &str) -> Self {
        Self::One(id.to_string())
    }
}

impl From<String> for Selector {
    fn from(id: String) -> Self {
        Self::One(id)
    }
}

impl TryFrom<Value> for Selector {
    type Error = FetchError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(id) => Ok(Self::One(id)),
            Value::Array(items) => {
                let ids = items
                    .into_iter()
                    .map(|item| match item {
                        Value::String(id) => Ok(id),
                        other => Err(FetchError::InvalidInput(format!("not an id: {other}"))),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Self::ids(ids)
            }
            Value::Object(query) => Ok(Self::query(query)),
            other => Err(FetchError::InvalidInput(format!("cannot select entities with {other}"))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn selector_shape() {
        assert_eq!(Selector::try_from(json!("a")).unwrap(), Selector::One("a".into()));
        assert_eq!(Selector::try_from(json!(["a"])).unwrap(), Selector::One("a".into()));
        assert_eq!(
            Selector::try_from(json!(["a", "b", "a"])).unwrap(),
            Selector::Many(vec!["a".into(), "b".into()])
        );
        assert_eq!(Selector::try_from(json!({})).unwrap(), Selector::All);
        assert!(matches!(
            Selector::try_from(json!({"type": "site"})).unwrap(),
            Selector::Where(q) if q["type"] == "site"
        ));
        assert!(Selector::try_from(json!([])).is_err());
        assert!(Selector::try_from(json!(42)).is_err());
        assert!(Selector::try_from(json!(["a", 1])).is_err());
    }

    #[test]
    fn verbs() {
        assert_eq!(OpKind::ReadMany.verb().as_ref(), "GET");
        assert_eq!(OpKind::CreateMany.verb().as_ref(), "POST");
        assert_eq!(OpKind::UpdateWhere.verb().to_string(), "PUT");
        assert_eq!(OpKind::DeleteOne.verb().as_ref(), "DELETE");
    }

    #[test]
    fn progress_fan_out() {
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        let sink = ProgressSink::with_subscribers(vec![tx1, tx2]);
        drop(rx2);
        sink.report(Progress {
            loaded: 5,
            total:  Some(10),
        });
        assert_eq!(rx1.try_recv().unwrap().loaded, 5);
        assert!(sink.has_subscribers());
        assert_eq!(sink.subscribers.lock().len(), 1);
    }
}
