use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{RelayError, RelayResult};

/// Opaque token binding one request to its single reply, or one stream session to its events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Streaming reply marker carried in the `event` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamEventKind {
    Chunk,
    Done,
    Error,
}

impl StreamEventKind {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamEventKind::Done | StreamEventKind::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamEventKind::Chunk => "chunk",
            StreamEventKind::Done => "done",
            StreamEventKind::Error => "error",
        }
    }

    /// `None` for any other value, which then stays a business field.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "chunk" => Some(StreamEventKind::Chunk),
            "done" => Some(StreamEventKind::Done),
            "error" => Some(StreamEventKind::Error),
            _ => None,
        }
    }
}

/// Wire key of the control slot; kept apart from business field names.
const METADATA_FIELD: &str = "_meta";
const CORRELATION_FIELD: &str = "correlation_id";
const EVENT_FIELD: &str = "event";

/// 总线消息信封
///
/// On the wire this is a single flat JSON object: the business fields of `body`
/// plus `correlation_id`, an optional `event` and an optional `_meta` object
/// for control values (caller tokens and the like) that are not business data.
///
/// Parsing never fails on an object. A field is only lifted out of the body when
/// its value has the control shape: `event` must be `chunk`/`done`/`error`,
/// `_meta` must map strings to strings, `correlation_id` must be a string or a
/// number (numbers are kept as their decimal text). Anything else stays in `body`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub correlation_id: Option<CorrelationId>,
    pub event: Option<StreamEventKind>,
    pub metadata: BTreeMap<String, String>,
    pub body: Map<String, Value>,
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire_map().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Map::<String, Value>::deserialize(deserializer).map(Self::from_wire_map)
    }
}

impl Envelope {
    pub fn new(body: Map<String, Value>) -> Self {
        Self {
            body,
            ..Default::default()
        }
    }

    /// Builds an envelope from an arbitrary JSON value; only objects are accepted.
    pub fn from_value(value: Value) -> RelayResult<Self> {
        match value {
            Value::Object(map) => Ok(Self::from_wire_map(map)),
            other => Err(RelayError::Validation(format!(
                "expected a JSON object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn chunk(correlation_id: CorrelationId, text: impl Into<String>) -> Self {
        let mut body = Map::new();
        body.insert("text".to_string(), Value::String(text.into()));
        Self::stream_event(correlation_id, StreamEventKind::Chunk, body)
    }

    pub fn done(correlation_id: CorrelationId) -> Self {
        Self::stream_event(correlation_id, StreamEventKind::Done, Map::new())
    }

    pub fn error(correlation_id: CorrelationId, error: impl Into<String>) -> Self {
        let mut body = Map::new();
        body.insert("error".to_string(), Value::String(error.into()));
        Self::stream_event(correlation_id, StreamEventKind::Error, body)
    }

    /// Synthesized `{success: false, error, correlation_id}` reply.
    pub fn failure(correlation_id: Option<CorrelationId>, error: impl Into<String>) -> Self {
        let mut body = Map::new();
        body.insert("success".to_string(), Value::Bool(false));
        body.insert("error".to_string(), Value::String(error.into()));
        Self {
            correlation_id,
            body,
            ..Default::default()
        }
    }

    fn stream_event(correlation_id: CorrelationId, event: StreamEventKind, body: Map<String, Value>) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            event: Some(event),
            metadata: BTreeMap::new(),
            body,
        }
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.body.get(field).and_then(Value::as_str)
    }

    /// Reads the handler contract's boolean outcome (`success`, falling back to `ok`).
    pub fn succeeded(&self) -> Option<bool> {
        self.body
            .get("success")
            .or_else(|| self.body.get("ok"))
            .and_then(Value::as_bool)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.get_str("error")
    }

    pub fn to_bytes(&self) -> RelayResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(bytes: &[u8]) -> RelayResult<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    pub fn to_json_string(&self) -> RelayResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json_str(data: &str) -> RelayResult<Self> {
        let value: Value = serde_json::from_str(data)?;
        Self::from_value(value)
    }

    /// The flat wire object as a JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.to_wire_map())
    }

    fn to_wire_map(&self) -> Map<String, Value> {
        let mut map = self.body.clone();
        if let Some(correlation_id) = &self.correlation_id {
            map.insert(CORRELATION_FIELD.to_string(), Value::String(correlation_id.to_string()));
        }
        if let Some(event) = self.event {
            map.insert(EVENT_FIELD.to_string(), Value::String(event.as_str().to_string()));
        }
        if !self.metadata.is_empty() {
            let metadata = self
                .metadata
                .iter()
                .map(|(key, value)| (key.clone(), Value::String(value.clone())))
                .collect();
            map.insert(METADATA_FIELD.to_string(), Value::Object(metadata));
        }
        map
    }

    fn from_wire_map(mut body: Map<String, Value>) -> Self {
        let correlation_id = match body.get(CORRELATION_FIELD) {
            Some(Value::String(id)) => Some(CorrelationId::from(id.as_str())),
            Some(Value::Number(id)) => Some(CorrelationId::from(id.to_string())),
            _ => None,
        };
        if correlation_id.is_some() || matches!(body.get(CORRELATION_FIELD), Some(Value::Null)) {
            body.remove(CORRELATION_FIELD);
        }

        let event = body
            .get(EVENT_FIELD)
            .and_then(Value::as_str)
            .and_then(StreamEventKind::parse);
        if event.is_some() {
            body.remove(EVENT_FIELD);
        }

        let metadata = match body.get(METADATA_FIELD) {
            Some(Value::Object(slot)) => slot
                .iter()
                .map(|(key, value)| value.as_str().map(|value| (key.clone(), value.to_string())))
                .collect::<Option<BTreeMap<_, _>>>(),
            _ => None,
        };
        if metadata.is_some() {
            body.remove(METADATA_FIELD);
        }

        Self {
            correlation_id,
            event,
            metadata: metadata.unwrap_or_default(),
            body,
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
