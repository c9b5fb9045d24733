use serde_json::{json, Value};

use super::{Envelope, StreamEventKind};

/// One frame delivered to an open push connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// `{"text": ...}`
    Text(String),
    /// `{"done": true}`
    Done,
    /// `{"error": ...}`
    Error(String),
    /// `{"data": <record>}` for field-filtered sessions
    Data(Value),
}

impl PushEvent {
    /// Maps a streaming reply envelope to its push frame.
    ///
    /// Only records carrying an explicit `chunk`/`done`/`error` marker are
    /// forwarded; anything else on the reply topic yields `None`.
    pub fn from_stream_envelope(envelope: &Envelope) -> Option<Self> {
        let event = match envelope.event? {
            StreamEventKind::Done => PushEvent::Done,
            StreamEventKind::Error => PushEvent::Error(
                envelope
                    .error_message()
                    .unwrap_or("unknown error")
                    .to_string(),
            ),
            StreamEventKind::Chunk => {
                PushEvent::Text(envelope.get_str("text").unwrap_or_default().to_string())
            }
        };
        Some(event)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PushEvent::Done | PushEvent::Error(_))
    }

    pub fn to_json(&self) -> Value {
        match self {
            PushEvent::Text(text) => json!({ "text": text }),
            PushEvent::Done => json!({ "done": true }),
            PushEvent::Error(error) => json!({ "error": error }),
            PushEvent::Data(data) => json!({ "data": data }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CorrelationId;

    #[test]
    fn test_stream_envelopes_map_to_frames() {
        let id = CorrelationId::from("c-1");

        assert_eq!(
            PushEvent::from_stream_envelope(&Envelope::chunk(id.clone(), "hel")).map(|e| e.to_json()),
            Some(json!({"text": "hel"}))
        );
        assert_eq!(
            PushEvent::from_stream_envelope(&Envelope::done(id.clone())).map(|e| e.to_json()),
            Some(json!({"done": true}))
        );

        let error = PushEvent::from_stream_envelope(&Envelope::error(id, "upstream failed")).unwrap();
        assert!(error.is_terminal());
        assert_eq!(error.to_json(), json!({"error": "upstream failed"}));
    }

    #[test]
    fn test_unmarked_records_are_not_forwarded() {
        let reply = Envelope::from_value(json!({"text": "stray", "success": true}))
            .unwrap()
            .with_correlation_id(CorrelationId::from("c-1"));
        assert_eq!(PushEvent::from_stream_envelope(&reply), None);
    }
}
