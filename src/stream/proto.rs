use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Prefix of every locally broadcast channel key.
pub const REMOTE_CHANNEL_PREFIX: &str = "remote.";

/// Decoded inbound frame: a type discriminator plus the rest of the object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl EventEnvelope {
    pub fn new(event_type: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    /// Key subscribers listen on for this envelope.
    pub fn channel_key(&self) -> String {
        channel_key(&self.event_type)
    }

    /// Rebuilds the full frame object, `type` included.
    pub fn to_value(&self) -> Value {
        let mut object = self.payload.clone();
        object.insert("type".to_string(), Value::String(self.event_type.clone()));
        Value::Object(object)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.payload.get(field)
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame type is empty")]
    EmptyType,
}

/// Decodes one text frame into an [`EventEnvelope`].
pub fn decode(raw: &str) -> Result<EventEnvelope, DecodeError> {
    let envelope: EventEnvelope = serde_json::from_str(raw)?;
    if envelope.event_type.is_empty() {
        return Err(DecodeError::EmptyType);
    }
    Ok(envelope)
}

/// Returns `remote.<event_type>`.
pub fn channel_key(event_type: &str) -> String {
    format!("{REMOTE_CHANNEL_PREFIX}{event_type}")
}
