//! Wire records exchanged with the message source and the result/error sinks.
//!
//! Each record is one JSON document per message payload.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while encoding or decoding wire records.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("decoding {record}: {source}")]
    Decode {
        record: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("encoding {record}: {source}")]
    Encode {
        record: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// One CSV row extracted from a dataset, tagged with its instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedEvent {
    pub instance_id: String,
    pub row: String,
    pub row_index: i64,
}

impl ExtractedEvent {
    /// Decodes an event from a raw message payload.
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(payload).map_err(|source| CodecError::Decode {
            record: "extracted event",
            source,
        })
    }

    /// Encodes the event into a message payload.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|source| CodecError::Encode {
            record: "extracted event",
            source,
        })
    }
}

/// Result record emitted once per instance persisted in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertedEvent {
    pub instance_id: String,
    pub observations_inserted: i32,
}

impl InsertedEvent {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|source| CodecError::Encode {
            record: "inserted event",
            source,
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(payload).map_err(|source| CodecError::Decode {
            record: "inserted event",
            source,
        })
    }
}

/// Error report published to the error sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub instance_id: String,
    pub event_type: String,
    pub event_message: String,
    pub created_at: String,
}

impl ErrorEvent {
    /// Builds an error report stamped with the current time.
    pub fn new(instance_id: &str, message: String) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            event_type: "error".to_string(),
            event_message: message,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|source| CodecError::Encode {
            record: "error event",
            source,
        })
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(payload).map_err(|source| CodecError::Decode {
            record: "error event",
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inserted_event_round_trip() {
        let event = InsertedEvent {
            instance_id: "inst-1".to_string(),
            observations_inserted: 42,
        };

        let bytes = event.encode().expect("should encode");
        let decoded = InsertedEvent::decode(&bytes).expect("should decode");

        assert_eq!(decoded.instance_id, "inst-1");
        assert_eq!(decoded.observations_inserted, 42);
    }

    #[test]
    fn test_extracted_event_decode() {
        let payload = br#"{"instance_id":"abc","row":"128,,Month,Aug-16","row_index":7}"#;
        let event = ExtractedEvent::decode(payload).expect("should decode");

        assert_eq!(event.instance_id, "abc");
        assert_eq!(event.row, "128,,Month,Aug-16");
        assert_eq!(event.row_index, 7);
    }

    #[test]
    fn test_extracted_event_missing_field_fails() {
        let payload = br#"{"instance_id":"abc","row":"1,2"}"#;
        let err = ExtractedEvent::decode(payload).expect_err("row_index is required");
        assert!(err.to_string().contains("decoding extracted event"));
    }

    #[test]
    fn test_extracted_event_garbage_fails() {
        assert!(ExtractedEvent::decode(b"not json").is_err());
        assert!(ExtractedEvent::decode(b"").is_err());
    }

    #[test]
    fn test_error_event_fields() {
        let event = ErrorEvent::new("inst-9", "graph write failed".to_string());
        assert_eq!(event.instance_id, "inst-9");
        assert_eq!(event.event_type, "error");
        assert_eq!(event.event_message, "graph write failed");
        assert!(event.created_at.ends_with('Z'));

        let decoded = ErrorEvent::decode(&event.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, event);
    }
}
