//! Wire message types for the QMP machine protocol.
//!
//! The protocol is newline-delimited UTF-8 JSON over a byte stream. Inbound
//! messages fall into four shapes: the greeting the hypervisor emits on
//! connection, command responses (`return` or `error`), and out-of-band
//! events. Outbound commands are built ad hoc by the client.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Structured error payload reported by the hypervisor for a failed command.
#[derive(Debug, Clone, Deserialize, Error)]
#[error("{class}: {desc}")]
pub struct QmpError {
    pub class: String,
    pub desc: String,
}

/// Errors surfaced to callers of the protocol client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A command was issued with no transport writer bound. This is a logic
    /// fault in the caller, not a protocol failure.
    #[error("no transport writer is bound")]
    NotBound,

    /// The connection was reset (transport replaced) before a response
    /// arrived; the request will never settle.
    #[error("connection was reset before a response arrived")]
    ConnectionReset,

    /// The hypervisor rejected the command.
    #[error(transparent)]
    Protocol(#[from] QmpError),
}

/// Event timestamp as reported on the wire: seconds plus microseconds.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct EventTimestamp {
    #[serde(default)]
    pub seconds: i64,
    #[serde(default)]
    pub microseconds: i64,
}

/// An asynchronous notification emitted by the hypervisor independent of any
/// request.
#[derive(Debug, Clone)]
pub struct QmpEvent {
    pub name: String,
    pub data: Value,
    pub timestamp: EventTimestamp,
}

impl QmpEvent {
    /// The event timestamp as UTC wall-clock time, when representable.
    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        let nanos = u32::try_from(self.timestamp.microseconds.clamp(0, 999_999) * 1_000).ok()?;
        DateTime::from_timestamp(self.timestamp.seconds, nanos)
    }
}

/// One complete top-level message extracted from the inbound byte stream.
///
/// Variant order matters: serde tries untagged variants top to bottom, and
/// each variant is keyed by a field only that shape carries.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum InboundMessage {
    Greeting {
        #[serde(rename = "QMP")]
        #[allow(dead_code)]
        greeting: Value,
    },
    Return {
        #[serde(rename = "return")]
        payload: Value,
    },
    CommandError {
        error: QmpError,
    },
    Event {
        event: String,
        #[serde(default)]
        data: Value,
        #[serde(default)]
        timestamp: EventTimestamp,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_parses_before_other_shapes() {
        let msg: InboundMessage =
            serde_json::from_str(r#"{"QMP": {"version": {}, "capabilities": []}}"#).unwrap();
        assert!(matches!(msg, InboundMessage::Greeting { .. }));
    }

    #[test]
    fn error_response_carries_class_and_desc() {
        let msg: InboundMessage = serde_json::from_str(
            r#"{"error": {"class": "GenericError", "desc": "device not found"}}"#,
        )
        .unwrap();
        match msg {
            InboundMessage::CommandError { error } => {
                assert_eq!(error.class, "GenericError");
                assert_eq!(error.desc, "device not found");
            }
            other => panic!("expected CommandError, got {other:?}"),
        }
    }

    #[test]
    fn event_timestamp_converts_to_utc() {
        let event = QmpEvent {
            name: "RESET".to_string(),
            data: Value::Null,
            timestamp: EventTimestamp {
                seconds: 1_700_000_000,
                microseconds: 250_000,
            },
        };
        let ts = event.timestamp_utc().expect("representable timestamp");
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_micros(), 250_000);
    }
}
