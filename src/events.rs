//! Typed gateway events.
//!
//! The gateway module turns raw `(op, t, d)` envelopes into this enum so the
//! bot loop only ever matches on parsed data.

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::types::{GatewayPayload, Message, ReadyEvent};

/// A parsed event coming off the Discord gateway.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// Identify / resume succeeded.
    Ready(ReadyEvent),

    /// A message was created in a channel the bot can see.
    MessageCreate(Message),

    /// Heartbeat ACK from the gateway (op 11).
    HeartbeatAck,

    /// The gateway is asking for an immediate heartbeat (op 1).
    HeartbeatRequest,

    /// Gateway told us to reconnect (op 7).
    Reconnect,

    /// Session has been invalidated (op 9). `true` means the session can be
    /// resumed; `false` means a fresh IDENTIFY is required.
    InvalidSession(bool),

    /// Anything else, kept raw for trace logging.
    Unknown {
        event_name: Option<String>,
        op: u8,
        data: Option<serde_json::Value>,
    },
}

impl GatewayEvent {
    /// Convert a raw [`GatewayPayload`] into a typed event.
    ///
    /// Never fails: unrecognised or malformed events become
    /// [`GatewayEvent::Unknown`].
    pub fn from_payload(payload: GatewayPayload) -> Self {
        match payload.op {
            0 => Self::parse_dispatch(payload.t, payload.d),
            1 => GatewayEvent::HeartbeatRequest,
            7 => GatewayEvent::Reconnect,
            9 => {
                let resumable = payload
                    .d
                    .as_ref()
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                GatewayEvent::InvalidSession(resumable)
            }
            11 => GatewayEvent::HeartbeatAck,
            op => GatewayEvent::Unknown {
                event_name: payload.t,
                op,
                data: payload.d,
            },
        }
    }

    /// Name of the dispatch event, if this is one we did not type.
    pub fn unknown_name(&self) -> Option<&str> {
        match self {
            GatewayEvent::Unknown { event_name, .. } => event_name.as_deref(),
            _ => None,
        }
    }

    fn parse_dispatch(event_name: Option<String>, data: Option<serde_json::Value>) -> Self {
        let parsed = match (event_name.as_deref(), data.as_ref()) {
            (Some(name @ "READY"), Some(d)) => typed(name, d).map(GatewayEvent::Ready),
            (Some(name @ "MESSAGE_CREATE"), Some(d)) => {
                typed(name, d).map(GatewayEvent::MessageCreate)
            }
            _ => None,
        };

        parsed.unwrap_or(GatewayEvent::Unknown {
            event_name,
            op: 0,
            data,
        })
    }
}

fn typed<T: DeserializeOwned>(name: &str, d: &serde_json::Value) -> Option<T> {
    match T::deserialize(d) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(event = name, error = %e, "failed to parse dispatch payload");
            None
        }
    }
}
