//! Pub/sub event protocol between nodes.
//!
//! Player lifecycle changes travel on `<prefix>-data` as JSON envelopes:
//!
//! ```json
//! {"source":"bungee-1","action":"JOIN","target":"Notch","payload":{"address":"10.0.0.7"}}
//! ```
//!
//! Administrative commands travel as raw strings on `<prefix>-allservers`
//! and `<prefix>-<node_id>`.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Pseudo node id addressing every node's command channel.
pub const ALL_SERVERS: &str = "allservers";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum Action {
    Join,
    Leave,
    ServerChange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct JoinPayload {
    address: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LeavePayload {
    timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ServerChangePayload {
    server: String,
}

/// Wire shape; the payload is decoded once the action is known.
#[derive(Debug, Serialize, Deserialize)]
struct RawEnvelope {
    source: String,
    action: Action,
    target: String,
    payload: Value,
}

/// What happened to the target player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Join { address: IpAddr },
    /// `timestamp` is the unix millisecond the player went offline.
    Leave { timestamp: i64 },
    ServerChange { server: String },
}

/// A source-attributed player lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub target: String,
    pub source: String,
    pub event: Event,
}

impl Envelope {
    pub fn new(source: impl Into<String>, target: impl Into<String>, event: Event) -> Self {
        Self {
            target: target.into(),
            source: source.into(),
            event,
        }
    }

    pub fn encode(&self) -> String {
        let (action, payload) = match &self.event {
            Event::Join { address } => (
                Action::Join,
                serde_json::json!(JoinPayload { address: *address }),
            ),
            Event::Leave { timestamp } => (
                Action::Leave,
                serde_json::json!(LeavePayload {
                    timestamp: *timestamp
                }),
            ),
            Event::ServerChange { server } => (
                Action::ServerChange,
                serde_json::json!(ServerChangePayload {
                    server: server.clone()
                }),
            ),
        };
        let raw = RawEnvelope {
            source: self.source.clone(),
            action,
            target: self.target.clone(),
            payload,
        };
        // Serializing plain strings, numbers and addresses cannot fail.
        serde_json::to_string(&raw).unwrap_or_default()
    }

    pub fn decode(message: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_str(message)?;
        let event = match raw.action {
            Action::Join => {
                let JoinPayload { address } = serde_json::from_value(raw.payload)?;
                Event::Join { address }
            }
            Action::Leave => {
                let LeavePayload { timestamp } = serde_json::from_value(raw.payload)?;
                Event::Leave { timestamp }
            }
            Action::ServerChange => {
                let ServerChangePayload { server } = serde_json::from_value(raw.payload)?;
                Event::ServerChange { server }
            }
        };
        Ok(Self {
            target: raw.target,
            source: raw.source,
            event,
        })
    }
}

/// Channel names for one node.
#[derive(Debug, Clone)]
pub struct Channels {
    prefix: String,
    pub data: String,
    pub all_servers: String,
    pub own: String,
}

impl Channels {
    pub fn new(prefix: &str, node_id: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            data: format!("{prefix}-data"),
            all_servers: format!("{prefix}-{ALL_SERVERS}"),
            own: format!("{prefix}-{node_id}"),
        }
    }

    /// Command channel of `target`, a node id or [`ALL_SERVERS`].
    pub fn command(&self, target: &str) -> String {
        format!("{}-{target}", self.prefix)
    }

    /// Every channel a node listens on.
    pub fn subscribed(&self) -> Vec<String> {
        vec![self.own.clone(), self.all_servers.clone(), self.data.clone()]
    }

    pub fn is_command(&self, channel: &str) -> bool {
        channel == self.all_servers || channel == self.own
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_matches_fleet_contract() {
        let envelope = Envelope::new(
            "bungee-1",
            "Notch",
            Event::Join {
                address: "10.0.0.7".parse().unwrap(),
            },
        );
        let value: Value = serde_json::from_str(&envelope.encode()).unwrap();
        assert_eq!(value["source"], "bungee-1");
        assert_eq!(value["action"], "JOIN");
        assert_eq!(value["target"], "Notch");
        assert_eq!(value["payload"]["address"], "10.0.0.7");
    }

    #[test]
    fn test_decode_each_action() {
        let leave = Envelope::decode(
            r#"{"source":"b","action":"LEAVE","target":"jeb_","payload":{"timestamp":1700000000123}}"#,
        )
        .unwrap();
        assert_eq!(
            leave.event,
            Event::Leave {
                timestamp: 1_700_000_000_123
            }
        );

        let change = Envelope::decode(
            r#"{"source":"b","action":"SERVER_CHANGE","target":"jeb_","payload":{"server":"survival"}}"#,
        )
        .unwrap();
        assert_eq!(change.target, "jeb_");
        assert_eq!(
            change.event,
            Event::ServerChange {
                server: "survival".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let result = Envelope::decode(
            r#"{"source":"b","action":"TELEPORT","target":"x","payload":{}}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_payload_must_match_action() {
        let result = Envelope::decode(
            r#"{"source":"b","action":"JOIN","target":"x","payload":{"timestamp":5}}"#,
        );
        assert!(result.is_err());
        assert!(Envelope::decode("not json").is_err());
    }

    #[test]
    fn test_channel_names() {
        let channels = Channels::new("redisbungee", "bungee-1");
        assert_eq!(channels.data, "redisbungee-data");
        assert_eq!(channels.all_servers, "redisbungee-allservers");
        assert_eq!(channels.own, "redisbungee-bungee-1");
        assert_eq!(channels.command("bungee-2"), "redisbungee-bungee-2");
        assert!(channels.is_command("redisbungee-allservers"));
        assert!(!channels.is_command("redisbungee-data"));
    }
}
