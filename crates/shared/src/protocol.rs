//! Push-channel protocol definitions.
//!
//! Every frame on the channel, in either direction, is a JSON envelope of
//! the shape `{"type": <tag>, "payload": <any JSON value>}`. Frames whose
//! `type` field is missing are still deliverable (see the client's
//! untyped-message topic); frames that fail to decode as an envelope are
//! dropped by the receiver.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{ChatMessage, Clip, Device, LoopRegion, TimeSignature};

/// WebSocket close code used for explicit, client-initiated disconnects.
/// Any other close code makes the connection eligible for reconnection.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Topic tags the server pushes on.
pub const TOPIC_TRANSPORT: &str = "transport";
pub const TOPIC_DEVICES: &str = "devices";
pub const TOPIC_CHAT: &str = "chat";
pub const TOPIC_TIMELINE: &str = "timeline";

/// Wire envelope for push-channel frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Message type tag. Absent on malformed-but-parseable frames.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: Some(kind.into()),
            payload,
        }
    }
}

/// Partial transport update pushed on the `transport` topic. Only the
/// fields present in the payload change; everything else is preserved.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransportUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_playing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_beats: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bpm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_signature: Option<TimeSignature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_region: Option<LoopRegion>,
}

/// Payload pushed on the `chat` topic: one newly created message.
pub type ChatPush = ChatMessage;

/// Payload pushed on the `devices` topic: the full authoritative list.
pub type DevicesPush = Vec<Device>;

/// Payload pushed on the `timeline` topic: the full authoritative list.
pub type TimelinePush = Vec<Clip>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_decodes_typed_frame() {
        let env: Envelope =
            serde_json::from_str(r#"{"type":"transport","payload":{"isPlaying":true}}"#)
                .expect("valid envelope");
        assert_eq!(env.kind.as_deref(), Some("transport"));

        let update: TransportUpdate = serde_json::from_value(env.payload).expect("valid payload");
        assert_eq!(update.is_playing, Some(true));
        assert_eq!(update.bpm, None);
    }

    #[test]
    fn envelope_without_type_keeps_payload() {
        let env: Envelope = serde_json::from_str(r#"{"payload":{"n":1}}"#).expect("parseable");
        assert_eq!(env.kind, None);
        assert_eq!(env.payload, json!({"n": 1}));
    }

    #[test]
    fn envelope_accepts_primitive_payloads() {
        for raw in [
            r#"{"type":"ping","payload":1}"#,
            r#"{"type":"ping","payload":"ok"}"#,
            r#"{"type":"ping","payload":true}"#,
        ] {
            let env: Envelope = serde_json::from_str(raw).expect("parseable");
            assert_eq!(env.kind.as_deref(), Some("ping"));
        }
    }

    #[test]
    fn envelope_round_trips_outbound_shape() {
        let env = Envelope::new("chat", json!({"body": "hello"}));
        let text = serde_json::to_string(&env).expect("serializable");
        assert_eq!(text, r#"{"type":"chat","payload":{"body":"hello"}}"#);
    }

    #[test]
    fn non_object_frames_are_decode_failures() {
        assert!(serde_json::from_str::<Envelope>("[1,2]").is_err());
        assert!(serde_json::from_str::<Envelope>("not json").is_err());
    }
}
