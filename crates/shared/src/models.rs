//! Shared data models for the jamroom API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Transport ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimeSignature {
    pub numerator: u8,
    pub denominator: u8,
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self {
            numerator: 4,
            denominator: 4,
        }
    }
}

/// A looped region of the timeline, in beats.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoopRegion {
    pub start_beat: f64,
    pub end_beat: f64,
}

/// Authoritative playback transport state as reported by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransportState {
    pub is_playing: bool,
    pub position_beats: f64,
    pub bpm: f64,
    #[serde(default)]
    pub time_signature: TimeSignature,
    #[serde(default)]
    pub loop_enabled: bool,
    #[serde(default)]
    pub loop_region: Option<LoopRegion>,
}

impl Default for TransportState {
    fn default() -> Self {
        Self {
            is_playing: false,
            position_beats: 0.0,
            bpm: 120.0,
            time_signature: TimeSignature::default(),
            loop_enabled: false,
            loop_region: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetPlayheadRequest {
    pub position_beats: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBpmRequest {
    pub bpm: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetLoopRequest {
    pub enabled: bool,
    #[serde(default)]
    pub region: Option<LoopRegion>,
}

// --- Devices ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum DeviceKind {
    Controller,
    Synth,
    Sampler,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub kind: DeviceKind,
    pub connected: bool,
}

/// Opaque payload forwarded to a device (note/control data is
/// server-interpreted; the client does not model it).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendDeviceMessageRequest {
    pub payload: serde_json::Value,
}

// --- Timeline ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Clip {
    pub id: String,
    pub name: String,
    pub start_beat: f64,
    pub length_beats: f64,
    pub order: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateClipRequest {
    pub name: String,
    pub start_beat: f64,
    pub length_beats: f64,
    /// Client id for the tentative entry; lets the server deduplicate a
    /// retried create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateClipRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_beat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length_beats: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderClipsRequest {
    pub clip_ids: Vec<String>,
}

// --- Chat ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub author: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageRequest {
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

// --- Session ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub anonymous: bool,
}
