//! Wire protocol message types for the location bridge.
//!
//! All messages are MessagePack-encoded maps with at minimum `type` and `id`
//! fields. Unsolicited messages from the daemon carry `id: 0`.

use serde::{Deserialize, Serialize};

use crate::geo::types::{LocationError, LocationSample};

/// All wire protocol messages.
///
/// Serialized as a tagged union on the `type` field via MessagePack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Message {
    // -- Handshake --
    #[serde(rename = "hello")]
    Hello { id: u32, version: u32, role: Role },

    #[serde(rename = "hello_ack")]
    HelloAck {
        id: u32,
        status: Status,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // -- Location calls (any role) --
    /// Answered once the next fetch completes.
    #[serde(rename = "get_location")]
    GetLocation {
        id: u32,
        enable_high_accuracy: bool,
        /// Accepted for compatibility; never served from cache.
        #[serde(default)]
        max_age: u64,
    },

    #[serde(rename = "add_watch")]
    AddWatch {
        id: u32,
        watch_id: String,
        enable_high_accuracy: bool,
    },

    #[serde(rename = "clear_watch")]
    ClearWatch { id: u32, watch_id: String },

    // -- Host lifecycle (host role only) --
    #[serde(rename = "pause")]
    Pause { id: u32 },

    #[serde(rename = "resume")]
    Resume { id: u32 },

    #[serde(rename = "settings_resolved")]
    SettingsResolved { id: u32 },

    #[serde(rename = "permission_result")]
    PermissionResult { id: u32, granted: bool },

    #[serde(rename = "request_permission")]
    RequestPermission { id: u32 },

    #[serde(rename = "set_location_mode")]
    SetLocationMode { id: u32, enabled: bool },

    // -- Unsolicited (daemon → app) --
    #[serde(rename = "watch_position")]
    WatchPosition {
        id: u32,
        watch_id: String,
        position: LocationSample,
    },

    #[serde(rename = "watch_error")]
    WatchError {
        id: u32,
        watch_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    // -- Unsolicited (daemon → host) --
    #[serde(rename = "permission_prompt")]
    PermissionPrompt { id: u32 },

    #[serde(rename = "resolve_settings")]
    ResolveSettings { id: u32 },

    // -- Generic response --
    #[serde(rename = "response")]
    Response {
        id: u32,
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Location error code (1 permission denied, 2 position
        /// unavailable, 3 timeout). Absent for verbatim backend errors.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<LocationSample>,
    },
}

impl Message {
    pub fn ok(id: u32) -> Self {
        Message::Response {
            id,
            status: Status::Ok,
            error: None,
            code: None,
            position: None,
        }
    }

    pub fn error(id: u32, reason: &str) -> Self {
        Message::Response {
            id,
            status: Status::Error,
            error: Some(reason.into()),
            code: None,
            position: None,
        }
    }

    /// Response to `get_location`.
    pub fn location(id: u32, result: Result<LocationSample, LocationError>) -> Self {
        match result {
            Ok(position) => Message::Response {
                id,
                status: Status::Ok,
                error: None,
                code: None,
                position: Some(position),
            },
            Err(e) => Self::location_error(id, &e),
        }
    }

    /// Response carrying a location error.
    pub fn location_error(id: u32, error: &LocationError) -> Self {
        Message::Response {
            id,
            status: Status::Error,
            error: Some(error.to_string()),
            code: error.code().map(|c| c.as_u8()),
            position: None,
        }
    }

    /// Unsolicited watch delivery.
    pub fn watch_event(watch_id: &str, event: Result<LocationSample, LocationError>) -> Self {
        match event {
            Ok(position) => Message::WatchPosition {
                id: 0,
                watch_id: watch_id.to_string(),
                position,
            },
            Err(e) => Message::WatchError {
                id: 0,
                watch_id: watch_id.to_string(),
                code: e.code().map(|c| c.as_u8()),
                message: match e {
                    LocationError::Backend(msg) => Some(msg),
                    _ => None,
                },
            },
        }
    }
}

/// Client role in the handshake.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The hybrid-app layer issuing location calls.
    App,
    /// The host runtime: lifecycle events, permission and settings UI.
    Host,
}

/// Response status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum payload size (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Minimal envelope for extracting `{type, id}` from unknown messages.
///
/// Used as a fallback when [`Message`] deserialization fails so the error
/// response can echo the request `id`.
#[derive(Debug, Deserialize)]
pub struct RawEnvelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub id: u32,
}
