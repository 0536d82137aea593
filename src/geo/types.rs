//! Value types shared by the registry, the backends, and the wire protocol.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A single location fix produced by a backend.
///
/// Field names are part of the bridge contract: existing callers read
/// `timestamp`, `velocity`, `accuracy`, `heading`, `altitude`,
/// `latitude` and `longitude`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LocationSample {
    /// Unix epoch milliseconds of the fix.
    pub timestamp: u64,
    pub latitude: f64,
    pub longitude: f64,
    /// Meters above the WGS84 ellipsoid.
    pub altitude: f64,
    /// Horizontal accuracy radius in meters.
    pub accuracy: f32,
    /// Bearing in degrees, clockwise from true north.
    pub heading: f32,
    /// Ground speed in m/s.
    pub velocity: f32,
}

/// Accuracy tier requested for a watch or one-shot fetch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AccuracyTier {
    High,
    Balanced,
}

impl AccuracyTier {
    pub fn from_high_accuracy(enable_high_accuracy: bool) -> Self {
        if enable_high_accuracy {
            Self::High
        } else {
            Self::Balanced
        }
    }

    /// Delivery parameters for this tier.
    pub fn update_params(self) -> UpdateParams {
        match self {
            Self::High => UpdateParams {
                interval_ms: 100,
                min_displacement_m: 0.0,
                max_update_count: Some(10),
            },
            Self::Balanced => UpdateParams {
                interval_ms: 5000,
                min_displacement_m: 10.0,
                max_update_count: None,
            },
        }
    }
}

/// Continuous-delivery parameters handed to the backend.
///
/// `max_update_count` bounds the size of a single delivery batch. It
/// never stops a watch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateParams {
    pub interval_ms: u64,
    pub min_displacement_m: f32,
    pub max_update_count: Option<u32>,
}

/// Numeric error codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    PermissionDenied = 1,
    PositionUnavailable = 2,
    Timeout = 3,
}

impl ErrorCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Failure delivered to a one-shot request or a watch stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable")]
    PositionUnavailable,
    #[error("location request timed out")]
    Timeout,
    /// Platform-specific failure; the message is passed through verbatim.
    #[error("{0}")]
    Backend(String),
}

impl LocationError {
    /// Error code for the wire, or `None` for verbatim backend failures.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::PermissionDenied => Some(ErrorCode::PermissionDenied),
            Self::PositionUnavailable => Some(ErrorCode::PositionUnavailable),
            Self::Timeout => Some(ErrorCode::Timeout),
            Self::Backend(_) => None,
        }
    }
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
