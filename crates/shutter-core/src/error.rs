//! Error types for ShutterSync

use thiserror::Error;

use crate::PeerIdentity;

/// Core ShutterSync errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutterError {
    // Wire errors
    #[error("Unknown color token: {0:?}")]
    UnknownColorToken(String),

    #[error("Invalid service namespace: {0:?}")]
    InvalidNamespace(String),

    // Discovery errors
    #[error("Advertising failed to start: {0}")]
    AdvertiseStartFailure(String),

    #[error("Browsing failed to start: {0}")]
    BrowseStartFailure(String),

    // Delivery errors
    #[error("Send to {peer} failed: {reason}")]
    SendFailure { peer: PeerIdentity, reason: String },

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type for ShutterSync operations
pub type ShutterResult<T> = Result<T, ShutterError>;
