//! Error taxonomy for the watermark pipeline.
//!
//! Each subsystem has its own error enum; `WatermarkError` is the umbrella
//! the sessions surface. Payloads are strings so errors stay `Clone` and can
//! be parked in a session's error cell for later retrieval.

use thiserror::Error;

/// Audio device failures. Fatal to `start()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("audio device index {0} not found")]
    NotFound(usize),
    #[error("audio device busy: {0}")]
    Busy(String),
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),
    /// The device was closed or cancelled while a read/write was blocked.
    #[error("device operation cancelled")]
    Cancelled,
    #[error("audio backend error: {0}")]
    Backend(String),
}

/// Inference model failures. Fatal to `start()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("model file missing: {0}")]
    FileMissing(String),
    #[error("malformed model descriptor: {0}")]
    Malformed(String),
    #[error("weight blob size mismatch: expected {expected} floats, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("model input width mismatch: expected {expected}, got {actual}")]
    InputMismatch { expected: usize, actual: usize },
    #[error("inference backend error: {0}")]
    Backend(String),
}

/// Network transport failures.
///
/// Connection-loss variants transition an active session to `Failed`;
/// `Cancelled` is the clean unblock path during `stop()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("listen failed: {0}")]
    Listen(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// A malformed frame mid-stream: bad magic, oversized length, or a
    /// non-increasing sequence number.
    #[error("corrupt frame on the wire: {0}")]
    Corrupt(String),
    #[error("transport operation cancelled")]
    Cancelled,
}

/// Failures reading a configured fixed signal file. Fatal to embedder setup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalFileError {
    #[error("signal file missing: {0}")]
    Missing(String),
    #[error("signal file unreadable: {0}")]
    Unreadable(String),
    #[error("signal file incompatible: {0}")]
    IncompatibleFormat(String),
}

/// Umbrella error surfaced by the session control surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatermarkError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    SignalFile(#[from] SignalFileError),
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Operation on a released session. Programming error, never silent.
    #[error("session already released")]
    Disposed,
}
