//! Error Types

#![allow(dead_code)]

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    // ============= Protocol Errors =============

    #[error("invalid packet length: {0}")]
    InvalidLength(i32),

    #[error("negative packet id: {0}")]
    NegativeId(i32),

    #[error("varint too long")]
    VarIntTooLong,

    #[error("expected packet {expected:#04x}, got {got:#04x}")]
    UnexpectedPacket { expected: i32, got: i32 },

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    // ============= Transport Errors =============

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection timeout to {addr}")]
    ConnectionTimeout { addr: String },

    #[error("short write: wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    // ============= Resolve Errors =============

    #[error("invalid local address '{addr}': {reason}")]
    InvalidLocalAddr { addr: String, reason: String },

    #[error("resolve {addr}: {reason}")]
    Resolve { addr: String, reason: String },

    // ============= Config Errors =============

    #[error("config error: {0}")]
    Config(String),

    // ============= Admission Errors =============

    /// Capacity / rate / auth rejects. User-visible via a disconnect frame;
    /// handlers treat these as a normal session close, not a failure.
    #[error("admission rejected: {0}")]
    Admission(String),

    // ============= Registry Errors =============

    #[error("connection not found")]
    NotFound,
}

impl ProxyError {
    /// True for transport failures where the upstream reconnect policy
    /// applies; protocol violations are never retried.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectionTimeout { .. } | Self::ShortWrite { .. }
        )
    }
}

/// Convenient Result type alias
pub type Result<T> = std::result::Result<T, ProxyError>;
