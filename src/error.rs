//! Error taxonomy for the streaming control plane.
//!
//! Each component owns one [`thiserror`]-derived enum covering the error
//! kinds that apply to it. Glue code (config loading, `main`, tests) uses
//! `anyhow::Result` with `.context(..)` instead of inventing a top-level
//! enum, splitting per-module errors from `anyhow` at the edges.

use thiserror::Error;

/// Errors raised by [`crate::encoder::EncoderCore`].
#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("no encoder configuration strategy succeeded for {width}x{height}")]
    ConfigUnsupported { width: u32, height: u32 },

    #[error("encoder is not running")]
    NotRunning,

    #[error("encoder is stopping, input rejected")]
    Stopping,

    #[error("encoder reported a fatal codec error: {0}")]
    CodecFatal(String),

    #[error("stall watchdog requested recovery after {0:?}")]
    StallRecovery(std::time::Duration),

    #[error("keyframe drought watchdog requested recovery after {0:?}")]
    KeyframeDrought(std::time::Duration),
}

/// Errors raised by [`crate::recording::RecordingTee`].
#[derive(Debug, Error)]
pub enum MuxerError {
    #[error("muxer is not in a state that accepts samples")]
    InvalidState,

    #[error("muxer fatal error while writing a sample: {0}")]
    Fatal(String),

    #[error("track was not yet established when a sample arrived")]
    TrackPending,
}

/// Errors raised by [`crate::session::ViewerSession`].
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transient I/O error: {0}")]
    TransientIo(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("authentication failed")]
    AuthFailure,

    #[error("session outbound queue closed")]
    Closed,
}

/// Errors raised by [`crate::server::StreamServer`].
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("server is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Encoder(#[from] EncoderError),
}

/// Errors raised while loading or validating [`crate::config::Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("password must not be empty")]
    EmptyPassword,
}
