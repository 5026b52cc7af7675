//! Central error type for the library.
//!
//! Transport and protocol failures are mapped into [`ScpiError`] so callers
//! can match on the failure class. Driver-level code composes these with
//! `anyhow::Context` for human-readable chains.

use std::time::Duration;
use thiserror::Error;

/// Convenient result alias used throughout the crate.
pub type ScpiResult<T> = std::result::Result<T, ScpiError>;

/// All failure modes surfaced by transports, sessions and devices.
#[derive(Error, Debug)]
pub enum ScpiError {
    /// Underlying I/O failure on the transport.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport is not connected (or was shut down).
    #[error("transport not connected: {0}")]
    NotConnected(String),

    /// No complete response arrived within the transport timeout.
    #[error("timed out after {0:?} waiting for a response")]
    ReadTimeout(Duration),

    /// The resource string did not match any known transport.
    #[error("unsupported resource string: {0}")]
    UnsupportedResource(String),

    /// A feature-gated transport was requested without the feature.
    #[error("feature not enabled: {0}")]
    FeatureNotEnabled(String),

    /// Response text could not be parsed into the requested type.
    #[error("cannot parse {text:?} as {wanted}")]
    ParseResponse {
        /// What the instrument actually sent.
        text: String,
        /// Type name the caller asked for.
        wanted: &'static str,
    },

    /// Malformed IEEE-488.2 block data.
    #[error("invalid block data: {0}")]
    BadBlock(String),

    /// A set value fell outside the device's numeric limits.
    #[error("device {device}: value {value} outside limits [{min}, {max}]")]
    OutOfLimits {
        /// Device name.
        device: String,
        /// Offending value, formatted for display.
        value: String,
        /// Lower inclusive bound ("-inf" when open).
        min: String,
        /// Upper inclusive bound ("inf" when open).
        max: String,
    },

    /// A set value is not in the device's choice vocabulary.
    #[error("device {device}: {value:?} is not one of {allowed:?}")]
    InvalidChoice {
        /// Device name.
        device: String,
        /// Offending value.
        value: String,
        /// Allowed long-form mnemonics.
        allowed: Vec<String>,
    },

    /// Device has no get command (set-only).
    #[error("device {0} is write-only")]
    NoGet(String),

    /// Device has no set command (measurement / read-only).
    #[error("device {0} is read-only")]
    NoSet(String),

    /// Command template substitution failed.
    #[error("command format error for {device}: {reason}")]
    CommandFormat {
        /// Device name.
        device: String,
        /// What went wrong during substitution.
        reason: String,
    },

    /// Triggered operation did not complete in the allotted time.
    #[error("trigger did not complete within {0:?}")]
    TriggerTimeout(Duration),

    /// The instrument reported an error through its error queue.
    #[error("instrument error {code}: {message}")]
    InstrumentError {
        /// SCPI error code (negative for standard errors).
        code: i32,
        /// Instrument-supplied message.
        message: String,
    },

    /// Identity check at connect time failed.
    #[error("unexpected instrument identity: {0}")]
    UnexpectedIdentity(String),

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),
}
