//! Error types for the bus engine.
//!
//! Every failure the engine can produce resolves to a [`BusError`] value; nothing
//! in the dispatch path panics on bad input from the wire.
//!
//! ## Error Categories
//!
//! - **Malformed frame**: bad CRC or length. Dropped and logged by the decoder.
//! - **Unroutable packet**: unknown device, service or register. Dropped and counted.
//! - **Timeout**: register refresh, ack wait or pipe read ran out of time.
//! - **Transport**: connect or send failure on one transport.
//! - **Role sync**: the remote role table could not be listed or updated.
//! - **Device lost**: the device an operation was waiting on left the bus.
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use jacbus::BusError;
//! use std::time::Duration;
//!
//! let error = BusError::timeout("register refresh", Duration::from_millis(150));
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::packet::DeviceId;
use crate::transport::TransportKind;

/// Result type alias for bus operations.
pub type Result<T, E = BusError> = std::result::Result<T, E>;

/// Main error type for bus operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BusError {
    #[error("Malformed frame: {reason}")]
    MalformedFrame { reason: String },

    #[error("Unroutable packet: {details}")]
    Unroutable { details: String },

    #[error("{operation} timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    #[error("Pipe read timed out after {duration:?} with {} partial chunk(s)", .partial.len())]
    PipeTimeout { duration: Duration, partial: Vec<Vec<u8>> },

    #[error("{kind} transport error: {reason}")]
    Transport {
        kind: TransportKind,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Role synchronization failed: {reason}")]
    RoleSync {
        reason: String,
        #[source]
        source: Option<Box<BusError>>,
    },

    #[error("Device {device} left the bus")]
    DeviceLost { device: DeviceId },

    #[error("Parse error in {context}: {details}")]
    Parse { context: String, details: String },

    #[error("Configuration error: {details}")]
    Config {
        details: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("File error: {path}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{what} is closed")]
    Closed { what: String },
}

impl BusError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            BusError::Timeout { .. } => true,
            BusError::PipeTimeout { .. } => true,
            BusError::Transport { .. } => true,
            BusError::RoleSync { .. } => true,
            BusError::MalformedFrame { .. } => false,
            BusError::Unroutable { .. } => false,
            BusError::DeviceLost { .. } => false,
            BusError::Parse { .. } => false,
            BusError::Config { .. } => false,
            BusError::File { .. } => false,
            BusError::Closed { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            BusError::MalformedFrame { .. } => vec![
                "Check the physical link for noise",
                "Verify both ends use the same framing",
            ],
            BusError::Unroutable { .. } => vec![
                "Wait for the device to announce itself",
                "Check the service index against the announced service list",
            ],
            BusError::Timeout { .. } | BusError::PipeTimeout { .. } => vec![
                "Retry the operation",
                "Increase the timeout for slow links",
                "Verify the device is still announcing",
            ],
            BusError::Transport { .. } => vec![
                "Reconnect the transport",
                "Check the device is plugged in and not claimed by another process",
            ],
            BusError::RoleSync { .. } => vec![
                "Wait for the next self-announce to retry",
                "Verify the role manager service is present",
            ],
            BusError::DeviceLost { .. } => {
                vec!["Wait for the device to reconnect", "Check power and cabling"]
            }
            BusError::Parse { .. } => {
                vec!["Check data format compatibility", "Verify source data integrity"]
            }
            BusError::Config { .. } => {
                vec!["Check configuration keys and value ranges", "Fall back to defaults"]
            }
            BusError::File { .. } => {
                vec!["Check file exists and is readable", "Check file permissions"]
            }
            BusError::Closed { .. } => vec!["Recreate the bus or transport"],
        }
    }

    /// Helper constructor for malformed frames.
    pub fn malformed(reason: impl Into<String>) -> Self {
        BusError::MalformedFrame { reason: reason.into() }
    }

    /// Helper constructor for timeouts.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        BusError::Timeout { operation: operation.into(), duration }
    }

    /// Helper constructor for transport failures.
    pub fn transport(kind: TransportKind, reason: impl Into<String>) -> Self {
        BusError::Transport { kind, reason: reason.into(), source: None }
    }

    /// Helper constructor for transport failures with source.
    pub fn transport_with_source(
        kind: TransportKind,
        reason: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        BusError::Transport { kind, reason: reason.into(), source: Some(Box::new(source)) }
    }

    /// Helper constructor for role synchronization failures.
    pub fn role_sync(reason: impl Into<String>, source: Option<BusError>) -> Self {
        BusError::RoleSync { reason: reason.into(), source: source.map(Box::new) }
    }

    /// Helper constructor for parse errors.
    pub fn parse(context: impl Into<String>, details: impl Into<String>) -> Self {
        BusError::Parse { context: context.into(), details: details.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(details: impl Into<String>) -> Self {
        BusError::Config { details: details.into(), source: None }
    }

    /// Helper constructor for closed channels and stopped components.
    pub fn closed(what: impl Into<String>) -> Self {
        BusError::Closed { what: what.into() }
    }
}

impl From<std::io::Error> for BusError {
    fn from(err: std::io::Error) -> Self {
        BusError::File { path: PathBuf::from("<unknown>"), source: err }
    }
}

impl From<serde_yaml_ng::Error> for BusError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        BusError::Config { details: err.to_string(), source: Some(Box::new(err)) }
    }
}
