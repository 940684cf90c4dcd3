//! Error types for open-mouse-core.

use crate::connection::ConnectionState;
use crate::protocol::Capability;
use std::fmt;
use thiserror::Error;

/// Where a device-level failure happened.
///
/// Attached to every error that originates from a live connection so that a
/// diagnostics surface can say which device failed, in which state, and on
/// which attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub device_id: Option<String>,
    pub state: Option<ConnectionState>,
    pub attempt: u32,
}

impl ErrorContext {
    pub fn new(device_id: impl Into<String>, state: ConnectionState, attempt: u32) -> Self {
        Self {
            device_id: Some(device_id.into()),
            state: Some(state),
            attempt,
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.device_id {
            Some(id) => write!(f, "device={id}")?,
            None => write!(f, "device=?")?,
        }
        if let Some(state) = self.state {
            write!(f, ", state={state}")?;
        }
        write!(f, ", attempt={}", self.attempt)
    }
}

/// Core library error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport I/O failure (HID write/read, open).
    #[error("HID error: {0}")]
    Hid(String),

    /// Device not found during enumeration or not known to the manager.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Command targets a capability the descriptor does not advertise.
    #[error("unsupported capability {capability} on {device}")]
    UnsupportedCapability {
        capability: Capability,
        device: String,
    },

    /// Checksum or frame mismatch.
    #[error("protocol error: {reason} ({context})")]
    Protocol {
        reason: String,
        context: ErrorContext,
    },

    /// No response within the command timeout.
    #[error("timeout after {timeout_ms} ms ({context})")]
    Timeout {
        timeout_ms: u64,
        context: ErrorContext,
    },

    /// A live handle already exists for this physical device.
    #[error("device already connected: {0}")]
    AlreadyConnected(String),

    /// The macro instance is already being played.
    #[error("macro already playing: {0}")]
    AlreadyPlaying(String),

    /// Probing or reconnection exhausted every option.
    #[error("connection failed: {reason} ({context})")]
    ConnectionFailed {
        reason: String,
        context: ErrorContext,
    },

    /// A queued command was discarded before it reached the device.
    #[error("command dropped: {reason} ({context})")]
    Dropped {
        reason: String,
        context: ErrorContext,
    },

    /// Value out of safe range.
    #[error("value out of range: {field} = {value} (allowed {min}..={max})")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    /// A descriptor with the same key is already registered.
    #[error("duplicate descriptor for {vendor_id:04X}:{product}")]
    DuplicateDescriptor { vendor_id: u16, product: String },

    /// Invalid macro data or recorder misuse.
    #[error("macro error: {0}")]
    Macro(String),

    /// Configuration could not be read or is invalid.
    #[error("config error: {0}")]
    Config(String),

    /// Permission denied (likely missing udev rule or exclusive access).
    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

impl Error {
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout {
            timeout_ms,
            context: ErrorContext::default(),
        }
    }

    pub fn connection_failed(reason: impl Into<String>, context: ErrorContext) -> Self {
        Self::ConnectionFailed {
            reason: reason.into(),
            context,
        }
    }

    pub fn dropped(reason: impl Into<String>, context: ErrorContext) -> Self {
        Self::Dropped {
            reason: reason.into(),
            context,
        }
    }

    /// Replace the context of a device-level error. Other variants pass through.
    pub fn with_context(self, ctx: ErrorContext) -> Self {
        match self {
            Self::Protocol { reason, .. } => Self::Protocol {
                reason,
                context: ctx,
            },
            Self::Timeout { timeout_ms, .. } => Self::Timeout {
                timeout_ms,
                context: ctx,
            },
            Self::ConnectionFailed { reason, .. } => Self::ConnectionFailed {
                reason,
                context: ctx,
            },
            Self::Dropped { reason, .. } => Self::Dropped {
                reason,
                context: ctx,
            },
            other => other,
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Protocol { context, .. }
            | Self::Timeout { context, .. }
            | Self::ConnectionFailed { context, .. }
            | Self::Dropped { context, .. } => Some(context),
            _ => None,
        }
    }
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_is_rendered_in_message() {
        let err = Error::timeout(1000).with_context(ErrorContext::new(
            "/dev/hidraw3",
            ConnectionState::Degraded,
            2,
        ));
        let msg = err.to_string();
        assert!(msg.contains("1000 ms"));
        assert!(msg.contains("device=/dev/hidraw3"));
        assert!(msg.contains("state=degraded"));
        assert!(msg.contains("attempt=2"));
    }

    #[test]
    fn with_context_leaves_plain_errors_alone() {
        let err = Error::AlreadyConnected("a".into()).with_context(ErrorContext::default());
        assert!(matches!(err, Error::AlreadyConnected(_)));
        assert!(err.context().is_none());
    }
}
