//! Error classification for device communication.
//!
//! The coordinator asks [`ErrorClass::classify`] whether a failed attempt is
//! worth retrying before the retry budget runs out.

use crate::error::Error;

/// Classification of communication errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient errors that may succeed on retry (timeout, busy, I/O hiccup).
    Transient,
    /// Device is gone. Retrying the same handle is pointless.
    Disconnected,
    /// Permission denied: likely a missing udev rule or exclusive access.
    PermissionDenied,
    /// The device answered with something we could not accept.
    Protocol,
    /// The request itself is wrong; nothing was sent.
    Rejected,
}

impl ErrorClass {
    /// Classify an error for retry decisions.
    pub fn classify(err: &Error) -> Self {
        match err {
            Error::Timeout { .. } => Self::Transient,
            Error::PermissionDenied(_) => Self::PermissionDenied,
            Error::DeviceNotFound(_) | Error::ConnectionFailed { .. } | Error::Dropped { .. } => {
                Self::Disconnected
            }
            Error::Protocol { .. } => Self::Protocol,
            Error::Hid(msg) => {
                let lower = msg.to_lowercase();
                if lower.contains("disconnect")
                    || lower.contains("not found")
                    || lower.contains("no such device")
                {
                    Self::Disconnected
                } else if lower.contains("permission")
                    || lower.contains("access denied")
                    || lower.contains("access is denied")
                {
                    Self::PermissionDenied
                } else {
                    Self::Transient
                }
            }
            Error::UnsupportedCapability { .. }
            | Error::OutOfRange { .. }
            | Error::AlreadyConnected(_)
            | Error::AlreadyPlaying(_)
            | Error::DuplicateDescriptor { .. }
            | Error::Macro(_)
            | Error::Config(_) => Self::Rejected,
        }
    }

    /// Whether this error class is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}
