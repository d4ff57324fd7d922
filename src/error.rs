//! Error taxonomy shared by the display model, the authority adapters and the
//! setup-packet rewriter.
//!
//! # Security
//!
//! Messages MUST NOT contain cookie material. Variants carry displays, lengths
//! and command diagnostics only.

use std::io;
use std::time::Duration;

use crate::display::Display;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, XAuthError>;

#[derive(Debug, thiserror::Error)]
pub enum XAuthError {
    /// Display string could not be parsed.
    #[error("invalid display {input:?}: {reason}")]
    InvalidDisplay { input: String, reason: &'static str },

    /// Display number outside the configured `[offset, max_display]` range.
    #[error("display number {number} is outside the valid range {min}..={max}")]
    DisplayOutOfRange { number: u32, min: u32, max: u32 },

    /// No authority entry is stored for the display.
    #[error("no xauth entry found for display {0}")]
    NotFound(Display),

    /// The client presented credentials it was not issued.
    #[error("access denied: {0}")]
    AccessDenied(&'static str),

    /// The stream ended before a complete setup packet was read.
    #[error("X11 setup packet truncated: {0}")]
    Truncated(&'static str),

    /// The setup packet cannot be interpreted.
    #[error("malformed X11 setup packet: {0}")]
    MalformedPacket(String),

    /// The genuine display could not be contacted to mint a cookie.
    #[error("display {display} is unreachable: {detail}")]
    DisplayUnreachable { display: Display, detail: String },

    /// An external request did not complete within its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// An external request was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration or input mismatch, e.g. an entry with a foreign protocol
    /// or a secret length that differs between decoy and real entry.
    #[error("validation error: {0}")]
    Validation(String),

    /// The authority utility exited unsuccessfully.
    #[error("xauth command failed: {0}")]
    Command(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl XAuthError {
    /// `true` for the expected "no entry yet" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, XAuthError::NotFound(_))
    }

    /// `true` when the failure must terminate the forwarded connection.
    ///
    /// Covers every rewrite failure: a partial rewrite is never forwarded.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            XAuthError::AccessDenied(_)
                | XAuthError::Truncated(_)
                | XAuthError::MalformedPacket(_)
                | XAuthError::Validation(_)
                | XAuthError::Io(_)
        )
    }
}
