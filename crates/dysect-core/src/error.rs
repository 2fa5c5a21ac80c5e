//! Error types for dysect-core.
//!
//! A single closed taxonomy covers the whole core. Recovery policy is
//! driven by classification, not by variant-specific handling at call
//! sites:
//!
//! - probe-local errors mark the owning probe dead and leave siblings
//!   running ([`DysectError::is_probe_local`]);
//! - packet errors drop the offending packet and keep the stream open
//!   ([`DysectError::is_packet_local`]);
//! - [`DysectError::Fatal`] tears the session down cleanly.

use thiserror::Error;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, DysectError>;

/// Main error type for dysect-core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DysectError {
    /// A probe references a domain that was never resolved.
    #[error("domain not found: {0}")]
    DomainNotFound(String),

    /// A group rank expression failed to parse.
    #[error("domain expression error: {0}")]
    DomainExpressionError(String),

    /// Overlay stream setup or mid-session stream failure.
    #[error("stream error: {0}")]
    StreamError(String),

    /// A code location names a library that is not loaded yet.
    #[error("library not loaded: {0}")]
    LibraryNotLoaded(String),

    /// Symbol, source-line, or expression resolution failed.
    #[error("resolution failure: {0}")]
    ResolutionFailure(String),

    /// The debugger engine reported a transient target failure.
    #[error("transient target failure: {0}")]
    TargetTransient(String),

    /// A wire packet's lengths overran the buffer or violated the layout.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// Two aggregates with the same id disagree on kind.
    #[error("aggregate kind mismatch for id {id}: {left} vs {right}")]
    KindMismatch {
        /// Aggregate id both sides claim.
        id: u32,
        /// Kind label on the left input.
        left: &'static str,
        /// Kind label on the right input.
        right: &'static str,
    },

    /// Unrecoverable failure; the session must be torn down.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl DysectError {
    /// True when recovery is "mark the owning probe dead, keep siblings".
    #[must_use]
    pub fn is_probe_local(&self) -> bool {
        matches!(
            self,
            Self::ResolutionFailure(_)
                | Self::TargetTransient(_)
                | Self::DomainExpressionError(_)
                | Self::DomainNotFound(_)
                | Self::LibraryNotLoaded(_)
        )
    }

    /// True when recovery is "drop the packet, keep the stream open".
    #[must_use]
    pub fn is_packet_local(&self) -> bool {
        matches!(self, Self::MalformedPacket(_) | Self::KindMismatch { .. })
    }

    /// True when the session must be torn down.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_disjoint() {
        let probe_local = DysectError::ResolutionFailure("x".into());
        assert!(probe_local.is_probe_local());
        assert!(!probe_local.is_packet_local());
        assert!(!probe_local.is_fatal());

        let packet_local = DysectError::MalformedPacket("short".into());
        assert!(packet_local.is_packet_local());
        assert!(!packet_local.is_probe_local());

        let fatal = DysectError::Fatal("boom".into());
        assert!(fatal.is_fatal());
        assert!(!fatal.is_probe_local());
        assert!(!fatal.is_packet_local());
    }

    #[test]
    fn kind_mismatch_message_names_both_kinds() {
        let err = DysectError::KindMismatch {
            id: 7,
            left: "min",
            right: "max",
        };
        let msg = err.to_string();
        assert!(msg.contains("id 7"));
        assert!(msg.contains("min"));
        assert!(msg.contains("max"));
    }
}
