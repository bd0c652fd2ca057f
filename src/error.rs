//! Custom error types for the event builder.
//!
//! This module defines the primary error type, `EvbError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the few hard failures the builder can report. Ordering anomalies (late data,
//! duplicate timestamps, partial barriers, flow control) are *not* errors; they are
//! delivered to observers and processing continues.
//!
//! ## Error Hierarchy
//!
//! - **`SizeMismatch`**: a flattened fragment batch whose declared sizes do not fit
//!   the byte count supplied. Fragments preceding the bad one stay queued.
//! - **`PayloadTooLarge`**: a payload whose length does not fit the 32-bit
//!   header size field.
//! - **`UnknownConnection`** / **`ConnectionNotFailed`**: administrative calls naming
//!   a connection the handler does not know in the required state.
//! - **`Config`** / **`Configuration`**: configuration parse errors from `figment`
//!   and semantic validation errors respectively.
//! - **`Io`**: file I/O from the CLI tools.
//! - **`ServiceStopped`**: the async service task exited while a caller still held
//!   a handle to it.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type EvbResult<T> = std::result::Result<T, EvbError>;

/// Primary error type for the event builder.
#[derive(Error, Debug)]
pub enum EvbError {
    /// A flattened fragment claims more bytes than remain in the batch.
    #[error(
        "Fragment size mismatch at byte offset {offset}: needs {needed} bytes but only {available} remain"
    )]
    SizeMismatch {
        /// Offset of the offending fragment within the batch
        offset: usize,
        /// Bytes the fragment header says it occupies
        needed: usize,
        /// Bytes left in the batch at that offset
        available: usize,
    },

    /// A payload too long for the 32-bit size field of the fragment header.
    #[error("Fragment payload of {len} bytes exceeds the {max} byte header limit", max = u32::MAX)]
    PayloadTooLarge {
        /// Payload length in bytes
        len: usize,
    },

    /// A connection name that was never registered with `create_source_queue`.
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// `revive_socket` on a connection that is not marked failed.
    #[error("Connection '{0}' has not been marked failed")]
    ConnectionNotFailed(String),

    /// Configuration file or environment could not be extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but holds invalid values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File or stream I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The service event loop is no longer running.
    #[error("Event builder service has stopped")]
    ServiceStopped,
}

impl From<figment::Error> for EvbError {
    fn from(value: figment::Error) -> Self {
        EvbError::Config(Box::new(value))
    }
}

impl EvbError {
    /// Whether the caller can keep using the handler after this error.
    ///
    /// Input and administrative errors leave the handler consistent; a stopped
    /// service or a broken configuration does not.
    pub fn can_recover(&self) -> bool {
        matches!(
            self,
            EvbError::SizeMismatch { .. }
                | EvbError::PayloadTooLarge { .. }
                | EvbError::UnknownConnection(_)
                | EvbError::ConnectionNotFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_mismatch_message_names_offset_and_sizes() {
        let err = EvbError::SizeMismatch {
            offset: 40,
            needed: 120,
            available: 32,
        };
        let msg = err.to_string();
        assert!(msg.contains("offset 40"));
        assert!(msg.contains("needs 120"));
        assert!(msg.contains("only 32"));
    }

    #[test]
    fn admin_errors_are_recoverable() {
        assert!(EvbError::UnknownConnection("crate1".into()).can_recover());
        assert!(EvbError::ConnectionNotFailed("crate1".into()).can_recover());
        assert!(!EvbError::ServiceStopped.can_recover());
        assert!(!EvbError::Configuration("bad".into()).can_recover());
    }

    #[test]
    fn figment_errors_convert() {
        let err: EvbError = figment::Error::from("missing field".to_string()).into();
        match err {
            EvbError::Config(inner) => assert!(inner.to_string().contains("missing field")),
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
