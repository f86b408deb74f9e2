// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the verification engine.
//!
//! Errors are `Clone` because a single failed accept-stream rejects every
//! consumer waiting on the block it held. They cross the `AsyncRead` and
//! `AsyncWrite` boundaries of the stream adapters as [`std::io::Error`] and
//! are recovered intact on the other side.

use std::io;

pub type Result<T> = std::result::Result<T, AuthflowError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthflowError {
    /// A block was already claimed or verified when a stream tried to claim it.
    #[error("Block {block} already resolved or claimed by another stream")]
    DuplicateClaim { block: usize },

    #[error("Verification failed: {message}")]
    Verification { message: String },

    #[error("Stream cancelled")]
    Cancelled,

    #[error("Range error: {message}")]
    Range { message: String },

    #[error("Unexpected end of stream: needed {needed} bytes, {buffered} buffered")]
    UnexpectedEof { needed: usize, buffered: usize },

    #[error("Upstream error ({kind:?}): {message}")]
    Upstream { kind: io::ErrorKind, message: String },

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// A hash needed to re-wrap verified data is absent from the cache.
    #[error("Missing hash: {what}")]
    MissingHash { what: String },

    #[error("Config error: {0}")]
    Config(String),
}

impl AuthflowError {
    pub fn verification(message: impl Into<String>) -> Self {
        AuthflowError::Verification {
            message: message.into(),
        }
    }

    pub fn range(message: impl Into<String>) -> Self {
        AuthflowError::Range {
            message: message.into(),
        }
    }

    pub fn upstream(kind: io::ErrorKind, message: impl Into<String>) -> Self {
        AuthflowError::Upstream {
            kind,
            message: message.into(),
        }
    }

    pub fn missing_hash(what: impl Into<String>) -> Self {
        AuthflowError::MissingHash { what: what.into() }
    }

    /// True for failures that say something about the data on the wire,
    /// as opposed to coordination signals, which are logged quietly.
    #[must_use]
    pub fn reverts_claim(&self) -> bool {
        !matches!(
            self,
            AuthflowError::DuplicateClaim { .. } | AuthflowError::Cancelled
        )
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            AuthflowError::Verification { .. } => io::ErrorKind::InvalidData,
            AuthflowError::UnexpectedEof { .. } => io::ErrorKind::UnexpectedEof,
            AuthflowError::Cancelled => io::ErrorKind::Interrupted,
            AuthflowError::Range { .. } => io::ErrorKind::InvalidInput,
            AuthflowError::Upstream { kind, .. } => *kind,
            _ => io::ErrorKind::Other,
        }
    }
}

impl From<io::Error> for AuthflowError {
    fn from(err: io::Error) -> Self {
        if let Some(inner) = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<AuthflowError>())
        {
            return inner.clone();
        }
        AuthflowError::upstream(err.kind(), err.to_string())
    }
}

impl From<AuthflowError> for io::Error {
    fn from(err: AuthflowError) -> Self {
        io::Error::new(err.io_kind(), err)
    }
}

impl From<serde_yaml_ng::Error> for AuthflowError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        AuthflowError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_roundtrip_preserves_variant() {
        let original = AuthflowError::verification("bad root");
        let io_err: io::Error = original.clone().into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);

        let back: AuthflowError = io_err.into();
        assert_eq!(back, original);
    }

    #[test]
    fn test_foreign_io_error_becomes_upstream() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "peer went away");
        match AuthflowError::from(io_err) {
            AuthflowError::Upstream { kind, message } => {
                assert_eq!(kind, io::ErrorKind::ConnectionReset);
                assert!(message.contains("peer went away"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_claim_reverting_classification() {
        assert!(!AuthflowError::DuplicateClaim { block: 0 }.reverts_claim());
        assert!(!AuthflowError::Cancelled.reverts_claim());
        assert!(AuthflowError::verification("x").reverts_claim());
        assert!(
            AuthflowError::UnexpectedEof {
                needed: 4,
                buffered: 1
            }
            .reverts_claim()
        );
    }
}
