#![forbid(unsafe_code)]
//! Error types for the APFS checker.
//!
//! Defines `CheckError` and a `Result<T>` alias used throughout the
//! workspace. Structural corruption is fatal by design: a `Corruption`
//! value propagates unmodified to the top of the check and aborts it, so
//! every site that detects an inconsistency names the affected subsystem
//! and describes the problem once.

use apck_types::ParseError;
use thiserror::Error;

/// Unified error type for all checker operations.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Parse(#[from] ParseError),

    /// A structural inconsistency in the on-disk filesystem. The context
    /// names the subsystem ("B-tree node", "Object map", ...) and the
    /// detail describes the violation, usually with the offending block.
    #[error("{context}: {detail}")]
    Corruption {
        context: &'static str,
        detail: String,
    },

    /// The filesystem uses a feature this tool does not validate. Kept
    /// separate from `Corruption` so callers can tell "unsupported" from
    /// "broken".
    #[error("unsupported feature: {0}")]
    UnknownFeature(&'static str),
}

/// Build a fatal structural-corruption error.
#[must_use]
pub fn corruption(context: &'static str, detail: impl Into<String>) -> CheckError {
    CheckError::Corruption {
        context,
        detail: detail.into(),
    }
}

/// Result alias using `CheckError`.
pub type Result<T> = std::result::Result<T, CheckError>;
