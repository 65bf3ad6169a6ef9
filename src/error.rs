//! Consolidated error taxonomy for the manager.
//!
//! Collapses what could be several per-subsystem error types
//! (`CompressionError`, `DiskIoError`, `GpuTransferError`,
//! `AllocatorError`, `LlamaError`-style splits) into one taxonomy for the
//! whole crate, since callers of `Orchestrator::append` don't care which
//! internal component raised the problem.

use std::fmt;

pub type ManagerResult<T> = Result<T, ManagerError>;

#[derive(thiserror::Error, Debug)]
pub enum ManagerError {
    /// A tensor operation received operands whose shapes are incompatible.
    #[error("shape mismatch in {context}: {detail}")]
    ShapeMismatch {
        context: &'static str,
        detail: String,
    },

    /// `ManagerConfig::validate` rejected the configuration.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// An internal invariant the manager depends on was violated
    /// (e.g. requesting more candidate blocks than are cached).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// A host/device transfer failed to complete.
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    /// The external attention or rotary-embedding primitive returned an
    /// error. Boxed because the manager doesn't know the primitive's own
    /// error type.
    #[error("attention primitive failed: {0}")]
    PrimitiveFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ManagerError {
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigInvalid(msg.into())
    }

    pub fn transfer(msg: impl Into<String>) -> Self {
        Self::TransferFailed(msg.into())
    }

    pub fn primitive<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::PrimitiveFailed(Box::new(err))
    }
}

/// A simple string-based error usable where `ReferenceAttention` and
/// `RotaryEmbedding` need an `std::error::Error` to wrap via
/// `ManagerError::primitive`.
#[derive(Debug)]
pub struct PrimitiveError(pub String);

impl fmt::Display for PrimitiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for PrimitiveError {}
