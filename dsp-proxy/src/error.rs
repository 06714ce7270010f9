//! Crate-wide error type.
//!
//! | Class | Variants | Recovery |
//! |-------|----------|----------|
//! | Deadline | [`Error::Timeout`], [`Error::Interrupted`] | retry the whole request |
//! | Resources | [`Error::ExhaustedPool`], [`Error::OutOfMemory`] | reconfigure, never retried |
//! | Protocol | [`Error::UnexpectedResponse`], [`Error::Rejected`] | component is desynchronised |
//! | Setup | [`Error::DeviceUnavailable`], [`Error::NotFound`] | retry setup, not mid-session |
//! | Programming | [`Error::InvalidState`], [`Error::InvalidArgument`], [`Error::BadAddress`] | fix the caller |
//!
//! Abnormal termination of a remote component is not represented here: it
//! aborts the process from the proxy receive path.

use thiserror::Error;

use crate::opcode::Opcode;

#[derive(Debug, Error)]
pub enum Error {
    #[error("timed out waiting for the remote core")]
    Timeout,

    #[error("wait interrupted by a signal")]
    Interrupted,

    #[error("pool exhausted")]
    ExhaustedPool,

    #[error("out of memory")]
    OutOfMemory,

    #[error("unexpected response: expected {expected}, got {got}")]
    UnexpectedResponse { expected: String, got: String },

    #[error("remote device unavailable")]
    DeviceUnavailable,

    #[error("not found")]
    NotFound,

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("address {0:#x} outside the shared region")]
    BadAddress(u64),

    #[error("remote endpoint rejected {opcode:?} with code {code}")]
    Rejected { opcode: Opcode, code: i32 },

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    pub(crate) fn unexpected(expected: impl core::fmt::Debug, got: impl core::fmt::Debug) -> Self {
        Error::UnexpectedResponse {
            expected: format!("{expected:?}"),
            got: format!("{got:?}"),
        }
    }

    /// Whether retrying the failed request (not the session) can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout | Error::Interrupted)
    }
}

/// Keep the first error from a sequence of cleanup steps that must all run.
pub(crate) fn first_error(acc: Result<()>, step: Result<()>) -> Result<()> {
    match (acc, step) {
        (Err(e), _) => Err(e),
        (Ok(()), r) => r,
    }
}
