use std::ffi::OsString;
use std::io;

use thiserror::Error;

use crate::branch::BIndex;

#[derive(Debug, Error)]
pub enum UnionError {
    #[error("{0:?}: no such entry in any branch")]
    NotFound(OsString),

    #[error("branch {bindex} is busy ({count} open references)")]
    Busy { bindex: BIndex, count: usize },

    #[error("{path}: resolution did not converge after {attempts} attempts")]
    StaleRetryExceeded { path: String, attempts: u32 },

    #[error(transparent)]
    IoFailure(#[from] io::Error),

    #[error("invalid branch range: {context}")]
    InvalidRange { context: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, UnionError>;

impl UnionError {
    pub(crate) fn invalid_range(context: impl Into<String>) -> Self {
        let context = context.into();
        error!("invalid branch range reached: {context}");
        UnionError::InvalidRange { context }
    }

    /// The errno the host dispatch layer should report for this error.
    pub fn errno(&self) -> i32 {
        match self {
            UnionError::NotFound(_) => libc::ENOENT,
            UnionError::Busy { .. } => libc::EBUSY,
            UnionError::StaleRetryExceeded { .. } => libc::ESTALE,
            UnionError::IoFailure(e) => e.raw_os_error().unwrap_or(libc::EIO),
            UnionError::InvalidRange { .. } => libc::EIO,
            UnionError::InvalidArgument(_) | UnionError::InvalidConfig(_) => libc::EINVAL,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, UnionError::NotFound(_))
    }
}

impl From<UnionError> for io::Error {
    fn from(e: UnionError) -> Self {
        match e {
            UnionError::IoFailure(e) => e,
            other => io::Error::from_raw_os_error(other.errno()),
        }
    }
}
