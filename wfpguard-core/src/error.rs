//! Error types for the filter engine

use crate::status::{
    NativeStatus, Severity, E_UNEXPECTED, ERROR_INVALID_PARAMETER, ERROR_NOT_SUPPORTED,
    FWP_E_IN_USE,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("{operation} failed: {status}")]
    Native { operation: String, status: NativeStatus },

    #[error("Sublayer {sublayer} is in use: remove its filters first")]
    SublayerInUse { sublayer: Uuid },

    #[error("Failed to resolve application identity for '{path}': {status}")]
    ProcessIdentity { path: String, status: NativeStatus },

    #[error("Invalid filter '{rule_id}': {reason}")]
    InvalidFilter { rule_id: String, reason: String },

    #[error("Windows Filtering Platform is not available on this platform")]
    NotSupported,

    #[error("Unexpected failure during {operation}: {message}")]
    Unexpected { operation: String, message: String },

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type FilterResult<T> = Result<T, FilterError>;

impl FilterError {
    pub fn native(operation: impl Into<String>, status: NativeStatus) -> Self {
        FilterError::Native {
            operation: operation.into(),
            status,
        }
    }

    pub fn invalid(rule_id: impl Into<String>, reason: impl Into<String>) -> Self {
        FilterError::InvalidFilter {
            rule_id: rule_id.into(),
            reason: reason.into(),
        }
    }

    /// Machine-readable code: the native status where there is one.
    pub fn code(&self) -> u32 {
        match self {
            FilterError::Native { status, .. } => status.code(),
            FilterError::SublayerInUse { .. } => FWP_E_IN_USE,
            FilterError::ProcessIdentity { status, .. } => status.code(),
            FilterError::InvalidFilter { .. } | FilterError::Settings(_) => ERROR_INVALID_PARAMETER,
            FilterError::NotSupported => ERROR_NOT_SUPPORTED,
            FilterError::Unexpected { .. } => E_UNEXPECTED,
            FilterError::Io(e) => e.raw_os_error().map(|c| c as u32).unwrap_or(E_UNEXPECTED),
        }
    }

    /// True when retrying the whole operation may succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            FilterError::Native { status, .. } => status.severity() == Severity::Recoverable,
            _ => false,
        }
    }
}
