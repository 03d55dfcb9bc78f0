//! Native status translation
//!
//! Every `Fwpm*` call returns a raw `DWORD`. This module gives those codes a
//! name and sorts them into the outcomes the engine acts on:
//!
//! - **Success**: `ERROR_SUCCESS`
//! - **Benign**: the object already exists (on create) or is already gone
//!   (on delete). Callers map these to success.
//! - **Recoverable**: the call may succeed if retried (timeouts, aborted
//!   transactions, busy RPC server).
//! - **Fatal**: everything else, including "in use".

use serde::{Deserialize, Serialize};
use std::fmt;

pub const ERROR_SUCCESS: u32 = 0;
pub const ERROR_FILE_NOT_FOUND: u32 = 2;
pub const ERROR_PATH_NOT_FOUND: u32 = 3;
pub const ERROR_ACCESS_DENIED: u32 = 5;
pub const ERROR_INVALID_HANDLE: u32 = 6;
pub const ERROR_NOT_ENOUGH_MEMORY: u32 = 8;
pub const ERROR_NOT_SUPPORTED: u32 = 50;
pub const ERROR_INVALID_PARAMETER: u32 = 87;
pub const RPC_S_SERVER_UNAVAILABLE: u32 = 1722;
pub const RPC_S_SERVER_TOO_BUSY: u32 = 1723;
pub const E_UNEXPECTED: u32 = 0x8000_FFFF;

pub const FWP_E_CALLOUT_NOT_FOUND: u32 = 0x8032_0001;
pub const FWP_E_CONDITION_NOT_FOUND: u32 = 0x8032_0002;
pub const FWP_E_FILTER_NOT_FOUND: u32 = 0x8032_0003;
pub const FWP_E_LAYER_NOT_FOUND: u32 = 0x8032_0004;
pub const FWP_E_PROVIDER_NOT_FOUND: u32 = 0x8032_0005;
pub const FWP_E_PROVIDER_CONTEXT_NOT_FOUND: u32 = 0x8032_0006;
pub const FWP_E_SUBLAYER_NOT_FOUND: u32 = 0x8032_0007;
pub const FWP_E_NOT_FOUND: u32 = 0x8032_0008;
pub const FWP_E_ALREADY_EXISTS: u32 = 0x8032_0009;
pub const FWP_E_IN_USE: u32 = 0x8032_000A;
pub const FWP_E_DYNAMIC_SESSION_IN_PROGRESS: u32 = 0x8032_000B;
pub const FWP_E_WRONG_SESSION: u32 = 0x8032_000C;
pub const FWP_E_NO_TXN_IN_PROGRESS: u32 = 0x8032_000D;
pub const FWP_E_TXN_IN_PROGRESS: u32 = 0x8032_000E;
pub const FWP_E_TXN_ABORTED: u32 = 0x8032_000F;
pub const FWP_E_SESSION_ABORTED: u32 = 0x8032_0010;
pub const FWP_E_INCOMPATIBLE_TXN: u32 = 0x8032_0011;
pub const FWP_E_TIMEOUT: u32 = 0x8032_0012;
pub const FWP_E_INVALID_NET_MASK: u32 = 0x8032_001F;
pub const FWP_E_INVALID_RANGE: u32 = 0x8032_0020;
pub const FWP_E_INVALID_WEIGHT: u32 = 0x8032_0025;
pub const FWP_E_INVALID_PARAMETER: u32 = 0x8032_0035;

/// Raw status returned by a native filtering call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NativeStatus(pub u32);

/// What a status means to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Success,
    AlreadyExists,
    NotFound,
    /// Object still referenced (e.g. a sublayer that holds filters)
    InUse,
    Transient,
    Fatal,
}

/// Propagation policy for a [`StatusKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Success,
    Benign,
    Recoverable,
    Fatal,
}

impl StatusKind {
    pub fn severity(self) -> Severity {
        match self {
            StatusKind::Success => Severity::Success,
            StatusKind::AlreadyExists | StatusKind::NotFound => Severity::Benign,
            StatusKind::Transient => Severity::Recoverable,
            StatusKind::InUse | StatusKind::Fatal => Severity::Fatal,
        }
    }
}

impl NativeStatus {
    pub const SUCCESS: NativeStatus = NativeStatus(ERROR_SUCCESS);

    pub fn from_code(code: u32) -> Self {
        NativeStatus(code)
    }

    pub fn code(self) -> u32 {
        self.0
    }

    pub fn is_success(self) -> bool {
        self.0 == ERROR_SUCCESS
    }

    pub fn kind(self) -> StatusKind {
        match self.0 {
            ERROR_SUCCESS => StatusKind::Success,
            FWP_E_ALREADY_EXISTS => StatusKind::AlreadyExists,
            FWP_E_NOT_FOUND
            | FWP_E_FILTER_NOT_FOUND
            | FWP_E_PROVIDER_NOT_FOUND
            | FWP_E_SUBLAYER_NOT_FOUND
            | FWP_E_PROVIDER_CONTEXT_NOT_FOUND
            | FWP_E_CALLOUT_NOT_FOUND
            | FWP_E_CONDITION_NOT_FOUND => StatusKind::NotFound,
            FWP_E_IN_USE => StatusKind::InUse,
            FWP_E_TIMEOUT
            | FWP_E_TXN_ABORTED
            | FWP_E_SESSION_ABORTED
            | RPC_S_SERVER_UNAVAILABLE
            | RPC_S_SERVER_TOO_BUSY => StatusKind::Transient,
            _ => StatusKind::Fatal,
        }
    }

    pub fn severity(self) -> Severity {
        self.kind().severity()
    }

    /// Success, or a benign status for a create.
    pub fn created_or_exists(self) -> bool {
        matches!(self.kind(), StatusKind::Success | StatusKind::AlreadyExists)
    }

    /// Success, or a benign status for a delete.
    pub fn deleted_or_missing(self) -> bool {
        matches!(self.kind(), StatusKind::Success | StatusKind::NotFound)
    }

    /// Symbolic name, when the code is one we know.
    pub fn name(self) -> Option<&'static str> {
        let name = match self.0 {
            ERROR_SUCCESS => "ERROR_SUCCESS",
            ERROR_FILE_NOT_FOUND => "ERROR_FILE_NOT_FOUND",
            ERROR_PATH_NOT_FOUND => "ERROR_PATH_NOT_FOUND",
            ERROR_ACCESS_DENIED => "ERROR_ACCESS_DENIED",
            ERROR_INVALID_HANDLE => "ERROR_INVALID_HANDLE",
            ERROR_NOT_ENOUGH_MEMORY => "ERROR_NOT_ENOUGH_MEMORY",
            ERROR_NOT_SUPPORTED => "ERROR_NOT_SUPPORTED",
            ERROR_INVALID_PARAMETER => "ERROR_INVALID_PARAMETER",
            RPC_S_SERVER_UNAVAILABLE => "RPC_S_SERVER_UNAVAILABLE",
            RPC_S_SERVER_TOO_BUSY => "RPC_S_SERVER_TOO_BUSY",
            E_UNEXPECTED => "E_UNEXPECTED",
            FWP_E_CALLOUT_NOT_FOUND => "FWP_E_CALLOUT_NOT_FOUND",
            FWP_E_CONDITION_NOT_FOUND => "FWP_E_CONDITION_NOT_FOUND",
            FWP_E_FILTER_NOT_FOUND => "FWP_E_FILTER_NOT_FOUND",
            FWP_E_LAYER_NOT_FOUND => "FWP_E_LAYER_NOT_FOUND",
            FWP_E_PROVIDER_NOT_FOUND => "FWP_E_PROVIDER_NOT_FOUND",
            FWP_E_PROVIDER_CONTEXT_NOT_FOUND => "FWP_E_PROVIDER_CONTEXT_NOT_FOUND",
            FWP_E_SUBLAYER_NOT_FOUND => "FWP_E_SUBLAYER_NOT_FOUND",
            FWP_E_NOT_FOUND => "FWP_E_NOT_FOUND",
            FWP_E_ALREADY_EXISTS => "FWP_E_ALREADY_EXISTS",
            FWP_E_IN_USE => "FWP_E_IN_USE",
            FWP_E_DYNAMIC_SESSION_IN_PROGRESS => "FWP_E_DYNAMIC_SESSION_IN_PROGRESS",
            FWP_E_WRONG_SESSION => "FWP_E_WRONG_SESSION",
            FWP_E_NO_TXN_IN_PROGRESS => "FWP_E_NO_TXN_IN_PROGRESS",
            FWP_E_TXN_IN_PROGRESS => "FWP_E_TXN_IN_PROGRESS",
            FWP_E_TXN_ABORTED => "FWP_E_TXN_ABORTED",
            FWP_E_SESSION_ABORTED => "FWP_E_SESSION_ABORTED",
            FWP_E_INCOMPATIBLE_TXN => "FWP_E_INCOMPATIBLE_TXN",
            FWP_E_TIMEOUT => "FWP_E_TIMEOUT",
            FWP_E_INVALID_NET_MASK => "FWP_E_INVALID_NET_MASK",
            FWP_E_INVALID_RANGE => "FWP_E_INVALID_RANGE",
            FWP_E_INVALID_WEIGHT => "FWP_E_INVALID_WEIGHT",
            FWP_E_INVALID_PARAMETER => "FWP_E_INVALID_PARAMETER",
            _ => return None,
        };
        Some(name)
    }

    /// Convert a raw return code into a `Result`.
    pub fn check(code: u32) -> Result<(), NativeStatus> {
        if code == ERROR_SUCCESS {
            Ok(())
        } else {
            Err(NativeStatus(code))
        }
    }
}

impl fmt::Display for NativeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "0x{:08X} ({})", self.0, name),
            None => write!(f, "0x{:08X}", self.0),
        }
    }
}

impl From<u32> for NativeStatus {
    fn from(code: u32) -> Self {
        NativeStatus(code)
    }
}
