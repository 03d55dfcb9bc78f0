//! Filtering backends
//!
//! The engine talks to the filter table through two traits that mirror the
//! `Fwpm*` API one call at a time. Every method returns the raw
//! [`NativeStatus`] on failure; deciding what a status means is left to the
//! caller.
//!
//! - [`wfp`]: the Windows Filtering Platform (Base Filtering Engine)
//! - [`memory`]: an in-process filter table with the same status semantics,
//!   used by the test-suite and for dry runs

pub mod memory;
pub mod wfp;

#[cfg(windows)]
mod marshal;

use crate::builder::FilterPlan;
use crate::error::FilterResult;
use crate::filter::ExistingFilter;
use crate::identity::{ProviderSpec, SublayerSpec};
use crate::status::NativeStatus;
use uuid::Uuid;

pub use memory::{MemoryBackend, MemorySession, StoredFilter};
pub use wfp::{WfpBackend, WfpSession};

/// Opens sessions to a filter table
pub trait FilterBackend: Send + Sync {
    type Session: BackendSession;

    /// Open a new session. The session is closed when dropped.
    fn open_session(&self) -> FilterResult<Self::Session>;
}

/// One open session to a filter table
///
/// Mutations made between `begin_transaction` and `commit_transaction` are
/// invisible to other sessions until the commit succeeds.
pub trait BackendSession {
    /// Enumeration cursor handle
    type Cursor: Copy;
    /// Resolved application identity. Dropping it releases the native blob.
    type AppId;

    fn begin_transaction(&self) -> Result<(), NativeStatus>;
    fn commit_transaction(&self) -> Result<(), NativeStatus>;
    fn abort_transaction(&self) -> Result<(), NativeStatus>;

    fn get_provider(&self, key: &Uuid) -> Result<(), NativeStatus>;
    fn add_provider(&self, provider: &ProviderSpec) -> Result<(), NativeStatus>;
    fn delete_provider(&self, key: &Uuid) -> Result<(), NativeStatus>;

    fn get_sublayer(&self, key: &Uuid) -> Result<(), NativeStatus>;
    fn add_sublayer(&self, sublayer: &SublayerSpec) -> Result<(), NativeStatus>;
    fn delete_sublayer(&self, key: &Uuid) -> Result<(), NativeStatus>;

    /// Cursor over every filter in the table (no sublayer predicate exists)
    fn create_filter_enum(&self) -> Result<Self::Cursor, NativeStatus>;
    /// Next batch of at most `max_entries` records; empty when exhausted.
    /// Native batch memory is released before this returns.
    fn fetch_filters(
        &self,
        cursor: Self::Cursor,
        max_entries: u32,
    ) -> Result<Vec<FilterRecord>, NativeStatus>;
    fn destroy_filter_enum(&self, cursor: Self::Cursor) -> Result<(), NativeStatus>;

    fn resolve_app_id(&self, path: &str) -> Result<Self::AppId, NativeStatus>;
    /// Add one filter; returns the engine-assigned filter ID
    fn add_filter(
        &self,
        plan: &FilterPlan,
        app_id: Option<&Self::AppId>,
    ) -> Result<u64, NativeStatus>;
    fn get_filter(&self, key: &Uuid) -> Result<(), NativeStatus>;
    fn delete_filter_by_key(&self, key: &Uuid) -> Result<(), NativeStatus>;
    fn delete_filter_by_id(&self, filter_id: u64) -> Result<(), NativeStatus>;
}

/// One filter as read back from the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRecord {
    pub filter_key: Uuid,
    pub filter_id: u64,
    pub sublayer_key: Uuid,
    pub display_name: String,
}

impl From<FilterRecord> for ExistingFilter {
    fn from(record: FilterRecord) -> Self {
        ExistingFilter {
            filter_key: record.filter_key,
            filter_id: record.filter_id,
            display_name: record.display_name,
        }
    }
}
