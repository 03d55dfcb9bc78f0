//! WfpGuard Core Library
//!
//! Filter reconciliation and transactional apply engine over the Windows
//! Filtering Platform. Takes a list of compiled filters, diffs it against
//! what is installed in the engine's sublayer and applies the difference in
//! one transaction. Used by the native C ABI and the smoke-test binary.

pub mod backend;
pub mod bootstrap;
pub mod builder;
pub mod diff;
pub mod engine;
pub mod enumerate;
pub mod error;
pub mod error_messages;
pub mod filter;
pub mod identity;
pub mod session;
pub mod settings;
pub mod status;
pub mod utils;

// Re-export commonly used items
pub use backend::{MemoryBackend, WfpBackend};
pub use diff::{compute_diff, FilterDiff};
pub use engine::{demo_filter, EngineOptions, FilterEngine, DEMO_FILTER_KEY};
pub use error::{FilterError, FilterResult};
pub use error_messages::user_friendly_error;
pub use filter::{
    ApplyResult, CompiledFilter, Direction, ExistingFilter, FilterAction, PortMatch, RemoteAddress,
};
pub use identity::{EngineIdentity, WFPGUARD_PROVIDER_KEY, WFPGUARD_SUBLAYER_KEY};
pub use settings::{load_settings, load_settings_from, save_settings_to, EngineSettings};
pub use status::{NativeStatus, Severity, StatusKind};
pub use utils::with_retry_sync;
