//! Filter engine
//!
//! [`FilterEngine`] is the public entry point. Every operation opens its own
//! session, so one engine can be shared between threads; concurrent calls
//! are serialized by the filter table's transactions, never by a lock here.
//!
//! `apply_filters` flow:
//! 1. Validate the batch (no native calls yet)
//! 2. Bootstrap provider and sublayer (own transaction)
//! 3. Enumerate the sublayer
//! 4. Diff by key; an empty diff returns without opening a transaction
//! 5. One transaction: delete obsolete keys, add new filters, commit
//!
//! Any failure in step 5 drops the transaction guard, which aborts, so the
//! table is left exactly as it was before the call. Panics are caught at the
//! operation boundary after the guard has aborted during unwinding.

use crate::backend::{BackendSession, FilterBackend};
use crate::bootstrap;
use crate::builder::build_and_add_filter;
use crate::diff::compute_diff;
use crate::enumerate::{enumerate_filters_in_sublayer, DEFAULT_BATCH_SIZE};
use crate::error::{FilterError, FilterResult};
use crate::filter::{
    protocol, ApplyResult, CompiledFilter, Direction, ExistingFilter, FilterAction, PortMatch,
    RemoteAddress,
};
use crate::identity::EngineIdentity;
use crate::session::{open_session, with_transaction, Transaction};
use crate::settings::{EngineSettings, DEFAULT_RETRY_ATTEMPTS};
use crate::status::StatusKind;
use crate::utils::with_retry_sync;
use std::any::Any;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::panic::{self, AssertUnwindSafe};
use uuid::Uuid;

/// Key of the diagnostic block filter
pub const DEMO_FILTER_KEY: Uuid = Uuid::from_u128(0x5f3b9c4e_7a21_4d6b_9e0f_2c8a1b7d4e40);

const DEMO_ADDRESS: Ipv4Addr = Ipv4Addr::new(1, 1, 1, 1);
const DEMO_PORT: u16 = 80;

/// The diagnostic filter: block outbound TCP to 1.1.1.1:80
///
/// It has no explicit weight and lives in the engine's sublayer, so the next
/// `apply_filters` removes it unless the desired set contains it.
pub fn demo_filter() -> CompiledFilter {
    CompiledFilter {
        filter_key: DEMO_FILTER_KEY,
        rule_id: "wfpguard-demo".to_string(),
        action: FilterAction::Block,
        direction: Direction::Outbound,
        protocol: protocol::TCP,
        remote_address: Some(RemoteAddress::host(IpAddr::V4(DEMO_ADDRESS))),
        remote_port: Some(PortMatch::Exact { port: DEMO_PORT }),
        process_path: None,
        weight: None,
        display_name: "WfpGuard Demo Block".to_string(),
        description: "Blocks TCP to 1.1.1.1:80 to verify the installation".to_string(),
    }
}

/// Tunables not tied to the identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub enum_batch_size: u32,
    pub retry_attempts: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            enum_batch_size: DEFAULT_BATCH_SIZE,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
        }
    }
}

/// Reconciles the installed filters with a desired set
pub struct FilterEngine<B: FilterBackend> {
    backend: B,
    identity: EngineIdentity,
    options: EngineOptions,
}

impl<B: FilterBackend> FilterEngine<B> {
    pub fn new(backend: B, identity: EngineIdentity) -> Self {
        Self::with_options(backend, identity, EngineOptions::default())
    }

    pub fn with_options(backend: B, identity: EngineIdentity, options: EngineOptions) -> Self {
        Self {
            backend,
            identity,
            options,
        }
    }

    pub fn from_settings(backend: B, settings: &EngineSettings) -> Self {
        let settings = settings.clone().normalized();
        Self::with_options(
            backend,
            settings.identity,
            EngineOptions {
                enum_batch_size: settings.enum_batch_size,
                retry_attempts: settings.retry_attempts,
            },
        )
    }

    pub fn identity(&self) -> &EngineIdentity {
        &self.identity
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Run `body`, turning a panic into [`FilterError::Unexpected`]
    fn guarded<T>(
        &self,
        operation: &str,
        body: impl FnOnce() -> FilterResult<T>,
    ) -> FilterResult<T> {
        match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(result) => {
                if let Err(e) = &result {
                    log::error!("{} failed: {}", operation, e);
                }
                result
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("{} panicked: {}", operation, message);
                Err(FilterError::Unexpected {
                    operation: operation.to_string(),
                    message,
                })
            }
        }
    }

    pub fn ensure_provider_and_sublayer(&self) -> FilterResult<()> {
        self.guarded("EnsureProviderAndSublayerExist", || {
            let session = open_session(&self.backend)?;
            bootstrap::ensure_provider_and_sublayer(&session, &self.identity)
        })
    }

    pub fn remove_provider_and_sublayer(&self) -> FilterResult<()> {
        self.guarded("RemoveProviderAndSublayer", || {
            let session = open_session(&self.backend)?;
            bootstrap::remove_provider_and_sublayer(&session, &self.identity)
        })
    }

    pub fn provider_exists(&self) -> FilterResult<bool> {
        self.guarded("ProviderExists", || {
            let session = open_session(&self.backend)?;
            bootstrap::provider_exists(&session, &self.identity)
        })
    }

    pub fn sublayer_exists(&self) -> FilterResult<bool> {
        self.guarded("SublayerExists", || {
            let session = open_session(&self.backend)?;
            bootstrap::sublayer_exists(&session, &self.identity)
        })
    }

    /// Filters currently installed in the engine's sublayer
    pub fn list_filters(&self) -> FilterResult<Vec<ExistingFilter>> {
        self.guarded("ListFilters", || {
            let session = open_session(&self.backend)?;
            enumerate_filters_in_sublayer(
                &session,
                &self.identity.sublayer_key,
                self.options.enum_batch_size,
            )
        })
    }

    /// Make the sublayer hold exactly `desired`
    pub fn apply_filters(&self, desired: &[CompiledFilter]) -> FilterResult<ApplyResult> {
        self.guarded("ApplyFilters", || {
            let desired = validate_batch(desired)?;

            let session = open_session(&self.backend)?;
            bootstrap::ensure_provider_and_sublayer(&session, &self.identity)?;

            let existing = enumerate_filters_in_sublayer(
                &session,
                &self.identity.sublayer_key,
                self.options.enum_batch_size,
            )?;

            let diff = compute_diff(&desired, &existing);
            log::info!(
                "Filter diff: {} to add, {} to remove, {} unchanged",
                diff.to_add.len(),
                diff.to_remove.len(),
                diff.unchanged
            );

            if diff.is_empty() {
                return Ok(ApplyResult {
                    created: 0,
                    removed: 0,
                    unchanged: diff.unchanged,
                });
            }

            let txn = Transaction::begin(&session)?;

            for key in &diff.to_remove {
                delete_by_key(txn.session(), key)?;
            }

            for filter in &diff.to_add {
                build_and_add_filter(txn.session(), filter, &self.identity)?;
            }

            txn.commit()?;

            let result = ApplyResult {
                created: diff.to_add.len(),
                removed: diff.to_remove.len(),
                unchanged: diff.unchanged,
            };
            log::info!(
                "Filters applied: {} created, {} removed, {} unchanged",
                result.created,
                result.removed,
                result.unchanged
            );
            Ok(result)
        })
    }

    /// `apply_filters`, retried while the failure is transient
    pub fn apply_filters_with_retry(
        &self,
        desired: &[CompiledFilter],
    ) -> FilterResult<ApplyResult> {
        with_retry_sync(
            self.options.retry_attempts,
            FilterError::is_recoverable,
            || self.apply_filters(desired),
        )
    }

    /// Delete every filter in the sublayer; returns how many were removed
    pub fn remove_all_filters(&self) -> FilterResult<usize> {
        self.guarded("RemoveAllFilters", || {
            let session = open_session(&self.backend)?;
            let existing = enumerate_filters_in_sublayer(
                &session,
                &self.identity.sublayer_key,
                self.options.enum_batch_size,
            )?;

            if existing.is_empty() {
                log::info!("No filters to remove");
                return Ok(0);
            }

            with_transaction(&session, |s| {
                for filter in &existing {
                    if filter.filter_key.is_nil() {
                        delete_by_id(s, filter)?;
                    } else {
                        delete_by_key(s, &filter.filter_key)?;
                    }
                }
                Ok(())
            })?;

            log::info!("Removed {} filters", existing.len());
            Ok(existing.len())
        })
    }

    /// Install the diagnostic block filter (bootstraps the identity first)
    pub fn add_demo_block_filter(&self) -> FilterResult<()> {
        self.guarded("AddDemoBlockFilter", || {
            let session = open_session(&self.backend)?;
            bootstrap::ensure_provider_and_sublayer(&session, &self.identity)?;
            let demo = demo_filter();
            with_transaction(&session, |s| build_and_add_filter(s, &demo, &self.identity))?;
            log::info!("Demo block filter installed");
            Ok(())
        })
    }

    pub fn remove_demo_block_filter(&self) -> FilterResult<()> {
        self.guarded("RemoveDemoBlockFilter", || {
            let session = open_session(&self.backend)?;
            delete_by_key(&session, &DEMO_FILTER_KEY)?;
            log::info!("Demo block filter removed");
            Ok(())
        })
    }

    pub fn demo_block_filter_exists(&self) -> FilterResult<bool> {
        self.guarded("DemoBlockFilterExists", || {
            let session = open_session(&self.backend)?;
            match session.get_filter(&DEMO_FILTER_KEY) {
                Ok(()) => Ok(true),
                Err(status) if status.kind() == StatusKind::NotFound => Ok(false),
                Err(status) => Err(FilterError::native("FwpmFilterGetByKey0", status)),
            }
        })
    }
}

fn delete_by_key<S: BackendSession>(session: &S, key: &Uuid) -> FilterResult<()> {
    match session.delete_filter_by_key(key) {
        Ok(()) => {
            log::debug!("Removed filter {}", key);
            Ok(())
        }
        Err(status) if status.deleted_or_missing() => {
            log::debug!("Filter {} already removed", key);
            Ok(())
        }
        Err(status) => Err(FilterError::native(format!("Removing filter {}", key), status)),
    }
}

fn delete_by_id<S: BackendSession>(session: &S, filter: &ExistingFilter) -> FilterResult<()> {
    match session.delete_filter_by_id(filter.filter_id) {
        Ok(()) => {
            log::debug!("Removed filter ID {}", filter.filter_id);
            Ok(())
        }
        Err(status) if status.deleted_or_missing() => {
            log::debug!("Filter ID {} already removed", filter.filter_id);
            Ok(())
        }
        Err(status) => Err(FilterError::native(
            format!("Removing filter ID {} ('{}')", filter.filter_id, filter.display_name),
            status,
        )),
    }
}

/// Reject malformed filters and key collisions; collapse exact duplicates
pub fn validate_batch(desired: &[CompiledFilter]) -> FilterResult<Vec<CompiledFilter>> {
    let mut by_key: HashMap<Uuid, &CompiledFilter> = HashMap::with_capacity(desired.len());
    let mut batch = Vec::with_capacity(desired.len());

    for filter in desired {
        filter.validate()?;
        if filter.filter_key.is_nil() {
            return Err(FilterError::invalid(&filter.rule_id, "filter key is nil"));
        }

        match by_key.get(&filter.filter_key) {
            Some(previous) if *previous == filter => {
                log::debug!("Ignoring duplicate of rule '{}'", filter.rule_id);
            }
            Some(previous) => {
                return Err(FilterError::invalid(
                    &filter.rule_id,
                    format!(
                        "filter key {} is also used by rule '{}' with different content",
                        filter.filter_key, previous.rule_id
                    ),
                ));
            }
            None => {
                by_key.insert(filter.filter_key, filter);
                batch.push(filter.clone());
            }
        }
    }

    Ok(batch)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn engine() -> FilterEngine<MemoryBackend> {
        FilterEngine::new(
            MemoryBackend::new(),
            EngineIdentity::with_keys(Uuid::from_u128(0xE1), Uuid::from_u128(0xE2)),
        )
    }

    #[test]
    fn test_validate_batch_collapses_duplicates() {
        let a = CompiledFilter::builder("a").build().unwrap();
        let batch = validate_batch(&[a.clone(), a.clone()]).unwrap();
        assert_eq!(batch, vec![a]);
    }

    #[test]
    fn test_validate_batch_rejects_collision() {
        let a = CompiledFilter::builder("a").build().unwrap();
        let mut b = CompiledFilter::builder("b").build().unwrap();
        b.filter_key = a.filter_key;

        match validate_batch(&[a, b]) {
            Err(FilterError::InvalidFilter { rule_id, .. }) => assert_eq!(rule_id, "b"),
            other => panic!("Expected collision error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_batch_rejects_nil_key() {
        let mut a = CompiledFilter::builder("a").build().unwrap();
        a.filter_key = Uuid::nil();
        assert!(matches!(validate_batch(&[a]), Err(FilterError::InvalidFilter { .. })));
    }

    #[test]
    fn test_invalid_batch_touches_nothing() {
        let engine = engine();
        let mut bad = CompiledFilter::builder("bad").remote_port_range(1, 2).build().unwrap();
        bad.remote_port = Some(PortMatch::Range { start: 9, end: 1 });

        assert!(engine.apply_filters(&[bad]).is_err());
        assert_eq!(engine.backend().sessions_opened(), 0);
    }

    #[test]
    fn test_demo_filter_shape() {
        let demo = demo_filter();
        assert_eq!(demo.filter_key, DEMO_FILTER_KEY);
        assert_eq!(demo.weight, None);
        assert_eq!(demo.protocol, protocol::TCP);
        assert!(demo.validate().is_ok());
    }

    #[test]
    fn test_demo_filter_lifecycle() {
        let engine = engine();
        assert!(!engine.demo_block_filter_exists().unwrap());

        engine.add_demo_block_filter().unwrap();
        assert!(engine.demo_block_filter_exists().unwrap());
        // Adding again is idempotent
        engine.add_demo_block_filter().unwrap();

        engine.remove_demo_block_filter().unwrap();
        assert!(!engine.demo_block_filter_exists().unwrap());
        engine.remove_demo_block_filter().unwrap();
    }

    #[test]
    fn test_from_settings_clamps() {
        let settings = EngineSettings {
            enum_batch_size: 0,
            retry_attempts: 50,
            ..EngineSettings::default()
        };
        let engine = FilterEngine::from_settings(MemoryBackend::new(), &settings);
        assert_eq!(engine.options().enum_batch_size, 1);
        assert_eq!(engine.options().retry_attempts, 10);
    }

    #[test]
    fn test_panic_message_variants() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&"boom".to_string()), "boom");
        assert_eq!(panic_message(&42u8), "unknown panic");
    }
}
