//! In-process filter table
//!
//! Behaves like the Base Filtering Engine as far as the engine can observe:
//! the same "already exists" / "not found" / "in use" statuses, providers and
//! sublayers that must exist before they are referenced, one transaction at a
//! time across all sessions, enumeration cursors, and app-id blobs that must
//! be released. Counters and fault injection make the engine's guarantees
//! checkable without Windows or administrator rights.

use super::{BackendSession, FilterBackend, FilterRecord};
use crate::builder::FilterPlan;
use crate::error::FilterResult;
use crate::identity::{ProviderSpec, SublayerSpec};
use crate::status::{
    NativeStatus, ERROR_FILE_NOT_FOUND, ERROR_INVALID_HANDLE, ERROR_INVALID_PARAMETER,
    FWP_E_ALREADY_EXISTS, FWP_E_FILTER_NOT_FOUND, FWP_E_IN_USE, FWP_E_NO_TXN_IN_PROGRESS,
    FWP_E_PROVIDER_NOT_FOUND, FWP_E_SUBLAYER_NOT_FOUND, FWP_E_TXN_IN_PROGRESS,
};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// First ID handed out to an added filter
const FIRST_FILTER_ID: u64 = 1000;

/// A filter as stored in the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFilter {
    pub filter_id: u64,
    pub plan: FilterPlan,
    /// Lower-cased path the app-id condition was resolved from
    pub app_path: Option<String>,
}

#[derive(Debug, Clone)]
struct Table {
    providers: HashMap<Uuid, ProviderSpec>,
    sublayers: HashMap<Uuid, SublayerSpec>,
    filters: BTreeMap<u64, StoredFilter>,
    next_filter_id: u64,
}

impl Default for Table {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
            sublayers: HashMap::new(),
            filters: BTreeMap::new(),
            next_filter_id: FIRST_FILTER_ID,
        }
    }
}

impl Table {
    fn filter_id_for_key(&self, key: &Uuid) -> Option<u64> {
        self.filters
            .values()
            .find(|f| f.plan.key == *key)
            .map(|f| f.filter_id)
    }
}

/// What a faulty batch fetch does
#[derive(Debug, Clone, Copy)]
enum FetchFault {
    Fail(NativeStatus),
    Panic,
}

#[derive(Default)]
struct Faults {
    unresolvable_paths: HashSet<String>,
    failing_adds: HashMap<Uuid, NativeStatus>,
    panicking_adds: HashSet<Uuid>,
    next_commit: Option<NativeStatus>,
    cursor_destroy: Option<NativeStatus>,
    /// Batches a session may fetch before the fault fires
    filter_fetch: Option<(usize, FetchFault)>,
}

#[derive(Default)]
struct Stats {
    sessions_opened: AtomicUsize,
    sessions_closed: AtomicUsize,
    transactions_begun: AtomicUsize,
    commits: AtomicUsize,
    aborts: AtomicUsize,
    open_cursors: AtomicUsize,
    live_app_ids: Arc<AtomicUsize>,
}

struct Shared {
    table: Mutex<Table>,
    /// Session currently holding the transaction lock
    txn_owner: Mutex<Option<u64>>,
    txn_released: Condvar,
    faults: Mutex<Faults>,
    stats: Stats,
    next_session_id: AtomicU64,
}

impl Shared {
    fn acquire_txn(&self, session_id: u64) {
        let mut owner = self.txn_owner.lock();
        while owner.is_some() {
            self.txn_released.wait(&mut owner);
        }
        *owner = Some(session_id);
    }

    fn release_txn(&self) {
        *self.txn_owner.lock() = None;
        self.txn_released.notify_all();
    }
}

/// Shared in-memory filter table; clones see the same table
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(Table::default()),
                txn_owner: Mutex::new(None),
                txn_released: Condvar::new(),
                faults: Mutex::new(Faults::default()),
                stats: Stats::default(),
                next_session_id: AtomicU64::new(1),
            }),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Committed state
    // ─────────────────────────────────────────────────────────────────────────

    pub fn provider_exists(&self, key: &Uuid) -> bool {
        self.shared.table.lock().providers.contains_key(key)
    }

    pub fn sublayer_exists(&self, key: &Uuid) -> bool {
        self.shared.table.lock().sublayers.contains_key(key)
    }

    /// Every committed filter, ordered by filter ID
    pub fn filters(&self) -> Vec<StoredFilter> {
        self.shared.table.lock().filters.values().cloned().collect()
    }

    pub fn filters_in_sublayer(&self, sublayer_key: &Uuid) -> Vec<StoredFilter> {
        self.filters()
            .into_iter()
            .filter(|f| f.plan.sublayer_key == *sublayer_key)
            .collect()
    }

    pub fn filter_keys(&self) -> HashSet<Uuid> {
        self.filters().into_iter().map(|f| f.plan.key).collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Counters
    // ─────────────────────────────────────────────────────────────────────────

    pub fn sessions_opened(&self) -> usize {
        self.shared.stats.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        let closed = self.shared.stats.sessions_closed.load(Ordering::SeqCst);
        self.sessions_opened().saturating_sub(closed)
    }

    pub fn transactions_begun(&self) -> usize {
        self.shared.stats.transactions_begun.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.shared.stats.commits.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> usize {
        self.shared.stats.aborts.load(Ordering::SeqCst)
    }

    /// Enumeration cursors created but not destroyed
    pub fn open_cursors(&self) -> usize {
        self.shared.stats.open_cursors.load(Ordering::SeqCst)
    }

    /// App-id blobs resolved but not released
    pub fn live_app_ids(&self) -> usize {
        self.shared.stats.live_app_ids.load(Ordering::SeqCst)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Fault injection
    // ─────────────────────────────────────────────────────────────────────────

    /// App-id resolution for `path` fails with `ERROR_FILE_NOT_FOUND`
    pub fn mark_unresolvable(&self, path: &str) {
        self.shared
            .faults
            .lock()
            .unresolvable_paths
            .insert(path.to_lowercase());
    }

    /// Adding the filter with `key` fails with `status`
    pub fn fail_filter_add(&self, key: Uuid, status: NativeStatus) {
        self.shared.faults.lock().failing_adds.insert(key, status);
    }

    /// Adding the filter with `key` panics
    pub fn panic_on_filter_add(&self, key: Uuid) {
        self.shared.faults.lock().panicking_adds.insert(key);
    }

    /// The next commit fails with `status` (once)
    pub fn fail_next_commit(&self, status: NativeStatus) {
        self.shared.faults.lock().next_commit = Some(status);
    }

    /// Destroying enumeration cursors fails with `status`
    pub fn fail_cursor_destroy(&self, status: NativeStatus) {
        self.shared.faults.lock().cursor_destroy = Some(status);
    }

    /// Each session's batch fetches fail with `status` once it has fetched
    /// `after_batches` batches
    pub fn fail_filter_fetch(&self, after_batches: usize, status: NativeStatus) {
        self.shared.faults.lock().filter_fetch = Some((after_batches, FetchFault::Fail(status)));
    }

    /// Like [`fail_filter_fetch`](Self::fail_filter_fetch), but the fetch panics
    pub fn panic_on_filter_fetch(&self, after_batches: usize) {
        self.shared.faults.lock().filter_fetch = Some((after_batches, FetchFault::Panic));
    }
}

impl FilterBackend for MemoryBackend {
    type Session = MemorySession;

    fn open_session(&self) -> FilterResult<MemorySession> {
        let id = self.shared.next_session_id.fetch_add(1, Ordering::SeqCst);
        self.shared.stats.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(MemorySession {
            id,
            shared: Arc::clone(&self.shared),
            txn: Mutex::new(None),
            cursors: Mutex::new(HashMap::new()),
            next_cursor: AtomicU64::new(1),
            batches_fetched: AtomicUsize::new(0),
        })
    }
}

/// Resolved application identity
#[derive(Debug)]
pub struct MemoryAppId {
    path: String,
    live: Arc<AtomicUsize>,
}

impl Drop for MemoryAppId {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MemorySession {
    id: u64,
    shared: Arc<Shared>,
    /// Working copy while a transaction is open
    txn: Mutex<Option<Table>>,
    cursors: Mutex<HashMap<u64, VecDeque<FilterRecord>>>,
    next_cursor: AtomicU64,
    batches_fetched: AtomicUsize,
}

impl MemorySession {
    fn read<R>(&self, f: impl FnOnce(&Table) -> R) -> R {
        if let Some(working) = self.txn.lock().as_ref() {
            return f(working);
        }
        f(&self.shared.table.lock())
    }

    /// Mutate the working copy, or the committed table as an implicit
    /// single-call transaction.
    fn write<R>(&self, f: impl FnOnce(&mut Table) -> R) -> R {
        if let Some(working) = self.txn.lock().as_mut() {
            return f(working);
        }
        self.shared.acquire_txn(self.id);
        let result = f(&mut self.shared.table.lock());
        self.shared.release_txn();
        result
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        // Closing a session aborts its open transaction
        if self.txn.lock().take().is_some() {
            self.shared.stats.aborts.fetch_add(1, Ordering::SeqCst);
            self.shared.release_txn();
        }
        let leaked = self.cursors.lock().len();
        self.shared.stats.open_cursors.fetch_sub(leaked, Ordering::SeqCst);
        self.shared.stats.sessions_closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl BackendSession for MemorySession {
    type Cursor = u64;
    type AppId = MemoryAppId;

    fn begin_transaction(&self) -> Result<(), NativeStatus> {
        if self.txn.lock().is_some() {
            return Err(NativeStatus(FWP_E_TXN_IN_PROGRESS));
        }
        self.shared.acquire_txn(self.id);
        let snapshot = self.shared.table.lock().clone();
        *self.txn.lock() = Some(snapshot);
        self.shared.stats.transactions_begun.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn commit_transaction(&self) -> Result<(), NativeStatus> {
        let mut txn = self.txn.lock();
        if txn.is_none() {
            return Err(NativeStatus(FWP_E_NO_TXN_IN_PROGRESS));
        }
        if let Some(status) = self.shared.faults.lock().next_commit.take() {
            return Err(status);
        }
        if let Some(working) = txn.take() {
            *self.shared.table.lock() = working;
        }
        drop(txn);
        self.shared.release_txn();
        self.shared.stats.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn abort_transaction(&self) -> Result<(), NativeStatus> {
        if self.txn.lock().take().is_none() {
            return Err(NativeStatus(FWP_E_NO_TXN_IN_PROGRESS));
        }
        self.shared.release_txn();
        self.shared.stats.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_provider(&self, key: &Uuid) -> Result<(), NativeStatus> {
        if self.read(|t| t.providers.contains_key(key)) {
            Ok(())
        } else {
            Err(NativeStatus(FWP_E_PROVIDER_NOT_FOUND))
        }
    }

    fn add_provider(&self, provider: &ProviderSpec) -> Result<(), NativeStatus> {
        self.write(|t| {
            if t.providers.contains_key(&provider.key) {
                return Err(NativeStatus(FWP_E_ALREADY_EXISTS));
            }
            t.providers.insert(provider.key, provider.clone());
            Ok(())
        })
    }

    fn delete_provider(&self, key: &Uuid) -> Result<(), NativeStatus> {
        self.write(|t| {
            if !t.providers.contains_key(key) {
                return Err(NativeStatus(FWP_E_PROVIDER_NOT_FOUND));
            }
            let referenced = t.sublayers.values().any(|s| s.provider_key == *key)
                || t.filters.values().any(|f| f.plan.provider_key == *key);
            if referenced {
                return Err(NativeStatus(FWP_E_IN_USE));
            }
            t.providers.remove(key);
            Ok(())
        })
    }

    fn get_sublayer(&self, key: &Uuid) -> Result<(), NativeStatus> {
        if self.read(|t| t.sublayers.contains_key(key)) {
            Ok(())
        } else {
            Err(NativeStatus(FWP_E_SUBLAYER_NOT_FOUND))
        }
    }

    fn add_sublayer(&self, sublayer: &SublayerSpec) -> Result<(), NativeStatus> {
        self.write(|t| {
            if t.sublayers.contains_key(&sublayer.key) {
                return Err(NativeStatus(FWP_E_ALREADY_EXISTS));
            }
            if !sublayer.provider_key.is_nil()
                && !t.providers.contains_key(&sublayer.provider_key)
            {
                return Err(NativeStatus(FWP_E_PROVIDER_NOT_FOUND));
            }
            t.sublayers.insert(sublayer.key, sublayer.clone());
            Ok(())
        })
    }

    fn delete_sublayer(&self, key: &Uuid) -> Result<(), NativeStatus> {
        self.write(|t| {
            if !t.sublayers.contains_key(key) {
                return Err(NativeStatus(FWP_E_SUBLAYER_NOT_FOUND));
            }
            if t.filters.values().any(|f| f.plan.sublayer_key == *key) {
                return Err(NativeStatus(FWP_E_IN_USE));
            }
            t.sublayers.remove(key);
            Ok(())
        })
    }

    fn create_filter_enum(&self) -> Result<u64, NativeStatus> {
        let records: VecDeque<FilterRecord> = self.read(|t| {
            t.filters
                .values()
                .map(|f| FilterRecord {
                    filter_key: f.plan.key,
                    filter_id: f.filter_id,
                    sublayer_key: f.plan.sublayer_key,
                    display_name: f.plan.display_name.clone(),
                })
                .collect()
        });
        let cursor = self.next_cursor.fetch_add(1, Ordering::SeqCst);
        self.cursors.lock().insert(cursor, records);
        self.shared.stats.open_cursors.fetch_add(1, Ordering::SeqCst);
        Ok(cursor)
    }

    fn fetch_filters(
        &self,
        cursor: u64,
        max_entries: u32,
    ) -> Result<Vec<FilterRecord>, NativeStatus> {
        let fault = self.shared.faults.lock().filter_fetch;
        if let Some((after_batches, fault)) = fault {
            if self.batches_fetched.load(Ordering::SeqCst) >= after_batches {
                match fault {
                    FetchFault::Fail(status) => return Err(status),
                    FetchFault::Panic => panic!("injected panic while fetching filters"),
                }
            }
        }
        self.batches_fetched.fetch_add(1, Ordering::SeqCst);

        let mut cursors = self.cursors.lock();
        let pending = cursors
            .get_mut(&cursor)
            .ok_or(NativeStatus(ERROR_INVALID_HANDLE))?;
        let take = pending.len().min(max_entries as usize);
        Ok(pending.drain(..take).collect())
    }

    fn destroy_filter_enum(&self, cursor: u64) -> Result<(), NativeStatus> {
        if let Some(status) = self.shared.faults.lock().cursor_destroy {
            return Err(status);
        }
        if self.cursors.lock().remove(&cursor).is_none() {
            return Err(NativeStatus(ERROR_INVALID_HANDLE));
        }
        self.shared.stats.open_cursors.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn resolve_app_id(&self, path: &str) -> Result<MemoryAppId, NativeStatus> {
        let path = path.to_lowercase();
        if self.shared.faults.lock().unresolvable_paths.contains(&path) {
            return Err(NativeStatus(ERROR_FILE_NOT_FOUND));
        }
        let live = Arc::clone(&self.shared.stats.live_app_ids);
        live.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryAppId { path, live })
    }

    fn add_filter(
        &self,
        plan: &FilterPlan,
        app_id: Option<&MemoryAppId>,
    ) -> Result<u64, NativeStatus> {
        let (panics, failure) = {
            let faults = self.shared.faults.lock();
            (
                faults.panicking_adds.contains(&plan.key),
                faults.failing_adds.get(&plan.key).copied(),
            )
        };
        if panics {
            panic!("injected panic while adding filter {}", plan.key);
        }
        if let Some(status) = failure {
            return Err(status);
        }

        if plan.requires_app_id() != app_id.is_some() {
            return Err(NativeStatus(ERROR_INVALID_PARAMETER));
        }

        self.write(|t| {
            if !t.providers.contains_key(&plan.provider_key) {
                return Err(NativeStatus(FWP_E_PROVIDER_NOT_FOUND));
            }
            if !t.sublayers.contains_key(&plan.sublayer_key) {
                return Err(NativeStatus(FWP_E_SUBLAYER_NOT_FOUND));
            }
            if t.filter_id_for_key(&plan.key).is_some() {
                return Err(NativeStatus(FWP_E_ALREADY_EXISTS));
            }
            let filter_id = t.next_filter_id;
            t.next_filter_id += 1;
            t.filters.insert(
                filter_id,
                StoredFilter {
                    filter_id,
                    plan: plan.clone(),
                    app_path: app_id.map(|a| a.path.clone()),
                },
            );
            Ok(filter_id)
        })
    }

    fn get_filter(&self, key: &Uuid) -> Result<(), NativeStatus> {
        match self.read(|t| t.filter_id_for_key(key)) {
            Some(_) => Ok(()),
            None => Err(NativeStatus(FWP_E_FILTER_NOT_FOUND)),
        }
    }

    fn delete_filter_by_key(&self, key: &Uuid) -> Result<(), NativeStatus> {
        self.write(|t| match t.filter_id_for_key(key) {
            Some(id) => {
                t.filters.remove(&id);
                Ok(())
            }
            None => Err(NativeStatus(FWP_E_FILTER_NOT_FOUND)),
        })
    }

    fn delete_filter_by_id(&self, filter_id: u64) -> Result<(), NativeStatus> {
        self.write(|t| match t.filters.remove(&filter_id) {
            Some(_) => Ok(()),
            None => Err(NativeStatus(FWP_E_FILTER_NOT_FOUND)),
        })
    }
}
