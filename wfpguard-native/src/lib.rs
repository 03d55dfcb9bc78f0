//! WfpGuard Native Library
//!
//! This library provides a C ABI over the WfpGuard filter engine, so a
//! control-plane service written in another language can drive it.
//!
//! # Safety
//! This library uses `unsafe` for FFI boundary. Callers must ensure:
//! - Pointers passed are valid and properly aligned
//! - Strings are null-terminated UTF-8
//! - Returned strings are freed using `wfpguard_free_string`
//!
//! Filter batches cross the boundary as JSON arrays of compiled filters;
//! results come back as JSON.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use wfpguard_core::{
    load_settings, ApplyResult, CompiledFilter, EngineSettings, ExistingFilter, FilterEngine,
    FilterError, FilterResult, MemoryBackend, WfpBackend,
};

/// Engine behind the ABI: the real filtering platform, or an in-memory
/// table for dry runs
enum Engine {
    Wfp(FilterEngine<WfpBackend>),
    Memory(FilterEngine<MemoryBackend>),
}

macro_rules! dispatch {
    ($engine:expr, $e:ident => $call:expr) => {
        match $engine {
            Engine::Wfp($e) => $call,
            Engine::Memory($e) => $call,
        }
    };
}

// Global engine instance
static ENGINE: Lazy<Mutex<Option<Arc<Engine>>>> = Lazy::new(|| Mutex::new(None));

// Global error message and code of the last failed call
static LAST_ERROR: Lazy<Mutex<Option<String>>> = Lazy::new(|| Mutex::new(None));
static LAST_STATUS: AtomicU32 = AtomicU32::new(0);

// Report of the last successful apply
static LAST_REPORT: Lazy<Mutex<Option<ApplyResult>>> = Lazy::new(|| Mutex::new(None));

// Return codes
const SUCCESS: i32 = 0;
const ERROR_INVALID_PARAM: i32 = -1;
const ERROR_NOT_INITIALIZED: i32 = -2;
const ERROR_SUBLAYER_IN_USE: i32 = -3;
const ERROR_PROCESS_IDENTITY: i32 = -4;
const ERROR_NOT_SUPPORTED: i32 = -5;
const ERROR_INTERNAL: i32 = -6;

fn set_error(error: &FilterError) -> i32 {
    LAST_STATUS.store(error.code(), Ordering::SeqCst);
    *LAST_ERROR.lock() = Some(error.to_string());
    match error {
        FilterError::InvalidFilter { .. } | FilterError::Settings(_) => ERROR_INVALID_PARAM,
        FilterError::SublayerInUse { .. } => ERROR_SUBLAYER_IN_USE,
        FilterError::ProcessIdentity { .. } => ERROR_PROCESS_IDENTITY,
        FilterError::NotSupported => ERROR_NOT_SUPPORTED,
        FilterError::Native { .. } | FilterError::Unexpected { .. } | FilterError::Io(_) => {
            ERROR_INTERNAL
        }
    }
}

fn set_param_error(msg: String) -> i32 {
    LAST_STATUS.store(wfpguard_core::status::ERROR_INVALID_PARAMETER, Ordering::SeqCst);
    *LAST_ERROR.lock() = Some(msg);
    ERROR_INVALID_PARAM
}

fn clear_error() {
    LAST_STATUS.store(0, Ordering::SeqCst);
    *LAST_ERROR.lock() = None;
}

fn current_engine() -> Option<Arc<Engine>> {
    ENGINE.lock().clone()
}

/// Run `op` against the engine and map the outcome to a return code
fn run<T>(op: impl FnOnce(&Engine) -> FilterResult<T>, on_ok: impl FnOnce(T) -> i32) -> i32 {
    clear_error();

    let Some(engine) = current_engine() else {
        *LAST_ERROR.lock() = Some("Library not initialized".to_string());
        return ERROR_NOT_INITIALIZED;
    };

    match op(&engine) {
        Ok(value) => on_ok(value),
        Err(e) => set_error(&e),
    }
}

fn into_c_string(value: String) -> *mut c_char {
    match CString::new(value) {
        Ok(s) => s.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

fn install(engine: Engine) -> i32 {
    // Initialize logging
    let _ = env_logger::try_init();

    let mut slot = ENGINE.lock();
    if slot.is_some() {
        log::warn!("Already initialized");
        return SUCCESS;
    }

    *slot = Some(Arc::new(engine));
    clear_error();
    log::info!("WfpGuard Native Library initialized");
    SUCCESS
}

/// Initialize the library against the Windows Filtering Platform
/// Must be called before any other function
/// Returns: 0 on success, negative error code on failure
#[no_mangle]
pub extern "C" fn wfpguard_init() -> i32 {
    let settings = load_settings();
    install(Engine::Wfp(FilterEngine::from_settings(WfpBackend::new(), &settings)))
}

/// Initialize the library against an in-memory filter table
/// Nothing reaches the filtering platform; useful to validate a policy
#[no_mangle]
pub extern "C" fn wfpguard_init_dry_run() -> i32 {
    let settings = EngineSettings::default();
    install(Engine::Memory(FilterEngine::from_settings(MemoryBackend::new(), &settings)))
}

/// Release the engine. Installed filters stay installed.
#[no_mangle]
pub extern "C" fn wfpguard_cleanup() {
    log::info!("WfpGuard Native Library cleanup");
    *ENGINE.lock() = None;
    *LAST_REPORT.lock() = None;
    clear_error();
}

/// Register the provider and sublayer (idempotent)
#[no_mangle]
pub extern "C" fn wfpguard_ensure_identity() -> i32 {
    run(
        |engine| dispatch!(engine, e => e.ensure_provider_and_sublayer()),
        |()| SUCCESS,
    )
}

/// Remove the sublayer and provider
///
/// # Returns
/// 0 on success, -3 while filters remain installed
#[no_mangle]
pub extern "C" fn wfpguard_remove_identity() -> i32 {
    run(
        |engine| dispatch!(engine, e => e.remove_provider_and_sublayer()),
        |()| SUCCESS,
    )
}

/// # Returns
/// 1 if the provider is registered, 0 if not, negative on error
#[no_mangle]
pub extern "C" fn wfpguard_provider_exists() -> i32 {
    run(|engine| dispatch!(engine, e => e.provider_exists()), i32::from)
}

/// # Returns
/// 1 if the sublayer is registered, 0 if not, negative on error
#[no_mangle]
pub extern "C" fn wfpguard_sublayer_exists() -> i32 {
    run(|engine| dispatch!(engine, e => e.sublayer_exists()), i32::from)
}

/// Reconcile installed filters with the given set
///
/// # Arguments
/// * `filters_json` - JSON array of compiled filters
///
/// # Returns
/// 0 on success (report via `wfpguard_get_last_report_json`), negative
/// error code on failure
#[no_mangle]
pub extern "C" fn wfpguard_apply_filters(filters_json: *const c_char) -> i32 {
    clear_error();

    if filters_json.is_null() {
        return set_param_error("Filters JSON is null".to_string());
    }

    let json = unsafe {
        match CStr::from_ptr(filters_json).to_str() {
            Ok(s) => s,
            Err(e) => return set_param_error(format!("Invalid UTF-8 in filters: {}", e)),
        }
    };

    let filters: Vec<CompiledFilter> = match serde_json::from_str(json) {
        Ok(f) => f,
        Err(e) => return set_param_error(format!("Invalid filters JSON: {}", e)),
    };

    log::info!("Applying {} filters", filters.len());

    run(
        |engine| dispatch!(engine, e => e.apply_filters_with_retry(&filters)),
        |report| {
            *LAST_REPORT.lock() = Some(report);
            SUCCESS
        },
    )
}

/// Delete every filter in the sublayer
///
/// # Returns
/// Number of filters removed, or negative error code
#[no_mangle]
pub extern "C" fn wfpguard_remove_all_filters() -> i32 {
    run(
        |engine| dispatch!(engine, e => e.remove_all_filters()),
        |count| i32::try_from(count).unwrap_or(i32::MAX),
    )
}

/// Installed filters as a JSON array
/// Caller must free the returned string with wfpguard_free_string
///
/// # Returns
/// JSON string or null on error
#[no_mangle]
pub extern "C" fn wfpguard_list_filters_json() -> *mut c_char {
    let mut listed: Option<Vec<ExistingFilter>> = None;
    run(
        |engine| dispatch!(engine, e => e.list_filters()),
        |filters| {
            listed = Some(filters);
            SUCCESS
        },
    );

    match listed.map(|filters| serde_json::to_string(&filters)) {
        Some(Ok(json)) => into_c_string(json),
        _ => std::ptr::null_mut(),
    }
}

/// Install the diagnostic block filter (TCP to 1.1.1.1:80)
#[no_mangle]
pub extern "C" fn wfpguard_add_demo_filter() -> i32 {
    run(|engine| dispatch!(engine, e => e.add_demo_block_filter()), |()| SUCCESS)
}

#[no_mangle]
pub extern "C" fn wfpguard_remove_demo_filter() -> i32 {
    run(|engine| dispatch!(engine, e => e.remove_demo_block_filter()), |()| SUCCESS)
}

/// # Returns
/// 1 if the demo filter is installed, 0 if not, negative on error
#[no_mangle]
pub extern "C" fn wfpguard_demo_filter_exists() -> i32 {
    run(|engine| dispatch!(engine, e => e.demo_block_filter_exists()), i32::from)
}

/// Report of the last successful apply
/// Caller must free the returned string with wfpguard_free_string
///
/// # Returns
/// JSON string or null if nothing was applied yet
#[no_mangle]
pub extern "C" fn wfpguard_get_last_report_json() -> *mut c_char {
    let report = *LAST_REPORT.lock();
    match report.map(|r| serde_json::to_string(&r)) {
        Some(Ok(json)) => into_c_string(json),
        _ => std::ptr::null_mut(),
    }
}

/// Get last error message
/// Caller must free the returned string with wfpguard_free_string
///
/// # Returns
/// Error message string or null if no error
#[no_mangle]
pub extern "C" fn wfpguard_get_error() -> *mut c_char {
    let error = LAST_ERROR.lock();
    match error.as_ref() {
        Some(msg) => into_c_string(msg.clone()),
        None => std::ptr::null_mut(),
    }
}

/// Machine-readable code of the last error (Win32 / FWP_E_* / HRESULT),
/// 0 if the last call succeeded
#[no_mangle]
pub extern "C" fn wfpguard_get_last_status() -> u32 {
    LAST_STATUS.load(Ordering::SeqCst)
}

/// Free a string returned by this library
#[no_mangle]
pub extern "C" fn wfpguard_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        unsafe {
            let _ = CString::from_raw(ptr);
        }
    }
}
