//! Engine behaviour over the in-memory filter table
//!
//! Every test builds its own table, so they run in parallel without
//! interfering and without administrator rights.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use uuid::Uuid;
use wfpguard_core::filter::protocol;
use wfpguard_core::status::{
    NativeStatus, ERROR_ACCESS_DENIED, FWP_E_IN_USE, FWP_E_INVALID_WEIGHT, FWP_E_TIMEOUT,
};
use wfpguard_core::{
    ApplyResult, CompiledFilter, Direction, EngineIdentity, EngineOptions, FilterAction,
    FilterEngine, FilterError, MemoryBackend, RemoteAddress, DEMO_FILTER_KEY,
};

const APP: &str = r"C:\Program Files\Example\app.exe";
const MISSING_APP: &str = r"C:\Program Files\Gone\missing.exe";

fn identity() -> EngineIdentity {
    EngineIdentity::with_keys(
        Uuid::from_u128(0x1111_0000_0000_0000_0000_0000_0000_0001),
        Uuid::from_u128(0x1111_0000_0000_0000_0000_0000_0000_0002),
    )
}

fn engine() -> FilterEngine<MemoryBackend> {
    FilterEngine::new(MemoryBackend::new(), identity())
}

fn k1() -> CompiledFilter {
    CompiledFilter::builder("K1")
        .action(FilterAction::Block)
        .protocol(protocol::TCP)
        .remote_host("1.1.1.1".parse().unwrap())
        .remote_port(443)
        .build()
        .unwrap()
}

fn policy() -> Vec<CompiledFilter> {
    vec![
        k1(),
        CompiledFilter::builder("allow-dns")
            .action(FilterAction::Allow)
            .protocol(protocol::UDP)
            .remote_port(53)
            .weight(100)
            .build()
            .unwrap(),
        CompiledFilter::builder("block-app")
            .process_path(APP)
            .build()
            .unwrap(),
        CompiledFilter::builder("inbound-v6")
            .direction(Direction::Inbound)
            .remote_address(RemoteAddress::parse_cidr("2001:db8::/32").unwrap())
            .remote_port_range(8000, 8100)
            .build()
            .unwrap(),
    ]
}

fn installed_keys(engine: &FilterEngine<MemoryBackend>) -> HashSet<Uuid> {
    engine
        .list_filters()
        .unwrap()
        .into_iter()
        .map(|f| f.filter_key)
        .collect()
}

fn keys(filters: &[CompiledFilter]) -> HashSet<Uuid> {
    filters.iter().map(|f| f.filter_key).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Reconciliation
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_k1_scenario() {
    let engine = engine();

    let first = engine.apply_filters(&[k1()]).unwrap();
    assert_eq!(first, ApplyResult { created: 1, removed: 0, unchanged: 0 });

    let second = engine.apply_filters(&[k1()]).unwrap();
    assert_eq!(second, ApplyResult { created: 0, removed: 0, unchanged: 1 });

    let third = engine.apply_filters(&[]).unwrap();
    assert_eq!(third, ApplyResult { created: 0, removed: 1, unchanged: 0 });

    assert!(engine.list_filters().unwrap().is_empty());
}

#[test]
fn test_apply_is_idempotent() {
    let engine = engine();
    let desired = policy();

    let first = engine.apply_filters(&desired).unwrap();
    assert_eq!(first.created, desired.len());
    let after_first = installed_keys(&engine);

    let second = engine.apply_filters(&desired).unwrap();
    assert_eq!(second, ApplyResult { created: 0, removed: 0, unchanged: desired.len() });
    assert_eq!(installed_keys(&engine), after_first);
    assert_eq!(after_first, keys(&desired));
}

#[test]
fn test_empty_diff_opens_no_transaction() {
    let engine = engine();
    let desired = policy();
    engine.apply_filters(&desired).unwrap();

    let begun = engine.backend().transactions_begun();
    let result = engine.apply_filters(&desired).unwrap();

    assert!(result.is_noop());
    assert_eq!(engine.backend().transactions_begun(), begun);
}

#[test]
fn test_changed_rule_is_replaced() {
    let engine = engine();
    engine.apply_filters(&[k1()]).unwrap();

    let changed = CompiledFilter::builder("K1")
        .remote_host("1.1.1.1".parse().unwrap())
        .remote_port(8443)
        .build()
        .unwrap();
    let result = engine.apply_filters(&[changed.clone()]).unwrap();

    assert_eq!(result, ApplyResult { created: 1, removed: 1, unchanged: 0 });
    assert_eq!(installed_keys(&engine), keys(&[changed]));
}

#[test]
fn test_filters_land_in_own_sublayer_with_plan() {
    let engine = engine();
    engine.apply_filters(&policy()).unwrap();

    let stored = engine.backend().filters_in_sublayer(&identity().sublayer_key);
    assert_eq!(stored.len(), 4);
    for filter in &stored {
        assert_eq!(filter.plan.provider_key, identity().provider_key);
    }

    let app_rule = stored
        .iter()
        .find(|f| f.plan.requires_app_id())
        .unwrap();
    assert_eq!(app_rule.app_path.as_deref(), Some(APP.to_lowercase().as_str()));
    assert_eq!(engine.backend().live_app_ids(), 0);
}

#[test]
fn test_duplicate_filters_in_batch_collapse() {
    let engine = engine();
    let result = engine.apply_filters(&[k1(), k1()]).unwrap();
    assert_eq!(result.created, 1);
    assert_eq!(engine.list_filters().unwrap().len(), 1);
}

#[test]
fn test_colliding_keys_rejected_before_native_calls() {
    let engine = engine();
    let mut impostor = CompiledFilter::builder("other").build().unwrap();
    impostor.filter_key = k1().filter_key;

    let err = engine.apply_filters(&[k1(), impostor]).unwrap_err();
    assert!(matches!(err, FilterError::InvalidFilter { .. }));
    assert_eq!(engine.backend().sessions_opened(), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// All-or-nothing
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_unresolvable_process_rolls_back_batch() {
    let engine = engine();
    let old = CompiledFilter::builder("old").remote_port(21).build().unwrap();
    engine.apply_filters(&[old.clone()]).unwrap();
    let before = installed_keys(&engine);
    engine.backend().mark_unresolvable(MISSING_APP);

    let desired = vec![
        k1(),
        CompiledFilter::builder("missing").process_path(MISSING_APP).build().unwrap(),
        CompiledFilter::builder("last").remote_port(25).build().unwrap(),
    ];
    let err = engine.apply_filters(&desired).unwrap_err();

    match err {
        FilterError::ProcessIdentity { path, .. } => assert_eq!(path, MISSING_APP),
        other => panic!("Expected process identity error, got {:?}", other),
    }
    // No additions, and the intended removal of `old` did not happen
    assert_eq!(installed_keys(&engine), before);
    assert!(engine.backend().aborts() >= 1);
    assert_eq!(engine.backend().live_app_ids(), 0);
}

#[test]
fn test_native_add_failure_rolls_back_batch() {
    let engine = engine();
    let bad = CompiledFilter::builder("bad").weight(u64::MAX).build().unwrap();
    engine
        .backend()
        .fail_filter_add(bad.filter_key, NativeStatus(FWP_E_INVALID_WEIGHT));

    let err = engine.apply_filters(&[k1(), bad]).unwrap_err();

    assert_eq!(err.code(), FWP_E_INVALID_WEIGHT);
    assert!(!err.is_recoverable());
    assert!(engine.list_filters().unwrap().is_empty());
}

#[test]
fn test_app_id_released_when_native_add_fails() {
    let engine = engine();
    let scoped = CompiledFilter::builder("scoped")
        .process_path(r"C:\Games\game.exe")
        .build()
        .unwrap();
    engine
        .backend()
        .fail_filter_add(scoped.filter_key, NativeStatus(FWP_E_INVALID_WEIGHT));

    let err = engine.apply_filters(&[k1(), scoped]).unwrap_err();

    assert_eq!(err.code(), FWP_E_INVALID_WEIGHT);
    assert!(engine.list_filters().unwrap().is_empty());
    assert_eq!(engine.backend().live_app_ids(), 0);
}

#[test]
fn test_app_id_released_when_native_add_panics() {
    let engine = engine();
    let scoped = CompiledFilter::builder("scoped")
        .process_path(r"C:\Games\game.exe")
        .build()
        .unwrap();
    engine.backend().panic_on_filter_add(scoped.filter_key);

    let err = engine.apply_filters(&[scoped]).unwrap_err();

    assert!(matches!(err, FilterError::Unexpected { .. }));
    assert_eq!(engine.backend().live_app_ids(), 0);
}

#[test]
fn test_fetch_failure_releases_cursor_and_session() {
    let engine = engine();
    engine.apply_filters(&policy()).unwrap();
    engine.backend().fail_filter_fetch(0, NativeStatus(FWP_E_TIMEOUT));

    let err = engine.apply_filters(&[k1()]).unwrap_err();

    assert!(err.is_recoverable());
    assert_eq!(engine.backend().open_cursors(), 0);
    assert_eq!(engine.backend().open_sessions(), 0);
    assert_eq!(engine.backend().filter_keys(), keys(&policy()));
}

#[test]
fn test_panic_becomes_unexpected_and_aborts() {
    let engine = engine();
    let doomed = CompiledFilter::builder("doomed").remote_port(6666).build().unwrap();
    engine.backend().panic_on_filter_add(doomed.filter_key);

    let err = engine.apply_filters(&[k1(), doomed]).unwrap_err();

    assert!(matches!(err, FilterError::Unexpected { .. }));
    assert!(engine.list_filters().unwrap().is_empty());
    assert_eq!(engine.backend().open_sessions(), 0);

    // The transaction lock was released; the engine keeps working
    let result = engine.apply_filters(&[k1()]).unwrap();
    assert_eq!(result.created, 1);
}

#[test]
fn test_failed_commit_leaves_table_untouched() {
    let engine = engine();
    engine.ensure_provider_and_sublayer().unwrap();
    engine.backend().fail_next_commit(NativeStatus(ERROR_ACCESS_DENIED));

    let err = engine.apply_filters(&[k1()]).unwrap_err();

    assert_eq!(err.code(), ERROR_ACCESS_DENIED);
    assert!(engine.list_filters().unwrap().is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Retry
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_retry_recovers_from_timeout() {
    let engine = engine();
    engine.ensure_provider_and_sublayer().unwrap();
    engine.backend().fail_next_commit(NativeStatus(FWP_E_TIMEOUT));

    let result = engine.apply_filters_with_retry(&[k1()]).unwrap();

    assert_eq!(result.created, 1);
    assert_eq!(installed_keys(&engine), keys(&[k1()]));
}

#[test]
fn test_retry_does_not_repeat_fatal_errors() {
    let engine = FilterEngine::with_options(
        MemoryBackend::new(),
        identity(),
        EngineOptions {
            enum_batch_size: 100,
            retry_attempts: 5,
        },
    );
    engine.backend().mark_unresolvable(MISSING_APP);
    let filter = CompiledFilter::builder("missing").process_path(MISSING_APP).build().unwrap();

    engine.ensure_provider_and_sublayer().unwrap();
    let begun = engine.backend().transactions_begun();
    assert!(engine.apply_filters_with_retry(&[filter]).is_err());
    assert_eq!(engine.backend().transactions_begun(), begun + 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Bootstrap
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_bootstrap_is_idempotent() {
    let engine = engine();

    engine.ensure_provider_and_sublayer().unwrap();
    assert!(engine.provider_exists().unwrap());
    assert!(engine.sublayer_exists().unwrap());

    engine.ensure_provider_and_sublayer().unwrap();
    assert!(engine.provider_exists().unwrap());
    assert!(engine.sublayer_exists().unwrap());
}

#[test]
fn test_sublayer_in_use_guard() {
    let engine = engine();
    engine.apply_filters(&[k1()]).unwrap();

    let err = engine.remove_provider_and_sublayer().unwrap_err();

    match &err {
        FilterError::SublayerInUse { sublayer } => assert_eq!(*sublayer, identity().sublayer_key),
        other => panic!("Expected sublayer in use, got {:?}", other),
    }
    assert_eq!(err.code(), FWP_E_IN_USE);
    assert!(engine.provider_exists().unwrap());
    assert!(engine.sublayer_exists().unwrap());
    assert_eq!(engine.list_filters().unwrap().len(), 1);
}

#[test]
fn test_teardown_after_remove_all() {
    let engine = engine();
    engine.apply_filters(&policy()).unwrap();

    assert_eq!(engine.remove_all_filters().unwrap(), 4);
    engine.remove_provider_and_sublayer().unwrap();

    assert!(!engine.provider_exists().unwrap());
    assert!(!engine.sublayer_exists().unwrap());
    // Removing again is not an error
    engine.remove_provider_and_sublayer().unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Isolation, enumeration, resources
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_identities_do_not_interfere() {
    let backend = MemoryBackend::new();
    let ours = FilterEngine::new(backend.clone(), identity());
    let theirs = FilterEngine::new(
        backend.clone(),
        EngineIdentity::with_keys(Uuid::from_u128(0xBEEF_0001), Uuid::from_u128(0xBEEF_0002)),
    );

    let own = CompiledFilter::builder("ours-only").remote_port(8080).build().unwrap();
    theirs.apply_filters(&policy()).unwrap();
    ours.apply_filters(&[own.clone()]).unwrap();

    assert_eq!(installed_keys(&ours), keys(&[own]));
    assert_eq!(installed_keys(&theirs), keys(&policy()));

    // Clearing one identity never touches the other sublayer
    assert_eq!(ours.apply_filters(&[]).unwrap().removed, 1);
    assert_eq!(ours.remove_all_filters().unwrap(), 0);
    assert_eq!(installed_keys(&theirs), keys(&policy()));
}

#[test]
fn test_small_enumeration_batches() {
    let engine = FilterEngine::with_options(
        MemoryBackend::new(),
        identity(),
        EngineOptions {
            enum_batch_size: 1,
            retry_attempts: 1,
        },
    );
    let desired = policy();
    engine.apply_filters(&desired).unwrap();

    assert_eq!(installed_keys(&engine), keys(&desired));
    assert!(engine.apply_filters(&desired).unwrap().is_noop());
}

#[test]
fn test_cursor_destroy_failure_only_logged() {
    let engine = engine();
    engine.apply_filters(&[k1()]).unwrap();
    engine.backend().fail_cursor_destroy(NativeStatus(ERROR_ACCESS_DENIED));

    let result = engine.apply_filters(&[k1()]).unwrap();

    assert_eq!(result.unchanged, 1);
    assert_eq!(engine.backend().open_sessions(), 0);
}

#[test]
fn test_sessions_and_cursors_released() {
    let engine = engine();
    engine.apply_filters(&policy()).unwrap();
    engine.apply_filters(&[]).unwrap();
    engine.remove_all_filters().unwrap();

    assert_eq!(engine.backend().open_sessions(), 0);
    assert_eq!(engine.backend().open_cursors(), 0);
    assert_eq!(engine.backend().live_app_ids(), 0);
}

#[test]
fn test_concurrent_applies_converge() {
    let engine = Arc::new(engine());
    let desired = Arc::new(policy());

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let desired = Arc::clone(&desired);
            thread::spawn(move || engine.apply_filters(&desired))
        })
        .collect();

    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(installed_keys(&engine), keys(&desired));
    assert_eq!(engine.backend().filters().len(), desired.len());
}

// ─────────────────────────────────────────────────────────────────────────────
// Remove all and demo filter
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_remove_all_on_empty_sublayer() {
    let engine = engine();
    assert_eq!(engine.remove_all_filters().unwrap(), 0);
    assert_eq!(engine.backend().transactions_begun(), 0);
}

#[test]
fn test_demo_filter_is_reconciled_away() {
    let engine = engine();
    engine.add_demo_block_filter().unwrap();
    assert!(engine.demo_block_filter_exists().unwrap());
    assert!(installed_keys(&engine).contains(&DEMO_FILTER_KEY));

    let result = engine.apply_filters(&[k1()]).unwrap();

    assert_eq!(result, ApplyResult { created: 1, removed: 1, unchanged: 0 });
    assert!(!engine.demo_block_filter_exists().unwrap());
}
