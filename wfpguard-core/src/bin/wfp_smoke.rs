//! WFP installation smoke test
//!
//! Registers the provider and sublayer, round-trips the demo block filter
//! and optionally applies a policy file (a JSON array of compiled filters).
//!
//! Usage: wfp_smoke [policy.json] [--remove-all] [--dry-run]
//!
//! `--dry-run` runs against the in-memory filter table instead of the Base
//! Filtering Engine. The real run needs administrator rights.

use std::fs;
use wfpguard_core::backend::FilterBackend;
use wfpguard_core::{
    load_settings, user_friendly_error, CompiledFilter, FilterEngine, FilterResult, MemoryBackend,
    WfpBackend,
};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    println!("=== WfpGuard Smoke Test ===\n");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let remove_all = args.iter().any(|a| a == "--remove-all");
    let dry_run = args.iter().any(|a| a == "--dry-run");
    let policy_path = args.iter().find(|a| !a.starts_with("--")).cloned();

    let settings = load_settings();

    let ok = if dry_run {
        println!("Backend: in-memory (dry run)\n");
        run(FilterEngine::from_settings(MemoryBackend::new(), &settings), policy_path, remove_all)
    } else {
        println!("Backend: Windows Filtering Platform\n");
        run(FilterEngine::from_settings(WfpBackend::new(), &settings), policy_path, remove_all)
    };

    println!("\n=== {} ===", if ok { "PASSED" } else { "FAILED" });
    if !ok {
        std::process::exit(1);
    }
}

fn step<T>(label: &str, result: FilterResult<T>) -> Option<T> {
    match result {
        Ok(value) => {
            println!("   ✓ {}", label);
            Some(value)
        }
        Err(e) => {
            println!("   ✗ {}: {}", label, user_friendly_error(&e));
            log::debug!("{} failed: {:?}", label, e);
            None
        }
    }
}

fn run<B: FilterBackend>(
    engine: FilterEngine<B>,
    policy_path: Option<String>,
    remove_all: bool,
) -> bool {
    let identity = engine.identity();
    println!("Provider: {}", identity.provider_key);
    println!("Sublayer: {}\n", identity.sublayer_key);

    if remove_all {
        println!("1. Removing all filters...");
        let Some(count) = step("Filters removed", engine.remove_all_filters()) else {
            return false;
        };
        println!("   {} filters removed", count);

        println!("\n2. Removing provider and sublayer...");
        let removed = engine.remove_provider_and_sublayer();
        return step("Provider and sublayer removed", removed).is_some();
    }

    println!("1. Registering provider and sublayer...");
    if step("Provider and sublayer ready", engine.ensure_provider_and_sublayer()).is_none() {
        return false;
    }
    let provider = engine.provider_exists().unwrap_or(false);
    let sublayer = engine.sublayer_exists().unwrap_or(false);
    println!("   Provider exists: {}, sublayer exists: {}", provider, sublayer);

    println!("\n2. Demo block filter (TCP 1.1.1.1:80)...");
    if step("Demo filter added", engine.add_demo_block_filter()).is_none() {
        return false;
    }
    match engine.demo_block_filter_exists() {
        Ok(true) => println!("   ✓ Demo filter present"),
        Ok(false) => {
            println!("   ✗ Demo filter missing after add");
            return false;
        }
        Err(e) => {
            println!("   ✗ Demo filter lookup failed: {}", user_friendly_error(&e));
            return false;
        }
    }
    if step("Demo filter removed", engine.remove_demo_block_filter()).is_none() {
        return false;
    }

    let Some(path) = policy_path else {
        return true;
    };

    println!("\n3. Applying policy from {}...", path);
    let filters: Vec<CompiledFilter> = match fs::read_to_string(&path)
        .map_err(|e| e.to_string())
        .and_then(|content| serde_json::from_str(&content).map_err(|e| e.to_string()))
    {
        Ok(filters) => filters,
        Err(e) => {
            println!("   ✗ Failed to load policy: {}", e);
            return false;
        }
    };
    println!("   {} filters in policy", filters.len());

    for filter in filters.iter().filter(|f| !f.verify_key()) {
        println!("   ! Filter '{}' carries a key that does not match its content", filter.rule_id);
    }

    let Some(result) = step("Policy applied", engine.apply_filters_with_retry(&filters)) else {
        return false;
    };
    println!(
        "   Created: {}, removed: {}, unchanged: {}",
        result.created, result.removed, result.unchanged
    );

    println!("\n4. Re-applying the same policy...");
    let Some(again) = step("Policy re-applied", engine.apply_filters(&filters)) else {
        return false;
    };
    if !again.is_noop() {
        println!("   ✗ Second apply changed {} filters", again.created + again.removed);
        return false;
    }
    println!("   ✓ No changes ({} unchanged)", again.unchanged);

    match engine.list_filters() {
        Ok(installed) => {
            println!("\nInstalled filters:");
            for filter in installed {
                println!(
                    "   [{}] {} ({})",
                    filter.filter_id, filter.display_name, filter.filter_key
                );
            }
            true
        }
        Err(e) => {
            println!("   ✗ Listing filters failed: {}", user_friendly_error(&e));
            false
        }
    }
}
