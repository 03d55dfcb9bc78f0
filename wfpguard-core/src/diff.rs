//! Desired vs. installed filter sets
//!
//! Compares keys only. A filter key covers every matched field and the
//! reported text, so equal keys mean equal content.

use crate::filter::{CompiledFilter, ExistingFilter};
use std::collections::HashSet;
use uuid::Uuid;

/// Minimal edit turning the installed set into the desired one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterDiff {
    /// Desired filters not installed
    pub to_add: Vec<CompiledFilter>,
    /// Installed keys not desired
    pub to_remove: Vec<Uuid>,
    pub unchanged: usize,
}

impl FilterDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Keys repeated within `desired` or `existing` count once.
pub fn compute_diff(desired: &[CompiledFilter], existing: &[ExistingFilter]) -> FilterDiff {
    let existing_keys: HashSet<Uuid> = existing.iter().map(|f| f.filter_key).collect();
    let desired_keys: HashSet<Uuid> = desired.iter().map(|f| f.filter_key).collect();

    let mut seen = HashSet::with_capacity(desired.len());
    let to_add: Vec<CompiledFilter> = desired
        .iter()
        .filter(|f| !existing_keys.contains(&f.filter_key) && seen.insert(f.filter_key))
        .cloned()
        .collect();

    let mut seen = HashSet::with_capacity(existing.len());
    let to_remove: Vec<Uuid> = existing
        .iter()
        .map(|f| f.filter_key)
        .filter(|key| !desired_keys.contains(key) && seen.insert(*key))
        .collect();

    let unchanged = desired_keys.intersection(&existing_keys).count();

    FilterDiff {
        to_add,
        to_remove,
        unchanged,
    }
}
