//! Reconciliation primitives.
//!
//! This library provides helpers for implementing reconciliation loops
//! that converge current state to desired state. Key concepts:
//!
//! - **Desired state**: What the system should look like (the device registry).
//! - **Current state**: What the system actually looks like (the live peer table).
//! - **Convergence**: The process of making current match desired.
//!
//! # Invariants
//!
//! - All operations are idempotent
//! - Decisions are deterministic given the same inputs
//! - Desired state is authoritative; current state is never copied back

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Actions needed to converge current state onto desired state.
///
/// Removals are listed separately from upserts so callers can apply them
/// first. Both lists are sorted by key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergencePlan<K> {
    /// Keys present in current state but absent from desired state.
    pub remove: Vec<K>,

    /// Keys missing from current state, or present with a different value.
    pub upsert: Vec<K>,

    /// Keys already matching desired state.
    pub unchanged: usize,
}

impl<K> ConvergencePlan<K> {
    /// Returns true if current state already matches desired state.
    pub fn is_converged(&self) -> bool {
        self.remove.is_empty() && self.upsert.is_empty()
    }
}

/// Compute the plan that converges `current` onto `desired`.
///
/// Values are compared with `PartialEq`; callers should normalise them
/// (e.g. sort address lists) before planning.
pub fn plan_convergence<K, V>(
    desired: &BTreeMap<K, V>,
    current: &BTreeMap<K, V>,
) -> ConvergencePlan<K>
where
    K: Ord + Clone,
    V: PartialEq,
{
    let remove = current
        .keys()
        .filter(|k| !desired.contains_key(*k))
        .cloned()
        .collect();

    let mut upsert = Vec::new();
    let mut unchanged = 0;
    for (key, want) in desired {
        match current.get(key) {
            Some(have) if have == want => unchanged += 1,
            _ => upsert.push(key.clone()),
        }
    }

    ConvergencePlan {
        remove,
        upsert,
        unchanged,
    }
}

// ============================================================================
// Freshness
// ============================================================================

/// Window within which a handshake counts as "currently connected".
///
/// WireGuard re-handshakes at least every two minutes on a live session.
pub const CONNECTED_WINDOW: Duration = Duration::from_secs(3 * 60);

/// Default interval for the metadata collection loop.
pub const DEFAULT_METADATA_INTERVAL: Duration = Duration::from_secs(30);

/// Default interval for the inactivity pruning loop.
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(30);

/// Returns true if `at` lies within `window` before `now`.
///
/// Timestamps in the future (clock skew between hosts) count as fresh.
pub fn is_fresh(at: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> bool {
    let Some(at) = at else {
        return false;
    };
    let Ok(window) = chrono::Duration::from_std(window) else {
        return true;
    };
    at > now - window
}

/// Time elapsed from `since` to `now`, clamped at zero.
pub fn elapsed_since(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}
