//! PPT invariant system: structural invariant checks with contract tracking.
//!
//! Graph building and preparation assert their invariants here; tests then
//! use [`contract_test`] to prove those checks actually ran. Everything in
//! this module takes a mutex, so none of it may be called from the
//! real-time path.

#[cfg(feature = "ppt")]
use lazy_static::lazy_static;
#[cfg(feature = "ppt")]
use std::collections::HashSet;
#[cfg(feature = "ppt")]
use std::sync::Mutex;

/// Every node in a built graph comes after all of its inputs.
pub const GRAPH_POSTORDER: u32 = 1;
/// A node appears at most once in a built graph.
pub const GRAPH_DEDUPLICATED: u32 = 2;
/// A builder containing a cycle was rejected.
pub const GRAPH_REJECTS_CYCLE: u32 = 3;
/// A builder referencing a missing node was rejected.
pub const GRAPH_REJECTS_INVALID: u32 = 4;
/// Nodes were prepared strictly after their inputs.
pub const PREPARE_INPUTS_FIRST: u32 = 5;
/// Dependency counts match the number of direct inputs.
pub const PREPARE_DEPENDENCIES: u32 = 6;
/// Leaves lead the prepared order without breaking postorder.
pub const PREPARE_LEAVES_FIRST: u32 = 7;

#[cfg(feature = "ppt")]
lazy_static! {
    static ref INVARIANT_LOG: Mutex<HashSet<u32>> = Mutex::new(HashSet::new());
}

#[cfg(feature = "ppt")]
/// Assert an invariant: logs it and panics on failure.
pub(crate) fn assert_invariant(id: u32, condition: bool, message: &str, context: Option<&str>) {
    if !condition {
        let full_message = match context {
            Some(ctx) => format!("Invariant {id} failed: {message} (context: {ctx})"),
            None => format!("Invariant {id} failed: {message}"),
        };
        tracing::error!("{full_message}");
        panic!("{full_message}");
    }
    INVARIANT_LOG
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(id);
}

#[cfg(not(feature = "ppt"))]
/// Assert an invariant: checks condition and panics on failure.
pub(crate) fn assert_invariant(_id: u32, condition: bool, message: &str, _context: Option<&str>) {
    if !condition {
        panic!("Invariant failed: {message}");
    }
}

#[cfg(feature = "ppt")]
/// Contract test: checks that specified invariants were asserted.
pub fn contract_test(test_name: &str, required_invariants: &[u32]) {
    let log = INVARIANT_LOG.lock().unwrap_or_else(|e| e.into_inner());
    let missing: Vec<u32> = required_invariants
        .iter()
        .copied()
        .filter(|inv| !log.contains(inv))
        .collect();
    drop(log);
    if !missing.is_empty() {
        panic!("Contract test '{test_name}' failed: invariants not enforced: {missing:?}");
    }
}

#[cfg(not(feature = "ppt"))]
/// Contract test: no-op when PPT feature is disabled.
pub fn contract_test(_test_name: &str, _required_invariants: &[u32]) {}

#[cfg(feature = "ppt")]
/// Clear invariant log (for between test runs).
pub fn clear_invariant_log() {
    INVARIANT_LOG
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clear();
}

#[cfg(not(feature = "ppt"))]
/// Clear invariant log: no-op when PPT feature is disabled.
pub fn clear_invariant_log() {}
