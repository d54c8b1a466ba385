//! Poll site selection (component A).
//!
//! Nominates the three classes of poll locations:
//!
//! - **entry**: as late in the entry chain as possible without crossing a
//!   split or join, so fewer values are live and placement is stable;
//! - **backedge**: every in-loop predecessor of a loop header, unless the
//!   loop has a known positive finite trip count (a finite loop cannot
//!   starve the collector);
//! - **call**: every call that might itself transition to the runtime.
//!
//! The poll implementation itself is always exempt: inserting polls into
//! `safepoint_poll` would recurse forever.

use crate::config::PassConfig;
use crate::stats::PassStats;
use ember_ir::{
    Cfg, DominatorTree, Function, InstKind, Intrinsic, LoopAnalysis, Module, TripCount, ValueId,
};
use smallvec::SmallVec;

/// Name of the frontend-provided poll implementation.
pub const POLL_FUNCTION_NAME: &str = "safepoint_poll";

pub const ATTR_ENTRY: &str = "gc-add-entry-safepoints";
pub const ATTR_BACKEDGE: &str = "gc-add-backedge-safepoints";
pub const ATTR_CALL: &str = "gc-add-call-safepoints";
pub const ATTR_LEAF: &str = "gc-leaf-function";

// =============================================================================
// Participation
// =============================================================================

/// Does `func` opt into the safepoint class controlled by `attr`?
pub fn should_run(func: &Function, attr: &str, config: &PassConfig) -> bool {
    let requested = config.all_functions || func.attr_true(attr);
    if requested && func.name == POLL_FUNCTION_NAME {
        debug_assert!(config.all_functions, "misconfigured poll attributes");
        log::warn!("ignoring request to place safepoints in {}", POLL_FUNCTION_NAME);
        return false;
    }
    requested
}

// =============================================================================
// Needs-statepoint predicate
// =============================================================================

/// Must this call be turned into a parse point?
pub fn needs_statepoint(module: &Module, func: &Function, inst: ValueId) -> bool {
    match func.inst(inst) {
        Some(InstKind::Call { callee, .. }) => {
            let target = module.get(*callee);
            match target.intrinsic {
                // Memory routines get overridden implementations that can
                // take a safepoint internally.
                Some(Intrinsic::Mem(_)) => true,
                // Every other intrinsic never transitions to the runtime.
                Some(_) => false,
                None => {
                    // Explicit leaf annotation wins.
                    !target.attr_true(ATTR_LEAF)
                }
            }
        }
        // Re-encountering our own machinery: already transformed, skip.
        Some(k) if k.is_safepoint_artifact() => false,
        _ => false,
    }
}

// =============================================================================
// Entry poll
// =============================================================================

/// Walk forward from the entry through the unique-successor /
/// unique-predecessor chain; the poll goes at the last terminator before
/// the first split or join. Returns None when the function opted out.
pub fn find_entry_poll_location(func: &Function, config: &PassConfig) -> Option<ValueId> {
    if !should_run(func, ATTR_ENTRY, config) {
        return None;
    }
    let mut current = func.entry();
    loop {
        let next = match func.unique_successor(current) {
            Some(n) => n,
            // Split: stop here.
            None => break,
        };
        if func.unique_predecessor(next).is_none() {
            // Next is a join: crossing it could move an "entry" poll into
            // the middle of a loop.
            break;
        }
        current = next;
    }
    Some(func.terminator(current))
}

// =============================================================================
// Backedge polls
// =============================================================================

/// Terminators of in-loop predecessors of each loop header that needs a
/// poll. Finite counted loops are pruned unless `all_backedges`.
pub fn find_backedge_poll_locations(
    func: &Function,
    config: &PassConfig,
    stats: &mut PassStats,
) -> Vec<ValueId> {
    let mut locations = Vec::new();
    if !should_run(func, ATTR_BACKEDGE, config) {
        return locations;
    }

    let cfg = Cfg::build(func);
    let dom = DominatorTree::build(&cfg);
    let loops = LoopAnalysis::compute(&cfg, &dom);

    for lp in &loops.loops {
        if !config.all_backedges {
            let tc = ember_ir::trip_count(func, lp);
            if tc.is_finite() {
                log::debug!(
                    "skipping backedge poll in finite loop (header {:?}, {:?})",
                    lp.header,
                    tc
                );
                stats.finite_loops_skipped += 1;
                continue;
            }
            if let TripCount::Symbolic(_) = tc {
                // A runtime bound proves nothing; the loop still polls.
            }
        }
        for &pred in &lp.back_edges {
            let term = func.terminator(pred);
            if !locations.contains(&term) {
                locations.push(term);
            }
        }
    }
    locations
}

// =============================================================================
// Call polls
// =============================================================================

/// Every call instruction that needs the full statepoint treatment.
pub fn find_call_safepoints(
    module: &Module,
    func: &Function,
    config: &PassConfig,
) -> Vec<ValueId> {
    let mut found = Vec::new();
    if !should_run(func, ATTR_CALL, config) {
        return found;
    }
    for &b in &func.layout {
        for &inst in &func.block(b).insts {
            if matches!(func.inst(inst), Some(InstKind::Call { .. }))
                && needs_statepoint(module, func, inst)
            {
                found.push(inst);
            }
        }
    }
    found
}

// =============================================================================
// Helpers
// =============================================================================

/// De-duplicate preserving first-seen order. Sorting here would shuffle
/// the site order, which several downstream expectations (and diffs of the
/// emitted IR) rely on.
pub fn unique_unsorted(values: &mut Vec<ValueId>) {
    let mut seen: SmallVec<[ValueId; 16]> = SmallVec::new();
    values.retain(|v| {
        if seen.contains(v) {
            false
        } else {
            seen.push(*v);
            true
        }
    });
}

// =============================================================================
// Tests
// =============================================================================
