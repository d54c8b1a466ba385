//! Liveness of GC pointers (component C).
//!
//! A GC-typed value is live at an instruction when some use of it is
//! reachable from that instruction along a path that does not pass through
//! its definition. Null and undef constants are excluded by policy: the
//! collector has nothing to relocate for them.
//!
//! Two interchangeable modes:
//!
//! - **Global**: one backward dataflow over the whole function, then a
//!   per-site backward walk from the block's live-out set.
//! - **Local**: per-site queries built on reachable-not-via-def walks,
//!   scanning arguments and every definition in a dominating block.
//!
//! A site's own result is never live at its own entry, and its operands are
//! live only if used again later.

use ember_ir::{BlockId, Cfg, DominatorTree, Function, InstKind, ValueId};
use rustc_hash::{FxHashMap, FxHashSet};

// =============================================================================
// Tracked values
// =============================================================================

/// Is `v` a pointer the collector must know about?
#[inline]
pub fn is_tracked(func: &Function, v: ValueId) -> bool {
    func.ty(v).is_gc_ptr() && !func.is_null(v) && !func.is_undef(v)
}

// =============================================================================
// Global dataflow
// =============================================================================

/// Per-block live-in/live-out sets of GC values.
#[derive(Debug, Clone, Default)]
pub struct LivenessMap {
    pub live_in: FxHashMap<BlockId, FxHashSet<ValueId>>,
    pub live_out: FxHashMap<BlockId, FxHashSet<ValueId>>,
}

/// Whole-function backward dataflow to a fixed point.
pub fn compute_liveness(func: &Function) -> LivenessMap {
    let mut data = LivenessMap::default();
    for &b in &func.layout {
        data.live_in.insert(b, FxHashSet::default());
        data.live_out.insert(b, FxHashSet::default());
    }

    let mut worklist: Vec<BlockId> = func.layout.clone();
    while let Some(b) = worklist.pop() {
        let mut live_out: FxHashSet<ValueId> = FxHashSet::default();
        for s in func.successors(b) {
            live_out.extend(data.live_in[&s].iter().copied());
            seed_phi_uses(func, b, s, &mut live_out);
        }

        if !live_out.is_empty() && data.live_out[&b] == live_out {
            // Processed before with the same result; nothing to propagate.
            continue;
        }
        data.live_out.insert(b, live_out.clone());

        let mut live = live_out;
        transfer_block(func, b, None, &mut live);

        if data.live_in[&b] != live {
            let grew = !live.is_empty();
            data.live_in.insert(b, live);
            if grew {
                for p in func.predecessors(b) {
                    worklist.push(p);
                }
            }
        }
    }
    data
}

/// A phi consumes its operand on the incoming edge: values flowing into a
/// successor's phis over the `pred → succ` edge are live out of `pred`,
/// not live into the phi's own block.
fn seed_phi_uses(
    func: &Function,
    pred: BlockId,
    succ: BlockId,
    live_out: &mut FxHashSet<ValueId>,
) {
    for &inst in &func.block(succ).insts {
        match func.inst(inst) {
            Some(InstKind::Phi { incomings, .. }) => {
                for &(from, v) in incomings {
                    if from == pred && is_tracked(func, v) {
                        live_out.insert(v);
                    }
                }
            }
            // Phis are grouped at the block head.
            _ => break,
        }
    }
}

/// Walk a block backwards applying the kill/gen rule, stopping *before*
/// `until` when given (its own operands and result are not processed).
/// Phi operands were consumed at the predecessor edge; phis only kill.
fn transfer_block(
    func: &Function,
    block: BlockId,
    until: Option<ValueId>,
    live: &mut FxHashSet<ValueId>,
) {
    for &inst in func.block(block).insts.iter().rev() {
        if Some(inst) == until {
            break;
        }
        live.remove(&inst);
        if func.inst(inst).map_or(false, InstKind::is_phi) {
            continue;
        }
        for op in func.operands(inst) {
            if is_tracked(func, op) {
                live.insert(op);
            }
        }
    }
}

/// Live set immediately before `site`, from precomputed dataflow results.
pub fn live_at_site_dataflow(
    func: &Function,
    data: &LivenessMap,
    site: ValueId,
) -> FxHashSet<ValueId> {
    let block = func.inst_block(site).expect("site must be an instruction");
    let mut live = data.live_out[&block].clone();
    transfer_block(func, block, Some(site), &mut live);
    live.remove(&site);
    live
}

// =============================================================================
// Local (on-demand) mode
// =============================================================================

/// Live set immediately before `site`, by per-value reachability queries.
///
/// Candidates are the GC-typed arguments plus every GC-typed definition in
/// a block dominating the site's block (definitions elsewhere cannot be
/// used across the site without violating SSA dominance).
pub fn live_at_site_local(
    func: &Function,
    cfg: &Cfg,
    dom: &DominatorTree,
    site: ValueId,
) -> FxHashSet<ValueId> {
    let site_block = func.inst_block(site).expect("site must be an instruction");
    let mut live = FxHashSet::default();

    for &arg in func.args() {
        if is_tracked(func, arg) && has_live_use(func, cfg, site, arg) {
            live.insert(arg);
        }
    }

    for &b in &func.layout {
        if !dom.dominates(b, site_block) {
            continue;
        }
        for &inst in &func.block(b).insts {
            if b == site_block && inst == site {
                // Definitions at or after the site itself are not live
                // into it.
                break;
            }
            if !is_tracked(func, inst) {
                continue;
            }
            if has_live_use(func, cfg, site, inst) {
                live.insert(inst);
            }
        }
    }
    live.remove(&site);
    live
}

/// Does any use of `def` keep it live across `site`?
fn has_live_use(func: &Function, cfg: &Cfg, site: ValueId, def: ValueId) -> bool {
    for user in func.users(def) {
        match func.inst(user) {
            Some(InstKind::Phi { incomings, .. }) => {
                // A phi consumes its operand at the end of the incoming
                // edge, not at the phi itself.
                for &(pred, v) in incomings {
                    if v == def
                        && reachable_not_via_def(func, cfg, site, func.terminator(pred), def)
                    {
                        return true;
                    }
                }
            }
            Some(_) => {
                if reachable_not_via_def(func, cfg, site, user, def) {
                    return true;
                }
            }
            None => {}
        }
    }
    false
}

/// Is there a control-flow path from `from` to `to` that does not execute
/// the definition of `def`?
///
/// Two cases matter beyond plain reachability: uses that can only be
/// reached by re-executing the definition (not live), and same-block
/// positions connected only around a loop.
pub fn reachable_not_via_def(
    func: &Function,
    cfg: &Cfg,
    from: ValueId,
    to: ValueId,
    def: ValueId,
) -> bool {
    let from_block = func.inst_block(from).expect("from must be placed");
    let to_block = func.inst_block(to).expect("to must be placed");
    let from_pos = func.pos_in_block(from).expect("from detached");
    let to_pos = func.pos_in_block(to).expect("to detached");

    // Where the definition sits, if it is an instruction at all. Arguments
    // and constants never block a path.
    let def_place = func
        .inst_block(def)
        .map(|b| (b, func.pos_in_block(def).expect("def detached")));

    // Straight-line path within one block.
    if from_block == to_block && to_pos > from_pos {
        let blocked = matches!(
            def_place,
            Some((b, p)) if b == from_block && p > from_pos && p < to_pos
        );
        if !blocked {
            return true;
        }
        // Straight line passes the def; a loop path may still avoid it.
    }

    // Leaving the from-block executes its remainder.
    if matches!(def_place, Some((b, p)) if b == from_block && p > from_pos) {
        return false;
    }

    let mut seen = FxHashSet::default();
    let mut work: Vec<BlockId> = cfg.succs(from_block).to_vec();
    while let Some(b) = work.pop() {
        if !seen.insert(b) {
            continue;
        }
        if b == to_block {
            // Entering at the top executes [start, to_pos).
            let via_def = matches!(def_place, Some((db, dp)) if db == b && dp < to_pos);
            if !via_def {
                return true;
            }
        }
        // A block containing the definition cannot be passed through.
        if matches!(def_place, Some((db, _)) if db == b) {
            continue;
        }
        work.extend(cfg.succs(b).iter().copied());
    }
    false
}

// =============================================================================
// Tests
// =============================================================================
