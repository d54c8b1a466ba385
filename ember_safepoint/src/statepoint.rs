//! Statepoint materialization (component E).
//!
//! Replaces a nominated call with the collector-parsable form:
//!
//! ```text
//! token = statepoint target [argc, flags,
//!                            depth, bci, #stack, #locals, #monitors,
//!                            origArgs...,
//!                            (tag, stack)..., (tag, local)..., monitors...,
//!                            | liveGC...]
//! result = statepoint_result token        ; iff the call result is used
//! x.relocated = relocate token, base_i, derived_i   ; one per live value
//! ```
//!
//! The inserted range `(token, last)` stays contiguous; the original call
//! sits between token and the projections until the driver deletes it.
//! Relocate indices count from the first live GC operand.

use crate::config::PassConfig;
use crate::stats::PassStats;
use ember_ir::{CallConv, Function, InstKind, Type, ValueId};
use rustc_hash::{FxHashMap, FxHashSet};

// =============================================================================
// Site record & state machine
// =============================================================================

/// Lifecycle of one parse point. Transitions are one-way; skipping or
/// repeating a phase is a bug in the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SiteState {
    Nominated,
    LivenessComputed,
    BasesResolved,
    Materialized,
    Rewritten,
}

/// Everything the pass accumulates about one parse point.
#[derive(Debug)]
pub struct SafepointRecord {
    /// The original call. Dead once the driver deletes it after
    /// materialization.
    pub site: ValueId,
    pub state: SiteState,
    /// Values live across the site.
    pub liveset: FxHashSet<ValueId>,
    /// derived → base for every live value; bases self-map.
    pub base_pairs: FxHashMap<ValueId, ValueId>,
    /// Values inserted into the IR while resolving this site's bases.
    pub new_defs: FxHashSet<ValueId>,
    /// First instruction of the inserted sequence (the statepoint token).
    pub token: ValueId,
    /// Last instruction of the inserted sequence.
    pub last: ValueId,
    /// Result projection, when the original call's result is used.
    pub result: Option<ValueId>,
}

impl SafepointRecord {
    pub fn new(site: ValueId) -> Self {
        SafepointRecord {
            site,
            state: SiteState::Nominated,
            liveset: FxHashSet::default(),
            base_pairs: FxHashMap::default(),
            new_defs: FxHashSet::default(),
            token: ValueId::INVALID,
            last: ValueId::INVALID,
            result: None,
        }
    }

    /// Advance the state machine by exactly one step.
    pub fn advance(&mut self, to: SiteState) {
        let expected = match to {
            SiteState::Nominated => unreachable!("cannot re-nominate"),
            SiteState::LivenessComputed => SiteState::Nominated,
            SiteState::BasesResolved => SiteState::LivenessComputed,
            SiteState::Materialized => SiteState::BasesResolved,
            SiteState::Rewritten => SiteState::Materialized,
        };
        assert_eq!(self.state, expected, "site state machine violated");
        self.state = to;
    }
}

// =============================================================================
// Ordering
// =============================================================================

/// Sort key making the base/live pairing deterministic: named values first
/// in name order, unnamed values after in id order.
fn name_key(func: &Function, v: ValueId) -> (bool, String, u32) {
    let name = &func.value(v).name;
    (name.is_empty(), name.clone(), v.raw())
}

/// Order base/live pairs by the derived value's name so the emitted
/// operand list is stable across runs (useful in diffs).
fn stabilize_order(func: &Function, bases: &mut [ValueId], lives: &mut [ValueId]) {
    assert_eq!(bases.len(), lives.len());
    let mut paired: Vec<(ValueId, ValueId)> = lives
        .iter()
        .copied()
        .zip(bases.iter().copied())
        .collect();
    paired.sort_by(|a, b| name_key(func, a.0).cmp(&name_key(func, b.0)));
    for (i, (live, base)) in paired.into_iter().enumerate() {
        lives[i] = live;
        bases[i] = base;
    }
}

// =============================================================================
// Materialization
// =============================================================================

/// Emit the statepoint sequence for one site. Does not touch uses of the
/// original live values and does not delete the call; both are the
/// driver's job.
pub fn materialize(
    func: &mut Function,
    record: &mut SafepointRecord,
    config: &PassConfig,
    stats: &mut PassStats,
) {
    let site = record.site;
    let (target, call_args, deopt) = match func.inst(site) {
        Some(InstKind::Call {
            callee,
            args,
            deopt,
            ..
        }) => (*callee, args.clone(), deopt.clone()),
        other => panic!("materializing a non-call site: {:?}", other),
    };

    // Every base referenced by the live set rides along so its relocation
    // exists for later safepoints.
    crate::base::add_bases_as_live(&mut record.liveset, &mut record.base_pairs);

    let mut livevec: Vec<ValueId> = record.liveset.iter().copied().collect();
    livevec.sort_by(|&a, &b| name_key(func, a).cmp(&name_key(func, b)));
    let mut basevec: Vec<ValueId> = livevec
        .iter()
        .map(|v| *record.base_pairs.get(v).expect("live value without base"))
        .collect();
    stabilize_order(func, &mut basevec, &mut livevec);

    // --- Operand vector in wire order ---------------------------------------
    let i32c = |f: &mut Function, bits: i64| f.make_int(Type::I32, bits);
    let mut operands: Vec<ValueId> = Vec::new();
    operands.push(i32c(func, call_args.len() as i64));
    operands.push(i32c(func, 0)); // reserved flag word

    let state = deopt.filter(|_| config.use_abstract_state);
    match &state {
        Some(s) => {
            operands.push(i32c(func, s.caller_depth));
            operands.push(i32c(func, s.bci));
            operands.push(i32c(func, s.stack.len() as i64));
            operands.push(i32c(func, s.locals.len() as i64));
            operands.push(i32c(func, s.monitors.len() as i64));
        }
        None => {
            // Placeholders: no abstract state required at this site.
            operands.push(i32c(func, 0));
            operands.push(i32c(func, -1));
            operands.push(i32c(func, 0));
            operands.push(i32c(func, 0));
            operands.push(i32c(func, 0));
        }
    }

    operands.extend(call_args.iter().copied());

    if let Some(s) = &state {
        for &(tag, v) in &s.stack {
            operands.push(i32c(func, tag.encode()));
            operands.push(v);
        }
        for &(tag, v) in &s.locals {
            operands.push(i32c(func, tag.encode()));
            operands.push(v);
        }
        operands.extend(s.monitors.iter().copied());
    }

    let live_start = operands.len() as u32;
    operands.extend(livevec.iter().copied());

    let token = func.insert_before(
        site,
        InstKind::Statepoint {
            target,
            operands,
            live_start,
            num_call_args: call_args.len() as u32,
        },
        Type::Token,
    );
    func.set_name(token, "safepoint_token");
    record.token = token;
    stats.statepoints += 1;

    // --- Result projection ---------------------------------------------------
    let mut last = token;
    let site_ty = func.ty(site);
    if !site_ty.is_void() && !func.users(site).is_empty() {
        let name = func.value(site).name.clone();
        let result = func.insert_after(site, InstKind::StatepointResult { token }, site_ty);
        if !name.is_empty() {
            func.set_name(result, name);
        }
        record.result = Some(result);
        stats.result_projections += 1;
        last = result;
    }

    // --- One relocate per live value -----------------------------------------
    let index_of = |vec: &[ValueId], v: ValueId| -> u32 {
        vec.iter().position(|&x| x == v).expect("value in live vector") as u32
    };
    let mut insert_point = if last == token { site } else { last };
    for i in 0..livevec.len() {
        let derived = livevec[i];
        let base = basevec[i];
        let reloc = func.insert_after(
            insert_point,
            InstKind::Relocate {
                token,
                base_index: index_of(&livevec, base),
                derived_index: i as u32,
                conv: CallConv::Cold,
            },
            func.ty(derived),
        );
        let derived_name = &func.value(derived).name;
        if !derived_name.is_empty() {
            let reloc_name = format!("{}.relocated", derived_name);
            func.set_name(reloc, reloc_name);
        }
        stats.relocates += 1;
        insert_point = reloc;
        last = reloc;
    }

    record.last = last;
    record.advance(SiteState::Materialized);
}

/// Map each queried value to the relocate this statepoint emitted for it,
/// if any. Entries start as None and stay None for values the site does
/// not relocate.
pub fn relocations_of(
    func: &Function,
    record: &SafepointRecord,
    defs: &mut FxHashMap<ValueId, Option<ValueId>>,
) {
    debug_assert!(defs.values().all(Option::is_none), "caller seeds with None");
    let (operands, live_start) = match func.inst(record.token) {
        Some(InstKind::Statepoint {
            operands,
            live_start,
            ..
        }) => (operands.clone(), *live_start as usize),
        _ => panic!("record token is not a statepoint"),
    };
    for user in func.users(record.token) {
        if let Some(InstKind::Relocate { derived_index, .. }) = func.inst(user) {
            let derived = operands[live_start + *derived_index as usize];
            if let Some(slot) = defs.get_mut(&derived) {
                *slot = Some(user);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
