//! Relocation rewriting (component F).
//!
//! After materialization, uses of the original live values still read the
//! pre-safepoint definitions. Rather than walking the dominator tree
//! inserting phis by hand, each live value takes a round trip through
//! memory:
//!
//! 1. one entry-block stack slot per distinct live value;
//! 2. a store of the original definition right after it;
//! 3. after every statepoint, a store of the relocated value (or null for
//!    values that site does not relocate — they are dead past it);
//! 4. every use rewritten to a load from the slot (phis load at the end of
//!    the incoming block);
//! 5. SSA promotion eliminates all the slots again, wiring the loads to
//!    the nearest dominating store and inserting exactly the phis the
//!    dominance frontier demands.
//!
//! The statepoints' own live operands are rewritten like any other use:
//! after promotion they read the value reaching the statepoint, which is
//! precisely the relocation of the nearest dominating statepoint (or the
//! original def). The slot count before and after must match exactly.

use crate::statepoint::{self, SafepointRecord, SiteState};
use crate::stats::PassStats;
use ember_ir::{
    promote_slots, Cfg, DominatorTree, Function, InstKind, Type, ValueId, ValueKind,
};
use rustc_hash::FxHashMap;

/// Rewrite every use of every value relocated anywhere in the function.
pub fn relocation_via_slots(
    func: &mut Function,
    records: &mut [SafepointRecord],
    stats: &mut PassStats,
) {
    let initial_slots = count_slots(func);

    // The live vectors are read out of the statepoints rather than the
    // records: a live value that was itself a nominated call has been
    // replaced by its result projection by now, and only the statepoint
    // operands saw that update.
    let mut live: Vec<ValueId> = Vec::new();
    for record in records.iter() {
        for v in statepoint_live_operands(func, record) {
            if !live.contains(&v) {
                live.push(v);
            }
        }
    }
    debug_assert!(
        live.iter().all(|&v| func.ty(v).is_gc_ptr()),
        "live vector must hold gc pointers"
    );

    if live.is_empty() {
        for record in records.iter_mut() {
            record.advance(SiteState::Rewritten);
        }
        return;
    }

    // --- Slots ---------------------------------------------------------------
    let mut slot_of: FxHashMap<ValueId, ValueId> = FxHashMap::default();
    let mut slots: Vec<ValueId> = Vec::with_capacity(live.len());
    let entry = func.entry();
    for &v in &live {
        let slot = func.insert_at_block_start(
            entry,
            InstKind::StackSlot {
                slot_ty: func.ty(v),
            },
            Type::raw_ptr(),
        );
        slot_of.insert(v, slot);
        slots.push(slot);
    }
    stats.relocation_slots += slots.len() as u64;

    // --- Stores after each statepoint ---------------------------------------
    // Before any use is rewritten, so the statepoint operands still link
    // relocates to original defs.
    for record in records.iter() {
        let mut relocations: FxHashMap<ValueId, Option<ValueId>> = FxHashMap::default();
        for &v in slot_of.keys() {
            relocations.insert(v, None);
        }
        statepoint::relocations_of(func, record, &mut relocations);

        for (&def, &reloc) in &relocations {
            let slot = slot_of[&def];
            match reloc {
                Some(relocated) => {
                    func.insert_after(
                        relocated,
                        InstKind::Store {
                            value: relocated,
                            ptr: slot,
                        },
                        Type::Void,
                    );
                }
                None if Some(def) == record.result => {
                    // The site's own result is stored at its definition
                    // like every other original def.
                }
                None => {
                    // Not relocated by this site: dead past it. Poison the
                    // slot with null so stale values cannot leak through.
                    let null = func.make_null(func.ty(def));
                    func.insert_after(
                        record.last,
                        InstKind::Store {
                            value: null,
                            ptr: slot,
                        },
                        Type::Void,
                    );
                }
            }
        }
    }

    // --- Rewrite uses, then store the original defs --------------------------
    for &def in &live {
        let slot = slot_of[&def];
        let def_ty = func.ty(def);

        let mut uses = func.users(def);
        uses.sort();
        uses.dedup();

        for use_inst in uses {
            match func.inst(use_inst) {
                Some(InstKind::Store { value, ptr }) if *ptr == slot && *value == def => {
                    // Our own spill store; leave it.
                    continue;
                }
                Some(InstKind::Phi { .. }) => {
                    let incomings = match func.inst(use_inst) {
                        Some(InstKind::Phi { incomings, .. }) => incomings.clone(),
                        _ => unreachable!(),
                    };
                    for (edge, &(pred, v)) in incomings.iter().enumerate() {
                        if v != def {
                            continue;
                        }
                        let term = func.terminator(pred);
                        let load = func.insert_before(term, InstKind::Load { ptr: slot }, def_ty);
                        if let Some(InstKind::Phi { incomings, .. }) = func.inst_mut(use_inst) {
                            incomings[edge].1 = load;
                        }
                    }
                }
                Some(_) => {
                    let load = func.insert_before(use_inst, InstKind::Load { ptr: slot }, def_ty);
                    func.map_operands(use_inst, |op| if op == def { load } else { op });
                }
                None => {}
            }
        }

        // The initial store comes last so it is not itself rewritten.
        // Instruction defs store right after themselves; arguments and
        // constants store in the entry block after the slot allocations.
        let store_kind = InstKind::Store {
            value: def,
            ptr: slot,
        };
        match func.value(def).kind {
            ValueKind::Inst { .. } => {
                func.insert_after(def, store_kind, Type::Void);
            }
            _ => {
                func.insert_after(*slots.last().expect("slots exist"), store_kind, Type::Void);
            }
        }
    }

    // --- Promote everything back to SSA --------------------------------------
    let cfg = Cfg::build(func);
    let dom = DominatorTree::build(&cfg);
    let promoted = promote_slots(func, &cfg, &dom, &slots);
    assert_eq!(promoted, slots.len(), "every relocation slot must promote");
    assert_eq!(
        count_slots(func),
        initial_slots,
        "relocation must not leak stack slots"
    );

    for record in records.iter_mut() {
        record.advance(SiteState::Rewritten);
    }
}

fn statepoint_live_operands(func: &Function, record: &SafepointRecord) -> Vec<ValueId> {
    match func.inst(record.token) {
        Some(InstKind::Statepoint {
            operands,
            live_start,
            ..
        }) => operands[*live_start as usize..].to_vec(),
        _ => panic!("record has no statepoint token"),
    }
}

fn count_slots(func: &Function) -> usize {
    func.count_insts(|k| matches!(k, InstKind::StackSlot { .. }))
}

// =============================================================================
// Tests
// =============================================================================
