//! Promotion of stack slots to SSA registers.
//!
//! The classic construction: place phis at the iterated dominance frontier
//! of the slot's store blocks, then walk the dominator tree renaming loads
//! to the reaching definition. Slots whose address is used by anything
//! other than a plain load or store are left alone.
//!
//! Loads with no reaching store read undef.

use crate::cfg::{Cfg, DominatorTree};
use crate::entity::DenseSet;
use crate::func::{BlockId, Function, InstKind, ValueId};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Promote the given stack slots. Returns the number of slots eliminated.
pub fn promote_slots(
    func: &mut Function,
    cfg: &Cfg,
    dom: &DominatorTree,
    slots: &[ValueId],
) -> usize {
    let mut promoted = 0;
    let mut ctx = Renamer {
        phi_slots: FxHashMap::default(),
        current: FxHashMap::default(),
        slot_tys: FxHashMap::default(),
    };
    let mut promotable: Vec<ValueId> = Vec::with_capacity(slots.len());

    for &slot in slots {
        let slot_ty = match func.inst(slot) {
            Some(InstKind::StackSlot { slot_ty }) => *slot_ty,
            _ => continue,
        };
        if !is_promotable(func, slot) {
            continue;
        }
        ctx.slot_tys.insert(slot, slot_ty);
        promotable.push(slot);

        // Phi placement at the iterated dominance frontier of store blocks.
        let mut def_blocks: Vec<BlockId> = Vec::new();
        for user in func.users(slot) {
            if let Some(InstKind::Store { ptr, .. }) = func.inst(user) {
                if *ptr == slot {
                    let b = func.inst_block(user).expect("store placed");
                    if !def_blocks.contains(&b) {
                        def_blocks.push(b);
                    }
                }
            }
        }

        let mut has_phi = DenseSet::with_capacity(func.blocks.len());
        let mut work = def_blocks.clone();
        while let Some(b) = work.pop() {
            for &fb in dom.frontier(b) {
                if has_phi.insert(fb.index()) {
                    let phi = func.insert_at_block_start(
                        fb,
                        InstKind::Phi {
                            incomings: SmallVec::new(),
                            is_base: false,
                        },
                        slot_ty,
                    );
                    ctx.phi_slots.insert(phi, slot);
                    if !def_blocks.contains(&fb) {
                        work.push(fb);
                    }
                }
            }
        }
    }

    if promotable.is_empty() {
        return 0;
    }

    let entry = func.entry();
    rename_block(func, cfg, dom, &mut ctx, entry);

    for slot in promotable {
        func.remove_inst(slot);
        promoted += 1;
    }
    promoted
}

/// A slot is promotable when its address never escapes: every use is a load
/// from it or a store *to* it.
fn is_promotable(func: &Function, slot: ValueId) -> bool {
    for user in func.users(slot) {
        match func.inst(user) {
            Some(InstKind::Load { ptr }) if *ptr == slot => {}
            Some(InstKind::Store { ptr, value }) if *ptr == slot && *value != slot => {}
            _ => return false,
        }
    }
    true
}

struct Renamer {
    /// Phi → slot it merges.
    phi_slots: FxHashMap<ValueId, ValueId>,
    /// Slot → stack of reaching definitions.
    current: FxHashMap<ValueId, Vec<ValueId>>,
    slot_tys: FxHashMap<ValueId, crate::types::Type>,
}

fn rename_block(
    func: &mut Function,
    cfg: &Cfg,
    dom: &DominatorTree,
    ctx: &mut Renamer,
    block: BlockId,
) {
    // Track how many pushes to undo when leaving this block.
    let mut pushed: Vec<ValueId> = Vec::new();

    for inst in func.block(block).insts.clone() {
        match func.inst(inst) {
            Some(InstKind::Phi { .. }) => {
                if let Some(&slot) = ctx.phi_slots.get(&inst) {
                    ctx.current.entry(slot).or_default().push(inst);
                    pushed.push(slot);
                }
            }
            Some(InstKind::Store { value, ptr }) => {
                let (value, ptr) = (*value, *ptr);
                if ctx.slot_tys.contains_key(&ptr) {
                    ctx.current.entry(ptr).or_default().push(value);
                    pushed.push(ptr);
                    func.remove_inst(inst);
                }
            }
            Some(InstKind::Load { ptr }) => {
                let ptr = *ptr;
                if ctx.slot_tys.contains_key(&ptr) {
                    let reaching = ctx
                        .current
                        .get(&ptr)
                        .and_then(|s| s.last().copied());
                    let replacement = match reaching {
                        Some(v) => v,
                        None => func.make_undef(ctx.slot_tys[&ptr]),
                    };
                    func.replace_all_uses(inst, replacement);
                    func.remove_inst(inst);
                }
            }
            _ => {}
        }
    }

    // Feed successor phis the value reaching the end of this block.
    for &succ in cfg.succs(block) {
        for inst in func.block(succ).insts.clone() {
            let slot = match ctx.phi_slots.get(&inst) {
                Some(&s) => s,
                None => continue,
            };
            let reaching = ctx.current.get(&slot).and_then(|s| s.last().copied());
            let value = match reaching {
                Some(v) => v,
                None => func.make_undef(ctx.slot_tys[&slot]),
            };
            if let Some(InstKind::Phi { incomings, .. }) = func.inst_mut(inst) {
                incomings.push((block, value));
            }
        }
    }

    for &child in dom.children(block).to_vec().iter() {
        rename_block(func, cfg, dom, ctx, child);
    }

    for slot in pushed {
        if let Some(stack) = ctx.current.get_mut(&slot) {
            stack.pop();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
