//! Function inlining.
//!
//! Replaces a direct call with a clone of the callee body:
//!
//! 1. Split the caller block at the call; everything after it moves to a
//!    continuation block.
//! 2. Clone the callee's blocks and instructions into the caller, mapping
//!    parameters to the call arguments.
//! 3. Rewrite cloned returns into branches to the continuation, merging
//!    multiple return values through a phi.
//! 4. Replace the call's uses with the inlined result and tombstone it.
//!
//! The callee must not contain stack slots; the only caller in this
//! workspace inlines runtime poll bodies, which are required to be
//! slot-free.

use crate::func::{BlockId, Function, InstKind, ValueData, ValueId, ValueKind};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InlineError {
    /// The given value is not a direct call instruction.
    NotACall,
    /// The callee has no body to inline.
    CalleeIsDeclaration,
    /// Argument count does not match the callee signature.
    ArityMismatch,
    /// The callee allocates stack slots, which this inliner does not carry.
    CalleeHasStackSlots,
    /// No path through the callee returns.
    NoReturn,
}

impl std::fmt::Display for InlineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InlineError::NotACall => write!(f, "inline target is not a call"),
            InlineError::CalleeIsDeclaration => write!(f, "cannot inline a declaration"),
            InlineError::ArityMismatch => write!(f, "call arity does not match callee"),
            InlineError::CalleeHasStackSlots => write!(f, "callee contains stack slots"),
            InlineError::NoReturn => write!(f, "callee never returns"),
        }
    }
}

impl std::error::Error for InlineError {}

pub type InlineResult<T> = Result<T, InlineError>;

/// What the inliner produced.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineInfo {
    /// Clones of the callee's blocks, in callee layout order.
    pub inlined_blocks: Vec<BlockId>,
    /// Block holding the instructions that followed the call.
    pub continuation: BlockId,
    /// The inlined return value, if the callee returns one.
    pub result: Option<ValueId>,
}

// =============================================================================
// Inlining
// =============================================================================

/// Inline `callee` at the call instruction `call` inside `caller`.
pub fn inline_call(
    caller: &mut Function,
    call: ValueId,
    callee: &Function,
) -> InlineResult<InlineInfo> {
    let call_args = match caller.inst(call) {
        Some(InstKind::Call { args, .. }) => args.clone(),
        _ => return Err(InlineError::NotACall),
    };
    if callee.is_declaration() {
        return Err(InlineError::CalleeIsDeclaration);
    }
    if call_args.len() != callee.sig.params.len() {
        return Err(InlineError::ArityMismatch);
    }
    if callee.count_insts(|k| matches!(k, InstKind::StackSlot { .. })) > 0 {
        return Err(InlineError::CalleeHasStackSlots);
    }

    let call_block = caller.inst_block(call).expect("call not placed");
    let call_pos = caller.pos_in_block(call).expect("call detached");

    // --- Split at the call -------------------------------------------------
    let cont_name = format!("{}.cont", caller.block(call_block).name);
    let continuation = caller.new_block(cont_name);
    let moved: Vec<ValueId> = caller.block(call_block).insts[call_pos + 1..].to_vec();
    caller.block_mut(call_block).insts.truncate(call_pos);
    for &v in &moved {
        if let ValueKind::Inst { block, .. } = &mut caller.values[v].kind {
            *block = continuation;
        }
    }
    caller.block_mut(continuation).insts = moved;

    // Successor phis still name the split block as their predecessor.
    for succ in caller.successors(continuation) {
        for i in caller.block(succ).insts.clone() {
            if let Some(InstKind::Phi { incomings, .. }) = caller.inst_mut(i) {
                for (pred, _) in incomings.iter_mut() {
                    if *pred == call_block {
                        *pred = continuation;
                    }
                }
            }
        }
    }

    // --- Clone the callee body ---------------------------------------------
    let mut block_map: FxHashMap<BlockId, BlockId> = FxHashMap::default();
    let mut inlined_blocks = Vec::with_capacity(callee.layout.len());
    for &b in &callee.layout {
        let name = format!("{}.inl", callee.block(b).name);
        let nb = caller.new_block(name);
        block_map.insert(b, nb);
        inlined_blocks.push(nb);
    }

    let mut value_map: FxHashMap<ValueId, ValueId> = FxHashMap::default();
    for (i, &param) in callee.args().iter().enumerate() {
        value_map.insert(param, call_args[i]);
    }

    // First pass: reserve a caller value for every callee instruction so
    // forward references (loop phis) resolve during the second pass.
    for &b in &callee.layout {
        let nb = block_map[&b];
        for &inst in &callee.block(b).insts {
            let data = callee.value(inst);
            let v = caller.append_inst(nb, InstKind::Unreachable, data.ty);
            if !data.name.is_empty() {
                caller.set_name(v, data.name.clone());
            }
            value_map.insert(inst, v);
        }
    }

    // Second pass: fill in the real instruction payloads.
    let mut returns: Vec<(BlockId, Option<ValueId>)> = Vec::new();
    for &b in &callee.layout {
        let nb = block_map[&b];
        for &inst in &callee.block(b).insts {
            let mapped = value_map[&inst];
            let mut kind = callee.inst(inst).expect("callee inst").clone();
            if let InstKind::Ret { value } = kind {
                let value = value.map(|v| map_value(caller, callee, &mut value_map, v));
                returns.push((nb, value));
                kind = InstKind::Br { dest: continuation };
            } else {
                remap_kind(caller, callee, &mut value_map, &block_map, &mut kind);
            }
            if let ValueKind::Inst { kind: slot, .. } = &mut caller.values[mapped].kind {
                *slot = kind;
            }
        }
    }

    if returns.is_empty() {
        return Err(InlineError::NoReturn);
    }

    // --- Merge return values ------------------------------------------------
    let result = if caller.ty(call).is_void() {
        None
    } else if returns.len() == 1 {
        returns[0].1
    } else {
        let ty = caller.ty(call);
        let incomings: SmallVec<[(BlockId, ValueId); 2]> = returns
            .iter()
            .map(|&(b, v)| (b, v.expect("typed callee must return a value")))
            .collect();
        let phi = caller.append_inst(
            continuation,
            InstKind::Phi {
                incomings,
                is_base: false,
            },
            ty,
        );
        // Phi goes in front of the moved instructions.
        let insts = &mut caller.block_mut(continuation).insts;
        let phi_pos = insts.len() - 1;
        insts.remove(phi_pos);
        insts.insert(0, phi);
        Some(phi)
    };

    // --- Wire the caller through the clone ----------------------------------
    let entry_clone = block_map[&callee.entry()];
    caller.append_inst(call_block, InstKind::Br { dest: entry_clone }, crate::types::Type::Void);

    if let Some(result) = result {
        caller.replace_all_uses(call, result);
    }
    caller.values[call].kind = ValueKind::Dead;

    Ok(InlineInfo {
        inlined_blocks,
        continuation,
        result,
    })
}

/// Map a callee value into the caller, materializing constants on demand.
fn map_value(
    caller: &mut Function,
    callee: &Function,
    value_map: &mut FxHashMap<ValueId, ValueId>,
    v: ValueId,
) -> ValueId {
    if let Some(&mapped) = value_map.get(&v) {
        return mapped;
    }
    let ValueData { kind, ty, .. } = callee.value(v);
    let mapped = match kind {
        ValueKind::NullPtr => caller.make_null(*ty),
        ValueKind::Undef => caller.make_undef(*ty),
        ValueKind::ConstInt { bits } => caller.make_int(*ty, *bits),
        ValueKind::GlobalAddr { symbol } => caller.make_global(symbol.clone(), *ty),
        _ => panic!("unmapped callee value of kind {:?}", kind),
    };
    value_map.insert(v, mapped);
    mapped
}

fn remap_kind(
    caller: &mut Function,
    callee: &Function,
    value_map: &mut FxHashMap<ValueId, ValueId>,
    block_map: &FxHashMap<BlockId, BlockId>,
    kind: &mut InstKind,
) {
    // Operands first.
    let mut ops: Vec<ValueId> = Vec::new();
    {
        let snapshot = kind.clone();
        collect_ops(&snapshot, &mut ops);
    }
    let mut mapped_ops = Vec::with_capacity(ops.len());
    for op in ops {
        mapped_ops.push(map_value(caller, callee, value_map, op));
    }
    let mut i = 0;
    rewrite_ops(kind, |op| {
        *op = mapped_ops[i];
        i += 1;
    });

    // Then block references.
    match kind {
        InstKind::Br { dest } => *dest = block_map[dest],
        InstKind::CondBr {
            on_true, on_false, ..
        } => {
            *on_true = block_map[on_true];
            *on_false = block_map[on_false];
        }
        InstKind::Phi { incomings, .. } => {
            for (pred, _) in incomings.iter_mut() {
                *pred = block_map[pred];
            }
        }
        _ => {}
    }
}

fn collect_ops(kind: &InstKind, out: &mut Vec<ValueId>) {
    crate::func::each_operand(kind, |v| out.push(v));
}

fn rewrite_ops(kind: &mut InstKind, f: impl FnMut(&mut ValueId)) {
    crate::func::each_operand_mut(kind, f);
}

// =============================================================================
// Tests
// =============================================================================
