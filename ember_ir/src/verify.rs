//! Structural IR verification.
//!
//! Run around pass boundaries to catch malformed IR early: every block
//! terminated exactly once, phis grouped at the head with one incoming per
//! predecessor, every operand's definition dominating its use, and the
//! statepoint machinery internally consistent. Violations report a message
//! naming the offending value.

use crate::cfg::{Cfg, DominatorTree};
use crate::func::{Function, InstKind, ValueId, ValueKind};
use crate::types::Type;

/// Verify one function. Declarations trivially pass.
pub fn verify_function(func: &Function) -> Result<(), String> {
    if func.is_declaration() {
        return Ok(());
    }

    for &b in &func.layout {
        let insts = &func.block(b).insts;
        if insts.is_empty() {
            return Err(format!("block {} is empty", func.block(b).name));
        }
        let mut seen_non_phi = false;
        for (i, &inst) in insts.iter().enumerate() {
            let kind = match func.inst(inst) {
                Some(k) => k,
                None => {
                    return Err(format!(
                        "block {} lists non-instruction {:?}",
                        func.block(b).name,
                        inst
                    ))
                }
            };
            if func.inst_block(inst) != Some(b) {
                return Err(format!("instruction {:?} has stale block link", inst));
            }
            let is_last = i + 1 == insts.len();
            if kind.is_terminator() != is_last {
                return Err(format!(
                    "block {}: terminator in the wrong position at {:?}",
                    func.block(b).name,
                    inst
                ));
            }
            if kind.is_phi() {
                if seen_non_phi {
                    return Err(format!(
                        "block {}: phi {:?} after non-phi instruction",
                        func.block(b).name,
                        inst
                    ));
                }
            } else {
                seen_non_phi = true;
            }
        }
    }

    let cfg = Cfg::build(func);
    let dom = DominatorTree::build(&cfg);

    for &b in &func.layout {
        for &inst in &func.block(b).insts {
            verify_inst(func, &cfg, &dom, b, inst)?;
        }
    }
    Ok(())
}

fn verify_inst(
    func: &Function,
    cfg: &Cfg,
    dom: &DominatorTree,
    block: crate::func::BlockId,
    inst: ValueId,
) -> Result<(), String> {
    let kind = func.inst(inst).expect("checked");

    // Phi edges must match predecessors exactly; operands are checked at
    // the incoming terminator rather than the phi itself.
    if let InstKind::Phi { incomings, .. } = kind {
        let mut preds = cfg.preds(block).to_vec();
        preds.sort();
        let mut incoming_blocks: Vec<_> = incomings.iter().map(|&(p, _)| p).collect();
        incoming_blocks.sort();
        if preds != incoming_blocks {
            return Err(format!(
                "phi {:?} incoming blocks do not match predecessors",
                inst
            ));
        }
        for &(pred, v) in incomings {
            if func.is_inst(v) && !dom.value_dominates_inst(func, v, func.terminator(pred)) {
                return Err(format!(
                    "phi {:?} operand {:?} does not dominate edge from {}",
                    inst,
                    v,
                    func.block(pred).name
                ));
            }
            if matches!(func.value(v).kind, ValueKind::Dead) {
                return Err(format!("phi {:?} references dead value {:?}", inst, v));
            }
        }
        return Ok(());
    }

    for op in func.operands(inst) {
        if matches!(func.value(op).kind, ValueKind::Dead) {
            return Err(format!("{:?} references dead value {:?}", inst, op));
        }
        if func.is_inst(op) && !dom.value_dominates_inst(func, op, inst) {
            return Err(format!("{:?} uses {:?} before its definition", inst, op));
        }
    }

    match kind {
        InstKind::Br { dest } => {
            if !func.layout.contains(dest) {
                return Err(format!("branch {:?} targets removed block", inst));
            }
        }
        InstKind::CondBr {
            cond,
            on_true,
            on_false,
        } => {
            if func.ty(*cond) != Type::I1 {
                return Err(format!("condbr {:?} condition is not i1", inst));
            }
            if !func.layout.contains(on_true) || !func.layout.contains(on_false) {
                return Err(format!("condbr {:?} targets removed block", inst));
            }
        }
        InstKind::Store { ptr, .. } | InstKind::Load { ptr } => {
            if !func.ty(*ptr).is_ptr() {
                return Err(format!("memory op {:?} address is not a pointer", inst));
            }
        }
        InstKind::Statepoint {
            operands,
            live_start,
            ..
        } => {
            if *live_start as usize > operands.len() {
                return Err(format!("statepoint {:?} live region out of range", inst));
            }
            if func.ty(inst) != Type::Token {
                return Err(format!("statepoint {:?} must yield a token", inst));
            }
            for &live in &operands[*live_start as usize..] {
                if !func.ty(live).is_gc_ptr() {
                    return Err(format!(
                        "statepoint {:?} live operand {:?} is not a gc pointer",
                        inst, live
                    ));
                }
            }
        }
        InstKind::Relocate {
            token,
            base_index,
            derived_index,
            ..
        } => {
            let (operands, live_start) = match func.inst(*token) {
                Some(InstKind::Statepoint {
                    operands,
                    live_start,
                    ..
                }) => (operands, *live_start as usize),
                _ => return Err(format!("relocate {:?} token is not a statepoint", inst)),
            };
            let live_len = operands.len().saturating_sub(live_start);
            if *base_index as usize >= live_len || *derived_index as usize >= live_len {
                return Err(format!("relocate {:?} index out of live range", inst));
            }
            if !func.ty(inst).is_gc_ptr() {
                return Err(format!("relocate {:?} must yield a gc pointer", inst));
            }
        }
        InstKind::StatepointResult { token } => {
            if !matches!(func.inst(*token), Some(InstKind::Statepoint { .. })) {
                return Err(format!("result projection {:?} token is not a statepoint", inst));
            }
        }
        _ => {}
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FunctionBuilder;
    use crate::func::{BinOp, Signature};
    use crate::types::Type;

    #[test]
    fn test_accepts_well_formed() {
        let mut b = FunctionBuilder::new("ok", Signature::new(vec![Type::I64], Type::I64));
        let entry = b.create_block("entry");
        b.switch_to(entry);
        let one = b.iconst(Type::I64, 1);
        let s = b.binop(BinOp::Add, b.arg(0), one);
        b.ret(s);
        assert!(verify_function(&b.finish()).is_ok());
    }

    #[test]
    fn test_rejects_missing_terminator() {
        let mut b = FunctionBuilder::new("bad", Signature::new(vec![], Type::Void));
        let entry = b.create_block("entry");
        b.switch_to(entry);
        b.iconst(Type::I64, 1);
        let mut f = b.finish();
        let c = f.make_int(Type::I64, 2);
        let entry_id = entry;
        f.append_inst(
            entry_id,
            crate::func::InstKind::BinOp {
                op: BinOp::Add,
                lhs: c,
                rhs: c,
            },
            Type::I64,
        );
        assert!(verify_function(&f).is_err());
    }

    #[test]
    fn test_rejects_use_before_def() {
        let mut b = FunctionBuilder::new("udef", Signature::new(vec![], Type::Void));
        let entry = b.create_block("entry");
        b.switch_to(entry);
        let one = b.iconst(Type::I64, 1);
        let x = b.binop(BinOp::Add, one, one);
        let y = b.binop(BinOp::Add, x, one);
        b.ret_void();
        let mut f = b.finish();
        // Swap x and y so y reads a later definition.
        let insts = &mut f.block_mut(entry).insts;
        insts.swap(0, 1);
        let _ = y;
        assert!(verify_function(&f).is_err());
    }

    #[test]
    fn test_rejects_phi_edge_mismatch() {
        let mut b = FunctionBuilder::new("phi", Signature::new(vec![Type::I1], Type::Void));
        let entry = b.create_block("entry");
        let t = b.create_block("t");
        let join = b.create_block("join");
        b.switch_to(entry);
        b.cond_br(b.arg(0), t, join);
        b.switch_to(t);
        b.br(join);
        b.switch_to(join);
        let one = b.iconst(Type::I64, 1);
        // Phi claims only one incoming edge; join has two predecessors.
        let p = b.phi(Type::I64, &[(t, one)]);
        let _ = p;
        b.ret_void();
        assert!(verify_function(&b.finish()).is_err());
    }
}
