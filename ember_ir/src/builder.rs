//! Instruction builder.
//!
//! Thin convenience layer for frontends and tests: tracks a current block
//! and offers one method per operation. The builder owns the function until
//! `finish()`.

use crate::func::{
    BinOp, BlockId, CallConv, CmpPred, DeoptState, FuncId, Function, InstKind, Signature, ValueId,
};
use crate::types::Type;
use smallvec::SmallVec;

pub struct FunctionBuilder {
    func: Function,
    cur: BlockId,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, sig: Signature) -> Self {
        FunctionBuilder {
            func: Function::new(name, sig),
            cur: BlockId::INVALID,
        }
    }

    /// Wrap an existing function to keep appending to it.
    pub fn reopen(func: Function) -> Self {
        FunctionBuilder {
            func,
            cur: BlockId::INVALID,
        }
    }

    pub fn finish(self) -> Function {
        self.func
    }

    #[inline]
    pub fn func(&self) -> &Function {
        &self.func
    }

    #[inline]
    pub fn func_mut(&mut self) -> &mut Function {
        &mut self.func
    }

    // -------------------------------------------------------------------------
    // Blocks
    // -------------------------------------------------------------------------

    pub fn create_block(&mut self, name: impl Into<String>) -> BlockId {
        self.func.new_block(name)
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.cur = block;
    }

    #[inline]
    pub fn current(&self) -> BlockId {
        self.cur
    }

    // -------------------------------------------------------------------------
    // Values
    // -------------------------------------------------------------------------

    #[inline]
    pub fn arg(&self, index: usize) -> ValueId {
        self.func.arg(index)
    }

    pub fn iconst(&mut self, ty: Type, bits: i64) -> ValueId {
        self.func.make_int(ty, bits)
    }

    pub fn null(&mut self, ty: Type) -> ValueId {
        self.func.make_null(ty)
    }

    pub fn undef(&mut self, ty: Type) -> ValueId {
        self.func.make_undef(ty)
    }

    pub fn global(&mut self, symbol: impl Into<String>, ty: Type) -> ValueId {
        self.func.make_global(symbol, ty)
    }

    /// Attach a debug name to a value, returning it for chaining.
    pub fn named(&mut self, v: ValueId, name: impl Into<String>) -> ValueId {
        self.func.set_name(v, name);
        v
    }

    fn push(&mut self, kind: InstKind, ty: Type) -> ValueId {
        assert!(self.cur.is_valid(), "no current block");
        self.func.append_inst(self.cur, kind, ty)
    }

    // -------------------------------------------------------------------------
    // Memory
    // -------------------------------------------------------------------------

    pub fn stack_slot(&mut self, slot_ty: Type) -> ValueId {
        self.push(InstKind::StackSlot { slot_ty }, Type::raw_ptr())
    }

    pub fn load(&mut self, ptr: ValueId, ty: Type) -> ValueId {
        self.push(InstKind::Load { ptr }, ty)
    }

    pub fn store(&mut self, value: ValueId, ptr: ValueId) -> ValueId {
        self.push(InstKind::Store { value, ptr }, Type::Void)
    }

    // -------------------------------------------------------------------------
    // Addressing & casts
    // -------------------------------------------------------------------------

    /// Address of `base + offset`; stays in `base`'s address space.
    pub fn field_addr(&mut self, base: ValueId, offset: ValueId) -> ValueId {
        let ty = self.func.ty(base);
        debug_assert!(ty.is_ptr());
        self.push(InstKind::FieldAddr { base, offset }, ty)
    }

    /// `field_addr` with a constant byte offset.
    pub fn field_addr_imm(&mut self, base: ValueId, offset: i64) -> ValueId {
        let off = self.iconst(Type::I64, offset);
        self.field_addr(base, off)
    }

    pub fn ptr_cast(&mut self, value: ValueId, to: Type) -> ValueId {
        debug_assert!(to.is_ptr() && self.func.ty(value).is_ptr());
        self.push(InstKind::PtrCast { value }, to)
    }

    pub fn int_to_ptr(&mut self, value: ValueId, to: Type, frontend_base: bool) -> ValueId {
        self.push(
            InstKind::IntToPtr {
                value,
                frontend_base,
            },
            to,
        )
    }

    // -------------------------------------------------------------------------
    // Merges & scalar ops
    // -------------------------------------------------------------------------

    pub fn phi(&mut self, ty: Type, incomings: &[(BlockId, ValueId)]) -> ValueId {
        self.push(
            InstKind::Phi {
                incomings: SmallVec::from_slice(incomings),
                is_base: false,
            },
            ty,
        )
    }

    pub fn select(&mut self, cond: ValueId, on_true: ValueId, on_false: ValueId) -> ValueId {
        let ty = self.func.ty(on_true);
        self.push(
            InstKind::Select {
                cond,
                on_true,
                on_false,
                is_base: false,
            },
            ty,
        )
    }

    pub fn binop(&mut self, op: BinOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        let ty = self.func.ty(lhs);
        self.push(InstKind::BinOp { op, lhs, rhs }, ty)
    }

    pub fn icmp(&mut self, pred: CmpPred, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.push(InstKind::IntCmp { pred, lhs, rhs }, Type::I1)
    }

    pub fn extract_field(&mut self, agg: ValueId, field: u32, ty: Type) -> ValueId {
        self.push(InstKind::ExtractField { agg, field }, ty)
    }

    pub fn cmpxchg(
        &mut self,
        ptr: ValueId,
        expected: ValueId,
        replacement: ValueId,
        ty: Type,
    ) -> ValueId {
        self.push(
            InstKind::CmpXchg {
                ptr,
                expected,
                replacement,
            },
            ty,
        )
    }

    pub fn atomic_xchg(&mut self, ptr: ValueId, value: ValueId, ty: Type) -> ValueId {
        self.push(InstKind::AtomicXchg { ptr, value }, ty)
    }

    // -------------------------------------------------------------------------
    // Calls
    // -------------------------------------------------------------------------

    pub fn call(&mut self, callee: FuncId, args: &[ValueId], ret: Type) -> ValueId {
        self.push(
            InstKind::Call {
                callee,
                args: SmallVec::from_slice(args),
                conv: CallConv::Standard,
                deopt: None,
            },
            ret,
        )
    }

    pub fn call_with_state(
        &mut self,
        callee: FuncId,
        args: &[ValueId],
        ret: Type,
        deopt: DeoptState,
    ) -> ValueId {
        self.push(
            InstKind::Call {
                callee,
                args: SmallVec::from_slice(args),
                conv: CallConv::Standard,
                deopt: Some(deopt),
            },
            ret,
        )
    }

    // -------------------------------------------------------------------------
    // Terminators
    // -------------------------------------------------------------------------

    pub fn br(&mut self, dest: BlockId) -> ValueId {
        self.push(InstKind::Br { dest }, Type::Void)
    }

    pub fn cond_br(&mut self, cond: ValueId, on_true: BlockId, on_false: BlockId) -> ValueId {
        self.push(
            InstKind::CondBr {
                cond,
                on_true,
                on_false,
            },
            Type::Void,
        )
    }

    pub fn ret(&mut self, value: ValueId) -> ValueId {
        self.push(InstKind::Ret { value: Some(value) }, Type::Void)
    }

    pub fn ret_void(&mut self) -> ValueId {
        self.push(InstKind::Ret { value: None }, Type::Void)
    }

    pub fn unreachable(&mut self) -> ValueId {
        self.push(InstKind::Unreachable, Type::Void)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builds_straight_line() {
        let mut b = FunctionBuilder::new(
            "f",
            Signature::new(vec![Type::gc_ptr(), Type::I64], Type::I64),
        );
        let entry = b.create_block("entry");
        b.switch_to(entry);
        let p = b.arg(0);
        let off = b.field_addr_imm(p, 8);
        let x = b.load(off, Type::I64);
        let y = b.binop(BinOp::Add, x, b.arg(1));
        b.ret(y);
        let f = b.finish();

        assert_eq!(f.block(entry).insts.len(), 4);
        assert!(f.ty(off).is_gc_ptr());
    }

    #[test]
    fn test_phi_wiring() {
        let mut b = FunctionBuilder::new("g", Signature::new(vec![Type::I1], Type::I64));
        let entry = b.create_block("entry");
        let t = b.create_block("t");
        let e = b.create_block("e");
        let join = b.create_block("join");

        b.switch_to(entry);
        b.cond_br(b.arg(0), t, e);
        b.switch_to(t);
        let one = b.iconst(Type::I64, 1);
        b.br(join);
        b.switch_to(e);
        let two = b.iconst(Type::I64, 2);
        b.br(join);
        b.switch_to(join);
        let m = b.phi(Type::I64, &[(t, one), (e, two)]);
        b.ret(m);

        let f = b.finish();
        assert_eq!(f.predecessors(join).len(), 2);
        assert!(f.inst(m).unwrap().is_phi());
    }
}
