//! Functions, blocks, values and instructions.
//!
//! The IR is a conventional block-structured SSA form: a function owns an
//! ordered list of basic blocks, each block owns an ordered instruction
//! sequence ending in exactly one terminator, and every instruction defines
//! at most one value. Instructions *are* values — a void-typed value for
//! instructions that define nothing — so a single `ValueId` names both the
//! instruction and its result. Non-instruction values (arguments and
//! constants) live in the same arena.
//!
//! The "kind of instruction" is a single tagged variant rather than a class
//! hierarchy; passes match on exactly the cases they understand and treat
//! everything else as an internal error.

use crate::entity::{Arena, DenseSet, Id};
use crate::types::Type;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

pub type FuncId = Id<Function>;
pub type BlockId = Id<BlockData>;
pub type ValueId = Id<ValueData>;

// =============================================================================
// Module
// =============================================================================

/// A compilation unit: a set of functions addressable by name.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub funcs: Arena<Function>,
    by_name: FxHashMap<String, FuncId>,
}

impl Module {
    pub fn new() -> Self {
        Module::default()
    }

    /// Add a function; its name must be unique within the module.
    pub fn add_function(&mut self, func: Function) -> FuncId {
        let name = func.name.clone();
        let id = self.funcs.alloc(func);
        let prior = self.by_name.insert(name, id);
        assert!(prior.is_none(), "duplicate function name");
        id
    }

    #[inline]
    pub fn get(&self, id: FuncId) -> &Function {
        &self.funcs[id]
    }

    #[inline]
    pub fn get_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.funcs[id]
    }

    pub fn lookup(&self, name: &str) -> Option<FuncId> {
        self.by_name.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FuncId, &Function)> {
        self.funcs.iter()
    }
}

// =============================================================================
// Signature & Attributes
// =============================================================================

/// Parameter and result types of a function.
#[derive(Debug, Clone, Default)]
pub struct Signature {
    pub params: Vec<Type>,
    pub ret: Type,
}

impl Signature {
    pub fn new(params: Vec<Type>, ret: Type) -> Self {
        Signature { params, ret }
    }
}

// =============================================================================
// Abstract interpreter state
// =============================================================================

/// Type tag for abstract-state slots, encoded into statepoint operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueTag {
    Int,
    Float,
    Object,
}

impl ValueTag {
    /// Wire encoding of the tag.
    #[inline]
    pub const fn encode(self) -> i64 {
        match self {
            ValueTag::Int => 0,
            ValueTag::Float => 1,
            ValueTag::Object => 2,
        }
    }
}

/// Language-level abstract state attached to a call site.
///
/// Describes the interpreter frame at the call: bytecode index, operand
/// stack, locals and held monitors. When present and enabled, the
/// statepoint encodes it so the runtime can reconstruct the frame.
#[derive(Debug, Clone, Default)]
pub struct DeoptState {
    pub caller_depth: i64,
    pub bci: i64,
    pub stack: Vec<(ValueTag, ValueId)>,
    pub locals: Vec<(ValueTag, ValueId)>,
    pub monitors: Vec<ValueId>,
}

// =============================================================================
// Instructions
// =============================================================================

/// Calling convention hint. `Cold` marks synthetic calls the backend should
/// keep out of the register allocator's way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallConv {
    #[default]
    Standard,
    Cold,
}

/// Integer binary operations (enough to express induction updates).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
}

/// Integer comparison predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpPred {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
}

/// Memory intrinsics that lower to runtime routines. These are the only
/// intrinsics that can themselves reach a safepoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemIntrinsic {
    Memset,
    Memcpy,
    Memmove,
}

/// Intrinsic identity of a callee. Declared on the *function*, not the call
/// site: intrinsic calls look like ordinary direct calls. All except the
/// `Mem` family are leaf operations that never transition to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intrinsic {
    Mem(MemIntrinsic),
    /// Count-leading-zeros style pure bit math.
    BitScan,
    /// Read a cycle counter.
    ReadCycles,
}

/// Instruction payloads. One value defined per instruction, `Void` where
/// there is no result.
#[derive(Debug, Clone)]
pub enum InstKind {
    /// A stack slot holding one `slot_ty` element; yields its address.
    StackSlot { slot_ty: Type },
    Load {
        ptr: ValueId,
    },
    Store {
        value: ValueId,
        ptr: ValueId,
    },
    /// Address of a field or element at a byte offset from `base`.
    /// The result pointer stays in `base`'s address space.
    FieldAddr {
        base: ValueId,
        offset: ValueId,
    },
    /// Pointer-to-pointer cast; the result type is the instruction's type.
    PtrCast {
        value: ValueId,
    },
    /// Integer reinterpreted as a pointer. `frontend_base` is set when the
    /// frontend guarantees the result is a base pointer.
    IntToPtr {
        value: ValueId,
        frontend_base: bool,
    },
    Phi {
        incomings: SmallVec<[(BlockId, ValueId); 2]>,
        /// Set on merges synthesized by base-pointer resolution.
        is_base: bool,
    },
    Select {
        cond: ValueId,
        on_true: ValueId,
        on_false: ValueId,
        is_base: bool,
    },
    BinOp {
        op: BinOp,
        lhs: ValueId,
        rhs: ValueId,
    },
    IntCmp {
        pred: CmpPred,
        lhs: ValueId,
        rhs: ValueId,
    },
    /// Atomic compare-and-swap; yields the loaded value.
    CmpXchg {
        ptr: ValueId,
        expected: ValueId,
        replacement: ValueId,
    },
    /// Atomic exchange; yields the previous value.
    AtomicXchg {
        ptr: ValueId,
        value: ValueId,
    },
    /// Extract a field from an opaque aggregate.
    ExtractField {
        agg: ValueId,
        field: u32,
    },
    Call {
        callee: FuncId,
        args: SmallVec<[ValueId; 4]>,
        conv: CallConv,
        deopt: Option<DeoptState>,
    },
    /// A call rewritten into collector-parsable form. `operands` follows the
    /// fixed wire layout; `live_start` is the offset of the first live GC
    /// value. Yields a token.
    Statepoint {
        target: FuncId,
        operands: Vec<ValueId>,
        live_start: u32,
        num_call_args: u32,
    },
    /// Projection of the post-safepoint value of one live pointer.
    /// Indices count from the first live GC operand of the statepoint.
    Relocate {
        token: ValueId,
        base_index: u32,
        derived_index: u32,
        conv: CallConv,
    },
    /// Projection of the original call's result out of a statepoint.
    StatepointResult {
        token: ValueId,
    },
    // Terminators.
    Br {
        dest: BlockId,
    },
    CondBr {
        cond: ValueId,
        on_true: BlockId,
        on_false: BlockId,
    },
    Ret {
        value: Option<ValueId>,
    },
    Unreachable,
}

impl InstKind {
    #[inline]
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Br { .. }
                | InstKind::CondBr { .. }
                | InstKind::Ret { .. }
                | InstKind::Unreachable
        )
    }

    #[inline]
    pub fn is_phi(&self) -> bool {
        matches!(self, InstKind::Phi { .. })
    }

    /// Statepoint, relocate or result projection.
    #[inline]
    pub fn is_safepoint_artifact(&self) -> bool {
        matches!(
            self,
            InstKind::Statepoint { .. }
                | InstKind::Relocate { .. }
                | InstKind::StatepointResult { .. }
        )
    }
}

// =============================================================================
// Values
// =============================================================================

/// What a value is: an argument, a constant, or an instruction result.
#[derive(Debug, Clone)]
pub enum ValueKind {
    Arg { index: u32 },
    /// Typed null pointer constant.
    NullPtr,
    /// Undefined value.
    Undef,
    ConstInt { bits: i64 },
    /// Address of a global symbol (permitted as a base only in test mode).
    GlobalAddr { symbol: String },
    Inst { block: BlockId, kind: InstKind },
    /// Tombstone for a removed instruction; touching one is a bug.
    Dead,
}

#[derive(Debug, Clone)]
pub struct ValueData {
    pub kind: ValueKind,
    pub ty: Type,
    /// Debug name; empty for unnamed values.
    pub name: String,
}

/// A basic block: a name and its instruction sequence.
#[derive(Debug, Clone, Default)]
pub struct BlockData {
    pub name: String,
    pub insts: Vec<ValueId>,
}

// =============================================================================
// Function
// =============================================================================

/// Interned constant keys, so repeated constants share one value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Null(Type),
    Undef(Type),
    Int(Type, i64),
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub sig: Signature,
    /// String attributes (`"gc-add-call-safepoints"` → `"true"`, ...).
    pub attrs: FxHashMap<String, String>,
    /// Set when this function is a well-known intrinsic.
    pub intrinsic: Option<Intrinsic>,
    pub values: Arena<ValueData>,
    pub blocks: Arena<BlockData>,
    /// Block order; `layout[0]` is the entry block. Blocks removed from the
    /// layout are dead.
    pub layout: Vec<BlockId>,
    args: Vec<ValueId>,
    consts: FxHashMap<ConstKey, ValueId>,
}

impl Function {
    /// Create a function with no body (a declaration until blocks are added).
    pub fn new(name: impl Into<String>, sig: Signature) -> Self {
        let mut f = Function {
            name: name.into(),
            sig,
            attrs: FxHashMap::default(),
            intrinsic: None,
            values: Arena::new(),
            blocks: Arena::new(),
            layout: Vec::new(),
            args: Vec::new(),
            consts: FxHashMap::default(),
        };
        for (i, &ty) in f.sig.params.clone().iter().enumerate() {
            let v = f.values.alloc(ValueData {
                kind: ValueKind::Arg { index: i as u32 },
                ty,
                name: String::new(),
            });
            f.args.push(v);
        }
        f
    }

    /// Declare an intrinsic function.
    pub fn new_intrinsic(name: impl Into<String>, sig: Signature, which: Intrinsic) -> Self {
        let mut f = Function::new(name, sig);
        f.intrinsic = Some(which);
        f
    }

    /// True when the function has no body.
    #[inline]
    pub fn is_declaration(&self) -> bool {
        self.layout.is_empty()
    }

    #[inline]
    pub fn entry(&self) -> BlockId {
        self.layout[0]
    }

    #[inline]
    pub fn arg(&self, index: usize) -> ValueId {
        self.args[index]
    }

    #[inline]
    pub fn args(&self) -> &[ValueId] {
        &self.args
    }

    /// Does the string attribute `name` hold the value `"true"`?
    pub fn attr_true(&self, name: &str) -> bool {
        self.attrs.get(name).map(String::as_str) == Some("true")
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attrs.insert(name.into(), value.into());
    }

    // -------------------------------------------------------------------------
    // Value access
    // -------------------------------------------------------------------------

    #[inline]
    pub fn value(&self, v: ValueId) -> &ValueData {
        &self.values[v]
    }

    #[inline]
    pub fn ty(&self, v: ValueId) -> Type {
        self.values[v].ty
    }

    /// Instruction payload of `v`, or None for non-instruction values.
    #[inline]
    pub fn inst(&self, v: ValueId) -> Option<&InstKind> {
        match &self.values[v].kind {
            ValueKind::Inst { kind, .. } => Some(kind),
            _ => None,
        }
    }

    #[inline]
    pub fn inst_mut(&mut self, v: ValueId) -> Option<&mut InstKind> {
        match &mut self.values[v].kind {
            ValueKind::Inst { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// Block containing instruction `v`.
    #[inline]
    pub fn inst_block(&self, v: ValueId) -> Option<BlockId> {
        match self.values[v].kind {
            ValueKind::Inst { block, .. } => Some(block),
            _ => None,
        }
    }

    #[inline]
    pub fn is_inst(&self, v: ValueId) -> bool {
        matches!(self.values[v].kind, ValueKind::Inst { .. })
    }

    #[inline]
    pub fn is_null(&self, v: ValueId) -> bool {
        matches!(self.values[v].kind, ValueKind::NullPtr)
    }

    #[inline]
    pub fn is_undef(&self, v: ValueId) -> bool {
        matches!(self.values[v].kind, ValueKind::Undef)
    }

    pub fn set_name(&mut self, v: ValueId, name: impl Into<String>) {
        self.values[v].name = name.into();
    }

    // -------------------------------------------------------------------------
    // Constants
    // -------------------------------------------------------------------------

    pub fn make_null(&mut self, ty: Type) -> ValueId {
        debug_assert!(ty.is_ptr());
        self.intern(ConstKey::Null(ty), ValueKind::NullPtr, ty)
    }

    pub fn make_undef(&mut self, ty: Type) -> ValueId {
        self.intern(ConstKey::Undef(ty), ValueKind::Undef, ty)
    }

    pub fn make_int(&mut self, ty: Type, bits: i64) -> ValueId {
        debug_assert!(ty.is_int());
        self.intern(ConstKey::Int(ty, bits), ValueKind::ConstInt { bits }, ty)
    }

    pub fn make_global(&mut self, symbol: impl Into<String>, ty: Type) -> ValueId {
        self.values.alloc(ValueData {
            kind: ValueKind::GlobalAddr {
                symbol: symbol.into(),
            },
            ty,
            name: String::new(),
        })
    }

    fn intern(&mut self, key: ConstKey, kind: ValueKind, ty: Type) -> ValueId {
        if let Some(&v) = self.consts.get(&key) {
            return v;
        }
        let v = self.values.alloc(ValueData {
            kind,
            ty,
            name: String::new(),
        });
        self.consts.insert(key, v);
        v
    }

    // -------------------------------------------------------------------------
    // Blocks
    // -------------------------------------------------------------------------

    pub fn new_block(&mut self, name: impl Into<String>) -> BlockId {
        let b = self.blocks.alloc(BlockData {
            name: name.into(),
            insts: Vec::new(),
        });
        self.layout.push(b);
        b
    }

    #[inline]
    pub fn block(&self, b: BlockId) -> &BlockData {
        &self.blocks[b]
    }

    #[inline]
    pub fn block_mut(&mut self, b: BlockId) -> &mut BlockData {
        &mut self.blocks[b]
    }

    /// The terminator of a block (last instruction).
    pub fn terminator(&self, b: BlockId) -> ValueId {
        *self.blocks[b]
            .insts
            .last()
            .expect("block has no terminator")
    }

    /// Successor blocks in terminator order.
    pub fn successors(&self, b: BlockId) -> SmallVec<[BlockId; 2]> {
        let mut out = SmallVec::new();
        if let Some(&term) = self.blocks[b].insts.last() {
            match self.inst(term) {
                Some(InstKind::Br { dest }) => out.push(*dest),
                Some(InstKind::CondBr {
                    on_true, on_false, ..
                }) => {
                    out.push(*on_true);
                    if on_false != on_true {
                        out.push(*on_false);
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// Predecessor blocks, in layout order.
    pub fn predecessors(&self, b: BlockId) -> Vec<BlockId> {
        self.layout
            .iter()
            .copied()
            .filter(|&p| self.successors(p).contains(&b))
            .collect()
    }

    /// The unique successor of `b`, if it has exactly one.
    pub fn unique_successor(&self, b: BlockId) -> Option<BlockId> {
        let succs = self.successors(b);
        match succs.as_slice() {
            [one] => Some(*one),
            _ => None,
        }
    }

    /// The unique predecessor of `b`, if it has exactly one.
    pub fn unique_predecessor(&self, b: BlockId) -> Option<BlockId> {
        let mut found = None;
        for &p in &self.layout {
            if self.successors(p).contains(&b) {
                if found.is_some() {
                    return None;
                }
                found = Some(p);
            }
        }
        found
    }

    /// Position of instruction `v` within its block.
    pub fn pos_in_block(&self, v: ValueId) -> Option<usize> {
        let b = self.inst_block(v)?;
        self.blocks[b].insts.iter().position(|&i| i == v)
    }

    // -------------------------------------------------------------------------
    // Instruction construction & placement
    // -------------------------------------------------------------------------

    fn new_inst_value(&mut self, block: BlockId, kind: InstKind, ty: Type) -> ValueId {
        self.values.alloc(ValueData {
            kind: ValueKind::Inst { block, kind },
            ty,
            name: String::new(),
        })
    }

    /// Append an instruction to a block.
    pub fn append_inst(&mut self, block: BlockId, kind: InstKind, ty: Type) -> ValueId {
        let v = self.new_inst_value(block, kind, ty);
        self.blocks[block].insts.push(v);
        v
    }

    /// Insert a new instruction immediately before `before`.
    pub fn insert_before(&mut self, before: ValueId, kind: InstKind, ty: Type) -> ValueId {
        let block = self.inst_block(before).expect("insert point not an inst");
        let pos = self.pos_in_block(before).expect("inst detached");
        let v = self.new_inst_value(block, kind, ty);
        self.blocks[block].insts.insert(pos, v);
        v
    }

    /// Insert a new instruction immediately after `after`.
    pub fn insert_after(&mut self, after: ValueId, kind: InstKind, ty: Type) -> ValueId {
        let block = self.inst_block(after).expect("insert point not an inst");
        let pos = self.pos_in_block(after).expect("inst detached");
        let v = self.new_inst_value(block, kind, ty);
        self.blocks[block].insts.insert(pos + 1, v);
        v
    }

    /// Insert at the front of a block (after any leading phis).
    pub fn insert_at_block_start(&mut self, block: BlockId, kind: InstKind, ty: Type) -> ValueId {
        let pos = self.blocks[block]
            .insts
            .iter()
            .position(|&i| !self.inst(i).map_or(false, InstKind::is_phi))
            .unwrap_or(self.blocks[block].insts.len());
        let v = self.new_inst_value(block, kind, ty);
        self.blocks[block].insts.insert(pos, v);
        v
    }

    /// Detach an instruction from its block and tombstone its value.
    pub fn remove_inst(&mut self, v: ValueId) {
        let block = self.inst_block(v).expect("not an instruction");
        self.blocks[block].insts.retain(|&i| i != v);
        self.values[v].kind = ValueKind::Dead;
    }

    // -------------------------------------------------------------------------
    // Operands & uses
    // -------------------------------------------------------------------------

    /// Collect the value operands of instruction `v`.
    pub fn operands(&self, v: ValueId) -> SmallVec<[ValueId; 4]> {
        let mut out = SmallVec::new();
        if let Some(kind) = self.inst(v) {
            each_operand(kind, |op| out.push(op));
        }
        out
    }

    /// Rewrite every operand of instruction `v` through `f`.
    pub fn map_operands(&mut self, v: ValueId, mut f: impl FnMut(ValueId) -> ValueId) {
        if let ValueKind::Inst { kind, .. } = &mut self.values[v].kind {
            each_operand_mut(kind, |op| *op = f(*op));
        }
    }

    /// All instructions that use `v` as an operand. Built by scanning; the
    /// IR does not maintain incremental use lists.
    pub fn users(&self, v: ValueId) -> Vec<ValueId> {
        let mut out = Vec::new();
        for &b in &self.layout {
            for &i in &self.blocks[b].insts {
                if self.operands(i).contains(&v) {
                    out.push(i);
                }
            }
        }
        out
    }

    /// Replace every use of `old` with `new` across the function.
    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) {
        for b in self.layout.clone() {
            for i in self.blocks[b].insts.clone() {
                self.map_operands(i, |op| if op == old { new } else { op });
            }
        }
    }

    /// Count instructions of a given predicate across the function.
    pub fn count_insts(&self, mut pred: impl FnMut(&InstKind) -> bool) -> usize {
        let mut n = 0;
        for &b in &self.layout {
            for &i in &self.blocks[b].insts {
                if self.inst(i).map_or(false, |k| pred(k)) {
                    n += 1;
                }
            }
        }
        n
    }

    // -------------------------------------------------------------------------
    // CFG cleanup
    // -------------------------------------------------------------------------

    /// Drop blocks unreachable from the entry, pruning phi edges that came
    /// from them. Returns true if anything changed. Dominance and
    /// reachability queries are nonsense until this has run.
    pub fn remove_unreachable_blocks(&mut self) -> bool {
        if self.layout.is_empty() {
            return false;
        }
        let mut reachable = DenseSet::with_capacity(self.blocks.len());
        let mut stack = vec![self.entry()];
        reachable.insert(self.entry().index());
        while let Some(b) = stack.pop() {
            for s in self.successors(b) {
                if reachable.insert(s.index()) {
                    stack.push(s);
                }
            }
        }

        let dead: Vec<BlockId> = self
            .layout
            .iter()
            .copied()
            .filter(|b| !reachable.contains(b.index()))
            .collect();
        if dead.is_empty() {
            return false;
        }

        for &b in &dead {
            for v in self.blocks[b].insts.clone() {
                self.values[v].kind = ValueKind::Dead;
            }
            self.blocks[b].insts.clear();
        }
        self.layout.retain(|b| reachable.contains(b.index()));

        // Phi edges from removed blocks are gone with their predecessor.
        for b in self.layout.clone() {
            for i in self.blocks[b].insts.clone() {
                if let Some(InstKind::Phi { incomings, .. }) = self.inst_mut(i) {
                    incomings.retain(|(pred, _)| reachable.contains(pred.index()));
                }
            }
        }
        true
    }
}

// =============================================================================
// Operand walking
// =============================================================================

pub(crate) fn each_operand(kind: &InstKind, mut f: impl FnMut(ValueId)) {
    match kind {
        InstKind::StackSlot { .. } | InstKind::Unreachable | InstKind::Br { .. } => {}
        InstKind::Load { ptr } => f(*ptr),
        InstKind::Store { value, ptr } => {
            f(*value);
            f(*ptr);
        }
        InstKind::FieldAddr { base, offset } => {
            f(*base);
            f(*offset);
        }
        InstKind::PtrCast { value } | InstKind::IntToPtr { value, .. } => f(*value),
        InstKind::Phi { incomings, .. } => {
            for &(_, v) in incomings {
                f(v);
            }
        }
        InstKind::Select {
            cond,
            on_true,
            on_false,
            ..
        } => {
            f(*cond);
            f(*on_true);
            f(*on_false);
        }
        InstKind::BinOp { lhs, rhs, .. } | InstKind::IntCmp { lhs, rhs, .. } => {
            f(*lhs);
            f(*rhs);
        }
        InstKind::CmpXchg {
            ptr,
            expected,
            replacement,
        } => {
            f(*ptr);
            f(*expected);
            f(*replacement);
        }
        InstKind::AtomicXchg { ptr, value } => {
            f(*ptr);
            f(*value);
        }
        InstKind::ExtractField { agg, .. } => f(*agg),
        InstKind::Call { args, deopt, .. } => {
            for &a in args {
                f(a);
            }
            if let Some(state) = deopt {
                for &(_, v) in &state.stack {
                    f(v);
                }
                for &(_, v) in &state.locals {
                    f(v);
                }
                for &m in &state.monitors {
                    f(m);
                }
            }
        }
        InstKind::Statepoint { operands, .. } => {
            for &o in operands {
                f(o);
            }
        }
        InstKind::Relocate { token, .. } | InstKind::StatepointResult { token } => f(*token),
        InstKind::CondBr { cond, .. } => f(*cond),
        InstKind::Ret { value } => {
            if let Some(v) = value {
                f(*v);
            }
        }
    }
}

pub(crate) fn each_operand_mut(kind: &mut InstKind, mut f: impl FnMut(&mut ValueId)) {
    match kind {
        InstKind::StackSlot { .. } | InstKind::Unreachable | InstKind::Br { .. } => {}
        InstKind::Load { ptr } => f(ptr),
        InstKind::Store { value, ptr } => {
            f(value);
            f(ptr);
        }
        InstKind::FieldAddr { base, offset } => {
            f(base);
            f(offset);
        }
        InstKind::PtrCast { value } | InstKind::IntToPtr { value, .. } => f(value),
        InstKind::Phi { incomings, .. } => {
            for (_, v) in incomings.iter_mut() {
                f(v);
            }
        }
        InstKind::Select {
            cond,
            on_true,
            on_false,
            ..
        } => {
            f(cond);
            f(on_true);
            f(on_false);
        }
        InstKind::BinOp { lhs, rhs, .. } | InstKind::IntCmp { lhs, rhs, .. } => {
            f(lhs);
            f(rhs);
        }
        InstKind::CmpXchg {
            ptr,
            expected,
            replacement,
        } => {
            f(ptr);
            f(expected);
            f(replacement);
        }
        InstKind::AtomicXchg { ptr, value } => {
            f(ptr);
            f(value);
        }
        InstKind::ExtractField { agg, .. } => f(agg),
        InstKind::Call { args, deopt, .. } => {
            for a in args.iter_mut() {
                f(a);
            }
            if let Some(state) = deopt {
                for (_, v) in state.stack.iter_mut() {
                    f(v);
                }
                for (_, v) in state.locals.iter_mut() {
                    f(v);
                }
                for m in state.monitors.iter_mut() {
                    f(m);
                }
            }
        }
        InstKind::Statepoint { operands, .. } => {
            for o in operands.iter_mut() {
                f(o);
            }
        }
        InstKind::Relocate { token, .. } | InstKind::StatepointResult { token } => f(token),
        InstKind::CondBr { cond, .. } => f(cond),
        InstKind::Ret { value } => {
            if let Some(v) = value {
                f(v);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
