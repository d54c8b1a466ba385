//! Typed SSA intermediate representation for the ember compiler.
//!
//! A small block-structured IR with the pieces a mid-end transformation
//! needs as given services:
//!
//! - arena-backed functions, blocks and values ([`func`], [`entity`])
//! - a type system with address-space-tagged pointers ([`types`]);
//!   GC-managed pointers live in address space 1
//! - CFG, dominator tree and dominance frontier ([`cfg`])
//! - natural loops and trip counts ([`loops`])
//! - direct-call inlining ([`inline`])
//! - stack-slot promotion to SSA ([`mem2reg`])
//! - structural verification ([`verify`]) and printing ([`print`])

pub mod builder;
pub mod cfg;
pub mod entity;
pub mod func;
pub mod inline;
pub mod loops;
pub mod mem2reg;
pub mod print;
pub mod types;
pub mod verify;

pub use builder::FunctionBuilder;
pub use cfg::{Cfg, DominatorTree};
pub use entity::{Arena, DenseSet, Id, SecondaryMap};
pub use func::{
    BinOp, BlockData, BlockId, CallConv, CmpPred, DeoptState, FuncId, Function, InstKind,
    Intrinsic, MemIntrinsic, Module, Signature, ValueData, ValueId, ValueKind, ValueTag,
};
pub use inline::{inline_call, InlineError, InlineInfo, InlineResult};
pub use loops::{trip_count, Loop, LoopAnalysis, TripCount};
pub use mem2reg::promote_slots;
pub use types::{AddrSpace, Elem, Type};
pub use verify::verify_function;
