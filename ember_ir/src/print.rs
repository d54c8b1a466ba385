//! Textual dump of functions, for logs and test failure diagnostics.

use crate::func::{Function, InstKind, ValueId, ValueKind};
use std::fmt;

/// Render `%name` for named values, `%vN` otherwise.
fn val(func: &Function, v: ValueId) -> String {
    let data = func.value(v);
    match &data.kind {
        ValueKind::NullPtr => "null".to_string(),
        ValueKind::Undef => "undef".to_string(),
        ValueKind::ConstInt { bits } => format!("{}", bits),
        ValueKind::GlobalAddr { symbol } => format!("@{}", symbol),
        _ if !data.name.is_empty() => format!("%{}", data.name),
        _ => format!("%v{}", v.raw()),
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn @{}(", self.name)?;
        for (i, &a) in self.args().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", val(self, a), self.ty(a))?;
        }
        writeln!(f, ") -> {} {{", self.sig.ret)?;
        for &b in &self.layout {
            writeln!(f, "{}:", self.block(b).name)?;
            for &inst in &self.block(b).insts {
                write!(f, "  ")?;
                if !self.ty(inst).is_void() {
                    write!(f, "{} = ", val(self, inst))?;
                }
                self.fmt_inst(f, inst)?;
                writeln!(f)?;
            }
        }
        writeln!(f, "}}")
    }
}

impl Function {
    fn fmt_inst(&self, f: &mut fmt::Formatter<'_>, inst: ValueId) -> fmt::Result {
        let kind = self.inst(inst).expect("printable inst");
        match kind {
            InstKind::StackSlot { slot_ty } => write!(f, "stack_slot {}", slot_ty),
            InstKind::Load { ptr } => write!(f, "load {}", val(self, *ptr)),
            InstKind::Store { value, ptr } => {
                write!(f, "store {}, {}", val(self, *value), val(self, *ptr))
            }
            InstKind::FieldAddr { base, offset } => {
                write!(f, "field_addr {}, {}", val(self, *base), val(self, *offset))
            }
            InstKind::PtrCast { value } => {
                write!(f, "ptr_cast {} to {}", val(self, *value), self.ty(inst))
            }
            InstKind::IntToPtr { value, .. } => {
                write!(f, "int_to_ptr {} to {}", val(self, *value), self.ty(inst))
            }
            InstKind::Phi { incomings, is_base } => {
                write!(f, "phi{}", if *is_base { ".base" } else { "" })?;
                for (i, (b, v)) in incomings.iter().enumerate() {
                    write!(
                        f,
                        "{} [{}, {}]",
                        if i == 0 { " " } else { ", " },
                        self.block(*b).name,
                        val(self, *v)
                    )?;
                }
                Ok(())
            }
            InstKind::Select {
                cond,
                on_true,
                on_false,
                is_base,
            } => write!(
                f,
                "select{} {}, {}, {}",
                if *is_base { ".base" } else { "" },
                val(self, *cond),
                val(self, *on_true),
                val(self, *on_false)
            ),
            InstKind::BinOp { op, lhs, rhs } => {
                write!(f, "{:?} {}, {}", op, val(self, *lhs), val(self, *rhs))
            }
            InstKind::IntCmp { pred, lhs, rhs } => {
                write!(f, "icmp {:?} {}, {}", pred, val(self, *lhs), val(self, *rhs))
            }
            InstKind::CmpXchg {
                ptr,
                expected,
                replacement,
            } => write!(
                f,
                "cmpxchg {}, {}, {}",
                val(self, *ptr),
                val(self, *expected),
                val(self, *replacement)
            ),
            InstKind::AtomicXchg { ptr, value } => {
                write!(f, "atomic_xchg {}, {}", val(self, *ptr), val(self, *value))
            }
            InstKind::ExtractField { agg, field } => {
                write!(f, "extract_field {}, {}", val(self, *agg), field)
            }
            InstKind::Call { args, .. } => {
                write!(f, "call #{}(", kind_callee(kind))?;
                for (i, &a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", val(self, a))?;
                }
                write!(f, ")")
            }
            InstKind::Statepoint {
                operands,
                live_start,
                ..
            } => {
                write!(f, "statepoint #{} [", kind_callee(kind))?;
                for (i, &o) in operands.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    if i == *live_start as usize {
                        write!(f, "| ")?;
                    }
                    write!(f, "{}", val(self, o))?;
                }
                write!(f, "]")
            }
            InstKind::Relocate {
                token,
                base_index,
                derived_index,
                ..
            } => write!(
                f,
                "relocate {}, base {}, derived {}",
                val(self, *token),
                base_index,
                derived_index
            ),
            InstKind::StatepointResult { token } => {
                write!(f, "statepoint_result {}", val(self, *token))
            }
            InstKind::Br { dest } => write!(f, "br {}", self.block(*dest).name),
            InstKind::CondBr {
                cond,
                on_true,
                on_false,
            } => write!(
                f,
                "condbr {}, {}, {}",
                val(self, *cond),
                self.block(*on_true).name,
                self.block(*on_false).name
            ),
            InstKind::Ret { value } => match value {
                Some(v) => write!(f, "ret {}", val(self, *v)),
                None => write!(f, "ret"),
            },
            InstKind::Unreachable => write!(f, "unreachable"),
        }
    }
}

fn kind_callee(kind: &InstKind) -> u32 {
    match kind {
        InstKind::Call { callee, .. } => callee.raw(),
        InstKind::Statepoint { target, .. } => target.raw(),
        _ => 0,
    }
}
