//! Natural loop detection and trip-count analysis.
//!
//! A natural loop is found from a back edge: an edge whose target dominates
//! its source. The target is the loop header, and the body is everything
//! that can reach the back edge source without passing the header.
//!
//! Trip counts matter to safepoint placement: a loop proven to run a finite
//! number of iterations cannot starve the collector, so its back edge needs
//! no poll. The analysis is deliberately conservative — `Unknown` is always
//! a safe answer.

use crate::cfg::{Cfg, DominatorTree};
use crate::entity::DenseSet;
use crate::func::{BinOp, BlockId, CmpPred, Function, InstKind, ValueId, ValueKind};
use rustc_hash::FxHashMap;

// =============================================================================
// Loop
// =============================================================================

#[derive(Debug, Clone)]
pub struct Loop {
    pub header: BlockId,
    /// Sources of back edges into the header.
    pub back_edges: Vec<BlockId>,
    pub body: Vec<BlockId>,
}

impl Loop {
    #[inline]
    pub fn contains(&self, b: BlockId) -> bool {
        self.body.contains(&b)
    }

    /// The single in-loop predecessor of the header, if there is one.
    pub fn latch(&self) -> Option<BlockId> {
        match self.back_edges.as_slice() {
            [one] => Some(*one),
            _ => None,
        }
    }
}

// =============================================================================
// Loop Analysis
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct LoopAnalysis {
    pub loops: Vec<Loop>,
    header_index: FxHashMap<BlockId, usize>,
}

impl LoopAnalysis {
    pub fn compute(cfg: &Cfg, dom: &DominatorTree) -> LoopAnalysis {
        let mut analysis = LoopAnalysis::default();
        for &b in &cfg.rpo {
            for &s in cfg.succs(b) {
                if dom.dominates(s, b) {
                    analysis.record_back_edge(s, b, cfg);
                }
            }
        }
        analysis
    }

    fn record_back_edge(&mut self, header: BlockId, source: BlockId, cfg: &Cfg) {
        if let Some(&idx) = self.header_index.get(&header) {
            let lp = &mut self.loops[idx];
            if !lp.back_edges.contains(&source) {
                lp.back_edges.push(source);
            }
            // Extend the body with blocks reaching this new back edge.
            let extra = body_from_back_edge(header, source, cfg);
            for b in extra {
                if !lp.body.contains(&b) {
                    lp.body.push(b);
                }
            }
            return;
        }
        let body = body_from_back_edge(header, source, cfg);
        self.header_index.insert(header, self.loops.len());
        self.loops.push(Loop {
            header,
            back_edges: vec![source],
            body,
        });
    }

    pub fn loop_with_header(&self, header: BlockId) -> Option<&Loop> {
        self.header_index.get(&header).map(|&i| &self.loops[i])
    }
}

/// Backward walk from the back-edge source, stopping at the header.
fn body_from_back_edge(header: BlockId, source: BlockId, cfg: &Cfg) -> Vec<BlockId> {
    let mut seen = DenseSet::new();
    seen.insert(header.index());
    let mut body = vec![header];
    let mut work = vec![source];
    while let Some(b) = work.pop() {
        if seen.insert(b.index()) {
            body.push(b);
            for &p in cfg.preds(b) {
                work.push(p);
            }
        }
    }
    body
}

// =============================================================================
// Trip Count
// =============================================================================

/// How many times a loop runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TripCount {
    /// Exactly `n` iterations, known at compile time.
    Constant(u64),
    /// Bounded by a runtime value.
    Symbolic(ValueId),
    Unknown,
}

impl TripCount {
    /// A loop with a positive constant trip count terminates and cannot
    /// starve the collector.
    #[inline]
    pub fn is_finite(&self) -> bool {
        matches!(self, TripCount::Constant(n) if *n > 0)
    }
}

/// Compute the trip count of a counted loop of the canonical shape:
///
/// ```text
/// header:  iv = phi [(preheader, init), (latch, iv.next)]
///          ...
/// latch:   iv.next = iv + step
///          c = icmp pred iv.next, bound      ; or pred iv, bound
///          condbr c, header, exit
/// ```
///
/// Anything else is `Unknown`.
pub fn trip_count(func: &Function, lp: &Loop) -> TripCount {
    let latch = match lp.latch() {
        Some(l) => l,
        None => return TripCount::Unknown,
    };

    let term = func.terminator(latch);
    let (cond, taken_is_header) = match func.inst(term) {
        Some(InstKind::CondBr {
            cond,
            on_true,
            on_false,
        }) => {
            if *on_true == lp.header && *on_false != lp.header {
                (*cond, true)
            } else if *on_false == lp.header && *on_true != lp.header {
                (*cond, false)
            } else {
                return TripCount::Unknown;
            }
        }
        _ => return TripCount::Unknown,
    };

    let (pred, lhs, rhs) = match func.inst(cond) {
        Some(InstKind::IntCmp { pred, lhs, rhs }) => (*pred, *lhs, *rhs),
        _ => return TripCount::Unknown,
    };
    // Continue-while form only; an inverted exit test flips the predicate,
    // which this analysis does not chase.
    if !taken_is_header {
        return TripCount::Unknown;
    }

    // lhs must be the induction variable (or its increment), rhs the bound.
    let (iv, iv_includes_step) = match resolve_induction(func, lp, lhs) {
        Some(r) => r,
        None => return TripCount::Unknown,
    };
    let (init, step) = match induction_shape(func, lp, iv) {
        Some(r) => r,
        None => return TripCount::Unknown,
    };
    if step <= 0 {
        return TripCount::Unknown;
    }

    let bound = match func.value(rhs).kind {
        ValueKind::ConstInt { bits } => bits,
        // Runtime bound: finite only if the runtime value is, which we
        // cannot prove here.
        _ => return TripCount::Symbolic(rhs),
    };

    let first_compared = if iv_includes_step { init + step } else { init };
    let remaining = match pred {
        CmpPred::Slt | CmpPred::Ult => bound - first_compared,
        CmpPred::Sle | CmpPred::Ule => bound - first_compared + 1,
        CmpPred::Ne => bound - first_compared,
        _ => return TripCount::Unknown,
    };
    if pred == CmpPred::Ne && (remaining < 0 || remaining % step != 0) {
        // The counter steps over the bound without ever equaling it.
        return TripCount::Unknown;
    }
    if remaining <= 0 {
        // First latch test already fails; the body ran once.
        return TripCount::Constant(1);
    }
    let extra = (remaining as u64 + step as u64 - 1) / step as u64;
    TripCount::Constant(1 + extra)
}

/// Is `v` the loop's induction phi, or the phi plus its step?
fn resolve_induction(func: &Function, lp: &Loop, v: ValueId) -> Option<(ValueId, bool)> {
    if is_header_phi(func, lp, v) {
        return Some((v, false));
    }
    if let Some(InstKind::BinOp {
        op: BinOp::Add,
        lhs,
        rhs,
    }) = func.inst(v)
    {
        if is_header_phi(func, lp, *lhs) && is_const(func, *rhs) {
            return Some((*lhs, true));
        }
    }
    None
}

fn is_header_phi(func: &Function, lp: &Loop, v: ValueId) -> bool {
    func.inst(v).map_or(false, InstKind::is_phi) && func.inst_block(v) == Some(lp.header)
}

fn is_const(func: &Function, v: ValueId) -> bool {
    matches!(func.value(v).kind, ValueKind::ConstInt { .. })
}

/// Extract (init, step) from the induction phi, requiring the increment to
/// come around a back edge and the init from outside the loop.
fn induction_shape(func: &Function, lp: &Loop, phi: ValueId) -> Option<(i64, i64)> {
    let incomings = match func.inst(phi) {
        Some(InstKind::Phi { incomings, .. }) => incomings.clone(),
        _ => return None,
    };
    let mut init = None;
    let mut step = None;
    for (pred, val) in incomings {
        if lp.contains(pred) {
            match func.inst(val) {
                Some(InstKind::BinOp {
                    op: BinOp::Add,
                    lhs,
                    rhs,
                }) if *lhs == phi => match func.value(*rhs).kind {
                    ValueKind::ConstInt { bits } => step = Some(bits),
                    _ => return None,
                },
                _ => return None,
            }
        } else {
            match func.value(val).kind {
                ValueKind::ConstInt { bits } => init = Some(bits),
                _ => return None,
            }
        }
    }
    Some((init?, step?))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::func::{Function, Signature};
    use crate::types::Type;
    use smallvec::smallvec;

    /// for (i = 0; ...; i += step) while (i.next <pred> bound)
    fn counted_loop(init: i64, step: i64, bound: Option<i64>, pred: CmpPred) -> Function {
        let mut f = Function::new("loopy", Signature::new(vec![Type::I64], Type::Void));
        let entry = f.new_block("entry");
        let header = f.new_block("header");
        let exit = f.new_block("exit");

        f.append_inst(entry, InstKind::Br { dest: header }, Type::Void);

        let init_v = f.make_int(Type::I64, init);
        let phi = f.append_inst(
            header,
            InstKind::Phi {
                incomings: smallvec![(entry, init_v)],
                is_base: false,
            },
            Type::I64,
        );
        let step_v = f.make_int(Type::I64, step);
        let next = f.append_inst(
            header,
            InstKind::BinOp {
                op: BinOp::Add,
                lhs: phi,
                rhs: step_v,
            },
            Type::I64,
        );
        let bound_v = match bound {
            Some(b) => f.make_int(Type::I64, b),
            None => f.arg(0),
        };
        let cmp = f.append_inst(
            header,
            InstKind::IntCmp {
                pred,
                lhs: next,
                rhs: bound_v,
            },
            Type::I1,
        );
        f.append_inst(
            header,
            InstKind::CondBr {
                cond: cmp,
                on_true: header,
                on_false: exit,
            },
            Type::Void,
        );
        if let Some(InstKind::Phi { incomings, .. }) = f.inst_mut(phi) {
            incomings.push((header, next));
        }
        f.append_inst(exit, InstKind::Ret { value: None }, Type::Void);
        f
    }

    fn analyze(f: &Function) -> (LoopAnalysis, TripCount) {
        let cfg = Cfg::build(f);
        let dom = DominatorTree::build(&cfg);
        let loops = LoopAnalysis::compute(&cfg, &dom);
        assert_eq!(loops.loops.len(), 1);
        let tc = trip_count(f, &loops.loops[0]);
        (loops, tc)
    }

    #[test]
    fn test_detects_self_loop() {
        let f = counted_loop(0, 1, Some(10), CmpPred::Slt);
        let (loops, _) = analyze(&f);
        let lp = &loops.loops[0];
        assert_eq!(lp.back_edges.len(), 1);
        assert_eq!(lp.latch(), Some(lp.header));
        assert!(lp.contains(lp.header));
    }

    #[test]
    fn test_constant_trip_count() {
        let f = counted_loop(0, 1, Some(10), CmpPred::Slt);
        let (_, tc) = analyze(&f);
        assert_eq!(tc, TripCount::Constant(10));
        assert!(tc.is_finite());
    }

    #[test]
    fn test_sle_counts_one_more() {
        let f = counted_loop(0, 1, Some(10), CmpPred::Sle);
        let (_, tc) = analyze(&f);
        assert_eq!(tc, TripCount::Constant(11));
    }

    #[test]
    fn test_stepped_loop() {
        let f = counted_loop(0, 3, Some(10), CmpPred::Slt);
        let (_, tc) = analyze(&f);
        // i.next takes 3, 6, 9, 12 -> body runs 4 times
        assert_eq!(tc, TripCount::Constant(4));
    }

    #[test]
    fn test_symbolic_bound() {
        let f = counted_loop(0, 1, None, CmpPred::Slt);
        let (_, tc) = analyze(&f);
        assert!(matches!(tc, TripCount::Symbolic(_)));
        assert!(!tc.is_finite());
    }

    #[test]
    fn test_ne_with_mismatched_step_unknown() {
        let f = counted_loop(0, 3, Some(10), CmpPred::Ne);
        let (_, tc) = analyze(&f);
        assert_eq!(tc, TripCount::Unknown);
    }
}
