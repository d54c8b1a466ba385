//! Control-flow graph view and dominator tree.
//!
//! `Cfg` is a snapshot: it caches predecessors, successors and a reverse
//! postorder for one version of the function. Any pass that mutates control
//! flow must rebuild it (and the dominator tree) before asking questions
//! again — there is no incremental update.
//!
//! The dominator tree uses the Cooper–Harvey–Kennedy iteration over
//! postorder numbers: simple, and fast enough for a per-function pass.

use crate::entity::{DenseSet, SecondaryMap};
use crate::func::{BlockData, BlockId, Function, ValueId, ValueKind};

// =============================================================================
// Cfg
// =============================================================================

/// Cached control-flow structure of one function.
#[derive(Debug, Clone)]
pub struct Cfg {
    pub entry: BlockId,
    preds: SecondaryMap<BlockData, Vec<BlockId>>,
    succs: SecondaryMap<BlockData, Vec<BlockId>>,
    /// Blocks in reverse postorder from the entry.
    pub rpo: Vec<BlockId>,
    postorder_num: SecondaryMap<BlockData, u32>,
}

impl Cfg {
    pub fn build(func: &Function) -> Cfg {
        let entry = func.entry();
        let mut cfg = Cfg {
            entry,
            preds: SecondaryMap::with_capacity(func.blocks.len()),
            succs: SecondaryMap::with_capacity(func.blocks.len()),
            rpo: Vec::with_capacity(func.layout.len()),
            postorder_num: SecondaryMap::with_capacity(func.blocks.len()),
        };

        for &b in &func.layout {
            let succs: Vec<BlockId> = func.successors(b).into_iter().collect();
            for &s in &succs {
                let mut p = cfg.preds.get(s).clone();
                p.push(b);
                cfg.preds.set(s, p);
            }
            cfg.succs.set(b, succs);
        }

        // Iterative postorder DFS.
        let mut visited = DenseSet::with_capacity(func.blocks.len());
        let mut postorder = Vec::with_capacity(func.layout.len());
        let mut stack: Vec<(BlockId, usize)> = vec![(entry, 0)];
        visited.insert(entry.index());
        while let Some(top) = stack.last_mut() {
            let (b, next) = *top;
            top.1 += 1;
            let succs = cfg.succs.get(b);
            if next < succs.len() {
                let s = succs[next];
                if visited.insert(s.index()) {
                    stack.push((s, 0));
                }
            } else {
                postorder.push(b);
                stack.pop();
            }
        }
        for (i, &b) in postorder.iter().enumerate() {
            cfg.postorder_num.set(b, i as u32);
        }
        postorder.reverse();
        cfg.rpo = postorder;
        cfg
    }

    #[inline]
    pub fn preds(&self, b: BlockId) -> &[BlockId] {
        self.preds.get(b)
    }

    #[inline]
    pub fn succs(&self, b: BlockId) -> &[BlockId] {
        self.succs.get(b)
    }

    #[inline]
    pub fn postorder(&self, b: BlockId) -> u32 {
        *self.postorder_num.get(b)
    }
}

// =============================================================================
// Dominator Tree
// =============================================================================

#[derive(Debug, Clone)]
pub struct DominatorTree {
    idom: SecondaryMap<BlockData, BlockId>,
    children: SecondaryMap<BlockData, Vec<BlockId>>,
    frontier: SecondaryMap<BlockData, Vec<BlockId>>,
    entry: BlockId,
}

impl DominatorTree {
    pub fn build(cfg: &Cfg) -> DominatorTree {
        let mut dom = DominatorTree {
            idom: SecondaryMap::new(),
            children: SecondaryMap::new(),
            frontier: SecondaryMap::new(),
            entry: cfg.entry,
        };
        dom.idom.set(cfg.entry, cfg.entry);

        let mut changed = true;
        while changed {
            changed = false;
            for &b in &cfg.rpo {
                if b == cfg.entry {
                    continue;
                }
                let mut new_idom = BlockId::INVALID;
                for &p in cfg.preds(b) {
                    if !dom.idom.get(p).is_valid() {
                        continue;
                    }
                    new_idom = if new_idom.is_valid() {
                        dom.intersect(p, new_idom, cfg)
                    } else {
                        p
                    };
                }
                if new_idom.is_valid() && *dom.idom.get(b) != new_idom {
                    dom.idom.set(b, new_idom);
                    changed = true;
                }
            }
        }

        for &b in &cfg.rpo {
            if b == cfg.entry {
                continue;
            }
            let idom = *dom.idom.get(b);
            if idom.is_valid() {
                let mut kids = dom.children.get(idom).clone();
                kids.push(b);
                dom.children.set(idom, kids);
            }
        }

        // Dominance frontier (needed by SSA slot promotion).
        for &b in &cfg.rpo {
            let preds = cfg.preds(b);
            if preds.len() < 2 {
                continue;
            }
            let idom_b = *dom.idom.get(b);
            for &p in preds {
                let mut runner = p;
                while runner.is_valid() && runner != idom_b {
                    let mut fr = dom.frontier.get(runner).clone();
                    if !fr.contains(&b) {
                        fr.push(b);
                        dom.frontier.set(runner, fr);
                    }
                    let up = *dom.idom.get(runner);
                    if up == runner {
                        break;
                    }
                    runner = up;
                }
            }
        }

        dom
    }

    fn intersect(&self, mut a: BlockId, mut b: BlockId, cfg: &Cfg) -> BlockId {
        while a != b {
            while cfg.postorder(a) < cfg.postorder(b) {
                a = *self.idom.get(a);
            }
            while cfg.postorder(b) < cfg.postorder(a) {
                b = *self.idom.get(b);
            }
        }
        a
    }

    /// Immediate dominator, None for the entry block.
    pub fn idom(&self, b: BlockId) -> Option<BlockId> {
        let idom = *self.idom.get(b);
        (idom.is_valid() && idom != b).then_some(idom)
    }

    pub fn children(&self, b: BlockId) -> &[BlockId] {
        self.children.get(b)
    }

    pub fn frontier(&self, b: BlockId) -> &[BlockId] {
        self.frontier.get(b)
    }

    /// Does block `a` dominate block `b`?
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if a == b {
            return true;
        }
        let mut cur = b;
        while let Some(up) = self.idom(cur) {
            if up == a {
                return true;
            }
            cur = up;
        }
        false
    }

    /// Does the *definition point* of `v` dominate instruction `site`?
    ///
    /// Arguments and constants are defined "before" the entry block and
    /// dominate everything. Instructions compare block dominance, with
    /// in-block position breaking ties.
    pub fn value_dominates_inst(&self, func: &Function, v: ValueId, site: ValueId) -> bool {
        let def_block = match func.value(v).kind {
            ValueKind::Inst { block, .. } => block,
            ValueKind::Dead => return false,
            // Arguments, constants, globals.
            _ => return true,
        };
        let site_block = match func.inst_block(site) {
            Some(b) => b,
            None => return false,
        };
        if def_block != site_block {
            return self.dominates(def_block, site_block);
        }
        let def_pos = func.pos_in_block(v).expect("detached def");
        let site_pos = func.pos_in_block(site).expect("detached site");
        def_pos < site_pos
    }

    #[inline]
    pub fn entry(&self) -> BlockId {
        self.entry
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::func::{Function, InstKind, Signature};
    use crate::types::Type;

    /// entry -> (left | right) -> join -> exit, plus a loop join -> left.
    fn diamond_with_loop() -> (Function, BlockId, BlockId, BlockId, BlockId) {
        let mut f = Function::new("d", Signature::new(vec![Type::I1], Type::Void));
        let entry = f.new_block("entry");
        let left = f.new_block("left");
        let right = f.new_block("right");
        let join = f.new_block("join");
        let exit = f.new_block("exit");
        f.append_inst(
            entry,
            InstKind::CondBr {
                cond: f.arg(0),
                on_true: left,
                on_false: right,
            },
            Type::Void,
        );
        f.append_inst(left, InstKind::Br { dest: join }, Type::Void);
        f.append_inst(right, InstKind::Br { dest: join }, Type::Void);
        f.append_inst(
            join,
            InstKind::CondBr {
                cond: f.arg(0),
                on_true: left,
                on_false: exit,
            },
            Type::Void,
        );
        f.append_inst(exit, InstKind::Ret { value: None }, Type::Void);
        (f, entry, left, right, join)
    }

    #[test]
    fn test_rpo_starts_at_entry() {
        let (f, entry, ..) = diamond_with_loop();
        let cfg = Cfg::build(&f);
        assert_eq!(cfg.rpo[0], entry);
        assert_eq!(cfg.rpo.len(), 5);
    }

    #[test]
    fn test_preds_succs() {
        let (f, entry, left, right, join) = diamond_with_loop();
        let cfg = Cfg::build(&f);
        assert_eq!(cfg.succs(entry), &[left, right]);
        let mut preds = cfg.preds(left).to_vec();
        preds.sort();
        let mut expect = vec![entry, join];
        expect.sort();
        assert_eq!(preds, expect);
    }

    #[test]
    fn test_idom() {
        let (f, entry, left, right, join) = diamond_with_loop();
        let cfg = Cfg::build(&f);
        let dom = DominatorTree::build(&cfg);
        assert_eq!(dom.idom(entry), None);
        assert_eq!(dom.idom(left), Some(entry));
        assert_eq!(dom.idom(right), Some(entry));
        assert_eq!(dom.idom(join), Some(entry));
        assert!(dom.dominates(entry, join));
        assert!(!dom.dominates(left, join));
        assert!(dom.dominates(join, join));
    }

    #[test]
    fn test_frontier() {
        let (f, _, left, right, join) = diamond_with_loop();
        let cfg = Cfg::build(&f);
        let dom = DominatorTree::build(&cfg);
        assert!(dom.frontier(right).contains(&join));
        // left is re-entered from join, so join's frontier reaches back.
        assert!(dom.frontier(join).contains(&left));
        assert!(dom.frontier(left).contains(&join));
    }

    #[test]
    fn test_value_dominance_in_block() {
        let mut f = Function::new("v", Signature::new(vec![], Type::Void));
        let entry = f.new_block("entry");
        let a = f.make_int(Type::I64, 1);
        let x = f.append_inst(
            entry,
            InstKind::BinOp {
                op: crate::func::BinOp::Add,
                lhs: a,
                rhs: a,
            },
            Type::I64,
        );
        let y = f.append_inst(
            entry,
            InstKind::BinOp {
                op: crate::func::BinOp::Add,
                lhs: x,
                rhs: a,
            },
            Type::I64,
        );
        f.append_inst(entry, InstKind::Ret { value: None }, Type::Void);
        let cfg = Cfg::build(&f);
        let dom = DominatorTree::build(&cfg);
        assert!(dom.value_dominates_inst(&f, x, y));
        assert!(!dom.value_dominates_inst(&f, y, x));
        // Constants dominate everything.
        assert!(dom.value_dominates_inst(&f, a, x));
    }
}
