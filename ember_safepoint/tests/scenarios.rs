//! End-to-end scenarios for safepoint insertion.
//!
//! Each test builds a small module with a realistic `safepoint_poll` body,
//! runs the whole pass, and checks the transformed IR.

use ember_ir::{
    verify_function, BinOp, CmpPred, FuncId, Function, FunctionBuilder, InstKind, Module,
    Signature, Type, ValueId,
};
use ember_safepoint::{
    select, PassConfig, PassStats, PlaceSafepoints, POLL_FUNCTION_NAME,
};

// =============================================================================
// Fixture
// =============================================================================

struct Fixture {
    module: Module,
    /// A plain runtime function `g()`.
    g: FuncId,
    /// The runtime slow path called by the poll body.
    slow_path: FuncId,
}

fn fixture() -> Fixture {
    let mut module = Module::new();
    let slow_path = module.add_function(Function::new(
        "gc_enter_safepoint",
        Signature::new(vec![], Type::Void),
    ));
    let g = module.add_function(Function::new("g", Signature::new(vec![], Type::Void)));

    // safepoint_poll: if (*page != 0) gc_enter_safepoint();
    let mut b = FunctionBuilder::new(POLL_FUNCTION_NAME, Signature::new(vec![], Type::Void));
    let entry = b.create_block("entry");
    let slow = b.create_block("slow");
    let done = b.create_block("done");
    b.switch_to(entry);
    let page = b.global("poll_page", Type::raw_ptr());
    let flag = b.load(page, Type::I64);
    let zero = b.iconst(Type::I64, 0);
    let c = b.icmp(CmpPred::Ne, flag, zero);
    b.cond_br(c, slow, done);
    b.switch_to(slow);
    b.call(slow_path, &[], Type::Void);
    b.br(done);
    b.switch_to(done);
    b.ret_void();
    module.add_function(b.finish());

    Fixture {
        module,
        g,
        slow_path,
    }
}

fn run(module: &mut Module) -> PassStats {
    PlaceSafepoints::new(PassConfig::default())
        .run_module(module)
        .unwrap()
}

fn statepoints_of(func: &Function) -> Vec<ValueId> {
    let mut out = Vec::new();
    for &b in &func.layout {
        for &i in &func.block(b).insts {
            if matches!(func.inst(i), Some(InstKind::Statepoint { .. })) {
                out.push(i);
            }
        }
    }
    out
}

fn live_region(func: &Function, token: ValueId) -> Vec<ValueId> {
    match func.inst(token) {
        Some(InstKind::Statepoint {
            operands,
            live_start,
            ..
        }) => operands[*live_start as usize..].to_vec(),
        _ => panic!("not a statepoint"),
    }
}

fn relocates_of(func: &Function, token: ValueId) -> Vec<ValueId> {
    func.users(token)
        .into_iter()
        .filter(|&u| matches!(func.inst(u), Some(InstKind::Relocate { .. })))
        .collect()
}

// =============================================================================
// S1 — call safepoint with a reused argument
// =============================================================================

#[test]
fn s1_call_safepoint_relocates_reused_argument() {
    let mut fx = fixture();
    let mut b = FunctionBuilder::new("f", Signature::new(vec![Type::gc_ptr()], Type::gc_ptr()));
    let entry = b.create_block("entry");
    b.switch_to(entry);
    let p = b.arg(0);
    b.func_mut().set_name(p, "p");
    b.call(fx.g, &[], Type::Void);
    b.ret(p);
    let mut f = b.finish();
    f.set_attr(select::ATTR_CALL, "true");
    let id = fx.module.add_function(f);

    let stats = run(&mut fx.module);
    assert_eq!(stats.statepoints, 1);
    assert_eq!(stats.relocates, 1);

    let f = fx.module.get(id);
    verify_function(f).unwrap();

    let sps = statepoints_of(f);
    assert_eq!(sps.len(), 1);
    assert_eq!(live_region(f, sps[0]), vec![p]);

    // The returned value is the relocated p, not p.
    let ret = f.terminator(f.entry());
    let returned = f.operands(ret)[0];
    assert!(matches!(f.inst(returned), Some(InstKind::Relocate { .. })));
    assert_eq!(f.value(returned).name, "p.relocated");
}

// =============================================================================
// S2 — phi of two derived pointers
// =============================================================================

#[test]
fn s2_phi_of_derived_pointers_gets_base_phi() {
    let mut fx = fixture();
    let mut b = FunctionBuilder::new(
        "f",
        Signature::new(
            vec![Type::gc_ptr(), Type::gc_ptr(), Type::I1],
            Type::gc_ptr(),
        ),
    );
    let entry = b.create_block("entry");
    let l = b.create_block("l");
    let r = b.create_block("r");
    let join = b.create_block("join");
    b.switch_to(entry);
    let p = b.arg(0);
    let q = b.arg(1);
    b.func_mut().set_name(p, "p");
    b.func_mut().set_name(q, "q");
    b.cond_br(b.arg(2), l, r);
    b.switch_to(l);
    let dp = b.field_addr_imm(p, 8);
    b.br(join);
    b.switch_to(r);
    let dq = b.field_addr_imm(q, 8);
    b.br(join);
    b.switch_to(join);
    let merged = b.phi(Type::gc_ptr(), &[(l, dp), (r, dq)]);
    b.func_mut().set_name(merged, "merged");
    b.call(fx.g, &[], Type::Void);
    b.ret(merged);
    let mut f = b.finish();
    f.set_attr(select::ATTR_CALL, "true");
    let id = fx.module.add_function(f);

    let stats = run(&mut fx.module);
    assert_eq!(stats.statepoints, 1);
    assert_eq!(stats.base_phis, 1);

    let f = fx.module.get(id);
    verify_function(f).unwrap();

    let sps = statepoints_of(f);
    let live = live_region(f, sps[0]);
    // Both the derived phi and the new base phi cross the statepoint.
    assert_eq!(live.len(), 2);
    let base_phi = live
        .iter()
        .copied()
        .find(|&v| matches!(f.inst(v), Some(InstKind::Phi { is_base: true, .. })))
        .expect("base phi must be live");
    assert!(live.contains(&merged));

    // The base phi merges the original roots p and q.
    match f.inst(base_phi) {
        Some(InstKind::Phi { incomings, .. }) => {
            let mut ins: Vec<ValueId> = incomings.iter().map(|&(_, v)| v).collect();
            ins.sort();
            let mut expect = vec![p, q];
            expect.sort();
            assert_eq!(ins, expect);
        }
        _ => unreachable!(),
    }

    // One relocate each.
    assert_eq!(relocates_of(f, sps[0]).len(), 2);

    // The return reads the relocated derived pointer.
    let ret = ret_block_of(f);
    let returned = f.operands(ret)[0];
    assert!(matches!(f.inst(returned), Some(InstKind::Relocate { .. })));
    assert_eq!(f.value(returned).name, "merged.relocated");
}

fn ret_block_of(func: &Function) -> ValueId {
    for &b in &func.layout {
        let term = func.terminator(b);
        if matches!(func.inst(term), Some(InstKind::Ret { .. })) {
            return term;
        }
    }
    panic!("no return found");
}

// =============================================================================
// S3 — finite counted loop needs no backedge poll
// =============================================================================

fn counted_loop_function(bound: Option<i64>) -> Function {
    // for (i = 0; i < bound; i++) {}  — no calls inside.
    let mut b = FunctionBuilder::new("f", Signature::new(vec![Type::I64], Type::Void));
    let entry = b.create_block("entry");
    let header = b.create_block("header");
    let exit = b.create_block("exit");
    b.switch_to(entry);
    b.br(header);
    b.switch_to(header);
    let zero = b.iconst(Type::I64, 0);
    let iv = b.phi(Type::I64, &[(entry, zero)]);
    let one = b.iconst(Type::I64, 1);
    let next = b.binop(BinOp::Add, iv, one);
    let bound_v = match bound {
        Some(n) => b.iconst(Type::I64, n),
        None => b.arg(0),
    };
    let c = b.icmp(CmpPred::Slt, next, bound_v);
    b.cond_br(c, header, exit);
    if let Some(InstKind::Phi { incomings, .. }) = b.func_mut().inst_mut(iv) {
        incomings.push((header, next));
    }
    b.switch_to(exit);
    b.ret_void();
    b.finish()
}

#[test]
fn s3_finite_loop_is_not_polled() {
    let mut fx = fixture();
    let mut f = counted_loop_function(Some(10));
    f.set_attr(select::ATTR_BACKEDGE, "true");
    f.set_attr(select::ATTR_CALL, "true");
    let id = fx.module.add_function(f);

    let stats = run(&mut fx.module);
    assert_eq!(stats.backedge_polls, 0);
    assert_eq!(stats.finite_loops_skipped, 1);
    assert_eq!(stats.statepoints, 0);

    let f = fx.module.get(id);
    verify_function(f).unwrap();
    assert!(statepoints_of(f).is_empty());
}

// =============================================================================
// S4 — unbounded loop polls on its latch
// =============================================================================

#[test]
fn s4_unbounded_loop_polls_backedge_with_loop_carried_live_set() {
    let mut fx = fixture();
    // Same loop shape with a runtime bound, plus a gc pointer carried
    // through the loop and returned afterwards.
    let mut b = FunctionBuilder::new(
        "f",
        Signature::new(vec![Type::I64, Type::gc_ptr()], Type::gc_ptr()),
    );
    let entry = b.create_block("entry");
    let header = b.create_block("header");
    let exit = b.create_block("exit");
    b.switch_to(entry);
    let p = b.arg(1);
    b.func_mut().set_name(p, "p");
    b.br(header);
    b.switch_to(header);
    let zero = b.iconst(Type::I64, 0);
    let iv = b.phi(Type::I64, &[(entry, zero)]);
    let one = b.iconst(Type::I64, 1);
    let next = b.binop(BinOp::Add, iv, one);
    let c = b.icmp(CmpPred::Slt, next, b.arg(0));
    b.cond_br(c, header, exit);
    if let Some(InstKind::Phi { incomings, .. }) = b.func_mut().inst_mut(iv) {
        incomings.push((header, next));
    }
    b.switch_to(exit);
    b.ret(p);
    let mut f = b.finish();
    f.set_attr(select::ATTR_BACKEDGE, "true");
    f.set_attr(select::ATTR_CALL, "true");
    let id = fx.module.add_function(f);

    let stats = run(&mut fx.module);
    assert_eq!(stats.backedge_polls, 1);
    assert_eq!(stats.finite_loops_skipped, 0);
    // The poll's slow-path call is the only parse point.
    assert_eq!(stats.statepoints, 1);

    let f = fx.module.get(id);
    verify_function(f).unwrap();

    let sps = statepoints_of(f);
    assert_eq!(sps.len(), 1);
    match f.inst(sps[0]) {
        Some(InstKind::Statepoint { target, .. }) => assert_eq!(*target, fx.slow_path),
        _ => unreachable!(),
    }

    // The live set is exactly the loop-carried gc value. After rewriting,
    // the operand is the loop-carried form of p: the phi merging the
    // incoming argument with the previous iteration's relocation.
    let live = live_region(f, sps[0]);
    assert_eq!(live.len(), 1);
    assert!(f.ty(live[0]).is_gc_ptr());
    assert!(
        live[0] == p || matches!(f.inst(live[0]), Some(InstKind::Phi { .. })),
        "live operand must be p or its loop-carried phi"
    );
    // Exactly one relocate hangs off the statepoint.
    assert_eq!(relocates_of(f, sps[0]).len(), 1);
}

// =============================================================================
// S5 — phi outside the dominator region of the new defs
// =============================================================================

#[test]
fn s5_unrelated_phi_is_still_rewritten() {
    let mut fx = fixture();
    let mut b = FunctionBuilder::new(
        "f",
        Signature::new(vec![Type::gc_ptr(), Type::I1], Type::gc_ptr()),
    );
    let entry = b.create_block("entry");
    let path1 = b.create_block("path1");
    let path2 = b.create_block("path2");
    let join = b.create_block("join");
    b.switch_to(entry);
    let o = b.arg(0);
    b.func_mut().set_name(o, "obj");
    b.cond_br(b.arg(1), path1, path2);
    b.switch_to(path1);
    // Uses obj before any safepoint; this phi input sits outside the
    // dominator region of the relocation code on path2.
    let v1 = b.field_addr_imm(o, 8);
    b.br(join);
    b.switch_to(path2);
    b.call(fx.g, &[], Type::Void);
    let v2 = b.field_addr_imm(o, 16);
    b.br(join);
    b.switch_to(join);
    let m = b.phi(Type::gc_ptr(), &[(path1, v1), (path2, v2)]);
    b.ret(m);
    let mut f = b.finish();
    f.set_attr(select::ATTR_CALL, "true");
    let id = fx.module.add_function(f);

    let stats = run(&mut fx.module);
    assert_eq!(stats.statepoints, 1);

    let f = fx.module.get(id);
    verify_function(f).unwrap();

    let sps = statepoints_of(f);
    assert_eq!(live_region(f, sps[0]), vec![o]);

    // Past the statepoint, the derived address must be computed from the
    // relocated object.
    let reloc = relocates_of(f, sps[0])[0];
    match f.inst(v2) {
        Some(InstKind::FieldAddr { base, .. }) => assert_eq!(*base, reloc),
        other => panic!("expected field_addr, got {:?}", other),
    }
    // The pre-statepoint path still feeds the original object's address.
    match f.inst(v1) {
        Some(InstKind::FieldAddr { base, .. }) => assert_eq!(*base, o),
        other => panic!("expected field_addr, got {:?}", other),
    }
}

// =============================================================================
// S6 — leaf calls take no statepoint
// =============================================================================

#[test]
fn s6_leaf_call_between_safepoints_is_skipped() {
    let mut fx = fixture();
    let mut leaf = Function::new("fast_path", Signature::new(vec![], Type::Void));
    leaf.set_attr(select::ATTR_LEAF, "true");
    let leaf = fx.module.add_function(leaf);

    let mut b = FunctionBuilder::new("f", Signature::new(vec![Type::gc_ptr()], Type::gc_ptr()));
    let entry = b.create_block("entry");
    b.switch_to(entry);
    let p = b.arg(0);
    b.func_mut().set_name(p, "p");
    b.call(fx.g, &[], Type::Void);
    let leaf_call = b.call(leaf, &[], Type::Void);
    b.call(fx.g, &[], Type::Void);
    b.ret(p);
    let mut f = b.finish();
    f.set_attr(select::ATTR_CALL, "true");
    let id = fx.module.add_function(f);

    let stats = run(&mut fx.module);
    assert_eq!(stats.statepoints, 2);

    let f = fx.module.get(id);
    verify_function(f).unwrap();
    assert_eq!(statepoints_of(f).len(), 2);

    // The leaf call survives untouched.
    match f.inst(leaf_call) {
        Some(InstKind::Call { callee, .. }) => assert_eq!(*callee, leaf),
        other => panic!("leaf call was transformed: {:?}", other),
    }
}
