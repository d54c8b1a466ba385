//! Cross-cutting invariants of the transformation.

use ember_ir::{
    verify_function, DeoptState, FuncId, Function, FunctionBuilder, InstKind, Module, Signature,
    Type, ValueId, ValueTag,
};
use ember_safepoint::{select, PassConfig, PlaceSafepoints, POLL_FUNCTION_NAME};
use std::collections::HashSet;

fn module_with_runtime() -> (Module, FuncId) {
    let mut module = Module::new();
    let g = module.add_function(Function::new("g", Signature::new(vec![], Type::Void)));

    let mut b = FunctionBuilder::new(POLL_FUNCTION_NAME, Signature::new(vec![], Type::Void));
    let entry = b.create_block("entry");
    let slow = b.create_block("slow");
    let done = b.create_block("done");
    b.switch_to(entry);
    let page = b.global("poll_page", Type::raw_ptr());
    let flag = b.load(page, Type::I64);
    let zero = b.iconst(Type::I64, 0);
    let c = b.icmp(ember_ir::CmpPred::Ne, flag, zero);
    b.cond_br(c, slow, done);
    b.switch_to(slow);
    b.call(g, &[], Type::Void);
    b.br(done);
    b.switch_to(done);
    b.ret_void();
    module.add_function(b.finish());
    (module, g)
}

/// S2-shaped function: two derived pointers merge, then a call.
fn derived_merge_function(module: &mut Module, g: FuncId) -> FuncId {
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
    b.call(g, &[], Type::Void);
    b.ret(merged);
    let mut f = b.finish();
    f.set_attr(select::ATTR_CALL, "true");
    module.add_function(f)
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

// =============================================================================
// Invariant 1: exactly one relocate per live value per statepoint
// =============================================================================

#[test]
fn exactly_one_relocate_per_live_value() {
    let (mut module, g) = module_with_runtime();
    let id = derived_merge_function(&mut module, g);
    PlaceSafepoints::new(PassConfig::default())
        .run_module(&mut module)
        .unwrap();

    let f = module.get(id);
    for token in statepoints_of(f) {
        let live = live_region(f, token);
        let mut derived_indices = Vec::new();
        for user in f.users(token) {
            if let Some(InstKind::Relocate { derived_index, .. }) = f.inst(user) {
                derived_indices.push(*derived_index);
            }
        }
        derived_indices.sort_unstable();
        let expected: Vec<u32> = (0..live.len() as u32).collect();
        assert_eq!(derived_indices, expected, "one relocate per live value");
    }
}

// =============================================================================
// Invariant 2: bases dominate deriveds and are relocated at the site
// =============================================================================

#[test]
fn bases_dominate_and_are_relocated() {
    let (mut module, g) = module_with_runtime();
    let id = derived_merge_function(&mut module, g);
    PlaceSafepoints::new(PassConfig::default())
        .run_module(&mut module)
        .unwrap();

    let f = module.get(id);
    let cfg = ember_ir::Cfg::build(f);
    let dom = ember_ir::DominatorTree::build(&cfg);

    for token in statepoints_of(f) {
        let live = live_region(f, token);
        for user in f.users(token) {
            if let Some(InstKind::Relocate {
                base_index,
                derived_index,
                ..
            }) = f.inst(user)
            {
                let base = live[*base_index as usize];
                let derived = live[*derived_index as usize];
                // The base value must dominate the derived value's def.
                if f.is_inst(derived) {
                    assert!(dom.value_dominates_inst(f, base, derived) || base == derived);
                }
                // And the base itself has a relocate at this site.
                let base_relocated = f.users(token).into_iter().any(|u| {
                    matches!(
                        f.inst(u),
                        Some(InstKind::Relocate { derived_index: di, .. }) if live[*di as usize] == base
                    )
                });
                assert!(base_relocated, "base must be relocated at the same site");
            }
        }
    }
}

// =============================================================================
// Invariant 4: stack slot count is preserved
// =============================================================================

#[test]
fn stack_slot_count_preserved() {
    let (mut module, g) = module_with_runtime();
    // A function that already owns a (non-GC) stack slot.
    let mut b = FunctionBuilder::new("f", Signature::new(vec![Type::gc_ptr()], Type::gc_ptr()));
    let entry = b.create_block("entry");
    b.switch_to(entry);
    let slot = b.stack_slot(Type::I64);
    let c = b.iconst(Type::I64, 3);
    b.store(c, slot);
    b.call(g, &[], Type::Void);
    b.ret(b.arg(0));
    let mut f = b.finish();
    f.set_attr(select::ATTR_CALL, "true");
    let id = module.add_function(f);

    let count = |f: &Function| f.count_insts(|k| matches!(k, InstKind::StackSlot { .. }));
    let before = count(module.get(id));
    assert_eq!(before, 1);

    let stats = PlaceSafepoints::new(PassConfig::default())
        .run_module(&mut module)
        .unwrap();
    assert!(stats.relocation_slots > 0);
    assert_eq!(count(module.get(id)), before);
    verify_function(module.get(id)).unwrap();
}

// =============================================================================
// Invariant 5: the statepoint machinery is never itself a parse point
// =============================================================================

#[test]
fn transformed_ir_offers_no_new_parse_points() {
    let (mut module, g) = module_with_runtime();
    let id = derived_merge_function(&mut module, g);
    PlaceSafepoints::new(PassConfig::default())
        .run_module(&mut module)
        .unwrap();

    let f = module.get(id);
    let config = PassConfig::default();
    let found = select::find_call_safepoints(&module, f, &config);
    assert!(
        found.is_empty(),
        "statepoints/relocates/results must not be re-selected"
    );
}

// =============================================================================
// Invariant 7: absent attributes leave the function untouched
// =============================================================================

#[test]
fn unattributed_function_is_untouched() {
    let (mut module, g) = module_with_runtime();
    let mut b = FunctionBuilder::new("f", Signature::new(vec![Type::gc_ptr()], Type::gc_ptr()));
    let entry = b.create_block("entry");
    b.switch_to(entry);
    b.call(g, &[], Type::Void);
    b.ret(b.arg(0));
    let id = module.add_function(b.finish());

    let before = format!("{}", module.get(id));
    let stats = PlaceSafepoints::new(PassConfig::default())
        .run_module(&mut module)
        .unwrap();
    assert_eq!(format!("{}", module.get(id)), before);
    assert_eq!(stats.statepoints, 0);
}

// =============================================================================
// Liveness modes agree
// =============================================================================

#[test]
fn liveness_modes_agree_on_scenarios() {
    for dataflow in [false, true] {
        let (mut module, g) = module_with_runtime();
        let id = derived_merge_function(&mut module, g);
        let config = PassConfig {
            dataflow_liveness: dataflow,
            ..PassConfig::default()
        };
        PlaceSafepoints::new(config).run_module(&mut module).unwrap();

        let f = module.get(id);
        verify_function(f).unwrap();
        let sps = statepoints_of(f);
        assert_eq!(sps.len(), 1);
        let live: HashSet<String> = live_region(f, sps[0])
            .into_iter()
            .map(|v| f.value(v).name.clone())
            .collect();
        let expect: HashSet<String> = ["merged".to_string(), "base_phi".to_string()]
            .into_iter()
            .collect();
        assert_eq!(live, expect, "dataflow={}", dataflow);
    }
}

// =============================================================================
// Abstract state rides the statepoint
// =============================================================================

#[test]
fn abstract_state_is_encoded_in_wire_order() {
    let (mut module, _) = module_with_runtime();
    let callee = module.add_function(Function::new(
        "target",
        Signature::new(vec![Type::I64], Type::I64),
    ));
    let mut b = FunctionBuilder::new("f", Signature::new(vec![Type::gc_ptr()], Type::I64));
    let entry = b.create_block("entry");
    b.switch_to(entry);
    let p = b.arg(0);
    b.func_mut().set_name(p, "p");
    let x = b.iconst(Type::I64, 5);
    let state = DeoptState {
        caller_depth: 0,
        bci: 17,
        stack: vec![(ValueTag::Object, p)],
        locals: vec![(ValueTag::Int, x)],
        monitors: vec![],
    };
    let call = b.call_with_state(callee, &[x], Type::I64, state);
    let keep = b.binop(ember_ir::BinOp::Add, call, x);
    // p used past the call, so it is live across the statepoint.
    b.field_addr(p, keep);
    b.ret(keep);
    let mut f = b.finish();
    f.set_attr(select::ATTR_CALL, "true");
    let id = module.add_function(f);

    let stats = PlaceSafepoints::new(PassConfig::default())
        .run_module(&mut module)
        .unwrap();
    assert_eq!(stats.statepoints, 1);
    assert_eq!(stats.result_projections, 1);

    let f = module.get(id);
    verify_function(f).unwrap();
    let token = statepoints_of(f)[0];
    let (ops, live_start, argc) = match f.inst(token) {
        Some(InstKind::Statepoint {
            operands,
            live_start,
            num_call_args,
            ..
        }) => (operands.clone(), *live_start as usize, *num_call_args),
        _ => unreachable!(),
    };
    let as_int = |v: ValueId| match f.value(v).kind {
        ember_ir::ValueKind::ConstInt { bits } => bits,
        _ => panic!("expected const int"),
    };

    // [argc][flags][depth][bci][#stack][#locals][#monitors]
    assert_eq!(argc, 1);
    assert_eq!(as_int(ops[0]), 1);
    assert_eq!(as_int(ops[1]), 0);
    assert_eq!(as_int(ops[2]), 0);
    assert_eq!(as_int(ops[3]), 17);
    assert_eq!(as_int(ops[4]), 1); // stack depth
    assert_eq!(as_int(ops[5]), 1); // locals
    assert_eq!(as_int(ops[6]), 0); // monitors
    // original arg
    assert_eq!(as_int(ops[7]), 5);
    // (tag, stack value): p tagged as object
    assert_eq!(as_int(ops[8]), ValueTag::Object.encode());
    // (tag, local)
    assert_eq!(as_int(ops[10]), ValueTag::Int.encode());
    assert_eq!(as_int(ops[11]), 5);
    // live region holds p
    assert_eq!(live_start, 12);
    assert_eq!(ops.len(), 13);

    // The call result flows through a result projection.
    let uses_result = f.users(token).into_iter().any(|u| {
        matches!(f.inst(u), Some(InstKind::StatepointResult { .. }))
    });
    assert!(uses_result);
}

// =============================================================================
// BaseRewriteOnly stops before materialization
// =============================================================================

#[test]
fn base_rewrite_only_stops_after_bases() {
    let (mut module, g) = module_with_runtime();
    let id = derived_merge_function(&mut module, g);
    let config = PassConfig {
        base_rewrite_only: true,
        ..PassConfig::default()
    };
    let stats = PlaceSafepoints::new(config).run_module(&mut module).unwrap();

    // Bases were resolved (the conflict phi exists) but nothing was
    // materialized or rewritten.
    assert_eq!(stats.base_phis, 1);
    assert_eq!(stats.statepoints, 0);
    assert_eq!(stats.relocates, 0);

    let f = module.get(id);
    verify_function(f).unwrap();
    assert!(statepoints_of(f).is_empty());
    let has_base_phi = f.layout.iter().any(|&b| {
        f.block(b)
            .insts
            .iter()
            .any(|&i| matches!(f.inst(i), Some(InstKind::Phi { is_base: true, .. })))
    });
    assert!(has_base_phi);
}
