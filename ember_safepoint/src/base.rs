//! Base pointer resolution (component D).
//!
//! For the collector to relocate a derived pointer it must know which
//! object owns the storage — the base pointer. Most values answer directly
//! (arguments, call results, loads are their own base; casts and address
//! computations defer to their source). Phis and selects of derived
//! pointers are the interesting case: the base may differ per path, so a
//! matching merge of *bases* has to be synthesized.
//!
//! Resolution runs a three-valued lattice per merge:
//!
//! ```text
//!     Unknown  ⊑  Base(b)  ⊑  Conflict
//! ```
//!
//! An optimistic meet over the merge's inputs either settles every node on
//! a single base or drives it to `Conflict`, and each conflict gets a
//! skeleton merge (marked `is_base`) whose operands are filled with the
//! bases of the original operands, casting where pointer shapes differ.
//! Self-referential phis terminate through the lattice: their own state
//! contributes `Unknown` until some other input decides them.
//!
//! The cache carries two relations over its lifetime: base-defining-value
//! first, upgraded to the base relation as resolutions complete. Upgraded
//! entries never change again.

use crate::config::PassConfig;
use crate::error::{PassError, PassResult};
use crate::liveness::{self, LivenessMap};
use crate::statepoint::SafepointRecord;
use crate::stats::PassStats;
use ember_ir::{Cfg, DominatorTree, Function, InstKind, ValueId, ValueKind};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

// =============================================================================
// BDV cache
// =============================================================================

/// Function-scoped cache of the BDV / base relation, shared across every
/// parse point so repeated queries do not duplicate base merges.
#[derive(Debug, Default)]
pub struct BdvCache {
    map: FxHashMap<ValueId, ValueId>,
}

impl BdvCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, v: ValueId) -> Option<ValueId> {
        self.map.get(&v).copied()
    }
}

// =============================================================================
// BDV classification
// =============================================================================

/// Is `v` something we positively know to be a base pointer (or a merge
/// already resolved to produce one)?
pub fn is_known_base(func: &Function, v: ValueId) -> bool {
    match func.inst(v) {
        Some(InstKind::Phi { is_base, .. }) | Some(InstKind::Select { is_base, .. }) => *is_base,
        _ => true,
    }
}

/// Classify a GC-pointer value by its source: either it is its own
/// base-defining value, or the search continues through its operand.
/// Merges return themselves; the lattice takes over from there.
fn find_base_defining_value(
    func: &Function,
    v: ValueId,
    config: &PassConfig,
) -> PassResult<ValueId> {
    debug_assert!(
        func.ty(v).is_ptr(),
        "asked for the base of a non-pointer value"
    );
    match &func.value(v).kind {
        // An incoming argument is a base by the input contract.
        ValueKind::Arg { .. } => Ok(v),
        // Null shows up in dead paths and proven-null indexing; it is its
        // own (degenerate) base. Undef likewise, from partially optimized
        // code.
        ValueKind::NullPtr | ValueKind::Undef => Ok(v),
        ValueKind::GlobalAddr { .. } => {
            debug_assert!(
                config.all_functions,
                "global as a gc base outside test mode"
            );
            Ok(v)
        }
        ValueKind::ConstInt { .. } => {
            unreachable!("integer constant cannot have gc pointer type")
        }
        ValueKind::Dead => panic!("base query on removed value"),
        ValueKind::Inst { kind, .. } => match kind {
            // The slot address names the storage itself.
            InstKind::StackSlot { .. } => {
                debug_assert!(config.all_functions, "stack slot as a gc base outside test mode");
                Ok(v)
            }
            // A loaded pointer had better be a base in the heap.
            InstKind::Load { .. } => Ok(v),
            // Atomics are load/store pairs; the loaded value is a base.
            InstKind::CmpXchg { .. } | InstKind::AtomicXchg { .. } => Ok(v),
            // A field of an aggregate is a definition, like a load.
            InstKind::ExtractField { .. } => Ok(v),
            // Managed runtime calls only return managed objects.
            InstKind::Call { .. } => Ok(v),
            InstKind::Statepoint { .. }
            | InstKind::Relocate { .. }
            | InstKind::StatepointResult { .. } => {
                panic!("re-running safepoint insertion on transformed IR is not supported")
            }
            // Casts defer to their source.
            InstKind::PtrCast { value } => {
                let inner = *value;
                if let Some(InstKind::IntToPtr { .. }) = func.inst(inner) {
                    int_to_ptr_base(func, inner, config)
                } else {
                    find_base_defining_value(func, inner, config)
                }
            }
            InstKind::IntToPtr { .. } => int_to_ptr_base(func, v, config),
            // The address computation's base pointer is the base.
            InstKind::FieldAddr { base, .. } => find_base_defining_value(func, *base, config),
            // Merges select dynamically; resolved by the lattice.
            InstKind::Phi { .. } | InstKind::Select { .. } => Ok(v),
            other => panic!("no base defining value for instruction {:?}", other),
        },
    }
}

/// Pointers manufactured from integers have no object to relocate. The
/// frontend can vouch for one; test mode shrugs and pretends.
fn int_to_ptr_base(func: &Function, v: ValueId, config: &PassConfig) -> PassResult<ValueId> {
    if let Some(InstKind::IntToPtr { frontend_base, .. }) = func.inst(v) {
        if *frontend_base {
            return Ok(v);
        }
        if config.all_functions {
            log::warn!("treating int-to-ptr {:?} as a manufactured base", v);
            return Ok(v);
        }
    }
    Err(PassError::IntToPtrBase { value: v })
}

fn find_bdv_cached(
    func: &Function,
    cache: &mut BdvCache,
    v: ValueId,
    config: &PassConfig,
) -> PassResult<ValueId> {
    if let Some(cached) = cache.get(v) {
        return Ok(cached);
    }
    let bdv = find_base_defining_value(func, v, config)?;
    log::trace!("bdv: {:?} -> {:?}", v, bdv);
    cache.map.insert(v, bdv);
    Ok(bdv)
}

/// The base of `v` when already resolved, otherwise its base defining
/// value. Callers must check `is_known_base` on the result.
fn find_base_or_bdv(
    func: &Function,
    cache: &mut BdvCache,
    v: ValueId,
    config: &PassConfig,
) -> PassResult<ValueId> {
    let def = find_bdv_cached(func, cache, v, config)?;
    // A second hop through the cache picks up the upgraded base relation.
    Ok(cache.get(def).unwrap_or(def))
}

// =============================================================================
// Merge lattice
// =============================================================================

/// Per-merge lattice state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeState {
    Unknown,
    Base(ValueId),
    Conflict,
}

impl MergeState {
    fn meet(a: MergeState, b: MergeState) -> MergeState {
        use MergeState::*;
        match (a, b) {
            (Unknown, x) | (x, Unknown) => x,
            (Conflict, _) | (_, Conflict) => Conflict,
            (Base(x), Base(y)) => {
                if x == y {
                    Base(x)
                } else {
                    Conflict
                }
            }
        }
    }

    /// Meet with the commutativity check the algorithm leans on.
    fn meet_checked(a: MergeState, b: MergeState) -> MergeState {
        debug_assert_eq!(
            MergeState::meet(a, b),
            MergeState::meet(b, a),
            "meet must commute"
        );
        MergeState::meet(a, b)
    }
}

/// Arena-style lattice table for one top-level resolution. Created, filled
/// and discarded per call; it never outlives the resolution.
#[derive(Debug, Default)]
struct LatticeTable {
    nodes: Vec<(ValueId, MergeState)>,
    index: FxHashMap<ValueId, usize>,
}

impl LatticeTable {
    fn add(&mut self, v: ValueId) -> bool {
        if self.index.contains_key(&v) {
            return false;
        }
        self.index.insert(v, self.nodes.len());
        self.nodes.push((v, MergeState::Unknown));
        true
    }

    fn state(&self, v: ValueId) -> Option<MergeState> {
        self.index.get(&v).map(|&i| self.nodes[i].1)
    }

    fn set(&mut self, v: ValueId, s: MergeState) {
        let i = self.index[&v];
        self.nodes[i].1 = s;
    }
}

/// Incoming operands of a merge, paired with the insertion point used when
/// a cast is needed for that edge.
fn merge_inputs(func: &Function, v: ValueId) -> SmallVec<[ValueId; 4]> {
    match func.inst(v) {
        Some(InstKind::Phi { incomings, .. }) => incomings.iter().map(|&(_, x)| x).collect(),
        Some(InstKind::Select {
            on_true, on_false, ..
        }) => SmallVec::from_slice(&[*on_true, *on_false]),
        _ => unreachable!("not a merge"),
    }
}

// =============================================================================
// Base resolution
// =============================================================================

/// Find (or synthesize) the base pointer for one live value.
pub fn find_base_pointer(
    func: &mut Function,
    cache: &mut BdvCache,
    v: ValueId,
    new_defs: &mut FxHashSet<ValueId>,
    config: &PassConfig,
    stats: &mut PassStats,
) -> PassResult<ValueId> {
    let def = find_base_or_bdv(func, cache, v, config)?;
    if is_known_base(func, def) {
        return Ok(def);
    }

    // Close over every merge transitively reachable through incoming BDVs.
    let mut table = LatticeTable::default();
    table.add(def);
    let mut work = vec![def];
    while let Some(m) = work.pop() {
        for input in merge_inputs(func, m) {
            let local = find_base_or_bdv(func, cache, input, config)?;
            if !is_known_base(func, local) && table.add(local) {
                work.push(local);
            }
        }
    }

    // Optimistic meet propagation to a fixed point.
    let mut progress = true;
    while progress {
        progress = false;
        for i in 0..table.nodes.len() {
            let (m, old) = table.nodes[i];
            let mut acc = MergeState::Unknown;
            for input in merge_inputs(func, m) {
                let local = find_base_or_bdv(func, cache, input, config)?;
                let contribution = if is_known_base(func, local) {
                    MergeState::Base(local)
                } else {
                    table.state(local).expect("closed over all merges")
                };
                acc = MergeState::meet_checked(acc, contribution);
            }
            if acc != old {
                table.set(m, acc);
                progress = true;
            }
        }
    }

    if log::log_enabled!(log::Level::Trace) {
        for &(m, state) in &table.nodes {
            log::trace!("lattice: {:?} = {:?}", m, state);
        }
    }

    // Materialize a skeleton merge for every conflict.
    let mut resolved: FxHashMap<ValueId, ValueId> = FxHashMap::default();
    for i in 0..table.nodes.len() {
        let (m, state) = table.nodes[i];
        match state {
            MergeState::Unknown => unreachable!("optimistic meet left a node unknown"),
            MergeState::Base(b) => {
                resolved.insert(m, b);
            }
            MergeState::Conflict => {
                let ty = func.ty(m);
                let mkind = func.inst(m).expect("merge is an inst").clone();
                let skeleton = match mkind {
                    InstKind::Phi { incomings, .. } => {
                        let skel = func.insert_before(
                            m,
                            InstKind::Phi {
                                incomings,
                                is_base: true,
                            },
                            ty,
                        );
                        func.set_name(skel, "base_phi");
                        stats.base_phis += 1;
                        skel
                    }
                    InstKind::Select { cond, .. } => {
                        let undef = func.make_undef(ty);
                        let skel = func.insert_before(
                            m,
                            InstKind::Select {
                                cond,
                                on_true: undef,
                                on_false: undef,
                                is_base: true,
                            },
                            ty,
                        );
                        func.set_name(skel, "base_select");
                        stats.base_selects += 1;
                        skel
                    }
                    _ => unreachable!("conflict on a non-merge"),
                };
                new_defs.insert(skeleton);
                resolved.insert(m, skeleton);
            }
        }
    }

    // Fill skeleton operands with the bases of the original operands.
    for i in 0..table.nodes.len() {
        let (m, state) = table.nodes[i];
        if state != MergeState::Conflict {
            continue;
        }
        let skeleton = resolved[&m];
        let skel_ty = func.ty(skeleton);
        match func.inst(m).expect("merge").clone() {
            InstKind::Phi { incomings, .. } => {
                for (edge, (pred, input)) in incomings.iter().enumerate() {
                    let mut base =
                        operand_base(func, cache, &resolved, *input, config)?;
                    if func.ty(base) != skel_ty {
                        // Cast on the incoming edge, right before its
                        // terminator, so the phi still sees a dominating def.
                        let term = func.terminator(*pred);
                        base = func.insert_before(term, InstKind::PtrCast { value: base }, skel_ty);
                        func.set_name(base, "cast");
                        new_defs.insert(base);
                        stats.base_casts += 1;
                    }
                    if let Some(InstKind::Phi { incomings, .. }) = func.inst_mut(skeleton) {
                        incomings[edge].1 = base;
                    }
                }
            }
            InstKind::Select {
                on_true, on_false, ..
            } => {
                for (which, input) in [(true, on_true), (false, on_false)] {
                    let mut base = operand_base(func, cache, &resolved, input, config)?;
                    if func.ty(base) != skel_ty {
                        base =
                            func.insert_before(skeleton, InstKind::PtrCast { value: base }, skel_ty);
                        func.set_name(base, "cast");
                        new_defs.insert(base);
                        stats.base_casts += 1;
                    }
                    if let Some(InstKind::Select {
                        on_true, on_false, ..
                    }) = func.inst_mut(skeleton)
                    {
                        if which {
                            *on_true = base;
                        } else {
                            *on_false = base;
                        }
                    }
                }
            }
            _ => unreachable!(),
        }
    }

    // Upgrade the cache from the BDV relation to the base relation. Once a
    // known base is recorded for a value it must never change.
    for &(m, _) in &table.nodes {
        let base = resolved[&m];
        debug_assert!(is_known_base(func, base));
        if let Some(prior) = cache.get(m) {
            debug_assert!(
                !is_known_base(func, prior) || prior == base,
                "base relation must be stable"
            );
        }
        log::trace!("base cache: {:?} -> {:?}", m, base);
        cache.map.insert(m, base);
    }

    Ok(resolved[&def])
}

/// Base of one merge operand: a known base directly, or the resolution of
/// the merge it leads to.
fn operand_base(
    func: &mut Function,
    cache: &mut BdvCache,
    resolved: &FxHashMap<ValueId, ValueId>,
    input: ValueId,
    config: &PassConfig,
) -> PassResult<ValueId> {
    let b = find_base_or_bdv(func, cache, input, config)?;
    if is_known_base(func, b) {
        Ok(b)
    } else {
        Ok(*resolved.get(&b).expect("unresolved merge operand"))
    }
}

/// Resolve bases for every value in a site's live set.
pub fn find_base_pointers_for_site(
    func: &mut Function,
    dom: &DominatorTree,
    cache: &mut BdvCache,
    record: &mut SafepointRecord,
    config: &PassConfig,
    stats: &mut PassStats,
) -> PassResult<()> {
    let live: Vec<ValueId> = record.liveset.iter().copied().collect();
    for v in live {
        let base = find_base_pointer(func, cache, v, &mut record.new_defs, config, stats)?;
        debug_assert!(
            func.ty(base).is_gc_ptr(),
            "a gc pointer must be based on a gc pointer"
        );
        debug_assert!(
            !func.is_inst(base)
                || !func.is_inst(v)
                || dom.dominates(
                    func.inst_block(base).expect("placed"),
                    func.inst_block(v).expect("placed")
                ),
            "base must dominate the derived pointer"
        );
        record.base_pairs.insert(v, base);
    }
    if log::log_enabled!(log::Level::Debug) {
        for (d, b) in &record.base_pairs {
            log::debug!("base pair: derived {:?} base {:?}", d, b);
        }
    }
    Ok(())
}

// =============================================================================
// Liveness fixup for inserted defs
// =============================================================================

/// Every base referenced by the live set must itself be relocated, so later
/// safepoints can read the relocated base. Missing bases are appended and
/// self-mapped.
pub fn add_bases_as_live(
    liveset: &mut FxHashSet<ValueId>,
    base_pairs: &mut FxHashMap<ValueId, ValueId>,
) {
    let mut missing: Vec<ValueId> = Vec::new();
    for v in liveset.iter() {
        let base = *base_pairs.get(v).expect("every live value has a base");
        if !liveset.contains(&base) && !missing.contains(&base) {
            missing.push(base);
        }
    }
    for base in missing {
        liveset.insert(base);
        base_pairs.insert(base, base);
    }
    debug_assert_eq!(liveset.len(), base_pairs.len());
}

/// After base insertion, newly created merges can themselves be live at
/// *other* parse points. Recheck each site against the whole set of
/// inserted defs; every inserted def is its own base.
pub fn fixup_liveness_local(
    func: &Function,
    cfg: &Cfg,
    dom: &DominatorTree,
    all_new_defs: &FxHashSet<ValueId>,
    record: &mut SafepointRecord,
) {
    add_bases_as_live(&mut record.liveset, &mut record.base_pairs);

    for &new_def in all_new_defs {
        if record.liveset.contains(&new_def) {
            continue;
        }
        if !dom.value_dominates_inst(func, new_def, record.site) {
            continue;
        }
        if liveness_has_use_across(func, cfg, record.site, new_def) {
            record.liveset.insert(new_def);
            record.base_pairs.insert(new_def, new_def);
        }
    }
}

fn liveness_has_use_across(func: &Function, cfg: &Cfg, site: ValueId, def: ValueId) -> bool {
    for user in func.users(def) {
        let use_points: SmallVec<[ValueId; 2]> = match func.inst(user) {
            Some(InstKind::Phi { incomings, .. }) => incomings
                .iter()
                .filter(|&&(_, v)| v == def)
                .map(|&(pred, _)| func.terminator(pred))
                .collect(),
            Some(_) => SmallVec::from_slice(&[user]),
            None => SmallVec::new(),
        };
        for up in use_points {
            if liveness::reachable_not_via_def(func, cfg, site, up, def) {
                return true;
            }
        }
    }
    false
}

/// Dataflow-mode fixup: take the recomputed live set wholesale, fold in
/// inserted defs, and re-establish the base invariants.
pub fn fixup_liveness_dataflow(
    func: &Function,
    revised: &LivenessMap,
    all_new_defs: &FxHashSet<ValueId>,
    record: &mut SafepointRecord,
) {
    let mut updated = liveness::live_at_site_dataflow(func, revised, record.site);

    // Inserted values live here need not be bases of an original live
    // value; they are their own base.
    for &v in &updated {
        if all_new_defs.contains(&v) {
            record.base_pairs.entry(v).or_insert(v);
        }
    }

    // Later code assumes every base is itself a (self-mapped) pair.
    let bases: Vec<ValueId> = record.base_pairs.values().copied().collect();
    for b in bases {
        record.base_pairs.entry(b).or_insert(b);
    }

    // A base that is not otherwise live still has to ride in the
    // statepoint so its relocation exists.
    for &b in record.base_pairs.values() {
        updated.insert(b);
    }

    if cfg!(debug_assertions) {
        for &v in &updated {
            debug_assert!(
                record.liveset.contains(&v)
                    || record.base_pairs.contains_key(&v)
                    || all_new_defs.contains(&v),
                "liveness analysis not stable"
            );
        }
    }

    record.liveset = updated;
    let SafepointRecord {
        liveset,
        base_pairs,
        ..
    } = record;
    base_pairs.retain(|d, _| liveset.contains(d));
    debug_assert_eq!(record.liveset.len(), record.base_pairs.len());
}

// =============================================================================
// Tests
// =============================================================================
