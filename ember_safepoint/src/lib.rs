//! GC safepoint insertion for the ember IR.
//!
//! A whole-function transformation that makes compiled code cooperate with
//! a relocating collector. Two concepts drive everything:
//!
//! - a **poll** is inlined code that checks whether the runtime wants the
//!   thread to stop, placed at function entry, on backedges of loops that
//!   may run unbounded, and implicitly at every non-leaf call;
//! - a **parse point** is a call across which the collector may relocate
//!   objects; every GC pointer live there is enumerated in a statepoint
//!   and re-read through a relocation projection afterwards.
//!
//! The pipeline per function:
//!
//! ```text
//! select polls (A) → inline polls (B) → liveness (C) → base pointers (D)
//!     → statepoints (E) → relocation rewriting (F)
//! ```
//!
//! Polls are placed first so the slow-path runtime calls they introduce
//! are parse points like any other. Base resolution for *all* sites
//! completes before any statepoint is materialized, and use rewriting runs
//! only after all materialization, so liveness queries never observe a
//! half-transformed function.

pub mod base;
pub mod config;
pub mod error;
pub mod liveness;
pub mod poll;
pub mod relocate;
pub mod select;
pub mod statepoint;
pub mod stats;

pub use config::{PassConfig, VerifyLevel};
pub use error::{PassError, PassResult};
pub use select::POLL_FUNCTION_NAME;
pub use statepoint::{SafepointRecord, SiteState};
pub use stats::PassStats;

use base::BdvCache;
use ember_ir::{
    verify_function, Cfg, DominatorTree, FuncId, Function, Module, Signature, ValueId,
};
use rustc_hash::FxHashSet;

// =============================================================================
// Pass entry points
// =============================================================================

pub struct PlaceSafepoints {
    config: PassConfig,
}

impl PlaceSafepoints {
    pub fn new(config: PassConfig) -> Self {
        PlaceSafepoints { config }
    }

    #[inline]
    pub fn config(&self) -> &PassConfig {
        &self.config
    }

    /// Transform every participating function in the module.
    pub fn run_module(&self, module: &mut Module) -> PassResult<PassStats> {
        let mut stats = PassStats::new();
        let ids: Vec<FuncId> = module.funcs.ids().collect();
        for id in ids {
            let per_fn = self.run_function(module, id)?;
            stats.absorb(&per_fn);
        }
        log::debug!("{}", stats);
        Ok(stats)
    }

    /// Transform a single function.
    pub fn run_function(&self, module: &mut Module, id: FuncId) -> PassResult<PassStats> {
        let mut stats = PassStats::new();
        {
            let func = module.get(id);
            if func.is_declaration()
                || func.name == POLL_FUNCTION_NAME
                || !self.participates(func)
            {
                stats.functions_skipped += 1;
                return Ok(stats);
            }
        }

        // Detach the function so the module stays readable (callee
        // attributes, the poll body) while we mutate it.
        let placeholder = Function::new("<in-flight>", Signature::default());
        let mut func = std::mem::replace(module.get_mut(id), placeholder);
        let outcome = self.transform(module, &mut func, &mut stats);
        *module.get_mut(id) = func;
        outcome?;
        Ok(stats)
    }

    fn participates(&self, func: &Function) -> bool {
        self.config.all_functions
            || func.attr_true(select::ATTR_ENTRY)
            || func.attr_true(select::ATTR_BACKEDGE)
            || func.attr_true(select::ATTR_CALL)
    }

    fn verify_at(
        &self,
        level: VerifyLevel,
        func: &Function,
        phase: &'static str,
    ) -> PassResult<()> {
        if self.config.verify >= level {
            verify_function(func).map_err(|message| PassError::VerifyFailed { phase, message })?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Whole-function pipeline
    // -------------------------------------------------------------------------

    fn transform(
        &self,
        module: &Module,
        func: &mut Function,
        stats: &mut PassStats,
    ) -> PassResult<()> {
        let config = &self.config;
        log::debug!("placing safepoints in @{}", func.name);

        self.verify_at(VerifyLevel::PrePost, func, "precondition")?;

        // Dominance and reachability are meaningless with unreachable
        // blocks around.
        func.remove_unreachable_blocks();

        // The poll implementation is only needed if some poll class fires.
        let wants_backedge = config.backedge_polls && select::should_run(func, select::ATTR_BACKEDGE, config);
        let wants_entry = config.entry_polls && select::should_run(func, select::ATTR_ENTRY, config);
        let poll_impl = if wants_backedge || wants_entry {
            match poll::find_poll_function(module, config)? {
                Some(id) => Some((id, module.get(id).clone())),
                // Reducer-friendly clean exit: leave the function alone.
                None => return Ok(()),
            }
        } else {
            None
        };

        let mut parse_points: Vec<ValueId> = Vec::new();
        let mut modified = false;

        // --- Backedge polls (A + B) ------------------------------------------
        if wants_backedge {
            let locations = select::find_backedge_poll_locations(func, config, stats);
            let (poll_id, poll_body) = poll_impl.as_ref().expect("poll fetched");
            for location in locations {
                let points = poll::insert_poll(func, module, *poll_id, poll_body, location)?;
                parse_points.extend(points);
                stats.backedge_polls += 1;
                modified = true;
                self.verify_at(VerifyLevel::Fine, func, "backedge poll")?;
            }
        }

        // --- Entry poll (A + B) ----------------------------------------------
        // Selected after backedge insertion so the entry chain walk sees
        // the final control flow.
        if wants_entry {
            if let Some(location) = select::find_entry_poll_location(func, config) {
                let (poll_id, poll_body) = poll_impl.as_ref().expect("poll fetched");
                let points = poll::insert_poll(func, module, *poll_id, poll_body, location)?;
                parse_points.extend(points);
                stats.entry_polls += 1;
                modified = true;
            }
        }
        self.verify_at(VerifyLevel::Phases, func, "poll insertion")?;

        // --- Call safepoints (A) ---------------------------------------------
        if config.call_polls {
            parse_points.extend(select::find_call_safepoints(module, func, config));
        }

        // A runtime call found both by poll inlining and the call scan must
        // be processed once.
        select::unique_unsorted(&mut parse_points);
        stats.parse_points += parse_points.len() as u64;

        if !parse_points.is_empty() {
            self.insert_parse_points(func, &parse_points, stats)?;
            modified = true;
        }

        self.verify_at(VerifyLevel::PrePost, func, "postcondition")?;
        if modified {
            stats.functions_modified += 1;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Parse point pipeline (C..F)
    // -------------------------------------------------------------------------

    fn insert_parse_points(
        &self,
        func: &mut Function,
        parse_points: &[ValueId],
        stats: &mut PassStats,
    ) -> PassResult<()> {
        let config = &self.config;
        debug_assert!(
            {
                let unique: FxHashSet<ValueId> = parse_points.iter().copied().collect();
                unique.len() == parse_points.len()
            },
            "no duplicate parse points"
        );

        // The CFG is stable from here on: C and D add instructions but
        // never blocks or edges.
        let cfg = Cfg::build(func);
        let dom = DominatorTree::build(&cfg);

        // --- C: liveness per site --------------------------------------------
        let global = config
            .dataflow_liveness
            .then(|| liveness::compute_liveness(func));
        let mut records: Vec<SafepointRecord> = Vec::with_capacity(parse_points.len());
        for &site in parse_points {
            let mut record = SafepointRecord::new(site);
            record.liveset = match &global {
                Some(data) => liveness::live_at_site_dataflow(func, data, site),
                None => liveness::live_at_site_local(func, &cfg, &dom, site),
            };
            log::debug!(
                "parse point {:?}: {} live gc values",
                site,
                record.liveset.len()
            );
            record.advance(SiteState::LivenessComputed);
            records.push(record);
        }

        // --- D: base pointers, one shared cache ------------------------------
        let mut cache = BdvCache::new();
        for record in &mut records {
            base::find_base_pointers_for_site(func, &dom, &mut cache, record, config, stats)?;
        }

        // Base insertion may have created merges that are live at *other*
        // sites; recheck every site against the union of inserted defs.
        let all_new_defs: FxHashSet<ValueId> = records
            .iter()
            .flat_map(|r| r.new_defs.iter().copied())
            .collect();
        let revised = config
            .dataflow_liveness
            .then(|| liveness::compute_liveness(func));
        for record in &mut records {
            match &revised {
                Some(data) => base::fixup_liveness_dataflow(func, data, &all_new_defs, record),
                None => base::fixup_liveness_local(func, &cfg, &dom, &all_new_defs, record),
            }
            record.advance(SiteState::BasesResolved);
        }

        if config.base_rewrite_only {
            return Ok(());
        }

        // --- E: materialize every site ---------------------------------------
        for record in &mut records {
            statepoint::materialize(func, record, config, stats);
        }

        // Adjust users of the original calls, then drop the calls. Doing
        // this after *all* materialization keeps live operands of earlier
        // statepoints pointing at defs until the very end.
        for record in &records {
            if let Some(result) = record.result {
                func.replace_all_uses(record.site, result);
            }
            func.remove_inst(record.site);
        }
        self.verify_at(VerifyLevel::Phases, func, "materialization")?;

        // --- F: rewrite uses through relocations ------------------------------
        relocate::relocation_via_slots(func, &mut records, stats);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
