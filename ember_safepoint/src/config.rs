//! Pass configuration.
//!
//! All knobs are carried in one explicit record threaded through the pass;
//! there is no process-wide state. Defaults match production behavior:
//! every safepoint class enabled, finite-loop pruning on, verification at
//! pass entry and exit.

// =============================================================================
// Verify Level
// =============================================================================

/// How aggressively to re-verify the IR while transforming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VerifyLevel {
    /// No verification.
    None,
    /// Verify the function before and after the whole pass.
    PrePost,
    /// Also verify after each major phase.
    Phases,
    /// Also verify at fine-grained internal points. Slow.
    Fine,
}

// =============================================================================
// Pass Config
// =============================================================================

#[derive(Debug, Clone)]
pub struct PassConfig {
    pub verify: VerifyLevel,
    /// Place backedge polls even on provably finite loops.
    pub all_backedges: bool,
    /// Stop after base pointers are resolved; isolates base-pointer bugs.
    pub base_rewrite_only: bool,
    /// Treat every function as opted in, and permit globals/stack slots as
    /// base sources. Test mode.
    pub all_functions: bool,
    /// Encode language-level abstract state into statepoints.
    pub use_abstract_state: bool,
    pub entry_polls: bool,
    pub backedge_polls: bool,
    pub call_polls: bool,
    /// Whole-function dataflow liveness instead of per-site queries.
    pub dataflow_liveness: bool,
    /// Turn configuration faults into clean no-op exits instead of errors,
    /// so automated test reduction does not mistake them for crashes.
    pub reducer_friendly: bool,
}

impl Default for PassConfig {
    fn default() -> Self {
        PassConfig {
            verify: VerifyLevel::PrePost,
            all_backedges: false,
            base_rewrite_only: false,
            all_functions: false,
            use_abstract_state: true,
            entry_polls: true,
            backedge_polls: true,
            call_polls: true,
            dataflow_liveness: false,
            reducer_friendly: false,
        }
    }
}

impl PassConfig {
    /// Test-mode configuration: all functions opt in, no abstract state.
    pub fn for_testing() -> Self {
        PassConfig {
            all_functions: true,
            use_abstract_state: false,
            verify: VerifyLevel::Phases,
            ..PassConfig::default()
        }
    }
}
