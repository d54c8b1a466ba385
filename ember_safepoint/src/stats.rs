//! Pass statistics.
//!
//! Plain counters accumulated while transforming one module. The pass is
//! single-threaded, so these are ordinary integers.

use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    /// Functions actually transformed.
    pub functions_modified: u64,
    /// Functions skipped (declarations, not opted in, the poll itself).
    pub functions_skipped: u64,
    pub entry_polls: u64,
    pub backedge_polls: u64,
    /// Backedges left alone because the loop is provably finite.
    pub finite_loops_skipped: u64,
    /// Call sites turned into parse points (poll slow paths included).
    pub parse_points: u64,
    pub statepoints: u64,
    pub relocates: u64,
    pub result_projections: u64,
    /// Merges synthesized by base-pointer resolution.
    pub base_phis: u64,
    pub base_selects: u64,
    pub base_casts: u64,
    /// Stack slots created and then eliminated by relocation rewriting.
    pub relocation_slots: u64,
}

impl PassStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absorb(&mut self, other: &PassStats) {
        self.functions_modified += other.functions_modified;
        self.functions_skipped += other.functions_skipped;
        self.entry_polls += other.entry_polls;
        self.backedge_polls += other.backedge_polls;
        self.finite_loops_skipped += other.finite_loops_skipped;
        self.parse_points += other.parse_points;
        self.statepoints += other.statepoints;
        self.relocates += other.relocates;
        self.result_projections += other.result_projections;
        self.base_phis += other.base_phis;
        self.base_selects += other.base_selects;
        self.base_casts += other.base_casts;
        self.relocation_slots += other.relocation_slots;
    }
}

impl fmt::Display for PassStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "safepoint pass:")?;
        writeln!(
            f,
            "  functions: {} modified, {} skipped",
            self.functions_modified, self.functions_skipped
        )?;
        writeln!(
            f,
            "  polls: {} entry, {} backedge ({} finite loops skipped)",
            self.entry_polls, self.backedge_polls, self.finite_loops_skipped
        )?;
        writeln!(
            f,
            "  statepoints: {} ({} parse points, {} relocates, {} results)",
            self.statepoints, self.parse_points, self.relocates, self.result_projections
        )?;
        write!(
            f,
            "  bases: {} phis, {} selects, {} casts; {} slots round-tripped",
            self.base_phis, self.base_selects, self.base_casts, self.relocation_slots
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absorb_sums() {
        let mut a = PassStats::new();
        a.statepoints = 2;
        a.relocates = 5;
        let mut b = PassStats::new();
        b.statepoints = 1;
        b.base_phis = 3;
        a.absorb(&b);
        assert_eq!(a.statepoints, 3);
        assert_eq!(a.relocates, 5);
        assert_eq!(a.base_phis, 3);
    }

    #[test]
    fn test_display_mentions_counts() {
        let mut s = PassStats::new();
        s.statepoints = 4;
        let text = format!("{}", s);
        assert!(text.contains("statepoints: 4"));
    }
}
