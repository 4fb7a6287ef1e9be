use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of B-link tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlinkStatsSnapshot {
    /// Leaf pages searched
    pub leaf_searches: u64,
    /// Branch pages searched
    pub branch_searches: u64,
    /// Leaf splits (root splits excluded)
    pub leaf_splits: u64,
    /// Branch splits (root splits excluded)
    pub branch_splits: u64,
    /// Root splits; each adds one level
    pub root_splits: u64,
    /// Underflowed pages spliced out of their level
    pub unchains: u64,
    /// Root collapses; each removes one level
    pub root_collapses: u64,
    /// Right-link hops taken because a key moved past a high key
    pub move_rights: u64,
    /// Descents restarted after hitting a released page
    pub descend_retries: u64,
    /// Iterator reopen hints that were still valid
    pub hint_hits: u64,
    /// Iterator reopen hints that forced a full descent
    pub hint_misses: u64,
    /// Values written to the blob store instead of inline
    pub externalized_values: u64,
}

/// Thread-safe statistics tracking for B-link tree operations.
#[derive(Default)]
pub struct BlinkStats {
    leaf_searches: AtomicU64,
    branch_searches: AtomicU64,
    leaf_splits: AtomicU64,
    branch_splits: AtomicU64,
    root_splits: AtomicU64,
    unchains: AtomicU64,
    root_collapses: AtomicU64,
    move_rights: AtomicU64,
    descend_retries: AtomicU64,
    hint_hits: AtomicU64,
    hint_misses: AtomicU64,
    externalized_values: AtomicU64,
}

macro_rules! bump {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub(crate) fn $name(&self) {
                self.$field.fetch_add(1, AtomicOrdering::Relaxed);
            }
        )*
    };
}

impl BlinkStats {
    bump! {
        inc_leaf_searches => leaf_searches,
        inc_branch_searches => branch_searches,
        inc_leaf_splits => leaf_splits,
        inc_branch_splits => branch_splits,
        inc_root_splits => root_splits,
        inc_unchains => unchains,
        inc_root_collapses => root_collapses,
        inc_move_rights => move_rights,
        inc_descend_retries => descend_retries,
        inc_hint_hits => hint_hits,
        inc_hint_misses => hint_misses,
        inc_externalized_values => externalized_values,
    }

    /// Returns the number of root splits so far.
    pub fn root_splits(&self) -> u64 {
        self.root_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of hint misses so far.
    pub fn hint_misses(&self) -> u64 {
        self.hint_misses.load(AtomicOrdering::Relaxed)
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> BlinkStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(AtomicOrdering::Relaxed);
        BlinkStatsSnapshot {
            leaf_searches: load(&self.leaf_searches),
            branch_searches: load(&self.branch_searches),
            leaf_splits: load(&self.leaf_splits),
            branch_splits: load(&self.branch_splits),
            root_splits: load(&self.root_splits),
            unchains: load(&self.unchains),
            root_collapses: load(&self.root_collapses),
            move_rights: load(&self.move_rights),
            descend_retries: load(&self.descend_retries),
            hint_hits: load(&self.hint_hits),
            hint_misses: load(&self.hint_misses),
            externalized_values: load(&self.externalized_values),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "sombra_blink::stats",
            leaf_searches = snapshot.leaf_searches,
            branch_searches = snapshot.branch_searches,
            leaf_splits = snapshot.leaf_splits,
            branch_splits = snapshot.branch_splits,
            root_splits = snapshot.root_splits,
            unchains = snapshot.unchains,
            root_collapses = snapshot.root_collapses,
            move_rights = snapshot.move_rights,
            descend_retries = snapshot.descend_retries,
            hint_hits = snapshot.hint_hits,
            hint_misses = snapshot.hint_misses,
            externalized_values = snapshot.externalized_values,
            "blink stats snapshot"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_bumps() {
        let stats = BlinkStats::default();
        stats.inc_root_splits();
        stats.inc_hint_misses();
        stats.inc_hint_misses();
        stats.inc_externalized_values();
        assert_eq!(stats.root_splits(), 1);
        assert_eq!(stats.hint_misses(), 2);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.externalized_values, 1);
        assert_eq!(snapshot.leaf_splits, 0);
        stats.emit_tracing();
    }
}
