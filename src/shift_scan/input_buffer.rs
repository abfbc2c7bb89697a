//! Two-tier per-key verdict history with bounded capacity.
//!
//! The hot history absorbs ordered inserts cheaply; when it overflows it
//! is merged into the cold history in one stable pass. When the cold
//! history overflows, the lowest-position prefix is evicted and returned
//! to the caller so its aggregate counts can be folded into segment
//! state. Analysis reads the merged view of both tiers.
//!
//! # Invariants
//! - `hot.len() <= hot_capacity` and `cold.len() <= cold_capacity` after
//!   every operation.
//! - Both histories are individually sorted by `(commit_position, hour)`;
//!   their concatenation need not be (hot may hold newer out-of-order
//!   inserts until compaction).
//! - Compaction is stable: on equal keys, cold (older) verdicts precede
//!   hot ones, so re-inserting an identical verdict set yields an
//!   identical buffer.
//!
//! # Cost
//! - Insertion is O(hot) per verdict; compaction is O(hot + cold).

use super::verdict::PositionVerdict;

/// Default hot history capacity.
pub const DEFAULT_HOT_CAPACITY: usize = 100;
/// Default cold history capacity.
pub const DEFAULT_COLD_CAPACITY: usize = 2000;

/// An ordered run of verdicts, sorted ascending by `(position, hour)`.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct History {
    /// Verdicts in sorted order.
    pub verdicts: Vec<PositionVerdict>,
}

impl History {
    /// Number of verdicts held.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.verdicts.len()
    }

    /// True when no verdicts are held.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.verdicts.is_empty()
    }

    /// Smallest commit position held, if any.
    #[must_use]
    pub fn min_position(&self) -> Option<u64> {
        self.verdicts.first().map(|v| v.commit_position)
    }

    /// Largest commit position held, if any.
    #[must_use]
    pub fn max_position(&self) -> Option<u64> {
        self.verdicts.last().map(|v| v.commit_position)
    }

    /// Inserts `v` at its ordered position.
    ///
    /// Equal keys insert after existing entries, keeping insertion order
    /// stable for repeated positions.
    fn ordered_insert(&mut self, v: PositionVerdict) {
        let key = v.order_key();
        let idx = self.verdicts.partition_point(|e| e.order_key() <= key);
        self.verdicts.insert(idx, v);
    }

    fn truncate_below(&mut self, position: u64) {
        let keep_from = self
            .verdicts
            .partition_point(|v| v.commit_position < position);
        if keep_from > 0 {
            self.verdicts.drain(..keep_from);
        }
    }

    #[cfg(debug_assertions)]
    fn is_sorted(&self) -> bool {
        self.verdicts
            .windows(2)
            .all(|w| w[0].order_key() <= w[1].order_key())
    }
}

/// Bounded two-tier verdict history for one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputBuffer {
    /// Recent inserts, merged into cold on overflow.
    pub hot: History,
    /// Long-tail history, evicted from the front on overflow.
    pub cold: History,
    /// Hot capacity; exceeding it triggers compaction.
    pub hot_capacity: usize,
    /// Cold capacity; exceeding it triggers prefix eviction.
    pub cold_capacity: usize,
    /// True when hot changed since the last store round-trip.
    pub hot_dirty: bool,
    /// True when cold changed since the last store round-trip.
    pub cold_dirty: bool,
}

impl InputBuffer {
    /// Creates an empty buffer with explicit capacities.
    ///
    /// # Panics
    ///
    /// Panics when either capacity is zero; a zero-capacity tier cannot
    /// hold the verdict that triggered its own compaction.
    #[must_use]
    pub fn new(hot_capacity: usize, cold_capacity: usize) -> Self {
        assert!(hot_capacity > 0, "hot capacity must be > 0");
        assert!(cold_capacity > 0, "cold capacity must be > 0");
        Self {
            hot: History::default(),
            cold: History::default(),
            hot_capacity,
            cold_capacity,
            hot_dirty: false,
            cold_dirty: false,
        }
    }

    /// Creates an empty buffer with the default capacities.
    #[must_use]
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_HOT_CAPACITY, DEFAULT_COLD_CAPACITY)
    }

    /// Total verdicts across both tiers.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.hot.len() + self.cold.len()
    }

    /// True when both tiers are empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hot.is_empty() && self.cold.is_empty()
    }

    /// Smallest commit position across both tiers.
    #[must_use]
    pub fn min_position(&self) -> Option<u64> {
        match (self.hot.min_position(), self.cold.min_position()) {
            (Some(h), Some(c)) => Some(h.min(c)),
            (h, c) => h.or(c),
        }
    }

    /// Largest commit position across both tiers.
    #[must_use]
    pub fn max_position(&self) -> Option<u64> {
        match (self.hot.max_position(), self.cold.max_position()) {
            (Some(h), Some(c)) => Some(h.max(c)),
            (h, c) => h.or(c),
        }
    }

    /// Largest hour across both tiers' final entries.
    #[must_use]
    pub fn max_hour(&self) -> Option<u64> {
        let h = self.hot.verdicts.last().map(|v| v.hour);
        let c = self.cold.verdicts.last().map(|v| v.hour);
        match (h, c) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Inserts a verdict, compacting and evicting as needed.
    ///
    /// Returns the evicted lowest-position prefix (usually empty). The
    /// caller folds the evicted verdicts' counts into segment state so no
    /// history is lost, only compressed.
    #[must_use = "evicted verdicts must be folded into segment counts"]
    pub fn insert(&mut self, v: PositionVerdict) -> Vec<PositionVerdict> {
        self.hot.ordered_insert(v);
        self.hot_dirty = true;
        if self.hot.len() > self.hot_capacity {
            return self.compact();
        }
        Vec::new()
    }

    /// Merges hot into cold and evicts cold down to capacity.
    ///
    /// Idempotent on an already-empty hot history.
    #[must_use = "evicted verdicts must be folded into segment counts"]
    pub fn compact(&mut self) -> Vec<PositionVerdict> {
        if !self.hot.is_empty() {
            debug_assert!(self.hot.is_sorted(), "hot history out of order");
            debug_assert!(self.cold.is_sorted(), "cold history out of order");

            let hot = std::mem::take(&mut self.hot.verdicts);
            let cold = std::mem::take(&mut self.cold.verdicts);
            let mut merged = Vec::with_capacity(hot.len() + cold.len());

            // Stable two-pointer merge; cold (older) wins ties.
            let mut hot_iter = hot.into_iter().peekable();
            let mut cold_iter = cold.into_iter().peekable();
            loop {
                match (cold_iter.peek(), hot_iter.peek()) {
                    (Some(c), Some(h)) => {
                        if c.order_key() <= h.order_key() {
                            merged.push(cold_iter.next().expect("peeked cold entry"));
                        } else {
                            merged.push(hot_iter.next().expect("peeked hot entry"));
                        }
                    }
                    (Some(_), None) => merged.push(cold_iter.next().expect("peeked cold entry")),
                    (None, Some(_)) => merged.push(hot_iter.next().expect("peeked hot entry")),
                    (None, None) => break,
                }
            }

            self.cold.verdicts = merged;
            self.hot_dirty = true;
            self.cold_dirty = true;
        }

        if self.cold.len() > self.cold_capacity {
            let evict = self.cold.len() - self.cold_capacity;
            let evicted: Vec<PositionVerdict> = self.cold.verdicts.drain(..evict).collect();
            self.cold_dirty = true;
            return evicted;
        }
        Vec::new()
    }

    /// Drops all verdicts with commit position strictly below `position`.
    pub fn truncate_below(&mut self, position: u64) {
        let hot_before = self.hot.len();
        let cold_before = self.cold.len();
        self.hot.truncate_below(position);
        self.cold.truncate_below(position);
        if self.hot.len() != hot_before {
            self.hot_dirty = true;
        }
        if self.cold.len() != cold_before {
            self.cold_dirty = true;
        }
    }

    /// Returns the merged ascending view of both tiers.
    #[must_use]
    pub fn merged(&self) -> Vec<PositionVerdict> {
        let mut merged = Vec::with_capacity(self.len());
        let mut hot_iter = self.hot.verdicts.iter().peekable();
        let mut cold_iter = self.cold.verdicts.iter().peekable();
        loop {
            match (cold_iter.peek(), hot_iter.peek()) {
                (Some(c), Some(h)) => {
                    if c.order_key() <= h.order_key() {
                        merged.push((*cold_iter.next().expect("peeked cold entry")).clone());
                    } else {
                        merged.push((*hot_iter.next().expect("peeked hot entry")).clone());
                    }
                }
                (Some(_), None) => {
                    merged.push((*cold_iter.next().expect("peeked cold entry")).clone());
                }
                (None, Some(_)) => {
                    merged.push((*hot_iter.next().expect("peeked hot entry")).clone());
                }
                (None, None) => break,
            }
        }
        merged
    }

    /// Clears the dirty flags after a successful store round-trip.
    pub fn mark_clean(&mut self) {
        self.hot_dirty = false;
        self.cold_dirty = false;
    }
}
