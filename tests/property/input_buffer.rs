//! Property tests for the hot/cold input buffer.
//!
//! # Invariants
//! - Capacities hold after every insert.
//! - Evicted plus buffered verdicts always equal the inserted set, and
//!   eviction takes the lowest positions first.
//! - The merged view is sorted and matches a naive model.
//! - Identical insert sequences produce identical buffers.

use proptest::prelude::*;

use shift_scan_rs::shift_scan::{InputBuffer, PositionVerdict};

fn verdict_strategy() -> impl Strategy<Value = PositionVerdict> {
    (0u64..500, 0u64..100).prop_map(|(position, hour)| PositionVerdict::simple(position, hour))
}

fn caps_strategy() -> impl Strategy<Value = (usize, usize)> {
    (1usize..12, 1usize..40)
}

proptest! {
    #[test]
    fn capacities_hold_and_counts_conserve(
        (hot_cap, cold_cap) in caps_strategy(),
        verdicts in prop::collection::vec(verdict_strategy(), 0..300),
    ) {
        let mut buffer = InputBuffer::new(hot_cap, cold_cap);
        let mut evicted_total = 0usize;

        for v in &verdicts {
            let evicted = buffer.insert(v.clone());
            evicted_total += evicted.len();
            prop_assert!(buffer.hot.len() <= hot_cap);
            prop_assert!(buffer.cold.len() <= cold_cap);
        }

        prop_assert_eq!(evicted_total + buffer.len(), verdicts.len());
    }

    #[test]
    fn merged_view_matches_naive_sort(
        (hot_cap, cold_cap) in caps_strategy(),
        verdicts in prop::collection::vec(verdict_strategy(), 0..120),
    ) {
        // Keep the buffer large enough that nothing evicts, so the
        // merged view must be exactly the stably sorted input.
        let mut buffer = InputBuffer::new(hot_cap, cold_cap.max(120));
        for v in &verdicts {
            let evicted = buffer.insert(v.clone());
            prop_assert!(evicted.is_empty());
        }

        let merged: Vec<(u64, u64)> = buffer
            .merged()
            .iter()
            .map(|v| (v.commit_position, v.hour))
            .collect();

        let mut model: Vec<(u64, u64)> = verdicts
            .iter()
            .map(|v| (v.commit_position, v.hour))
            .collect();
        model.sort();

        prop_assert_eq!(merged, model);
    }

    #[test]
    fn eviction_removes_lowest_positions_first(
        mut verdicts in prop::collection::vec(verdict_strategy(), 1..200),
    ) {
        // Ascending ingest order models guarded use: the out-of-order
        // filter rejects positions below the analyzed frontier, so the
        // buffer never receives a position below an evicted one.
        verdicts.sort_by_key(PositionVerdict::order_key);

        let mut buffer = InputBuffer::new(5, 10);
        let mut evicted_all = Vec::new();
        for v in &verdicts {
            evicted_all.extend(buffer.insert(v.clone()));
        }

        if let (Some(max_evicted), Some(min_kept)) = (
            evicted_all.iter().map(|v| v.commit_position).max(),
            buffer.min_position(),
        ) {
            prop_assert!(
                max_evicted <= min_kept,
                "evicted {} above kept minimum {}",
                max_evicted,
                min_kept
            );
        }
    }

    #[test]
    fn identical_inputs_build_identical_buffers(
        (hot_cap, cold_cap) in caps_strategy(),
        verdicts in prop::collection::vec(verdict_strategy(), 0..150),
    ) {
        let build = || {
            let mut buffer = InputBuffer::new(hot_cap, cold_cap);
            let mut evicted = Vec::new();
            for v in &verdicts {
                evicted.extend(buffer.insert(v.clone()));
            }
            (buffer, evicted)
        };
        prop_assert_eq!(build(), build());
    }

    #[test]
    fn truncate_below_keeps_only_the_suffix(
        verdicts in prop::collection::vec(verdict_strategy(), 0..150),
        cut in 0u64..500,
    ) {
        let mut buffer = InputBuffer::new(10, 200);
        for v in &verdicts {
            let _ = buffer.insert(v.clone());
        }
        buffer.truncate_below(cut);

        prop_assert!(buffer.merged().iter().all(|v| v.commit_position >= cut));
    }
}
