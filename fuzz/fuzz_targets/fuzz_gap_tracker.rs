//! Fuzz target for gap tracking.
//!
//! Feeds arbitrary observation, requeue and expiry sequences into a
//! tracker and checks that the gap set stays well formed.

#![no_main]

use change_router::gap::{GapBudget, GapTracker};
use chrono::Utc;
use libfuzzer_sys::fuzz_target;
use std::time::Duration;

fuzz_target!(|ops: Vec<(u8, u16)>| {
    let mut tracker = GapTracker::new(
        "fuzz",
        GapBudget {
            max_rescans: 2,
            expire_after: Duration::ZERO,
            max_retries: 2,
        },
    );
    let now = Utc::now();

    for (op, value) in ops {
        let id = u64::from(value);
        match op % 4 {
            0 | 1 => {
                tracker.record_observed(id.max(1), now);
            }
            2 => {
                tracker.requeue(id, now);
            }
            _ => {
                let ranges: Vec<(u64, u64)> = tracker
                    .open_gaps()
                    .iter()
                    .map(|g| (g.start_id, g.end_id))
                    .collect();
                tracker.close_overdue(&ranges, now);
                tracker.record_rescan(&ranges);
                tracker.expire_due(now);
            }
        }

        if let Err(violation) = tracker.check_invariants() {
            panic!("invariant broken: {}", violation);
        }
    }
});
