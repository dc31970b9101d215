//! Per-event-type aggregation.
//!
//! Pure and total: never fails, performs no I/O. Grouping is ASCII
//! case-insensitive; the spelling kept for each group is the first one
//! observed in input order.

use std::collections::HashMap;

use crate::job::{RawEvent, ResultRow};

/// Collapse a job's raw events into ordered `(event_type, count)` rows.
///
/// Output is sorted by event type, case-insensitive ascending; groups
/// whose folded keys compare equal keep first-observed order (the sort
/// is stable). Empty input yields empty output.
pub fn aggregate(events: &[RawEvent]) -> Vec<ResultRow> {
    let mut order: Vec<(String, String, i64)> = Vec::new(); // (folded, first spelling, count)
    let mut index: HashMap<String, usize> = HashMap::new();

    for event in events {
        let folded = event.event_type.to_ascii_lowercase();
        match index.get(&folded) {
            Some(&i) => order[i].2 += 1,
            None => {
                index.insert(folded.clone(), order.len());
                order.push((folded, event.event_type.clone(), 1));
            }
        }
    }

    order.sort_by(|a, b| a.0.cmp(&b.0));
    order
        .into_iter()
        .map(|(_, event_type, count)| ResultRow { event_type, count })
        .collect()
}
