//! Unique token generation for maildir filename prefixes.

use chrono::Utc;
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

/// Produces collision-free `(timestamp, sequence)` pairs for filename
/// prefixes within one process.
///
/// In-process uniqueness is necessary but not sufficient: on-disk
/// uniqueness additionally relies on the pid and hostname embedded in
/// the prefix plus exclusive creation of the staging file.
pub trait Sequencer: Send + Sync {
    /// Returns the next `(timestamp, sequence)` pair for the given
    /// timestamp, defaulting to the current time in seconds. The first
    /// call for a distinct timestamp yields sequence 0.
    fn next(&self, timestamp: Option<i64>) -> (i64, u32);
}

/// Sequencer keyed on wall-clock seconds, meant to be shared
/// process-wide between all stores writing to the same maildir tree.
#[derive(Debug, Default)]
pub struct TimeSequencer {
    slots: Mutex<HashMap<i64, u32>>,
}

impl Sequencer for TimeSequencer {
    fn next(&self, timestamp: Option<i64>) -> (i64, u32) {
        let timestamp = timestamp.unwrap_or_else(|| Utc::now().timestamp());
        // A poisoned lock only means another caller panicked between
        // the read and the write, the slot map itself stays usable.
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = slots
            .entry(timestamp)
            .and_modify(|seq| *seq += 1)
            .or_insert(0);
        (timestamp, *seq)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc, thread};

    use super::{Sequencer, TimeSequencer};

    #[test]
    fn sequences_start_at_zero_per_timestamp() {
        let sequencer = TimeSequencer::default();

        assert_eq!((42, 0), sequencer.next(Some(42)));
        assert_eq!((42, 1), sequencer.next(Some(42)));
        assert_eq!((43, 0), sequencer.next(Some(43)));
        assert_eq!((42, 2), sequencer.next(Some(42)));
    }

    #[test]
    fn concurrent_calls_never_collide() {
        let sequencer = Arc::new(TimeSequencer::default());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sequencer = sequencer.clone();
                thread::spawn(move || {
                    (0..50)
                        .map(|_| sequencer.next(Some(42)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seqs = HashSet::new();
        for handle in handles {
            for (timestamp, seq) in handle.join().unwrap() {
                assert_eq!(42, timestamp);
                assert!(seqs.insert(seq), "sequence {} issued twice", seq);
            }
        }

        // Sequences for one timestamp form a contiguous range from 0.
        assert_eq!(400, seqs.len());
        assert!((0..400).all(|seq| seqs.contains(&seq)));
    }
}
