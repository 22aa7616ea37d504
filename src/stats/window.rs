//! Lock-free counter buckets and the lazily rotating window slot.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use arc_swap::ArcSwap;

use super::Outcome;

/// Retries a reader spends waiting for in-flight writers.
pub const READ_ATTEMPTS: u32 = 1_024;

/// Counter values of one bucket read at a single logical instant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    pub req_count: u64,
    pub bytes_tx: u64,
    pub errors_4xx: u64,
    pub errors_5xx: u64,
}

/// Counters of one window instance, starting at `start_millis`.
///
/// Writers never wait: they bump `started`, add, then bump `completed`.
/// A reader retries until it sees no writer in flight across its whole read,
/// which makes every snapshot a consistent cut of all four counters. After
/// [`READ_ATTEMPTS`] failed attempts the reader settles for a plain load, so a
/// writer descheduled mid-update delays readers but never stalls them.
#[derive(Debug)]
pub struct Bucket {
    start_millis: u64,
    started: AtomicU64,
    completed: AtomicU64,
    req_count: AtomicU64,
    bytes_tx: AtomicU64,
    errors_4xx: AtomicU64,
    errors_5xx: AtomicU64,
}

impl Bucket {
    pub fn new(start_millis: u64) -> Self {
        Self {
            start_millis,
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            req_count: AtomicU64::new(0),
            bytes_tx: AtomicU64::new(0),
            errors_4xx: AtomicU64::new(0),
            errors_5xx: AtomicU64::new(0),
        }
    }

    pub fn start_millis(&self) -> u64 {
        self.start_millis
    }

    /// Add one event. `count_request` is false for completion reports that
    /// only carry bytes and the error class of an already counted request.
    pub fn add(&self, outcome: Outcome, bytes: u64, count_request: bool) {
        self.started.fetch_add(1, Ordering::SeqCst);
        if count_request {
            self.req_count.fetch_add(1, Ordering::SeqCst);
        }
        if bytes > 0 {
            self.bytes_tx.fetch_add(bytes, Ordering::SeqCst);
        }
        match outcome {
            Outcome::Success => {}
            Outcome::Error4xx => {
                self.errors_4xx.fetch_add(1, Ordering::SeqCst);
            }
            Outcome::Error5xx => {
                self.errors_5xx.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn read(&self) -> Counters {
        for attempt in 1..=READ_ATTEMPTS {
            let completed = self.completed.load(Ordering::SeqCst);
            let started = self.started.load(Ordering::SeqCst);
            if started == completed {
                let counters = self.load();
                if self.started.load(Ordering::SeqCst) == started {
                    return counters;
                }
            }

            if attempt % 64 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
        self.load()
    }

    fn load(&self) -> Counters {
        Counters {
            req_count: self.req_count.load(Ordering::SeqCst),
            bytes_tx: self.bytes_tx.load(Ordering::SeqCst),
            errors_4xx: self.errors_4xx.load(Ordering::SeqCst),
            errors_5xx: self.errors_5xx.load(Ordering::SeqCst),
        }
    }
}

/// One configured window size for one series.
///
/// The current bucket is swapped out lazily by whichever reader or writer
/// first observes that its time slot has passed. A writer that loaded the old
/// bucket just before the swap still lands in it, so every event is counted in
/// exactly one bucket.
pub struct WindowSlot {
    duration_millis: u64,
    current: ArcSwap<Bucket>,
    archive: Mutex<VecDeque<Arc<Bucket>>>,
    archive_depth: usize,
}

impl WindowSlot {
    pub fn new(duration_secs: u64, archive_depth: usize, now: u64) -> Self {
        let duration_millis = duration_secs.max(1).saturating_mul(1000);
        Self {
            duration_millis,
            current: ArcSwap::from_pointee(Bucket::new(align(now, duration_millis))),
            archive: Mutex::new(VecDeque::with_capacity(archive_depth)),
            archive_depth,
        }
    }

    pub fn duration_secs(&self) -> u64 {
        self.duration_millis / 1000
    }

    /// Bucket covering `now`, rotating the stale one into the archive first.
    ///
    /// An event observed with a time older than the current bucket (clock skew
    /// between callers) is attributed to the current bucket.
    pub fn current(&self, now: u64) -> Arc<Bucket> {
        let slot_start = align(now, self.duration_millis);
        loop {
            let cur = self.current.load_full();
            if cur.start_millis() >= slot_start {
                return cur;
            }

            let fresh = Arc::new(Bucket::new(slot_start));
            let prev = self.current.compare_and_swap(&cur, fresh);
            if Arc::ptr_eq(&*prev, &cur) {
                self.push_archive(cur);
            }
        }
    }

    /// The window that ended at the last boundary before `now`.
    ///
    /// `None` when nothing was recorded in it.
    pub fn previous(&self, now: u64) -> Option<Arc<Bucket>> {
        let slot_start = align(now, self.duration_millis);
        let wanted = slot_start.checked_sub(self.duration_millis)?;
        self.current(now);
        let archive = self.archive.lock().unwrap_or_else(|e| e.into_inner());
        archive
            .iter()
            .rev()
            .find(|b| b.start_millis() == wanted)
            .cloned()
    }

    /// Start of the window that ended at the last boundary before `now`.
    pub fn previous_start(&self, now: u64) -> u64 {
        align(now, self.duration_millis).saturating_sub(self.duration_millis)
    }

    /// Closed buckets, newest first.
    pub fn archived(&self) -> Vec<Arc<Bucket>> {
        let archive = self.archive.lock().unwrap_or_else(|e| e.into_inner());
        archive.iter().rev().cloned().collect()
    }

    fn push_archive(&self, bucket: Arc<Bucket>) {
        if self.archive_depth == 0 {
            return;
        }
        let mut archive = self.archive.lock().unwrap_or_else(|e| e.into_inner());
        if archive.len() == self.archive_depth {
            archive.pop_front();
        }
        archive.push_back(bucket);
    }
}

fn align(now: u64, duration_millis: u64) -> u64 {
    now - now % duration_millis
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_bucket_counts() {
        let bucket = Bucket::new(0);
        bucket.add(Outcome::Success, 100, true);
        bucket.add(Outcome::Error4xx, 0, true);
        bucket.add(Outcome::Error5xx, 20, false);
        assert_eq!(
            bucket.read(),
            Counters {
                req_count: 2,
                bytes_tx: 120,
                errors_4xx: 1,
                errors_5xx: 1,
            }
        );
    }

    #[test]
    fn test_slot_rotates_lazily_and_archives() {
        let slot = WindowSlot::new(60, 2, 30_000);
        slot.current(30_000).add(Outcome::Success, 0, true);
        assert_eq!(slot.current(59_999).read().req_count, 1);

        let next = slot.current(60_000);
        assert_eq!(next.start_millis(), 60_000);
        assert_eq!(next.read().req_count, 0);
        assert_eq!(slot.archived().len(), 1);
        assert_eq!(slot.archived()[0].read().req_count, 1);

        slot.current(120_000);
        slot.current(180_000);
        let archived = slot.archived();
        assert_eq!(archived.len(), 2);
        assert_eq!(archived[0].start_millis(), 120_000);
    }

    #[test]
    fn test_previous_window() {
        let slot = WindowSlot::new(60, 4, 30_000);
        slot.current(59_999).add(Outcome::Success, 0, true);
        assert!(slot.previous(59_999).is_none());

        let prev = slot.previous(60_001).unwrap();
        assert_eq!(prev.start_millis(), 0);
        assert_eq!(prev.read().req_count, 1);

        // an idle window in between means the previous one saw nothing
        assert!(slot.previous(180_000).is_none());
        assert_eq!(slot.previous_start(180_000), 120_000);
    }

    #[test]
    fn test_late_writer_lands_in_exactly_one_bucket() {
        let slot = WindowSlot::new(1, 4, 0);
        let old = slot.current(0);
        // another caller rotates the window
        let new = slot.current(1_000);
        old.add(Outcome::Success, 0, true);

        assert_eq!(new.read().req_count, 0);
        assert_eq!(slot.archived()[0].read().req_count, 1);

        // a skewed timestamp from the previous slot joins the current bucket
        slot.current(999).add(Outcome::Success, 0, true);
        assert_eq!(new.read().req_count, 1);
    }

    #[test]
    fn test_concurrent_rotation_loses_nothing() {
        let slot = Arc::new(WindowSlot::new(1, 64, 0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let slot = slot.clone();
                thread::spawn(move || {
                    for i in 0..1_000u64 {
                        // walks through ten consecutive one second slots
                        slot.current(i * 10).add(Outcome::Success, 1, true);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut total = slot.current(9_999).read().req_count;
        total += slot
            .archived()
            .iter()
            .map(|b| b.read().req_count)
            .sum::<u64>();
        assert_eq!(total, 4_000);
    }

    #[test]
    fn test_read_gives_up_on_a_stuck_writer() {
        let bucket = Bucket::new(0);
        bucket.add(Outcome::Success, 7, true);
        // a writer that bumped `started` and never finished
        bucket.started.fetch_add(1, Ordering::SeqCst);
        let c = bucket.read();
        assert_eq!(c.req_count, 1);
        assert_eq!(c.bytes_tx, 7);
    }

    #[test]
    fn test_huge_window_does_not_overflow() {
        let slot = WindowSlot::new(u64::MAX, 1, 5_000);
        let bucket = slot.current(10_000);
        assert_eq!(bucket.start_millis(), 0);
        assert_eq!(slot.duration_secs(), u64::MAX / 1000);
    }

    #[test]
    fn test_snapshot_is_consistent_under_writes() {
        let bucket = Arc::new(Bucket::new(0));
        let writer = {
            let bucket = bucket.clone();
            thread::spawn(move || {
                for _ in 0..10_000 {
                    bucket.add(Outcome::Error5xx, 3, true);
                }
            })
        };
        for _ in 0..1_000 {
            let c = bucket.read();
            assert_eq!(c.bytes_tx, c.req_count * 3);
            assert_eq!(c.errors_5xx, c.req_count);
        }
        writer.join().unwrap();
    }
}
