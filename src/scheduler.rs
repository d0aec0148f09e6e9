//! Deadline scheduler for timed transport actions
//!
//! One worker thread owns a min-heap keyed by wall-clock target instant and
//! sleeps on a channel until the next deadline or a wake-up message. There is
//! no polling loop: the sleep is exactly the gap to the earliest deadline.
//! Jobs run on the worker and receive their skew (actual minus target, in
//! microseconds) so callers can report timing quality.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::clock::wall_micros;

/// A job scheduled for a wall-clock instant; receives skew in microseconds
pub type ScheduledJob = Box<dyn FnOnce(i64) + Send>;

struct Entry {
    target_micros: u64,
    seq: u64,
    id: u64,
    job: ScheduledJob,
}

// Min-heap order: earliest target first, insertion order breaking ties.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .target_micros
            .cmp(&self.target_micros)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.target_micros == other.target_micros && self.seq == other.seq
    }
}

impl Eq for Entry {}

enum Msg {
    Schedule(Entry),
    Cancel(u64),
    CancelAfter(u64),
    Shutdown,
}

/// Handle to a scheduled action, valid until its deadline enters the
/// worker's current tick
#[derive(Debug, Clone)]
pub struct ScheduleHandle {
    id: u64,
    tx: Sender<Msg>,
}

impl ScheduleHandle {
    /// Identifier of the scheduled action
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Request cancellation.
    ///
    /// Best-effort: an action whose deadline has already been reached by the
    /// worker fires anyway.
    pub fn cancel(&self) {
        let _ = self.tx.send(Msg::Cancel(self.id));
    }
}

/// Deadline scheduler with a single worker thread
pub struct Scheduler {
    tx: Sender<Msg>,
    next_id: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Create the scheduler and start its worker thread
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        let worker = std::thread::Builder::new()
            .name("skc-scheduler".to_string())
            .spawn(move || worker_loop(&rx))
            .expect("failed to spawn scheduler worker");

        Self {
            tx,
            next_id: AtomicU64::new(1),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Schedule `job` to run at the wall-clock instant `target_micros`.
    ///
    /// A target at or before now runs immediately on the worker with the
    /// observed skew.
    pub fn schedule_at<F>(&self, target_micros: u64, job: F) -> ScheduleHandle
    where
        F: FnOnce(i64) + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let entry = Entry {
            target_micros,
            seq: id,
            id,
            job: Box::new(job),
        };
        let _ = self.tx.send(Msg::Schedule(entry));
        ScheduleHandle {
            id,
            tx: self.tx.clone(),
        }
    }

    /// Cancel every pending action with a target after `cutoff_micros`.
    ///
    /// Used by the shutdown flow: actions inside the grace window still fire,
    /// everything further out is dropped.
    pub fn cancel_after(&self, cutoff_micros: u64) {
        let _ = self.tx.send(Msg::CancelAfter(cutoff_micros));
    }

    /// Stop the worker, dropping all pending actions
    pub fn shutdown(&self) {
        let _ = self.tx.send(Msg::Shutdown);
        if let Ok(mut guard) = self.worker.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let _ = self.tx.send(Msg::Shutdown);
    }
}

#[allow(clippy::cast_possible_wrap)]
fn worker_loop(rx: &Receiver<Msg>) {
    let mut heap: BinaryHeap<Entry> = BinaryHeap::new();
    let mut alive: HashSet<u64> = HashSet::new();
    let mut cancelled: HashSet<u64> = HashSet::new();

    loop {
        // Fire everything that is due. Once an entry is popped here it is
        // inside the current tick and can no longer be cancelled.
        let now = wall_micros();
        while heap.peek().is_some_and(|e| e.target_micros <= now) {
            let entry = heap.pop().expect("peeked entry");
            alive.remove(&entry.id);
            if cancelled.remove(&entry.id) {
                continue;
            }
            let fired_at = wall_micros();
            let skew = fired_at as i64 - entry.target_micros as i64;
            tracing::trace!(id = entry.id, skew_us = skew, "firing scheduled action");
            (entry.job)(skew);
        }

        let msg = match heap.peek() {
            Some(next) => {
                let wait = next.target_micros.saturating_sub(wall_micros());
                match rx.recv_timeout(Duration::from_micros(wait)) {
                    Ok(msg) => msg,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
            None => match rx.recv() {
                Ok(msg) => msg,
                Err(_) => return,
            },
        };

        match msg {
            Msg::Schedule(entry) => {
                alive.insert(entry.id);
                heap.push(entry);
            }
            Msg::Cancel(id) => {
                if alive.contains(&id) {
                    cancelled.insert(id);
                }
            }
            Msg::CancelAfter(cutoff) => {
                for entry in &heap {
                    if entry.target_micros > cutoff {
                        cancelled.insert(entry.id);
                    }
                }
            }
            Msg::Shutdown => return,
        }
    }
}
