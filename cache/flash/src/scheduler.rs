//! Cooperative job scheduler with per-key ordering.
//!
//! Jobs are hashed into shards; each shard is a FIFO executed by at most
//! one worker at a time, so all jobs sharing a key hash run in submission
//! order and never concurrently, while distinct shards run in parallel
//! across the worker pool. A shard count well above the worker count keeps
//! cross-key collisions rare.
//!
//! A job returning [`JobExitCode::Reschedule`] is re-queued behind later
//! arrivals for its shard; that return point is also the cooperative
//! cancellation point once [`JobScheduler::finish`] has been called.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_deque::{Injector, Steal};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// What a job asks the scheduler to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobExitCode {
    /// The job is complete.
    Done,
    /// Re-queue the job behind later arrivals for the same key.
    Reschedule,
}

type Job = Box<dyn FnMut() -> JobExitCode + Send>;

struct QueuedJob {
    job: Job,
    tag: &'static str,
}

struct Shard {
    queue: Mutex<VecDeque<QueuedJob>>,
    /// True while the shard sits in the ready queue or is being drained by
    /// a worker. At most one worker holds a shard at a time.
    scheduled: AtomicBool,
}

struct Inner {
    shards: Vec<Shard>,
    ready: Injector<usize>,
    pending: AtomicU64,
    stopped: AtomicBool,
    /// Workers park here when the ready queue is empty.
    park: Mutex<()>,
    park_cv: Condvar,
    /// `finish` waits here for `pending` to reach zero.
    drain: Mutex<()>,
    drain_cv: Condvar,
    executed: AtomicU64,
    rescheduled: AtomicU64,
}

/// Sharded cooperative scheduler over a fixed worker pool.
pub struct JobScheduler {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobScheduler {
    /// Spawn `num_workers` workers over `num_shards` FIFO shards.
    pub fn new(num_workers: usize, num_shards: usize) -> Self {
        assert!(num_workers > 0, "scheduler needs at least one worker");
        let num_shards = num_shards.max(num_workers);
        let shards = (0..num_shards)
            .map(|_| Shard {
                queue: Mutex::new(VecDeque::new()),
                scheduled: AtomicBool::new(false),
            })
            .collect();
        let inner = Arc::new(Inner {
            shards,
            ready: Injector::new(),
            pending: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            park: Mutex::new(()),
            park_cv: Condvar::new(),
            drain: Mutex::new(()),
            drain_cv: Condvar::new(),
            executed: AtomicU64::new(0),
            rescheduled: AtomicU64::new(0),
        });

        let mut workers = Vec::with_capacity(num_workers);
        for id in 0..num_workers {
            let inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("flash-worker-{id}"))
                .spawn(move || worker_loop(&inner))
                .expect("failed to spawn scheduler worker");
            workers.push(handle);
        }

        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Submit a job keyed by `key_hash`. Jobs sharing a hash execute in
    /// FIFO order and never concurrently with each other.
    ///
    /// Returns false (dropping the job) once [`finish`] has been called.
    ///
    /// [`finish`]: JobScheduler::finish
    pub fn enqueue_with_key(
        &self,
        key_hash: u64,
        tag: &'static str,
        job: impl FnMut() -> JobExitCode + Send + 'static,
    ) -> bool {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::Acquire) {
            return false;
        }
        inner.pending.fetch_add(1, Ordering::AcqRel);
        let shard_idx = (key_hash % inner.shards.len() as u64) as usize;
        let shard = &inner.shards[shard_idx];
        shard.queue.lock().push_back(QueuedJob {
            job: Box::new(job),
            tag,
        });
        if shard
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            inner.ready.push(shard_idx);
        }
        inner.park_cv.notify_one();
        true
    }

    /// Submit a job with no ordering requirement against any key.
    pub fn enqueue(
        &self,
        tag: &'static str,
        job: impl FnMut() -> JobExitCode + Send + 'static,
    ) -> bool {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        let hash = NEXT.fetch_add(1, Ordering::Relaxed);
        self.enqueue_with_key(hash, tag, job)
    }

    /// Block until every submitted job has completed.
    pub fn wait_until_idle(&self) {
        let mut guard = self.inner.drain.lock();
        while self.inner.pending.load(Ordering::Acquire) > 0 {
            self.inner
                .drain_cv
                .wait_for(&mut guard, Duration::from_millis(10));
        }
    }

    /// Drain all outstanding work and block further submissions. Running
    /// jobs observe the stop at their reschedule points; rescheduling
    /// continues to be honored until each job reports `Done`.
    pub fn finish(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            // Already finishing; just wait for the drain.
            self.wait_until_idle();
            return;
        }
        self.wait_until_idle();
        self.inner.park_cv.notify_all();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
        debug!(
            executed = self.inner.executed.load(Ordering::Relaxed),
            rescheduled = self.inner.rescheduled.load(Ordering::Relaxed),
            "scheduler drained"
        );
    }

    /// Whether `finish` has been called.
    pub fn stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Jobs executed to completion so far.
    pub fn executed(&self) -> u64 {
        self.inner.executed.load(Ordering::Relaxed)
    }

    /// Reschedule returns observed so far.
    pub fn rescheduled(&self) -> u64 {
        self.inner.rescheduled.load(Ordering::Relaxed)
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.finish();
    }
}

fn worker_loop(inner: &Inner) {
    loop {
        match inner.ready.steal() {
            Steal::Success(shard_idx) => drain_shard(inner, shard_idx),
            Steal::Retry => continue,
            Steal::Empty => {
                if inner.stopped.load(Ordering::Acquire)
                    && inner.pending.load(Ordering::Acquire) == 0
                {
                    return;
                }
                let mut guard = inner.park.lock();
                inner.park_cv.wait_for(&mut guard, Duration::from_millis(10));
            }
        }
    }
}

/// Run one scheduling round for a shard: each job present at entry runs at
/// most once, so a hot shard cannot starve the rest of the pool.
fn drain_shard(inner: &Inner, shard_idx: usize) {
    let shard = &inner.shards[shard_idx];
    let budget = shard.queue.lock().len();

    for _ in 0..budget {
        let entry = shard.queue.lock().pop_front();
        let Some(mut entry) = entry else { break };
        match (entry.job)() {
            JobExitCode::Done => {
                inner.executed.fetch_add(1, Ordering::Relaxed);
                if inner.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                    inner.drain_cv.notify_all();
                }
            }
            JobExitCode::Reschedule => {
                inner.rescheduled.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(tag = entry.tag, "job rescheduled");
                shard.queue.lock().push_back(entry);
            }
        }
    }

    shard.scheduled.store(false, Ordering::Release);
    // Jobs may have arrived (or been rescheduled) while we held the shard;
    // hand it back to the pool if so.
    if !shard.queue.lock().is_empty()
        && shard
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    {
        inner.ready.push(shard_idx);
        inner.park_cv.notify_one();
    }
}
