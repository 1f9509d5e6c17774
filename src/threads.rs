//! Fixed-size worker pool executing indexed work items.
//!
//! A [`Job`] is a range `[0, count)` of items plus a payload implementing
//! [`WorkItems`]. Every call to [`ThreadPool::submit`] enqueues one
//! participation request; the worker that picks it up claims item indices
//! from the job's shared cursor until the range is exhausted or the pool is
//! shutting down. Submitting the same job several times lets several workers
//! cooperate on it, and no index is ever claimed twice.
//!
//! Cancellation is cooperative: the shutdown flag is checked between items,
//! never while an item runs. The pool never looks at item results; payloads
//! record their own failures for the caller to inspect after [`Job::wait`].
//! A panicking item is caught, reported through [`WorkItems::panicked`] and
//! counted as completed; the worker keeps serving the queue.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::error::{GraphError, Result};

/// Payload of a job.
pub trait WorkItems: Send + Sync {
    /// Execute one item.
    fn run(&self, worker: &WorkerContext, item: u32);

    /// Called once by every worker that claimed at least one item, after its
    /// last item (also when it stopped early because of shutdown).
    fn cleanup(&self, _worker: &WorkerContext) {}

    /// Called instead of recording a result when `run` panicked on `item`.
    fn panicked(&self, _worker: &WorkerContext, _item: u32, _message: &str) {}
}

struct PoolShared {
    shutdown: AtomicBool,
    num_threads: usize,
}

/// Per-worker context, built once when the worker starts.
pub struct WorkerContext {
    id: usize,
    shared: Arc<PoolShared>,
}

impl WorkerContext {
    /// Stable worker id in `0..num_threads`
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn num_threads(&self) -> usize {
        self.shared.num_threads
    }

    pub fn shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

struct Task {
    job: Job,
    cursor: Option<Arc<AtomicU32>>,
}

#[derive(Default)]
struct Participation {
    /// Submitted but not yet picked up
    pending: usize,
    /// Picked up and not yet left
    active: usize,
}

struct JobInner {
    count: u32,
    cursor: AtomicU32,
    done: Arc<AtomicU32>,
    items: Arc<dyn WorkItems>,
    state: Mutex<Participation>,
    idle: Condvar,
}

/// Handle to a job. Cloning is cheap and every clone refers to the same job.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl Job {
    pub fn new<W: WorkItems + 'static>(count: u32, items: Arc<W>) -> Self {
        Self::with_progress(count, items, Arc::new(AtomicU32::new(0)))
    }

    /// Like [`Job::new`] but increments an external completed-items counter
    pub fn with_progress<W: WorkItems + 'static>(
        count: u32,
        items: Arc<W>,
        done: Arc<AtomicU32>,
    ) -> Self {
        Self {
            inner: Arc::new(JobInner {
                count,
                cursor: AtomicU32::new(0),
                done,
                items,
                state: Mutex::new(Participation::default()),
                idle: Condvar::new(),
            }),
        }
    }

    pub fn count(&self) -> u32 {
        self.inner.count
    }

    /// Number of completed items. Best effort while the job runs.
    pub fn progress(&self) -> u32 {
        self.inner.done.load(Ordering::Relaxed)
    }

    /// Number of item indices handed out so far
    pub fn claimed(&self) -> u32 {
        self.inner.cursor.load(Ordering::Acquire).min(self.inner.count)
    }

    /// Block until every submission of this job has been picked up and every
    /// participating worker has left it. Must not be called from a worker.
    pub fn wait(&self) {
        let mut state = self.inner.lock_state();
        while state.pending > 0 || state.active > 0 {
            state = self
                .inner
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn participate(&self, worker: &WorkerContext, cursor_out: Option<&AtomicU32>) {
        let inner = &self.inner;
        {
            let mut state = inner.lock_state();
            state.pending -= 1;
            state.active += 1;
        }
        // leaves the job even if an item panics, so waiters never hang
        let _leave = LeaveGuard(inner);

        let mut claimed_any = false;
        while !worker.shutting_down() {
            let Some(item) = inner.claim() else { break };
            claimed_any = true;
            if let Some(cursor) = cursor_out {
                cursor.store(item, Ordering::Release);
            }
            let ran = panic::catch_unwind(AssertUnwindSafe(|| inner.items.run(worker, item)));
            if let Err(payload) = ran {
                let message = panic_message(payload.as_ref());
                warn!("Worker {} panicked on item {}: {}", worker.id, item, message);
                inner.items.panicked(worker, item, &message);
            }
            inner.done.fetch_add(1, Ordering::AcqRel);
        }

        // a participation only ends on exhaustion or shutdown, both final,
        // so a worker can claim items in at most one participation per job
        if claimed_any {
            inner.items.cleanup(worker);
        }
    }

    fn drain(&self) {
        {
            let mut state = self.inner.lock_state();
            state.pending -= 1;
        }
        self.inner.idle.notify_all();
    }

    fn enqueued(&self) {
        self.inner.lock_state().pending += 1;
    }
}

impl JobInner {
    fn lock_state(&self) -> MutexGuard<'_, Participation> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(&self) -> Option<u32> {
        let mut current = self.cursor.load(Ordering::Acquire);
        loop {
            if current >= self.count {
                return None;
            }
            match self.cursor.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current),
                Err(actual) => current = actual,
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct LeaveGuard<'a>(&'a JobInner);

impl Drop for LeaveGuard<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.0.lock_state();
            state.active -= 1;
        }
        self.0.idle.notify_all();
    }
}

/// Worker pool. Dropping it shuts down and joins every worker.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Start `num_threads` workers (at least one)
    pub fn new(num_threads: usize) -> Result<Self> {
        let num_threads = num_threads.max(1);
        let shared = Arc::new(PoolShared {
            shutdown: AtomicBool::new(false),
            num_threads,
        });
        let (sender, receiver) = unbounded::<Task>();

        let mut workers = Vec::with_capacity(num_threads);
        for id in 0..num_threads {
            let ctx = WorkerContext {
                id,
                shared: Arc::clone(&shared),
            };
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("pipegraph-worker-{}", id))
                .spawn(move || worker_loop(ctx, receiver))?;
            workers.push(handle);
        }

        info!("Thread pool started with {} workers", num_threads);

        Ok(Self {
            shared,
            sender: Some(sender),
            workers,
        })
    }

    /// One worker per available core
    pub fn with_available_parallelism() -> Result<Self> {
        let n = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self::new(n)
    }

    pub fn num_threads(&self) -> usize {
        self.shared.num_threads
    }

    /// Enqueue one participation request for `job`
    pub fn submit(&self, job: &Job) -> Result<()> {
        self.enqueue(job, None)
    }

    /// Like [`ThreadPool::submit`], additionally storing the last item index
    /// the participating worker claimed into `cursor`
    pub fn submit_with_cursor(&self, job: &Job, cursor: Arc<AtomicU32>) -> Result<()> {
        self.enqueue(job, Some(cursor))
    }

    /// Submit `participants` requests (clamped to the pool size and item
    /// count) and wait for the job to finish
    pub fn run(&self, job: &Job, participants: usize) -> Result<()> {
        let n = participants
            .min(self.num_threads())
            .min(job.count() as usize)
            .max(1);
        for _ in 0..n {
            self.submit(job)?;
        }
        job.wait();
        Ok(())
    }

    fn enqueue(&self, job: &Job, cursor: Option<Arc<AtomicU32>>) -> Result<()> {
        let sender = self.sender.as_ref().ok_or(GraphError::Cancelled)?;
        job.enqueued();
        let task = Task {
            job: job.clone(),
            cursor,
        };
        if let Err(returned) = sender.send(task) {
            returned.0.job.drain();
            return Err(GraphError::Cancelled);
        }
        Ok(())
    }

    /// Ask every worker to abandon remaining items. Items already running
    /// finish normally and cleanups still fire.
    pub fn shutdown(&self) {
        if !self.shared.shutdown.swap(true, Ordering::AcqRel) {
            debug!("Thread pool shutdown requested");
        }
    }

    pub fn shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Shut down and join every worker
    pub fn join(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown();
        // closing the queue lets workers drain it and exit
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("Worker thread exited with a panic");
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(ctx: WorkerContext, receiver: Receiver<Task>) {
    debug!("Worker {} started", ctx.id);
    while let Ok(task) = receiver.recv() {
        if ctx.shutting_down() {
            task.job.drain();
            continue;
        }
        task.job.participate(&ctx, task.cursor.as_deref());
    }
    debug!("Worker {} exiting", ctx.id);
}
