//! Fixed worker pool fed by a lazily started spooler thread.
//!
//! Each worker owns a command channel and a scratch buffer. The spooler pulls
//! jobs off the shared queue in submission order and hands each one to the
//! first idle worker, waiting for one to free up when all are busy. Finished
//! jobs land on a results list the owner drains.

use std::collections::VecDeque;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, LockResult, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::job::{Job, LoadError};
use crate::observability::{self, lock_unpoisoned, panic_payload_to_string};

const LOG_TARGET: &str = "inject::worker";

/// Smallest scratch allocation; also what a trim keeps.
pub const SCRATCH_MIN_BYTES: usize = 8 * 1024 * 1024;
/// A scratch buffer younger than this is never trimmed.
pub const SCRATCH_MIN_AGE: Duration = Duration::from_secs(5);
/// Idle time after which the spooler asks idle workers to trim.
pub const IDLE_TRIM_INTERVAL: Duration = Duration::from_millis(1500);

/// Per-worker reusable byte buffer for decompressed payloads.
#[derive(Debug, Default)]
pub struct ScratchBuffer {
    data: Vec<u8>,
    grown_at: Option<Instant>,
}

impl ScratchBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empties the buffer and makes room for at least `len` bytes.
    pub fn prepare(&mut self, len: usize) -> &mut Vec<u8> {
        self.data.clear();
        if self.data.capacity() < len {
            self.data.reserve(len.max(SCRATCH_MIN_BYTES));
            self.grown_at = Some(Instant::now());
        }
        &mut self.data
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Shrinks to `keep` bytes once the allocation is older than `min_age`.
    /// Returns the bytes given back.
    pub fn trim(&mut self, keep: usize, min_age: Duration) -> usize {
        let before = self.data.capacity();
        if before <= keep {
            return 0;
        }
        let old_enough = self
            .grown_at
            .map_or(true, |grown_at| grown_at.elapsed() >= min_age);
        if !old_enough {
            return 0;
        }
        self.data.clear();
        if keep == 0 {
            self.data = Vec::new();
            self.grown_at = None;
        } else {
            self.data.shrink_to(keep);
            self.grown_at = Some(Instant::now());
        }
        before - self.data.capacity()
    }
}

pub trait JobRunner: Send + Sync {
    /// Fills in `job.result`. Panics are caught by the worker.
    fn run(&self, job: &mut Job, scratch: &mut ScratchBuffer);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
    ShuttingDown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpoolerState {
    /// Pulling the next job off the queue.
    Draining,
    /// Queue empty; blocked until work arrives.
    Waiting,
    /// Holding a job until a worker takes it.
    Dispatching,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to spawn thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("worker pool {0} is shut down")]
    ShutDown(String),
}

/// A job handed back because the pool could not accept it.
#[derive(Debug)]
pub struct RejectedJob {
    pub job: Job,
    pub error: PoolError,
}

/// Generation counter bumped whenever any worker finishes a job.
#[derive(Debug, Default)]
pub struct CompletionSignal {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        *lock_unpoisoned(&self.generation) += 1;
        self.cond.notify_all();
    }

    pub fn generation(&self) -> u64 {
        *lock_unpoisoned(&self.generation)
    }

    /// Blocks until the generation moves past `seen` or `timeout` elapses.
    pub fn wait_past(&self, seen: u64, timeout: Duration) -> u64 {
        let guard = lock_unpoisoned(&self.generation);
        let (guard, _) = recover(
            self.cond
                .wait_timeout_while(guard, timeout, |generation| *generation == seen),
        );
        *guard
    }
}

enum WorkerCommand {
    Run(Job),
    Trim,
    Shutdown,
}

struct WorkerSlot {
    state: Mutex<WorkerState>,
    commands: mpsc::Sender<WorkerCommand>,
}

struct QueueState {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct PoolShared {
    name: String,
    runner: Arc<dyn JobRunner>,
    queue: Mutex<QueueState>,
    jobs_added: Condvar,
    results: Mutex<Vec<Job>>,
    workers: Vec<WorkerSlot>,
    freed: Mutex<u64>,
    worker_freed: Condvar,
    stopping: AtomicBool,
    spooler_state: Mutex<SpoolerState>,
    completion: Arc<CompletionSignal>,
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    spooler: Mutex<Option<JoinHandle<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Starts `threads` workers. The spooler starts on the first post.
    pub fn new(
        name: &str,
        threads: usize,
        runner: Arc<dyn JobRunner>,
        completion: Arc<CompletionSignal>,
    ) -> Result<Self, PoolError> {
        let threads = threads.max(1);
        let mut slots = Vec::with_capacity(threads);
        let mut receivers = Vec::with_capacity(threads);
        for _ in 0..threads {
            let (sender, receiver) = mpsc::channel();
            slots.push(WorkerSlot {
                state: Mutex::new(WorkerState::Idle),
                commands: sender,
            });
            receivers.push(receiver);
        }
        let pool = Self {
            shared: Arc::new(PoolShared {
                name: name.to_string(),
                runner,
                queue: Mutex::new(QueueState {
                    jobs: VecDeque::new(),
                    shutdown: false,
                }),
                jobs_added: Condvar::new(),
                results: Mutex::new(Vec::new()),
                workers: slots,
                freed: Mutex::new(0),
                worker_freed: Condvar::new(),
                stopping: AtomicBool::new(false),
                spooler_state: Mutex::new(SpoolerState::Waiting),
                completion,
            }),
            spooler: Mutex::new(None),
            threads: Mutex::new(Vec::with_capacity(threads)),
        };
        for (index, receiver) in receivers.into_iter().enumerate() {
            let shared = Arc::clone(&pool.shared);
            let thread_name = format!("{}-worker-{}", name, index);
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker_loop(&shared, index, receiver))
                .map_err(|source| PoolError::Spawn {
                    name: thread_name,
                    source,
                })?;
            lock_unpoisoned(&pool.threads).push(handle);
        }
        log::debug!(target: LOG_TARGET, "pool {} started {} workers", name, threads);
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn post(&self, job: Job) -> Result<(), RejectedJob> {
        if let Err(error) = self.ensure_spooler() {
            return Err(RejectedJob { job, error });
        }
        {
            let mut queue = lock_unpoisoned(&self.shared.queue);
            if queue.shutdown {
                return Err(RejectedJob {
                    job,
                    error: PoolError::ShutDown(self.shared.name.clone()),
                });
            }
            queue.jobs.push_back(job);
        }
        self.shared.jobs_added.notify_one();
        Ok(())
    }

    /// Takes every finished job.
    pub fn drain(&self) -> Vec<Job> {
        std::mem::take(&mut *lock_unpoisoned(&self.shared.results))
    }

    pub fn queue_length(&self) -> usize {
        lock_unpoisoned(&self.shared.queue).jobs.len()
    }

    pub fn busy_workers(&self) -> usize {
        self.worker_states()
            .into_iter()
            .filter(|state| *state == WorkerState::Busy)
            .count()
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.shared
            .workers
            .iter()
            .map(|slot| *lock_unpoisoned(&slot.state))
            .collect()
    }

    pub fn spooler_state(&self) -> SpoolerState {
        *lock_unpoisoned(&self.shared.spooler_state)
    }

    /// Queued, dispatching, running or undrained work exists.
    pub fn is_working(&self) -> bool {
        // Checked in the order a job moves through the pool so a job in
        // transit is never missed.
        self.queue_length() > 0
            || self.spooler_state() == SpoolerState::Dispatching
            || self.busy_workers() > 0
            || !lock_unpoisoned(&self.shared.results).is_empty()
    }

    /// Stops the spooler and every worker and joins them. Queued jobs that
    /// never started are dropped. Idempotent.
    pub fn shutdown(&self) {
        let dropped = {
            let mut queue = lock_unpoisoned(&self.shared.queue);
            queue.shutdown = true;
            let dropped = queue.jobs.len();
            queue.jobs.clear();
            dropped
        };
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.jobs_added.notify_all();
        self.shared.signal_freed();

        if let Some(handle) = lock_unpoisoned(&self.spooler).take() {
            let _ = handle.join();
        }
        let mut threads = lock_unpoisoned(&self.threads);
        if threads.is_empty() {
            return;
        }
        for slot in &self.shared.workers {
            let _ = slot.commands.send(WorkerCommand::Shutdown);
        }
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        if dropped > 0 {
            log::debug!(
                target: LOG_TARGET,
                "pool {} dropped {} queued jobs at shutdown",
                self.shared.name,
                dropped
            );
        }
    }

    fn ensure_spooler(&self) -> Result<(), PoolError> {
        let mut spooler = lock_unpoisoned(&self.spooler);
        if spooler.is_some() {
            return Ok(());
        }
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(PoolError::ShutDown(self.shared.name.clone()));
        }
        let shared = Arc::clone(&self.shared);
        let name = format!("{}-spooler", self.shared.name);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || spooler_loop(&shared))
            .map_err(|source| PoolError::Spawn { name, source })?;
        *spooler = Some(handle);
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PoolShared {
    fn set_spooler_state(&self, state: SpoolerState) {
        *lock_unpoisoned(&self.spooler_state) = state;
    }

    fn signal_freed(&self) {
        *lock_unpoisoned(&self.freed) += 1;
        self.worker_freed.notify_all();
    }

    fn next_job(&self) -> Option<Job> {
        let mut queue = lock_unpoisoned(&self.queue);
        loop {
            if queue.shutdown {
                return None;
            }
            self.set_spooler_state(SpoolerState::Draining);
            if let Some(job) = queue.jobs.pop_front() {
                self.set_spooler_state(SpoolerState::Dispatching);
                return Some(job);
            }
            self.set_spooler_state(SpoolerState::Waiting);
            let (guard, wait) =
                recover(self.jobs_added.wait_timeout(queue, IDLE_TRIM_INTERVAL));
            queue = guard;
            if wait.timed_out() && queue.jobs.is_empty() && !queue.shutdown {
                drop(queue);
                self.trim_idle_workers();
                queue = lock_unpoisoned(&self.queue);
            }
        }
    }

    /// Hands `job` to a worker, waiting for one to free up. Gives the job
    /// back when the pool stops first.
    fn dispatch(&self, mut job: Job) -> Result<(), Job> {
        loop {
            let seen = *lock_unpoisoned(&self.freed);
            match self.try_assign(job) {
                Ok(()) => return Ok(()),
                Err(back) => job = back,
            }
            let mut freed = lock_unpoisoned(&self.freed);
            while *freed == seen {
                if self.stopping.load(Ordering::Acquire) {
                    return Err(job);
                }
                freed = recover(self.worker_freed.wait_timeout(freed, IDLE_TRIM_INTERVAL)).0;
            }
        }
    }

    /// First idle worker gets the job; other idle workers are asked to trim.
    fn try_assign(&self, job: Job) -> Result<(), Job> {
        let mut pending = Some(job);
        for (index, slot) in self.workers.iter().enumerate() {
            let mut state = lock_unpoisoned(&slot.state);
            if *state != WorkerState::Idle {
                continue;
            }
            let Some(job) = pending.take() else {
                drop(state);
                let _ = slot.commands.send(WorkerCommand::Trim);
                continue;
            };
            *state = WorkerState::Busy;
            drop(state);
            if let Err(mpsc::SendError(command)) = slot.commands.send(WorkerCommand::Run(job)) {
                log::warn!(
                    target: LOG_TARGET,
                    "pool {} worker {} is gone",
                    self.name,
                    index
                );
                *lock_unpoisoned(&slot.state) = WorkerState::ShuttingDown;
                if let WorkerCommand::Run(job) = command {
                    pending = Some(job);
                }
            }
        }
        match pending {
            None => Ok(()),
            Some(job) => Err(job),
        }
    }

    fn trim_idle_workers(&self) {
        for slot in &self.workers {
            if *lock_unpoisoned(&slot.state) == WorkerState::Idle {
                let _ = slot.commands.send(WorkerCommand::Trim);
            }
        }
    }
}

fn spooler_loop(shared: &PoolShared) {
    while let Some(job) = shared.next_job() {
        if shared.dispatch(job).is_err() {
            break;
        }
    }
    shared.set_spooler_state(SpoolerState::Waiting);
}

fn worker_loop(shared: &PoolShared, index: usize, commands: mpsc::Receiver<WorkerCommand>) {
    let Some(slot) = shared.workers.get(index) else {
        return;
    };
    let mut scratch = ScratchBuffer::new();
    while let Ok(command) = commands.recv() {
        match command {
            WorkerCommand::Run(mut job) => {
                let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
                    shared.runner.run(&mut job, &mut scratch)
                }));
                if let Err(payload) = outcome {
                    let message = format!(
                        "{} job for {} panicked ({})",
                        shared.name,
                        job.fingerprint,
                        panic_payload_to_string(&*payload)
                    );
                    observability::set_sticky_error(message.clone());
                    job.result = Some(Err(LoadError::Panicked(message)));
                    job.finished = Some(Instant::now());
                }
                lock_unpoisoned(&shared.results).push(job);
                *lock_unpoisoned(&slot.state) = WorkerState::Idle;
                shared.signal_freed();
                shared.completion.notify();
            }
            WorkerCommand::Trim => {
                let released = scratch.trim(SCRATCH_MIN_BYTES, SCRATCH_MIN_AGE);
                if released > 0 {
                    log::debug!(
                        target: LOG_TARGET,
                        "{} worker {} trimmed {} KiB of scratch",
                        shared.name,
                        index,
                        released / 1024
                    );
                }
            }
            WorkerCommand::Shutdown => break,
        }
    }
    *lock_unpoisoned(&slot.state) = WorkerState::ShuttingDown;
    scratch.trim(0, Duration::ZERO);
}

fn recover<T>(result: LockResult<T>) -> T {
    match result {
        Ok(value) => value,
        Err(poisoned) => poisoned.into_inner(),
    }
}
