use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::archive::{reserve_hint, ArchiveError, ArchiveReader, Extracted};
use crate::fingerprint::Fingerprint;
use crate::observability::lock_unpoisoned;
use crate::resource::{levels_byte_size, FactoryError, ResourceFactory, ResourceRef};
use crate::worker::{JobRunner, ScratchBuffer};

/// Streamed archive loads above this size wait for a decompression slot.
pub const DECOMPRESS_GATE_BYTES: u64 = 32 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Background load; the original texture is shown until it lands.
    Stream,
    /// Load the renderer waits for before first use.
    Immediate,
    /// Regenerate the mip chain of the original source.
    Resample,
}

#[derive(Clone, Debug)]
pub enum JobSource {
    File(PathBuf),
    Archive {
        reader: Arc<ArchiveReader>,
        archive: usize,
        entry: usize,
    },
    Bytes(Arc<[u8]>),
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("read failed ({path}): {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Factory(#[from] FactoryError),
    #[error("{0:?} job has no usable source")]
    Source(JobKind),
    #[error("worker panicked: {0}")]
    Panicked(String),
    #[error("job finished without a result")]
    Incomplete,
}

#[derive(Clone, Debug)]
pub struct LoadedResource {
    pub resource: ResourceRef,
    /// Bytes the override adds to the cache total.
    pub byte_size: u64,
}

#[derive(Debug)]
pub struct Job {
    pub fingerprint: Fingerprint,
    pub kind: JobKind,
    pub source: JobSource,
    /// Payload size used for pool routing and decompression gating.
    pub size_hint: u64,
    pub submitted: Instant,
    pub started: Option<Instant>,
    pub finished: Option<Instant>,
    pub result: Option<Result<LoadedResource, LoadError>>,
}

impl Job {
    pub fn new(fingerprint: Fingerprint, kind: JobKind, source: JobSource, size_hint: u64) -> Self {
        Self {
            fingerprint,
            kind,
            source,
            size_hint,
            submitted: Instant::now(),
            started: None,
            finished: None,
            result: None,
        }
    }

    /// Submission to completion.
    pub fn elapsed(&self) -> Duration {
        self.finished
            .map(|finished| finished.saturating_duration_since(self.submitted))
            .unwrap_or_default()
    }

    /// Time spent on a worker.
    pub fn work_time(&self) -> Duration {
        match (self.started, self.finished) {
            (Some(started), Some(finished)) => finished.saturating_duration_since(started),
            _ => Duration::ZERO,
        }
    }

    pub fn queue_time(&self) -> Duration {
        self.started
            .map(|started| started.saturating_duration_since(self.submitted))
            .unwrap_or_default()
    }
}

/// Counting semaphore bounding concurrent large decompressions.
#[derive(Debug)]
pub struct DecompressSlots {
    free: Mutex<usize>,
    released: Condvar,
}

pub struct DecompressPermit<'a> {
    slots: &'a DecompressSlots,
}

impl DecompressSlots {
    pub fn new(slots: usize) -> Self {
        Self {
            free: Mutex::new(slots.max(1)),
            released: Condvar::new(),
        }
    }

    pub fn acquire(&self) -> DecompressPermit<'_> {
        let mut free = lock_unpoisoned(&self.free);
        while *free == 0 {
            free = match self.released.wait(free) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        *free -= 1;
        DecompressPermit { slots: self }
    }

    pub fn available(&self) -> usize {
        *lock_unpoisoned(&self.free)
    }
}

impl Drop for DecompressPermit<'_> {
    fn drop(&mut self) {
        *lock_unpoisoned(&self.slots.free) += 1;
        self.slots.released.notify_one();
    }
}

/// Cumulative totals plus live gauges for loads currently on a worker.
#[derive(Debug, Default)]
pub struct LoadCounters {
    pub streamed: AtomicU64,
    pub streamed_bytes: AtomicU64,
    pub resampled: AtomicU64,
    pub failed: AtomicU64,
    pub streaming: AtomicU64,
    pub streaming_bytes: AtomicU64,
    pub resampling: AtomicU64,
    /// References added to spliced destinations to mirror a cached entry.
    /// Nothing gives them back.
    pub mirrored_refs: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadCounterSnapshot {
    pub streamed: u64,
    pub streamed_bytes: u64,
    pub resampled: u64,
    pub failed: u64,
    pub streaming: u64,
    pub streaming_bytes: u64,
    pub resampling: u64,
    pub mirrored_refs: u64,
}

impl LoadCounters {
    pub fn snapshot(&self) -> LoadCounterSnapshot {
        LoadCounterSnapshot {
            streamed: self.streamed.load(Ordering::Relaxed),
            streamed_bytes: self.streamed_bytes.load(Ordering::Relaxed),
            resampled: self.resampled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            streaming: self.streaming.load(Ordering::Relaxed),
            streaming_bytes: self.streaming_bytes.load(Ordering::Relaxed),
            resampling: self.resampling.load(Ordering::Relaxed),
            mirrored_refs: self.mirrored_refs.load(Ordering::Relaxed),
        }
    }

    /// Raises the live gauges for `job` until the returned guard drops.
    pub fn begin(&self, job: &Job) -> ActiveLoad<'_> {
        let bytes = match job.kind {
            JobKind::Stream | JobKind::Immediate => {
                self.streaming.fetch_add(1, Ordering::Relaxed);
                self.streaming_bytes
                    .fetch_add(job.size_hint, Ordering::Relaxed);
                job.size_hint
            }
            JobKind::Resample => {
                self.resampling.fetch_add(1, Ordering::Relaxed);
                0
            }
        };
        ActiveLoad {
            counters: self,
            kind: job.kind,
            bytes,
        }
    }
}

pub struct ActiveLoad<'a> {
    counters: &'a LoadCounters,
    kind: JobKind,
    bytes: u64,
}

impl Drop for ActiveLoad<'_> {
    fn drop(&mut self) {
        match self.kind {
            JobKind::Stream | JobKind::Immediate => {
                self.counters.streaming.fetch_sub(1, Ordering::Relaxed);
                self.counters
                    .streaming_bytes
                    .fetch_sub(self.bytes, Ordering::Relaxed);
            }
            JobKind::Resample => {
                self.counters.resampling.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }
}

/// Executes load and resample jobs against the host factory.
pub struct LoadRunner {
    factory: Arc<dyn ResourceFactory>,
    decompress: Arc<DecompressSlots>,
    counters: Arc<LoadCounters>,
}

impl LoadRunner {
    pub fn new(
        factory: Arc<dyn ResourceFactory>,
        decompress: Arc<DecompressSlots>,
        counters: Arc<LoadCounters>,
    ) -> Self {
        Self {
            factory,
            decompress,
            counters,
        }
    }

    fn load(&self, job: &Job, scratch: &mut ScratchBuffer) -> Result<LoadedResource, LoadError> {
        match job.kind {
            JobKind::Stream | JobKind::Immediate => {
                let payload = self.read_source(job, scratch)?;
                let bytes = payload.slice(scratch.bytes());
                let resource = self.factory.create(bytes)?;
                self.counters.streamed.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .streamed_bytes
                    .fetch_add(payload.len as u64, Ordering::Relaxed);
                Ok(LoadedResource {
                    resource,
                    byte_size: payload.len as u64,
                })
            }
            JobKind::Resample => {
                let JobSource::Bytes(bytes) = &job.source else {
                    return Err(LoadError::Source(job.kind));
                };
                let resource = self.factory.resample(bytes)?;
                let byte_size = levels_byte_size(&resource.levels());
                self.counters.resampled.fetch_add(1, Ordering::Relaxed);
                Ok(LoadedResource {
                    resource,
                    byte_size,
                })
            }
        }
    }

    fn read_source(&self, job: &Job, scratch: &mut ScratchBuffer) -> Result<Extracted, LoadError> {
        match &job.source {
            JobSource::File(path) => {
                let io_err = |source| LoadError::Io {
                    path: path.clone(),
                    source,
                };
                let mut file = File::open(path).map_err(io_err)?;
                let len = file.metadata().map_err(io_err)?.len() as usize;
                let buffer = scratch.prepare(len);
                let read = file.read_to_end(buffer).map_err(io_err)?;
                Ok(Extracted {
                    offset: 0,
                    len: read,
                })
            }
            JobSource::Archive {
                reader,
                archive,
                entry,
            } => {
                let buffer = scratch.prepare(reserve_hint(job.size_hint));
                let _permit = (job.kind == JobKind::Stream
                    && job.size_hint > DECOMPRESS_GATE_BYTES)
                    .then(|| self.decompress.acquire());
                Ok(reader.extract(*archive, *entry, buffer)?)
            }
            JobSource::Bytes(bytes) => {
                let buffer = scratch.prepare(bytes.len());
                buffer.extend_from_slice(bytes);
                Ok(Extracted {
                    offset: 0,
                    len: bytes.len(),
                })
            }
        }
    }
}

impl JobRunner for LoadRunner {
    fn run(&self, job: &mut Job, scratch: &mut ScratchBuffer) {
        job.started = Some(Instant::now());
        let active = self.counters.begin(job);
        let result = self.load(job, scratch);
        drop(active);
        if let Err(err) = &result {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                target: "inject::pipeline",
                "{:?} load of {} failed: {}",
                job.kind,
                job.fingerprint,
                err
            );
        }
        job.result = Some(result);
        job.finished = Some(Instant::now());
    }
}
