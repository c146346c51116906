//! Load submission with in-flight deduplication, and the per-frame drain
//! that hands finished loads back to their destination textures.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::TextureCache;
use crate::config::EngineConfig;
use crate::fingerprint::Fingerprint;
use crate::index::FingerprintIndex;
use crate::job::{
    DecompressSlots, Job, JobKind, JobSource, LoadCounterSnapshot, LoadCounters, LoadError,
    LoadRunner,
};
use crate::observability::{self, lock_unpoisoned};
use crate::resource::{ManagedTexture, ResourceFactory};
use crate::splitter::StreamSplitter;
use crate::worker::{CompletionSignal, JobRunner, PoolError, WorkerPool};

const LOG_TARGET: &str = "inject::pipeline";

#[derive(Clone, Debug)]
pub struct LoadRequest {
    pub fingerprint: Fingerprint,
    pub kind: JobKind,
    pub source: JobSource,
    pub size_hint: u64,
    pub destination: ManagedTexture,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submission {
    /// A new job was queued.
    Queued,
    /// Joined a load already in flight for the same fingerprint.
    Spliced,
    /// Nothing was queued.
    Rejected,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    Installed { destinations: usize },
    /// Every destination was released while the load ran.
    Discarded,
    Failed(String),
}

#[derive(Clone, Debug)]
pub struct CompletedLoad {
    pub fingerprint: Fingerprint,
    pub kind: JobKind,
    pub elapsed: Duration,
    pub byte_size: u64,
    pub outcome: LoadOutcome,
}

struct InFlight {
    destination: ManagedTexture,
    spliced: Vec<ManagedTexture>,
}

impl InFlight {
    fn into_destinations(self) -> Vec<ManagedTexture> {
        let mut all = self.spliced;
        all.push(self.destination);
        all
    }
}

pub struct JobPipeline {
    splitter: StreamSplitter,
    resample: WorkerPool,
    in_flight: Mutex<HashMap<Fingerprint, InFlight>>,
    resample_blacklist: Mutex<HashSet<Fingerprint>>,
    completion: Arc<CompletionSignal>,
    counters: Arc<LoadCounters>,
}

impl JobPipeline {
    pub fn new(config: &EngineConfig, factory: Arc<dyn ResourceFactory>) -> Result<Self, PoolError> {
        let counters = Arc::new(LoadCounters::default());
        let runner: Arc<dyn JobRunner> = Arc::new(LoadRunner::new(
            factory,
            Arc::new(DecompressSlots::new(config.workers.decompress_slots)),
            Arc::clone(&counters),
        ));
        let completion = Arc::new(CompletionSignal::new());
        let splitter = StreamSplitter::new(
            config.workers.stream_threads,
            config.large_threshold_bytes(),
            Arc::clone(&runner),
            Arc::clone(&completion),
        )?;
        let resample = WorkerPool::new(
            "resample",
            config.workers.resample_threads,
            runner,
            Arc::clone(&completion),
        )?;
        let blacklist = config
            .resample
            .blacklist
            .iter()
            .filter_map(|text| {
                let parsed = Fingerprint::parse_hex(text);
                if parsed.is_none() {
                    log::warn!(target: LOG_TARGET, "ignoring bad resample blacklist entry {:?}", text);
                }
                parsed
            })
            .collect();
        Ok(Self {
            splitter,
            resample,
            in_flight: Mutex::new(HashMap::new()),
            resample_blacklist: Mutex::new(blacklist),
            completion,
            counters,
        })
    }

    /// Queues a load, or attaches `destination` to the load already running
    /// for the fingerprint. Every destination holds one load reference until
    /// the completion is drained.
    pub fn submit(&self, request: LoadRequest, cache: &TextureCache) -> Submission {
        let LoadRequest {
            fingerprint,
            kind,
            source,
            size_hint,
            destination,
        } = request;
        if kind == JobKind::Resample && self.is_resample_blacklisted(fingerprint) {
            return Submission::Rejected;
        }
        let cached = cache.external_refs(fingerprint);

        {
            let mut in_flight = lock_unpoisoned(&self.in_flight);
            if let Some(flight) = in_flight.get_mut(&fingerprint) {
                let known = flight.destination.same(&destination)
                    || flight.spliced.iter().any(|texture| texture.same(&destination));
                if known {
                    return Submission::Spliced;
                }
                destination.hold_for_load();
                // Mirrored references are never released; they are counted so
                // diagnostics can report them.
                if let Some((entry, refs)) = &cached {
                    if !entry.same(&destination) && *refs > 0 {
                        for _ in 0..*refs {
                            destination.add_ref();
                        }
                        self.counters
                            .mirrored_refs
                            .fetch_add(*refs as u64, Ordering::Relaxed);
                    }
                }
                let previous = std::mem::replace(&mut flight.destination, destination);
                flight.spliced.push(previous);
                log::debug!(
                    target: LOG_TARGET,
                    "spliced {:?} load of {} ({} destinations)",
                    kind,
                    fingerprint,
                    flight.spliced.len() + 1
                );
                return Submission::Spliced;
            }
            destination.hold_for_load();
            in_flight.insert(
                fingerprint,
                InFlight {
                    destination,
                    spliced: Vec::new(),
                },
            );
        }

        let job = Job::new(fingerprint, kind, source, size_hint);
        let posted = match kind {
            JobKind::Resample => self.resample.post(job),
            JobKind::Stream | JobKind::Immediate => self.splitter.post(job),
        };
        match posted {
            Ok(()) => Submission::Queued,
            Err(rejected) => {
                log::warn!(
                    target: LOG_TARGET,
                    "{:?} load of {} rejected: {}",
                    kind,
                    fingerprint,
                    rejected.error
                );
                let flight = lock_unpoisoned(&self.in_flight).remove(&fingerprint);
                for texture in flight.map(InFlight::into_destinations).unwrap_or_default() {
                    texture.set_must_block(false);
                    texture.release_load_hold();
                }
                Submission::Rejected
            }
        }
    }

    /// Hands every finished job to its destinations. Runs on the render
    /// thread.
    pub fn drain_completions(
        &self,
        cache: &TextureCache,
        index: &FingerprintIndex,
    ) -> Vec<CompletedLoad> {
        let mut jobs = self.splitter.drain();
        jobs.extend(self.resample.drain());
        let mut completed = Vec::with_capacity(jobs.len());
        for job in jobs {
            let flight = lock_unpoisoned(&self.in_flight).remove(&job.fingerprint);
            let Some(flight) = flight else {
                observability::invariant_violation(
                    LOG_TARGET,
                    format!("finished load of {} has no in-flight entry", job.fingerprint),
                );
                continue;
            };
            completed.push(self.finish(job, flight.into_destinations(), cache, index));
        }
        completed
    }

    fn finish(
        &self,
        mut job: Job,
        destinations: Vec<ManagedTexture>,
        cache: &TextureCache,
        index: &FingerprintIndex,
    ) -> CompletedLoad {
        let fingerprint = job.fingerprint;
        let elapsed = job.elapsed();
        let work_time = job.work_time();
        let mut byte_size = 0;
        let mut discarded = Vec::new();
        let outcome = match job.result.take().unwrap_or(Err(LoadError::Incomplete)) {
            Ok(loaded) => {
                byte_size = loaded.byte_size;
                let mut installed = 0;
                for texture in &destinations {
                    if texture.external_refs() <= 0 {
                        discarded.push(texture);
                        continue;
                    }
                    cache.install_override(texture, Arc::clone(&loaded.resource), loaded.byte_size);
                    texture.set_load_time(texture.load_time() + work_time);
                    installed += 1;
                }
                if installed == 0 {
                    log::debug!(
                        target: LOG_TARGET,
                        "discarded {:?} load of {}: no longer referenced",
                        job.kind,
                        fingerprint
                    );
                    LoadOutcome::Discarded
                } else {
                    log::debug!(
                        target: LOG_TARGET,
                        "installed {:?} load of {} ({} KiB, {} ms)",
                        job.kind,
                        fingerprint,
                        loaded.byte_size / 1024,
                        elapsed.as_millis()
                    );
                    LoadOutcome::Installed {
                        destinations: installed,
                    }
                }
            }
            Err(err) => {
                match job.kind {
                    JobKind::Resample => {
                        lock_unpoisoned(&self.resample_blacklist).insert(fingerprint);
                    }
                    JobKind::Stream | JobKind::Immediate => index.forget(fingerprint),
                }
                LoadOutcome::Failed(err.to_string())
            }
        };
        for texture in &destinations {
            texture.set_must_block(false);
            texture.release_load_hold();
        }
        // A resident entry never outlives a discarded load of its override.
        for texture in discarded {
            if cache.evict_unreferenced(texture) {
                log::debug!(
                    target: LOG_TARGET,
                    "evicted unreferenced texture {} after discarding its load",
                    fingerprint
                );
            }
        }
        CompletedLoad {
            fingerprint,
            kind: job.kind,
            elapsed,
            byte_size,
            outcome,
        }
    }

    pub fn is_in_flight(&self, fingerprint: Fingerprint) -> bool {
        lock_unpoisoned(&self.in_flight).contains_key(&fingerprint)
    }

    pub fn in_flight_snapshot(&self) -> HashSet<Fingerprint> {
        lock_unpoisoned(&self.in_flight).keys().copied().collect()
    }

    pub fn in_flight_count(&self) -> usize {
        lock_unpoisoned(&self.in_flight).len()
    }

    /// Loads are queued, running, or waiting to be drained.
    pub fn has_pending(&self) -> bool {
        self.in_flight_count() > 0 || self.splitter.is_working() || self.resample.is_working()
    }

    pub fn stream_queue_length(&self) -> usize {
        self.splitter.queue_length()
    }

    pub fn resample_queue_length(&self) -> usize {
        self.resample.queue_length()
    }

    pub fn completion_generation(&self) -> u64 {
        self.completion.generation()
    }

    pub fn wait_for_completion(&self, seen: u64, timeout: Duration) -> u64 {
        self.completion.wait_past(seen, timeout)
    }

    pub fn is_resample_blacklisted(&self, fingerprint: Fingerprint) -> bool {
        lock_unpoisoned(&self.resample_blacklist).contains(&fingerprint)
    }

    pub fn counters(&self) -> LoadCounterSnapshot {
        self.counters.snapshot()
    }

    pub fn shutdown(&self) {
        self.splitter.shutdown();
        self.resample.shutdown();
        let abandoned: Vec<InFlight> = lock_unpoisoned(&self.in_flight)
            .drain()
            .map(|(_, flight)| flight)
            .collect();
        for texture in abandoned.into_iter().flat_map(InFlight::into_destinations) {
            texture.set_must_block(false);
            texture.release_load_hold();
        }
    }
}
