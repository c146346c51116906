use std::sync::Arc;

use crate::job::Job;
use crate::worker::{CompletionSignal, JobRunner, PoolError, RejectedJob, WorkerPool};

/// Routes stream loads to one of two pools by payload size so a few large
/// decompressions cannot starve the many small ones.
pub struct StreamSplitter {
    large: WorkerPool,
    small: WorkerPool,
    threshold: u64,
}

impl StreamSplitter {
    pub fn new(
        threads_per_pool: usize,
        threshold: u64,
        runner: Arc<dyn JobRunner>,
        completion: Arc<CompletionSignal>,
    ) -> Result<Self, PoolError> {
        Ok(Self {
            large: WorkerPool::new(
                "stream-large",
                threads_per_pool,
                Arc::clone(&runner),
                Arc::clone(&completion),
            )?,
            small: WorkerPool::new("stream-small", threads_per_pool, runner, completion)?,
            threshold,
        })
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn is_large(&self, job: &Job) -> bool {
        job.size_hint > self.threshold
    }

    pub fn post(&self, job: Job) -> Result<(), RejectedJob> {
        if self.is_large(&job) {
            self.large.post(job)
        } else {
            self.small.post(job)
        }
    }

    /// Large-pool completions first, then small.
    pub fn drain(&self) -> Vec<Job> {
        let mut done = self.large.drain();
        done.extend(self.small.drain());
        done
    }

    pub fn queue_length(&self) -> usize {
        self.large.queue_length() + self.small.queue_length()
    }

    pub fn is_working(&self) -> bool {
        self.large.is_working() || self.small.is_working()
    }

    pub fn large_pool(&self) -> &WorkerPool {
        &self.large
    }

    pub fn small_pool(&self) -> &WorkerPool {
        &self.small
    }

    pub fn shutdown(&self) {
        self.large.shutdown();
        self.small.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use crate::job::{JobKind, JobSource, LoadedResource};
    use crate::resource::tests::stub;
    use crate::worker::ScratchBuffer;
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct RecordingRunner {
        threads: Mutex<Vec<(u32, String)>>,
    }

    impl JobRunner for RecordingRunner {
        fn run(&self, job: &mut Job, _scratch: &mut ScratchBuffer) {
            let name = thread::current().name().unwrap_or_default().to_string();
            self.threads
                .lock()
                .unwrap()
                .push((job.fingerprint.value(), name));
            job.result = Some(Ok(LoadedResource {
                resource: stub(1, 1),
                byte_size: job.size_hint,
            }));
        }
    }

    fn job(value: u32, size_hint: u64) -> Job {
        Job::new(
            Fingerprint(value),
            JobKind::Stream,
            JobSource::Bytes(Arc::from(&b"x"[..])),
            size_hint,
        )
    }

    #[test]
    fn routes_by_threshold() {
        let runner = Arc::new(RecordingRunner::default());
        let splitter = StreamSplitter::new(
            1,
            128 * 1024,
            Arc::clone(&runner) as Arc<dyn JobRunner>,
            Arc::new(CompletionSignal::new()),
        )
        .expect("splitter");
        splitter.post(job(1, 128 * 1024)).expect("post");
        splitter.post(job(2, 128 * 1024 + 1)).expect("post");

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut done = Vec::new();
        while done.len() < 2 && Instant::now() < deadline {
            done.extend(splitter.drain());
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(done.len(), 2);
        while splitter.is_working() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!splitter.is_working());
        assert_eq!(splitter.queue_length(), 0);

        let threads = runner.threads.lock().unwrap().clone();
        let pool_of = |value: u32| {
            threads
                .iter()
                .find(|(fingerprint, _)| *fingerprint == value)
                .map(|(_, name)| name.clone())
                .unwrap_or_default()
        };
        assert!(pool_of(1).starts_with("stream-small"));
        assert!(pool_of(2).starts_with("stream-large"));
    }
}
