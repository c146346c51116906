use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::archive::ArchiveReader;
use crate::cache::{CacheStats, PurgeReport, ResetReport, TextureCache};
use crate::config::{ConfigError, EngineConfig};
use crate::fingerprint::Fingerprint;
use crate::index::{FingerprintIndex, IndexSummary, LoadMethod, SourceLocation, SourceRecord};
use crate::job::{JobKind, JobSource, LoadCounterSnapshot};
use crate::observability::{self, lock_unpoisoned};
use crate::pipeline::{CompletedLoad, JobPipeline, LoadRequest, Submission};
use crate::resource::{FactoryError, ManagedTexture, ResourceFactory, ResourceRef};
use crate::worker::PoolError;

const LOG_TARGET: &str = "inject::engine";
const BLOCKING_WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub completed: Vec<CompletedLoad>,
    pub purge: Option<PurgeReport>,
}

#[derive(Clone, Copy, Debug)]
pub struct EngineTelemetry {
    pub cache: CacheStats,
    pub index: IndexSummary,
    pub loads: LoadCounterSnapshot,
    pub in_flight: usize,
    pub stream_queue: usize,
    pub resample_queue: usize,
    pub invariant_violations: u64,
}

/// Render-thread facade tying the index, cache and load pipeline together.
pub struct TextureEngine {
    config: EngineConfig,
    factory: Arc<dyn ResourceFactory>,
    index: FingerprintIndex,
    cache: TextureCache,
    pipeline: JobPipeline,
    /// Completions drained inside `bind`, reported by the next `tick`.
    deferred: Mutex<Vec<CompletedLoad>>,
}

impl TextureEngine {
    /// Validates the config, starts the worker pools and builds the index.
    pub fn new(config: EngineConfig, factory: Arc<dyn ResourceFactory>) -> Result<Self, EngineError> {
        config.validate()?;
        let index = FingerprintIndex::new(&config.index.root, &config.index.extension);
        let pipeline = JobPipeline::new(&config, Arc::clone(&factory))?;
        let engine = Self {
            config,
            factory,
            index,
            cache: TextureCache::new(),
            pipeline,
            deferred: Mutex::new(Vec::new()),
        };
        engine.index.rebuild();
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn index(&self) -> &FingerprintIndex {
        &self.index
    }

    pub fn cache(&self) -> &TextureCache {
        &self.cache
    }

    /// Returns the cached texture for `source` or creates one, queueing its
    /// replacement load when the index knows one.
    pub fn create_texture(&self, source: &[u8]) -> Result<ManagedTexture, FactoryError> {
        let started = Instant::now();
        let fingerprint = Fingerprint::of(source);
        if self.config.cache.enabled {
            if let Some(entry) = self.cache.lookup(fingerprint) {
                self.cache.acquire(&entry);
                return Ok(entry);
            }
            self.cache.record_miss();
        }

        let base = self.factory.create(source)?;
        let texture = ManagedTexture::new(fingerprint, base, source.len() as u64);
        if let Some((record, archives)) = self.index.lookup_source(fingerprint) {
            let kind = match record.method {
                LoadMethod::Blocking => JobKind::Immediate,
                LoadMethod::Streaming | LoadMethod::Unspecified => JobKind::Stream,
            };
            self.queue_record(&texture, record, archives, kind);
        } else if self.wants_resample(fingerprint, source) {
            self.pipeline.submit(
                LoadRequest {
                    fingerprint,
                    kind: JobKind::Resample,
                    source: JobSource::Bytes(Arc::from(source)),
                    size_hint: source.len() as u64,
                    destination: texture.clone(),
                },
                &self.cache,
            );
        }
        texture.set_load_time(started.elapsed());

        if self.config.cache.enabled {
            self.cache.insert(&texture);
        }
        Ok(texture)
    }

    /// Resolves the resource to draw with. Waits for must-block textures
    /// until their replacement lands or their load fails.
    pub fn bind(&self, texture: &ManagedTexture) -> ResourceRef {
        texture.mark_used();
        if texture.must_block() && !texture.has_override() {
            self.wait_for_override(texture);
        }
        texture.resolve()
    }

    /// The renderer dropped one reference. Returns how many remain.
    pub fn destroyed(&self, texture: &ManagedTexture) -> i64 {
        texture.release()
    }

    /// Per-frame work: drain finished loads, then purge when over budget.
    pub fn tick(&self) -> TickReport {
        let mut completed = std::mem::take(&mut *lock_unpoisoned(&self.deferred));
        completed.extend(self.pipeline.drain_completions(&self.cache, &self.index));
        let purge = (self.config.cache.enabled
            && self.cache.total_bytes() > self.config.max_cache_bytes())
        .then(|| self.purge());
        TickReport { completed, purge }
    }

    pub fn purge(&self) -> PurgeReport {
        self.cache.purge(
            self.config.purge_target_bytes(),
            &self.pipeline.in_flight_snapshot(),
        )
    }

    pub fn rebuild_index(&self) -> IndexSummary {
        self.index.rebuild()
    }

    pub fn reset(&self) -> ResetReport {
        let report = self.cache.reset();
        let mirrored = self.pipeline.counters().mirrored_refs;
        if mirrored > 0 {
            log::warn!(
                target: LOG_TARGET,
                "{} references mirrored onto spliced textures were never released",
                mirrored
            );
        }
        let drained = self.pipeline.drain_completions(&self.cache, &self.index);
        lock_unpoisoned(&self.deferred).extend(drained);
        report
    }

    /// Drops the installed replacement for `fingerprint` and streams it
    /// again from the current index.
    pub fn reload(&self, fingerprint: Fingerprint) -> Submission {
        let Some((record, archives)) = self.index.lookup_source(fingerprint) else {
            return Submission::Rejected;
        };
        let Some(entry) = self.cache.lookup(fingerprint) else {
            return Submission::Rejected;
        };
        self.cache.clear_override(&entry);
        log::info!(target: LOG_TARGET, "reloading {}", fingerprint);
        self.queue_record(&entry, record, archives, JobKind::Stream)
    }

    /// Loads `path` onto `texture` before its next bind, regardless of the
    /// index.
    pub fn inject_blocking(&self, texture: &ManagedTexture, path: &Path) -> Submission {
        let size_hint = fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
        texture.set_must_block(true);
        self.pipeline.submit(
            LoadRequest {
                fingerprint: texture.fingerprint(),
                kind: JobKind::Immediate,
                source: JobSource::File(path.to_path_buf()),
                size_hint,
                destination: texture.clone(),
            },
            &self.cache,
        )
    }

    pub fn telemetry(&self) -> EngineTelemetry {
        EngineTelemetry {
            cache: self.cache.stats(),
            index: self.index.summary(),
            loads: self.pipeline.counters(),
            in_flight: self.pipeline.in_flight_count(),
            stream_queue: self.pipeline.stream_queue_length(),
            resample_queue: self.pipeline.resample_queue_length(),
            invariant_violations: observability::invariant_violations(),
        }
    }

    pub fn has_pending_loads(&self) -> bool {
        self.pipeline.has_pending()
    }

    pub fn shutdown(&self) {
        self.pipeline.shutdown();
    }

    fn queue_record(
        &self,
        texture: &ManagedTexture,
        record: SourceRecord,
        archives: Arc<ArchiveReader>,
        kind: JobKind,
    ) -> Submission {
        let source = match record.location {
            SourceLocation::Loose(path) => JobSource::File(path),
            SourceLocation::Archive { archive, entry } => JobSource::Archive {
                reader: archives,
                archive,
                entry,
            },
        };
        if kind == JobKind::Immediate {
            texture.set_must_block(true);
        }
        self.pipeline.submit(
            LoadRequest {
                fingerprint: record.fingerprint,
                kind,
                source,
                size_hint: record.size,
                destination: texture.clone(),
            },
            &self.cache,
        )
    }

    fn wants_resample(&self, fingerprint: Fingerprint, source: &[u8]) -> bool {
        if !self.config.resample.enabled || self.pipeline.is_resample_blacklisted(fingerprint) {
            return false;
        }
        self.factory
            .describe(source)
            .map(|info| info.wants_mip_chain())
            .unwrap_or(false)
    }

    fn wait_for_override(&self, texture: &ManagedTexture) {
        let started = Instant::now();
        loop {
            let seen = self.pipeline.completion_generation();
            let drained = self.pipeline.drain_completions(&self.cache, &self.index);
            lock_unpoisoned(&self.deferred).extend(drained);
            if texture.has_override() || !texture.must_block() {
                break;
            }
            if !self.pipeline.is_in_flight(texture.fingerprint()) {
                log::warn!(
                    target: LOG_TARGET,
                    "texture {} must block but has no load queued",
                    texture.fingerprint()
                );
                texture.set_must_block(false);
                break;
            }
            self.pipeline.wait_for_completion(seen, BLOCKING_WAIT_SLICE);
        }
        log::debug!(
            target: LOG_TARGET,
            "blocked {} ms on {}",
            started.elapsed().as_millis(),
            texture.fingerprint()
        );
    }
}

impl Drop for TextureEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::{temp_dir, write_zip};
    use crate::pipeline::LoadOutcome;
    use crate::resource::tests::MockFactory;
    use crate::resource::SourceInfo;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;
    use std::thread;

    fn inject_root(label: &str) -> PathBuf {
        let root = temp_dir(label);
        fs::create_dir_all(root.join("inject/textures/blocking")).unwrap();
        fs::create_dir_all(root.join("inject/textures/streaming")).unwrap();
        root
    }

    fn config(root: &Path) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.index.root = root.to_path_buf();
        config.workers.stream_threads = 1;
        config.workers.resample_threads = 1;
        config
    }

    fn engine(config: EngineConfig, factory: &Arc<MockFactory>) -> TextureEngine {
        TextureEngine::new(config, Arc::clone(factory) as Arc<dyn ResourceFactory>)
            .expect("engine")
    }

    fn replacement_name(original: &[u8]) -> String {
        format!("{}.png", Fingerprint::of(original))
    }

    fn tick_until(engine: &TextureEngine, count: usize) -> Vec<CompletedLoad> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut done = Vec::new();
        while done.len() < count && Instant::now() < deadline {
            done.extend(engine.tick().completed);
            thread::sleep(Duration::from_millis(2));
        }
        done
    }

    #[test]
    fn streamed_replacement_installs_after_tick() {
        let root = inject_root("engine_stream");
        let original = b"original texture 0x1000";
        fs::write(
            root.join("inject/textures/streaming").join(replacement_name(original)),
            b"replacement",
        )
        .unwrap();
        let factory = Arc::new(MockFactory::new());
        let engine = engine(config(&root), &factory);

        let texture = engine.create_texture(original).expect("create");
        assert!(!texture.must_block());
        let done = tick_until(&engine, 1);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].outcome, LoadOutcome::Installed { destinations: 1 });

        let bound = engine.bind(&texture);
        assert!(!Arc::ptr_eq(&bound, &texture.base()));
        let telemetry = engine.telemetry();
        assert_eq!(telemetry.cache.injected_count, 1);
        assert_eq!(telemetry.cache.injected_bytes, b"replacement".len() as u64);
        assert_eq!(telemetry.loads.streamed, 1);
        assert_eq!(telemetry.in_flight, 0);
    }

    #[test]
    fn blocking_replacement_is_ready_on_first_bind() {
        let root = inject_root("engine_blocking");
        let original = b"license screen";
        fs::write(
            root.join("inject/textures/blocking").join(replacement_name(original)),
            b"slow license replacement",
        )
        .unwrap();
        let factory = Arc::new(MockFactory::new());
        let engine = engine(config(&root), &factory);

        let texture = engine.create_texture(original).expect("create");
        assert!(texture.must_block());
        let bound = engine.bind(&texture);
        assert!(texture.has_override());
        assert!(!texture.must_block());
        assert!(Arc::ptr_eq(&bound, &texture.resolve()));
        assert!(!Arc::ptr_eq(&bound, &texture.base()));
        // The completion drained by bind is reported by the next tick.
        assert_eq!(engine.tick().completed.len(), 1);
    }

    #[test]
    fn concurrent_requests_share_one_archive_extraction() {
        let root = inject_root("engine_dedup");
        let original = b"shared texture 0x2000";
        let entry = format!("textures/streaming/{}", replacement_name(original));
        write_zip(
            &root.join("inject/pack.zip"),
            &[(entry.as_str(), b"slow zipped replacement".as_slice())],
        );
        let factory = Arc::new(MockFactory::new());
        let mut config = config(&root);
        config.cache.enabled = false;
        let engine = engine(config, &factory);

        let first = engine.create_texture(original).expect("first");
        let second = engine.create_texture(original).expect("second");
        assert!(!first.same(&second));
        assert_eq!(engine.telemetry().in_flight, 1);

        let done = tick_until(&engine, 1);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].outcome, LoadOutcome::Installed { destinations: 2 });
        assert!(first.has_override() && second.has_override());
        assert!(first.refs() >= 1 && second.refs() >= 1);
        // Two base creations plus exactly one replacement decode.
        assert_eq!(factory.creates.load(Ordering::SeqCst), 3);
        assert_eq!(engine.telemetry().loads.streamed, 1);
    }

    #[test]
    fn cache_hit_returns_same_texture() {
        let root = inject_root("engine_hit");
        let factory = Arc::new(MockFactory::new());
        let engine = engine(config(&root), &factory);

        let first = engine.create_texture(b"plain").expect("first");
        let second = engine.create_texture(b"plain").expect("second");
        assert!(first.same(&second));
        assert_eq!(factory.creates.load(Ordering::SeqCst), 1);
        let stats = engine.telemetry().cache;
        assert_eq!((stats.hits, stats.misses), (1, 1));

        engine.destroyed(&first);
        engine.destroyed(&second);
        assert!(first.can_free());
        let report = engine.purge();
        // Far below the 128 MiB floor, so nothing needs to go.
        assert_eq!(report.released, 0);
    }

    #[test]
    fn over_budget_tick_purges_unreferenced_entries() {
        let root = inject_root("engine_purge");
        let factory = Arc::new(MockFactory::new());
        let mut config = config(&root);
        config.cache.max_cache_mib = 0;
        let engine = engine(config, &factory);

        let kept = engine.create_texture(b"still drawn").expect("kept");
        let dropped = engine.create_texture(b"gone").expect("dropped");
        engine.destroyed(&dropped);
        let report = engine.tick().purge.expect("purge ran");
        // The 128 MiB floor is already met, so the purge stops at once.
        assert_eq!(report.released, 0);
        assert_eq!(engine.cache().len(), 2);
        assert!(kept.refs() >= 2);
    }

    #[test]
    fn failed_blocking_load_falls_back_to_original() {
        let root = inject_root("engine_fail");
        let original = b"gamepad glyphs";
        fs::write(
            root.join("inject/textures/blocking").join(replacement_name(original)),
            b"bad replacement",
        )
        .unwrap();
        let factory = Arc::new(MockFactory::new());
        let mut config = config(&root);
        config.cache.enabled = false;
        let engine = engine(config, &factory);

        let texture = engine.create_texture(original).expect("create");
        let bound = engine.bind(&texture);
        assert!(Arc::ptr_eq(&bound, &texture.base()));
        assert!(!texture.must_block());
        assert!(engine.index().lookup(Fingerprint::of(original)).is_none());

        let again = engine.create_texture(original).expect("again");
        assert!(!again.must_block());
        assert_eq!(engine.telemetry().in_flight, 0);
        assert_eq!(engine.rebuild_index().records, 0);
    }

    #[test]
    fn eligible_sources_are_resampled() {
        let root = inject_root("engine_resample");
        let factory = Arc::new(MockFactory::with_info(SourceInfo {
            width: 64,
            height: 64,
            depth: 1,
            mip_levels: 1,
        }));
        let mut config = config(&root);
        config.resample.enabled = true;
        let engine = engine(config, &factory);

        let texture = engine.create_texture(b"pow2 source").expect("create");
        let done = tick_until(&engine, 1);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].kind, JobKind::Resample);
        assert_eq!(done[0].byte_size, (64 * 64 + 32 * 32) * 4);
        assert!(texture.has_override());
        assert_eq!(factory.resamples.load(Ordering::SeqCst), 1);
        assert_eq!(engine.telemetry().loads.resampled, 1);
    }

    #[test]
    fn volume_sources_are_not_resampled() {
        let root = inject_root("engine_volume");
        let factory = Arc::new(MockFactory::with_info(SourceInfo {
            width: 64,
            height: 64,
            depth: 4,
            mip_levels: 1,
        }));
        let mut config = config(&root);
        config.resample.enabled = true;
        let engine = engine(config, &factory);
        engine.create_texture(b"volume").expect("create");
        assert!(!engine.has_pending_loads());
    }

    #[test]
    fn reload_streams_replacement_again() {
        let root = inject_root("engine_reload");
        let original = b"reloadable";
        let path = root.join("inject/textures/streaming").join(replacement_name(original));
        fs::write(&path, b"first").unwrap();
        let factory = Arc::new(MockFactory::new());
        let engine = engine(config(&root), &factory);

        let texture = engine.create_texture(original).expect("create");
        tick_until(&engine, 1);
        assert_eq!(engine.telemetry().cache.injected_bytes, 5);

        fs::write(&path, b"second!").unwrap();
        assert_eq!(engine.reload(texture.fingerprint()), Submission::Queued);
        assert_eq!(engine.telemetry().cache.injected_count, 0);
        tick_until(&engine, 1);
        assert!(texture.has_override());
        assert_eq!(engine.telemetry().cache.injected_bytes, 7);
        assert_eq!(engine.reload(Fingerprint(0xdead_beef)), Submission::Rejected);
    }

    #[test]
    fn inject_blocking_loads_arbitrary_file() {
        let root = inject_root("engine_inject");
        let glyphs = root.join("buttons.png");
        fs::write(&glyphs, b"slow glyph sheet").unwrap();
        let factory = Arc::new(MockFactory::new());
        let engine = engine(config(&root), &factory);

        let texture = engine.create_texture(b"stock glyphs").expect("create");
        assert_eq!(engine.inject_blocking(&texture, &glyphs), Submission::Queued);
        let bound = engine.bind(&texture);
        assert!(!Arc::ptr_eq(&bound, &texture.base()));
    }

    #[test]
    fn recreate_after_discarded_load_streams_again() {
        let root = inject_root("engine_recreate");
        let original = b"level geometry atlas";
        fs::write(
            root.join("inject/textures/streaming").join(replacement_name(original)),
            b"atlas replacement",
        )
        .unwrap();
        let factory = Arc::new(MockFactory::new());
        let engine = engine(config(&root), &factory);

        let first = engine.create_texture(original).expect("first");
        engine.destroyed(&first);
        let done = tick_until(&engine, 1);
        assert_eq!(done[0].outcome, LoadOutcome::Discarded);
        assert_eq!(first.refs(), 0);

        let again = engine.create_texture(original).expect("again");
        assert!(!again.same(&first));
        assert!(engine.has_pending_loads());
        let done = tick_until(&engine, 1);
        assert_eq!(done[0].outcome, LoadOutcome::Installed { destinations: 1 });
        assert!(again.has_override());
        assert_eq!(engine.cache().len(), 1);
        assert_eq!(engine.telemetry().cache.misses, 2);
    }

    #[test]
    fn reset_reports_held_textures() {
        let root = inject_root("engine_reset");
        let factory = Arc::new(MockFactory::new());
        let engine = engine(config(&root), &factory);

        let held = engine.create_texture(b"held").expect("held");
        let released = engine.create_texture(b"released").expect("released");
        engine.destroyed(&released);
        let report = engine.reset();
        assert_eq!(report.released, 1);
        assert_eq!(report.leaked, 1);
        assert!(engine.cache().is_empty());
        assert_eq!(held.refs(), 1);
    }
}
