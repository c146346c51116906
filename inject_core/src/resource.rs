//! The renderer-facing side of the engine: the capability traits the host
//! implements, and the shared handle wrapped around every texture it creates.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::fingerprint::Fingerprint;
use crate::observability::{self, lock_unpoisoned};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    R8,
    Rg8,
    Rgb8,
    Rgba8,
    Bgra8,
    Rgba16F,
    Rgba32F,
    /// 8 bytes per 4x4 block.
    Bc1,
    /// 16 bytes per 4x4 block.
    Bc2,
    /// 16 bytes per 4x4 block.
    Bc3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Footprint {
    BytesPerPixel(u64),
    Block { bytes_per_block: u64 },
}

impl PixelFormat {
    pub fn footprint(self) -> Footprint {
        match self {
            PixelFormat::R8 => Footprint::BytesPerPixel(1),
            PixelFormat::Rg8 => Footprint::BytesPerPixel(2),
            PixelFormat::Rgb8 => Footprint::BytesPerPixel(3),
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => Footprint::BytesPerPixel(4),
            PixelFormat::Rgba16F => Footprint::BytesPerPixel(8),
            PixelFormat::Rgba32F => Footprint::BytesPerPixel(16),
            PixelFormat::Bc1 => Footprint::Block { bytes_per_block: 8 },
            PixelFormat::Bc2 | PixelFormat::Bc3 => Footprint::Block {
                bytes_per_block: 16,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LevelDesc {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl LevelDesc {
    /// Tightly packed size of this level. Block formats use a 4x4 block
    /// stride approximation.
    pub fn byte_size(&self) -> u64 {
        let width = u64::from(self.width);
        let height = u64::from(self.height);
        match self.format.footprint() {
            Footprint::BytesPerPixel(bpp) => width * height * bpp,
            Footprint::Block { bytes_per_block } => {
                let stride = ((width + 3) / 4).max(1) * bytes_per_block;
                stride * (height / 4 + height % 4)
            }
        }
    }
}

pub fn levels_byte_size(levels: &[LevelDesc]) -> u64 {
    levels.iter().map(LevelDesc::byte_size).sum()
}

/// A resource created by the host renderer. Dropping the last `Arc` frees it.
pub trait RenderResource: Send + Sync + fmt::Debug {
    fn levels(&self) -> Vec<LevelDesc>;
}

pub type ResourceRef = Arc<dyn RenderResource>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
}

impl SourceInfo {
    pub fn is_power_of_two(&self) -> bool {
        self.width.is_power_of_two() && self.height.is_power_of_two()
    }

    pub fn full_chain_len(&self) -> u32 {
        32 - self.width.max(self.height).max(1).leading_zeros()
    }

    /// 2-D, power-of-two, and short of a complete mip chain.
    pub fn wants_mip_chain(&self) -> bool {
        self.depth == 1 && self.is_power_of_two() && self.mip_levels < self.full_chain_len()
    }
}

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("resample failed: {0}")]
    Resample(String),
}

/// Resource factory implemented by the renderer integration.
pub trait ResourceFactory: Send + Sync {
    fn describe(&self, source: &[u8]) -> Result<SourceInfo, FactoryError>;

    fn create(&self, source: &[u8]) -> Result<ResourceRef, FactoryError>;

    /// Recreates `source` with a regenerated, fully filtered mip chain.
    fn resample(&self, source: &[u8]) -> Result<ResourceRef, FactoryError>;
}

type ReleaseHook = Box<dyn Fn(&ManagedTexture) + Send + Sync>;

/// Shared handle around one renderer texture.
///
/// The reference count covers every holder: the renderer (one per creation
/// or cache hit), the cache's own reference while it keeps the entry, and one
/// hold per pending load that targets this texture. When it reaches zero the
/// release hook installed by the cache queues the entry for removal.
#[derive(Clone)]
pub struct ManagedTexture {
    inner: Arc<TextureInner>,
}

struct TextureInner {
    id: u64,
    fingerprint: Fingerprint,
    base: ResourceRef,
    base_size: u64,
    refs: AtomicI64,
    load_holds: AtomicI64,
    cache_held: AtomicBool,
    release_hook: OnceLock<ReleaseHook>,
    state: Mutex<TextureState>,
}

struct TextureState {
    override_resource: Option<ResourceRef>,
    override_size: u64,
    last_used: Instant,
    must_block: bool,
    load_time: Duration,
}

impl ManagedTexture {
    /// The creator holds the first reference.
    pub fn new(fingerprint: Fingerprint, base: ResourceRef, base_size: u64) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            inner: Arc::new(TextureInner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                fingerprint,
                base,
                base_size,
                refs: AtomicI64::new(1),
                load_holds: AtomicI64::new(0),
                cache_held: AtomicBool::new(false),
                release_hook: OnceLock::new(),
                state: Mutex::new(TextureState {
                    override_resource: None,
                    override_size: 0,
                    last_used: Instant::now(),
                    must_block: false,
                    load_time: Duration::ZERO,
                }),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.inner.fingerprint
    }

    pub fn base(&self) -> ResourceRef {
        Arc::clone(&self.inner.base)
    }

    pub fn base_size(&self) -> u64 {
        self.inner.base_size
    }

    pub fn same(&self, other: &ManagedTexture) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn refs(&self) -> i64 {
        self.inner.refs.load(Ordering::Acquire)
    }

    /// References held by the renderer, excluding the cache's own reference
    /// and pending-load holds.
    pub fn external_refs(&self) -> i64 {
        let internal = self.inner.load_holds.load(Ordering::Acquire)
            + i64::from(self.inner.cache_held.load(Ordering::Acquire));
        self.refs() - internal
    }

    /// Only internal holders remain and no load targets this texture.
    pub fn can_free(&self) -> bool {
        self.external_refs() <= 0 && self.inner.load_holds.load(Ordering::Acquire) == 0
    }

    pub fn add_ref(&self) -> i64 {
        self.inner.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops one reference and returns how many remain.
    pub fn release(&self) -> i64 {
        let remaining = self.inner.refs.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining < 0 {
            self.inner.refs.fetch_add(1, Ordering::AcqRel);
            observability::invariant_violation(
                "inject::resource",
                format!("reference count underflow on texture {}", self.fingerprint()),
            );
            return 0;
        }
        if remaining == 0 {
            if let Some(hook) = self.inner.release_hook.get() {
                hook(self);
            }
        }
        remaining
    }

    pub fn has_override(&self) -> bool {
        lock_unpoisoned(&self.inner.state).override_resource.is_some()
    }

    pub fn override_resource(&self) -> Option<ResourceRef> {
        lock_unpoisoned(&self.inner.state).override_resource.clone()
    }

    pub fn override_size(&self) -> u64 {
        let state = lock_unpoisoned(&self.inner.state);
        if state.override_resource.is_some() {
            state.override_size
        } else {
            0
        }
    }

    /// The override when one is installed, otherwise the base resource.
    pub fn resolve(&self) -> ResourceRef {
        let state = lock_unpoisoned(&self.inner.state);
        match &state.override_resource {
            Some(resource) => Arc::clone(resource),
            None => Arc::clone(&self.inner.base),
        }
    }

    pub fn mark_used(&self) {
        self.set_last_used(Instant::now());
    }

    pub fn set_last_used(&self, at: Instant) {
        lock_unpoisoned(&self.inner.state).last_used = at;
    }

    pub fn last_used(&self) -> Instant {
        lock_unpoisoned(&self.inner.state).last_used
    }

    pub fn must_block(&self) -> bool {
        lock_unpoisoned(&self.inner.state).must_block
    }

    pub fn set_must_block(&self, must_block: bool) {
        lock_unpoisoned(&self.inner.state).must_block = must_block;
    }

    pub fn load_time(&self) -> Duration {
        lock_unpoisoned(&self.inner.state).load_time
    }

    pub fn set_load_time(&self, load_time: Duration) {
        lock_unpoisoned(&self.inner.state).load_time = load_time;
    }

    pub fn is_cache_held(&self) -> bool {
        self.inner.cache_held.load(Ordering::Acquire)
    }

    /// Swaps the override and returns the previous one with its size.
    pub(crate) fn replace_override(
        &self,
        resource: Option<ResourceRef>,
        size: u64,
    ) -> Option<(ResourceRef, u64)> {
        let mut state = lock_unpoisoned(&self.inner.state);
        let previous = state.override_resource.take();
        let previous_size = state.override_size;
        state.override_resource = resource;
        state.override_size = if state.override_resource.is_some() {
            size
        } else {
            0
        };
        previous.map(|resource| (resource, previous_size))
    }

    pub(crate) fn hold_for_load(&self) {
        self.inner.load_holds.fetch_add(1, Ordering::AcqRel);
        self.add_ref();
    }

    pub(crate) fn release_load_hold(&self) -> i64 {
        let holds = self.inner.load_holds.fetch_sub(1, Ordering::AcqRel) - 1;
        if holds < 0 {
            self.inner.load_holds.fetch_add(1, Ordering::AcqRel);
            observability::invariant_violation(
                "inject::resource",
                format!("load hold underflow on texture {}", self.fingerprint()),
            );
            return self.refs();
        }
        self.release()
    }

    pub(crate) fn attach_to_cache(&self, hook: ReleaseHook) {
        // A texture is only ever inserted into one cache; a second hook is
        // ignored.
        let _ = self.inner.release_hook.set(hook);
        self.inner.cache_held.store(true, Ordering::Release);
        self.add_ref();
    }

    /// Drops the cache's own reference. `None` when the cache had already
    /// let go of it.
    pub(crate) fn release_from_cache(&self) -> Option<i64> {
        if !self.inner.cache_held.swap(false, Ordering::AcqRel) {
            return None;
        }
        Some(self.release())
    }
}

impl fmt::Debug for ManagedTexture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedTexture")
            .field("id", &self.inner.id)
            .field("fingerprint", &self.inner.fingerprint)
            .field("refs", &self.refs())
            .field("base_size", &self.inner.base_size)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    pub(crate) struct StubResource {
        pub(crate) levels: Vec<LevelDesc>,
    }

    impl RenderResource for StubResource {
        fn levels(&self) -> Vec<LevelDesc> {
            self.levels.clone()
        }
    }

    pub(crate) fn stub(width: u32, height: u32) -> ResourceRef {
        Arc::new(StubResource {
            levels: vec![LevelDesc {
                width,
                height,
                format: PixelFormat::Rgba8,
            }],
        })
    }

    /// Payloads starting with `bad` fail to decode; `slow` ones take 50 ms.
    pub(crate) struct MockFactory {
        pub(crate) info: SourceInfo,
        pub(crate) creates: AtomicUsize,
        pub(crate) resamples: AtomicUsize,
    }

    impl MockFactory {
        pub(crate) fn new() -> Self {
            Self::with_info(SourceInfo {
                width: 100,
                height: 60,
                depth: 1,
                mip_levels: 1,
            })
        }

        pub(crate) fn with_info(info: SourceInfo) -> Self {
            Self {
                info,
                creates: AtomicUsize::new(0),
                resamples: AtomicUsize::new(0),
            }
        }

        fn check(source: &[u8]) -> Result<(), String> {
            if source.starts_with(b"bad") {
                return Err("corrupt payload".to_string());
            }
            if source.starts_with(b"slow") {
                std::thread::sleep(Duration::from_millis(50));
            }
            Ok(())
        }
    }

    impl ResourceFactory for MockFactory {
        fn describe(&self, source: &[u8]) -> Result<SourceInfo, FactoryError> {
            Self::check(source).map_err(FactoryError::Decode)?;
            Ok(self.info)
        }

        fn create(&self, source: &[u8]) -> Result<ResourceRef, FactoryError> {
            Self::check(source).map_err(FactoryError::Decode)?;
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(stub(self.info.width, self.info.height))
        }

        fn resample(&self, source: &[u8]) -> Result<ResourceRef, FactoryError> {
            Self::check(source).map_err(FactoryError::Resample)?;
            self.resamples.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(StubResource {
                levels: vec![
                    LevelDesc {
                        width: self.info.width,
                        height: self.info.height,
                        format: PixelFormat::Rgba8,
                    },
                    LevelDesc {
                        width: (self.info.width / 2).max(1),
                        height: (self.info.height / 2).max(1),
                        format: PixelFormat::Rgba8,
                    },
                ],
            }))
        }
    }

    #[test]
    fn level_sizes_follow_format_footprint() {
        let rgba = LevelDesc {
            width: 64,
            height: 32,
            format: PixelFormat::Rgba8,
        };
        assert_eq!(rgba.byte_size(), 64 * 32 * 4);

        let bc1 = LevelDesc {
            width: 64,
            height: 64,
            format: PixelFormat::Bc1,
        };
        assert_eq!(bc1.byte_size(), 16 * 8 * 16);

        let tiny_bc3 = LevelDesc {
            width: 2,
            height: 2,
            format: PixelFormat::Bc3,
        };
        assert_eq!(tiny_bc3.byte_size(), 16 * 2);
    }

    #[test]
    fn mip_chain_eligibility() {
        let info = SourceInfo {
            width: 256,
            height: 128,
            depth: 1,
            mip_levels: 1,
        };
        assert_eq!(info.full_chain_len(), 9);
        assert!(info.wants_mip_chain());
        let npot = SourceInfo {
            width: 100,
            ..info
        };
        assert!(!npot.wants_mip_chain());
        let volume = SourceInfo { depth: 4, ..info };
        assert!(!volume.wants_mip_chain());
    }

    #[test]
    fn release_hook_fires_once_at_zero() {
        let fired = Arc::new(AtomicUsize::new(0));
        let texture = ManagedTexture::new(Fingerprint(1), stub(4, 4), 64);
        let counter = Arc::clone(&fired);
        texture.attach_to_cache(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(texture.refs(), 2);
        assert_eq!(texture.external_refs(), 1);

        assert_eq!(texture.release(), 1);
        assert!(texture.can_free());
        assert_eq!(texture.release_from_cache(), Some(0));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(texture.release_from_cache(), None);
    }

    #[test]
    fn underflow_is_clamped() {
        let texture = ManagedTexture::new(Fingerprint(2), stub(1, 1), 4);
        assert_eq!(texture.release(), 0);
        assert_eq!(texture.release(), 0);
        assert_eq!(texture.refs(), 0);
    }

    #[test]
    fn load_hold_blocks_freeing() {
        let texture = ManagedTexture::new(Fingerprint(3), stub(1, 1), 4);
        texture.release();
        texture.hold_for_load();
        assert!(!texture.can_free());
        assert_eq!(texture.external_refs(), 0);
        texture.release_load_hold();
        assert!(texture.can_free());
    }

    #[test]
    fn override_is_preferred() {
        let texture = ManagedTexture::new(Fingerprint(4), stub(1, 1), 4);
        let replacement = stub(8, 8);
        texture.replace_override(Some(Arc::clone(&replacement)), 256);
        assert!(Arc::ptr_eq(&texture.resolve(), &replacement));
        assert_eq!(texture.override_size(), 256);
        let previous = texture.replace_override(None, 0);
        assert_eq!(previous.map(|(_, size)| size), Some(256));
        assert!(!texture.has_override());
    }
}
