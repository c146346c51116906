use std::any::Any;
use std::panic::{self, PanicHookInfo};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn read_unpoisoned<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn write_unpoisoned<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn sticky_cell() -> &'static Mutex<Option<String>> {
    static STICKY: OnceLock<Mutex<Option<String>>> = OnceLock::new();
    STICKY.get_or_init(|| Mutex::new(None))
}

static INVARIANT_VIOLATIONS: AtomicU64 = AtomicU64::new(0);

pub fn set_sticky_error(message: impl Into<String>) {
    let message = message.into();
    log::error!(target: "inject", "{}", message);
    let mut guard = lock_unpoisoned(sticky_cell());
    *guard = Some(message);
}

pub fn clear_sticky_error() {
    let mut guard = lock_unpoisoned(sticky_cell());
    *guard = None;
}

pub fn sticky_error() -> Option<String> {
    let guard = lock_unpoisoned(sticky_cell());
    guard.clone()
}

/// Records a broken bookkeeping assumption. Never fatal.
pub fn invariant_violation(target: &str, message: impl AsRef<str>) {
    INVARIANT_VIOLATIONS.fetch_add(1, Ordering::Relaxed);
    log::warn!(target: target, "invariant violation: {}", message.as_ref());
}

pub fn invariant_violations() -> u64 {
    INVARIANT_VIOLATIONS.load(Ordering::Relaxed)
}

pub fn install_panic_hook() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    if INSTALLED.set(()).is_err() {
        return;
    }
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        set_sticky_error(format_panic(info));
        default_hook(info);
    }));
}

pub(crate) fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn format_panic(info: &PanicHookInfo<'_>) -> String {
    let location = info
        .location()
        .map(|loc| format!("{}:{}", loc.file(), loc.line()))
        .unwrap_or_else(|| "<unknown>".to_string());
    format!(
        "panic at {}: {}",
        location,
        panic_payload_to_string(info.payload())
    )
}
