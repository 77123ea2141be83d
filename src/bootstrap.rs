//! The process-wide descriptor bootstrap cache.
//!
//! Off-slab caches need somewhere to allocate their slab descriptors from.
//! That somewhere is a single cache of [`SlabDescriptor`]s, shared by every
//! off-slab cache in the process. Its own slabs carry their descriptors
//! on-slab, which is what stops the scheme from recursing forever: a
//! descriptor cache never needs a descriptor from another descriptor cache.
use core::ptr::null_mut;

use spin::{Mutex, Once};

use crate::cache::{Cache, CacheFlags};
use crate::error::CacheInitError;
use crate::page_source::OsPageSource;
use crate::slab::SlabDescriptor;

static BOOTSTRAP: Once<Mutex<Option<Cache<SlabDescriptor, OsPageSource>>>> = Once::new();

/// Initializes the process-wide descriptor cache. Must be called before any
/// cache with `DESCR_ON_SLAB` unset is created. Idempotent: a call while
/// already initialized is a no-op that returns `Ok(())`.
pub fn bootstrap_init() -> Result<(), CacheInitError> {
    BOOTSTRAP.call_once(|| Mutex::new(None));
    let mut guard = BOOTSTRAP.get().expect("just initialized").lock();
    if guard.is_none() {
        let cache = Cache::init_ex(1, CacheFlags::DESCR_ON_SLAB, None, None)
            .expect("bootstrap descriptor cache configuration is always valid");
        *guard = Some(cache);
        log::debug!("bootstrap descriptor cache initialized");
    }
    Ok(())
}

/// Tears down the process-wide descriptor cache, unmapping its slabs.
/// Requires that every off-slab cache has already been destroyed; calling
/// this with live off-slab caches still outstanding is a programming error
/// left unchecked, per the allocator's contract.
pub fn bootstrap_destroy() {
    if let Some(mutex) = BOOTSTRAP.get() {
        let mut guard = mutex.lock();
        if guard.take().is_some() {
            log::debug!("bootstrap descriptor cache destroyed");
        }
    }
}

pub(crate) fn is_initialized() -> bool {
    BOOTSTRAP.get().map(|m| m.lock().is_some()).unwrap_or(false)
}

pub(crate) fn alloc_descriptor() -> *mut SlabDescriptor {
    match BOOTSTRAP.get() {
        Some(mutex) => match mutex.lock().as_mut() {
            Some(cache) => cache.alloc(),
            None => null_mut(),
        },
        None => null_mut(),
    }
}

pub(crate) fn free_descriptor(ptr: *mut SlabDescriptor) {
    if ptr.is_null() {
        return;
    }
    if let Some(mutex) = BOOTSTRAP.get() {
        if let Some(cache) = mutex.lock().as_mut() {
            cache.free(ptr);
        }
    }
}
