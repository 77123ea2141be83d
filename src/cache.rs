use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr::null_mut;

use bitflags::bitflags;
use intrusive_collections::{LinkedList, UnsafeRef};

use crate::bootstrap;
use crate::error::CacheInitError;
use crate::page_source::{OsPageSource, PageSource};
use crate::reclaim::{self, ReclaimPolicy};
use crate::slab::{self, SlabAdapter, SlabDescriptor};

bitflags! {
    /// Per-cache configuration flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CacheFlags: u32 {
        /// Store each slab's descriptor on the slab's own first page rather
        /// than allocating it from the bootstrap cache.
        const DESCR_ON_SLAB = 1 << 0;
    }
}

/// A read-only snapshot of a cache's bookkeeping counters, for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub obj_size: usize,
    pub actual_obj_size: usize,
    pub pages_per_slab: usize,
    pub slab_size: usize,
    pub objs_per_slab: usize,
    pub wasted_memory_per_slab: usize,
    pub free_objs_count: usize,
    pub used_objs_count: usize,
    pub slab_count: usize,
    pub free_slabs_count: usize,
    pub partial_slabs_count: usize,
    pub full_slabs_count: usize,
}

/// A pool of same-size-object slabs, bound to one object size at
/// initialization.
///
/// `Cache<T>` is generic over the page source only so tests can substitute a
/// heap-backed fake; production code always uses the default
/// [`OsPageSource`].
pub struct Cache<T, PS: PageSource = OsPageSource> {
    obj_size: usize,
    actual_obj_size: usize,
    flags: CacheFlags,
    pages_per_slab: usize,
    page_size: usize,
    slab_size: usize,
    objs_per_slab: usize,
    wasted_memory_per_slab: usize,

    free_objs_count: usize,
    used_objs_count: usize,

    slab_count: usize,
    free_slabs_count: usize,
    partial_slabs_count: usize,
    full_slabs_count: usize,

    free_slabs: LinkedList<SlabAdapter>,
    partial_slabs: LinkedList<SlabAdapter>,
    full_slabs: LinkedList<SlabAdapter>,

    ctor: Option<fn(*mut T)>,
    reclaim_policy: Option<ReclaimPolicy<T, PS>>,

    page_source: PS,
    phantom: PhantomData<fn(T) -> T>,
}

impl<T> Cache<T, OsPageSource> {
    /// Convenience initializer: one page per slab, on-slab descriptor, the
    /// default reclamation policy.
    pub fn init(ctor: Option<fn(*mut T)>) -> Result<Self, CacheInitError> {
        Self::init_ex(1, CacheFlags::DESCR_ON_SLAB, ctor, None)
    }
}

impl<T, PS: PageSource + Default> Cache<T, PS> {
    /// Full initializer.
    pub fn init_ex(
        pages_per_slab: usize,
        flags: CacheFlags,
        ctor: Option<fn(*mut T)>,
        reclaim_policy: Option<ReclaimPolicy<T, PS>>,
    ) -> Result<Self, CacheInitError> {
        Self::init_ex_with_page_source(pages_per_slab, flags, ctor, reclaim_policy, PS::default())
    }
}

impl<T, PS: PageSource> Cache<T, PS> {
    /// Full initializer over an explicit page source. Exposed at
    /// crate-visibility so tests can supply a fake; the public surface
    /// (`init`/`init_ex`) always goes through [`OsPageSource`].
    pub(crate) fn init_ex_with_page_source(
        pages_per_slab: usize,
        flags: CacheFlags,
        ctor: Option<fn(*mut T)>,
        reclaim_policy: Option<ReclaimPolicy<T, PS>>,
        page_source: PS,
    ) -> Result<Self, CacheInitError> {
        if pages_per_slab == 0 {
            return Err(CacheInitError::ZeroPagesPerSlab);
        }

        let descr_on_slab = flags.contains(CacheFlags::DESCR_ON_SLAB);
        if !descr_on_slab && !bootstrap::is_initialized() {
            return Err(CacheInitError::NotBootstrapped);
        }

        let obj_size = size_of::<T>();
        let actual_obj_size = obj_size.max(size_of::<*mut u8>());
        let page_size = page_source.page_size();
        let slab_size = pages_per_slab * page_size;

        let objs_per_slab =
            slab::objs_per_slab(pages_per_slab, page_size, actual_obj_size, descr_on_slab);
        if objs_per_slab == 0 {
            return Err(CacheInitError::ObjectTooLarge);
        }

        let wasted_memory_per_page = page_size % actual_obj_size;
        let wasted_memory_per_slab = wasted_memory_per_page * pages_per_slab;

        log::debug!(
            "cache init: obj_size={obj_size} actual_obj_size={actual_obj_size} \
             pages_per_slab={pages_per_slab} objs_per_slab={objs_per_slab} \
             descr_on_slab={descr_on_slab}"
        );

        Ok(Self {
            obj_size,
            actual_obj_size,
            flags,
            pages_per_slab,
            page_size,
            slab_size,
            objs_per_slab,
            wasted_memory_per_slab,
            free_objs_count: 0,
            used_objs_count: 0,
            slab_count: 0,
            free_slabs_count: 0,
            partial_slabs_count: 0,
            full_slabs_count: 0,
            free_slabs: LinkedList::new(SlabAdapter::new()),
            partial_slabs: LinkedList::new(SlabAdapter::new()),
            full_slabs: LinkedList::new(SlabAdapter::new()),
            ctor,
            reclaim_policy,
            page_source,
            phantom: PhantomData,
        })
    }

    fn descr_on_slab(&self) -> bool {
        self.flags.contains(CacheFlags::DESCR_ON_SLAB)
    }

    /// Allocates one object. Returns null on out-of-memory (page or, for
    /// off-slab caches, descriptor exhaustion).
    pub fn alloc(&mut self) -> *mut T {
        // SAFETY: every descriptor touched below was produced by
        // `slab::create_slab` with this cache's page source/layout, and
        // list membership is kept in sync with `free_objs_count` throughout.
        unsafe {
            if !self.partial_slabs.is_empty() {
                let descr_ptr = self.partial_slabs.front().get().unwrap()
                    as *const SlabDescriptor as *mut SlabDescriptor;
                let obj = slab::alloc_obj(descr_ptr);
                self.free_objs_count -= 1;
                self.used_objs_count += 1;

                if (*descr_ptr).free_objs_count() == 0 {
                    let moved = self
                        .partial_slabs
                        .cursor_mut_from_ptr(descr_ptr)
                        .remove()
                        .unwrap();
                    self.full_slabs.push_back(moved);
                    self.partial_slabs_count -= 1;
                    self.full_slabs_count += 1;
                }

                self.invoke_ctor(obj as *mut T);
                return obj as *mut T;
            }

            if self.free_slabs.is_empty() {
                let new_descr = slab::create_slab(
                    &self.page_source,
                    self.pages_per_slab,
                    self.page_size,
                    self.actual_obj_size,
                    self.descr_on_slab(),
                );
                if new_descr.is_null() {
                    log::warn!("cache alloc: failed to create a new slab");
                    return null_mut();
                }
                self.free_slabs.push_back(UnsafeRef::from_raw(new_descr));
                self.slab_count += 1;
                self.free_slabs_count += 1;
                self.free_objs_count += self.objs_per_slab;
            }

            let descr_ptr = self.free_slabs.front().get().unwrap() as *const SlabDescriptor
                as *mut SlabDescriptor;
            let obj = slab::alloc_obj(descr_ptr);
            self.free_objs_count -= 1;
            self.used_objs_count += 1;

            if (*descr_ptr).free_objs_count() > 0 {
                let moved = self
                    .free_slabs
                    .cursor_mut_from_ptr(descr_ptr)
                    .remove()
                    .unwrap();
                self.partial_slabs.push_back(moved);
                self.free_slabs_count -= 1;
                self.partial_slabs_count += 1;
            } else {
                // Only reachable when objs_per_slab == 1.
                let moved = self
                    .free_slabs
                    .cursor_mut_from_ptr(descr_ptr)
                    .remove()
                    .unwrap();
                self.full_slabs.push_back(moved);
                self.free_slabs_count -= 1;
                self.full_slabs_count += 1;
            }

            self.invoke_ctor(obj as *mut T);
            obj as *mut T
        }
    }

    unsafe fn invoke_ctor(&self, obj: *mut T) {
        if let Some(ctor) = self.ctor {
            if !obj.is_null() {
                ctor(obj);
            }
        }
    }

    /// Releases a slot previously returned by [`Cache::alloc`] on this same
    /// cache. A null slot is a no-op. Passing a foreign or non-slot pointer
    /// is undefined behavior, per the allocator's contract.
    pub fn free(&mut self, obj: *mut T) {
        if obj.is_null() {
            return;
        }
        // SAFETY: `obj` is assumed, per the function contract, to be a live
        // slot from this cache; owner lookup then yields a valid descriptor.
        unsafe {
            let obj_ptr = obj as *mut u8;
            let descr_ptr = slab::owning_slab(obj_ptr, self.page_size);
            debug_assert!(!descr_ptr.is_null());

            let was_full = (*descr_ptr).free_objs_count() == 0;
            slab::free_obj(descr_ptr, obj_ptr);
            self.free_objs_count += 1;
            self.used_objs_count -= 1;
            let is_now_free = (*descr_ptr).free_objs_count() == self.objs_per_slab;

            if !was_full && is_now_free {
                let moved = self
                    .partial_slabs
                    .cursor_mut_from_ptr(descr_ptr)
                    .remove()
                    .unwrap();
                self.free_slabs.push_front(moved);
                self.partial_slabs_count -= 1;
                self.free_slabs_count += 1;
            } else if was_full {
                if is_now_free {
                    let moved = self
                        .full_slabs
                        .cursor_mut_from_ptr(descr_ptr)
                        .remove()
                        .unwrap();
                    self.free_slabs.push_front(moved);
                    self.full_slabs_count -= 1;
                    self.free_slabs_count += 1;
                } else {
                    let moved = self
                        .full_slabs
                        .cursor_mut_from_ptr(descr_ptr)
                        .remove()
                        .unwrap();
                    self.partial_slabs.push_front(moved);
                    self.full_slabs_count -= 1;
                    self.partial_slabs_count += 1;
                }
            }

            self.run_reclaim_policy();
        }
    }

    fn run_reclaim_policy(&mut self) {
        match self.reclaim_policy.take() {
            Some(mut policy) => {
                policy(self);
                self.reclaim_policy = Some(policy);
            }
            None => self.reclaim_default(),
        }
    }

    fn reclaim_default(&mut self) {
        while self.free_slabs_count > reclaim::DEFAULT_MAX_FREE_SLABS {
            // SAFETY: every entry on `free_slabs` is a live descriptor owned
            // by this cache, created with this cache's page source/layout.
            unsafe {
                let descr = self.free_slabs.pop_front().unwrap();
                let ptr = UnsafeRef::into_raw(descr);
                slab::destroy_slab(&self.page_source, ptr, self.pages_per_slab, self.descr_on_slab());
            }
            self.free_slabs_count -= 1;
            self.slab_count -= 1;
            self.free_objs_count -= self.objs_per_slab;
            log::trace!("reclaimed a free slab, {} remaining", self.free_slabs_count);
        }
    }

    /// A snapshot of this cache's bookkeeping counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            obj_size: self.obj_size,
            actual_obj_size: self.actual_obj_size,
            pages_per_slab: self.pages_per_slab,
            slab_size: self.slab_size,
            objs_per_slab: self.objs_per_slab,
            wasted_memory_per_slab: self.wasted_memory_per_slab,
            free_objs_count: self.free_objs_count,
            used_objs_count: self.used_objs_count,
            slab_count: self.slab_count,
            free_slabs_count: self.free_slabs_count,
            partial_slabs_count: self.partial_slabs_count,
            full_slabs_count: self.full_slabs_count,
        }
    }

    fn destroy_all_slabs(&mut self) {
        let descr_on_slab = self.descr_on_slab();
        for list in [
            &mut self.free_slabs,
            &mut self.partial_slabs,
            &mut self.full_slabs,
        ] {
            while let Some(descr) = list.pop_front() {
                // SAFETY: every slab on any of the three lists was created
                // by `slab::create_slab` with this page source and layout.
                unsafe {
                    let ptr = UnsafeRef::into_raw(descr);
                    slab::destroy_slab(&self.page_source, ptr, self.pages_per_slab, descr_on_slab);
                }
            }
        }
        self.slab_count = 0;
        self.free_slabs_count = 0;
        self.partial_slabs_count = 0;
        self.full_slabs_count = 0;
        self.free_objs_count = 0;
        self.used_objs_count = 0;
        log::debug!("cache destroyed");
    }
}

impl<T, PS: PageSource> Drop for Cache<T, PS> {
    fn drop(&mut self) {
        self.destroy_all_slabs();
    }
}
