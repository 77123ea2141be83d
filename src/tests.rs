use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::null_mut;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};

use crate::cache::{Cache, CacheFlags};
use crate::page_source::{OsPageSource, PageSource};
use crate::reclaim::DEFAULT_MAX_FREE_SLABS;
use crate::{bootstrap_destroy, bootstrap_init};

/// A page source backed by the process heap instead of `mmap`, so tests can
/// pick small, exact page sizes without touching the real address space.
#[derive(Clone, Copy)]
struct FakePageSource {
    page_size: usize,
}

impl Default for FakePageSource {
    fn default() -> Self {
        FakePageSource { page_size: 4096 }
    }
}

impl PageSource for FakePageSource {
    fn page_size(&self) -> usize {
        self.page_size
    }

    unsafe fn acquire(&self, n_pages: usize) -> *mut u8 {
        let layout = Layout::from_size_align(n_pages * self.page_size, self.page_size).unwrap();
        alloc_zeroed(layout)
    }

    unsafe fn release(&self, pages: *mut u8, n_pages: usize) {
        let layout = Layout::from_size_align(n_pages * self.page_size, self.page_size).unwrap();
        dealloc(pages, layout);
    }
}

fn fake_cache<T>(page_size: usize, pages_per_slab: usize) -> Cache<T, FakePageSource> {
    Cache::init_ex_with_page_source(
        pages_per_slab,
        CacheFlags::DESCR_ON_SLAB,
        None,
        None,
        FakePageSource { page_size },
    )
    .unwrap()
}

#[repr(C)]
struct Small {
    #[allow(dead_code)]
    bytes: [u8; 4],
}

#[repr(C)]
struct OneObj {
    #[allow(dead_code)]
    bytes: [u8; 64],
}

#[repr(C)]
struct Mid {
    #[allow(dead_code)]
    bytes: [u8; 64],
}

// Scenario: single slot, single page.
#[test]
fn single_slot_single_page() {
    let mut cache: Cache<Small, FakePageSource> = fake_cache(4096, 1);
    assert!(cache.stats().objs_per_slab > 1);

    let obj = cache.alloc();
    assert!(!obj.is_null());
    cache.free(obj);

    let stats = cache.stats();
    assert_eq!(stats.slab_count, 1);
    assert_eq!(stats.free_slabs_count, 1);
    assert_eq!(stats.used_objs_count, 0);
}

// Exactly-one-object slabs land directly on full, and freeing moves them
// straight back to free.
#[test]
fn exactly_one_object_per_slab() {
    // page_size - ptr_size - descriptor_size leaves room for exactly one
    // 64-byte object, not two.
    let mut cache: Cache<OneObj, FakePageSource> = fake_cache(128, 1);
    assert_eq!(cache.stats().objs_per_slab, 1);

    let a = cache.alloc();
    let b = cache.alloc();
    assert!(!a.is_null() && !b.is_null());

    let stats = cache.stats();
    assert_eq!(stats.slab_count, 2);
    assert_eq!(stats.full_slabs_count, 2);
    assert_eq!(stats.partial_slabs_count, 0);
    assert_eq!(stats.free_slabs_count, 0);

    cache.free(a);
    let stats = cache.stats();
    assert_eq!(stats.full_slabs_count, 1);
    assert_eq!(stats.free_slabs_count, 1);

    cache.free(b);
    let stats = cache.stats();
    assert_eq!(stats.full_slabs_count, 0);
    assert_eq!(stats.free_slabs_count, 2);
}

// full <-> partial <-> free transitions for k >= 3 objects per slab.
#[test]
fn list_transitions() {
    let mut cache: Cache<Mid, FakePageSource> = fake_cache(4096, 1);
    let k = cache.stats().objs_per_slab;
    assert!(k >= 3, "test fixture must yield at least 3 objects per slab, got {k}");

    let mut first_batch = Vec::new();
    for _ in 0..k {
        first_batch.push(cache.alloc());
    }
    assert!(first_batch.iter().all(|p| !p.is_null()));
    let stats = cache.stats();
    assert_eq!(stats.slab_count, 1);
    assert_eq!(stats.full_slabs_count, 1);
    assert_eq!(stats.partial_slabs_count, 0);

    let extra = cache.alloc();
    assert!(!extra.is_null());
    let stats = cache.stats();
    assert_eq!(stats.slab_count, 2);
    assert_eq!(stats.full_slabs_count, 1);
    assert_eq!(stats.partial_slabs_count, 1);

    cache.free(first_batch.pop().unwrap());
    let stats = cache.stats();
    assert_eq!(stats.full_slabs_count, 0);
    assert_eq!(stats.partial_slabs_count, 2);

    for obj in first_batch {
        cache.free(obj);
    }
    cache.free(extra);
    let stats = cache.stats();
    assert_eq!(stats.partial_slabs_count, 0);
    assert_eq!(stats.free_slabs_count, 2);
}

// The default reclamation policy never lets more than DEFAULT_MAX_FREE_SLABS
// sit fully-free.
#[test]
fn reclamation_caps_free_slabs() {
    let mut cache: Cache<OneObj, FakePageSource> = fake_cache(128, 1);
    assert_eq!(cache.stats().objs_per_slab, 1);

    for _ in 0..10 {
        let obj = cache.alloc();
        assert!(!obj.is_null());
        cache.free(obj);
        assert!(cache.stats().free_slabs_count <= DEFAULT_MAX_FREE_SLABS);
    }

    assert_eq!(cache.stats().free_slabs_count, DEFAULT_MAX_FREE_SLABS);
    assert_eq!(cache.stats().slab_count, DEFAULT_MAX_FREE_SLABS);
}

// Owner lookup recovers the correct slab for every live slot.
#[test]
fn owner_lookup_is_consistent() {
    let page_size = 4096;
    let mut cache: Cache<Mid, FakePageSource> = fake_cache(page_size, 2);
    let k = cache.stats().objs_per_slab;

    let mut objs = Vec::new();
    for _ in 0..(k * 2 + 1) {
        let obj = cache.alloc();
        assert!(!obj.is_null());
        objs.push(obj);
    }

    for &obj in &objs {
        // SAFETY: every pointer in `objs` was just returned by `alloc` on
        // this cache, whose page size is `page_size`.
        let descr = unsafe { crate::slab::owning_slab(obj as *mut u8, page_size) };
        assert!(!descr.is_null());
        let page_base = (obj as usize) & !(page_size - 1);
        let back_pointer = unsafe { *(page_base as *const usize) };
        assert_eq!(back_pointer, descr as usize);
    }

    for obj in objs {
        cache.free(obj);
    }
}

// A counting constructor fires on every alloc, including ones that reuse a
// freed slot, and never on free.
#[test]
fn constructor_runs_on_every_alloc() {
    static COUNT: AtomicUsize = AtomicUsize::new(0);
    fn ctor(_obj: *mut Small) {
        COUNT.fetch_add(1, Ordering::SeqCst);
    }

    let mut cache: Cache<Small, FakePageSource> = Cache::init_ex_with_page_source(
        1,
        CacheFlags::DESCR_ON_SLAB,
        Some(ctor as fn(*mut Small)),
        None,
        FakePageSource { page_size: 4096 },
    )
    .unwrap();

    let a = cache.alloc();
    let b = cache.alloc();
    assert_eq!(COUNT.load(Ordering::SeqCst), 2);

    cache.free(a);
    assert_eq!(COUNT.load(Ordering::SeqCst), 2);

    let c = cache.alloc();
    assert_eq!(COUNT.load(Ordering::SeqCst), 3);

    cache.free(b);
    cache.free(c);
}

// Off-slab descriptor caches allocate their descriptors through the
// bootstrap cache.
#[test]
fn off_slab_descriptors_use_bootstrap_cache() {
    bootstrap_init().unwrap();

    let mut cache: Cache<Mid, OsPageSource> =
        Cache::init_ex(1, CacheFlags::empty(), None, None).unwrap();

    let mut objs = Vec::new();
    for _ in 0..(cache.stats().objs_per_slab + 1) {
        let obj = cache.alloc();
        assert!(!obj.is_null());
        objs.push(obj);
    }
    assert!(cache.stats().slab_count >= 2);

    for obj in objs {
        cache.free(obj);
    }
    drop(cache);

    bootstrap_destroy();
}

// A cache behind a process-wide static, mirroring how a real program would
// share one allocator across call sites.
#[test]
fn can_be_used_as_static() {
    use spin::{Mutex, Once};

    static CACHE: Once<Mutex<Option<Cache<Mid, FakePageSource>>>> = Once::new();
    CACHE.call_once(|| Mutex::new(Some(fake_cache(4096, 1))));

    let mut guard = CACHE.get().unwrap().lock();
    let cache = guard.as_mut().unwrap();
    let obj = cache.alloc();
    assert!(!obj.is_null());
    cache.free(obj);
}

// Randomized alloc/free stress test: counters stay internally consistent
// across an unpredictable interleaving.
#[test]
fn randomized_alloc_free_keeps_invariants() {
    let mut cache: Cache<Mid, FakePageSource> = fake_cache(4096, 1);
    let objs_per_slab = cache.stats().objs_per_slab;

    let mut rng = thread_rng();
    let mut live: Vec<*mut Mid> = Vec::new();

    for _ in 0..2000 {
        let do_alloc = live.is_empty() || rng.gen_bool(0.6);
        if do_alloc {
            let obj = cache.alloc();
            assert!(!obj.is_null());
            live.push(obj);
        } else {
            live.shuffle(&mut rng);
            let obj = live.pop().unwrap();
            cache.free(obj);
        }

        let stats = cache.stats();
        assert_eq!(
            stats.slab_count,
            stats.free_slabs_count + stats.partial_slabs_count + stats.full_slabs_count
        );
        assert_eq!(
            stats.used_objs_count + stats.free_objs_count,
            stats.slab_count * objs_per_slab
        );
        assert_eq!(stats.used_objs_count, live.len());
    }

    for obj in live {
        cache.free(obj);
    }
}

#[test]
fn null_free_is_a_no_op() {
    let mut cache: Cache<Small, FakePageSource> = fake_cache(4096, 1);
    cache.free(null_mut());
    assert_eq!(cache.stats().slab_count, 0);
}
