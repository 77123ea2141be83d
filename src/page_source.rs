use std::ptr::null_mut;

use crate::error::PageSourceError;

/// Supplies contiguous, page-aligned, zero-initialized memory to caches.
///
/// Implementations hand out ranges of `n_pages * page_size()` bytes and take
/// them back; they carry no knowledge of slabs, objects, or descriptors.
/// Kept as a trait (rather than hard-wiring `mmap` into the cache) so tests
/// can swap in a heap-backed fake and exercise the slab/cache logic without
/// touching the real address space.
pub trait PageSource {
    /// The OS page size, queried once and assumed stable for the process.
    fn page_size(&self) -> usize;

    /// Acquire `n_pages` contiguous, read/write, zeroed pages. Returns a
    /// null pointer on failure; never panics.
    ///
    /// # Safety
    /// The returned pointer, if non-null, must eventually be passed to
    /// exactly one matching [`PageSource::release`] call with the same
    /// `n_pages`.
    unsafe fn acquire(&self, n_pages: usize) -> *mut u8;

    /// Release a range previously returned by [`PageSource::acquire`].
    ///
    /// # Safety
    /// `pages` must be a pointer returned by `acquire` on this page source
    /// with the same `n_pages`, not previously released.
    unsafe fn release(&self, pages: *mut u8, n_pages: usize);
}

/// Page source backed by anonymous, private `mmap`/`munmap`.
///
/// `MAP_ANONYMOUS` pages arrive zero-filled from the kernel, so no explicit
/// clearing is performed here — a slot is only zero on its *first* use;
/// `free` followed by `alloc` does not re-zero it.
#[derive(Debug, Clone, Copy)]
pub struct OsPageSource {
    page_size: usize,
}

impl OsPageSource {
    pub fn new() -> Self {
        // SAFETY: sysconf with a well-known name is always sound to call.
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if raw > 0 { raw as usize } else { 4096 };
        Self { page_size }
    }
}

impl Default for OsPageSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PageSource for OsPageSource {
    fn page_size(&self) -> usize {
        self.page_size
    }

    unsafe fn acquire(&self, n_pages: usize) -> *mut u8 {
        let len = n_pages * self.page_size;
        let ptr = libc::mmap(
            null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            let err = PageSourceError::Mmap(std::io::Error::last_os_error());
            log::warn!("{err}");
            return null_mut();
        }
        ptr as *mut u8
    }

    unsafe fn release(&self, pages: *mut u8, n_pages: usize) {
        let len = n_pages * self.page_size;
        if libc::munmap(pages as *mut libc::c_void, len) != 0 {
            let err = PageSourceError::Munmap(std::io::Error::last_os_error());
            log::warn!("{err}");
        }
    }
}
