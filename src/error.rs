use thiserror::Error;

/// Failure modes of [`crate::Cache::init`] and [`crate::Cache::init_ex`].
///
/// These are the cold-path, typed counterpart to the hot-path `null` returns
/// from `alloc` — construction is not performance sensitive, so there is no
/// reason to collapse a descriptive cause into a sentinel here.
#[derive(Debug, Error)]
pub enum CacheInitError {
    #[error("pages_per_slab must be at least 1")]
    ZeroPagesPerSlab,
    #[error("object size leaves no room for a single slot in a slab of this size")]
    ObjectTooLarge,
    #[error("an off-slab-descriptor cache was requested before bootstrap_init() was called")]
    NotBootstrapped,
}

/// Failure of the page source. Only ever observed as a log record — callers
/// see a null slab, per the allocator's contract.
#[derive(Debug, Error)]
pub enum PageSourceError {
    #[error("mmap failed: {0}")]
    Mmap(#[source] std::io::Error),
    #[error("munmap failed: {0}")]
    Munmap(#[source] std::io::Error),
}
