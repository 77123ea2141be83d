use crate::cache::Cache;
use crate::page_source::PageSource;

/// Number of fully-free slabs the default reclamation policy retains before
/// it starts unmapping them. Mirrors the reference implementation's
/// `DEFAULT_MAX_FREE_SLABS_ALLOWED`.
pub const DEFAULT_MAX_FREE_SLABS: usize = 5;

/// A policy invoked after every `free`, free to destroy slabs sitting on the
/// cache's `free` list. Allocation never calls this — only frees do.
pub type ReclaimPolicy<T, PS> = Box<dyn FnMut(&mut Cache<T, PS>) + Send>;
