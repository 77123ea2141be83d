//! A userland slab allocator.
//!
//! Clients create one or more [`Cache`]s, each bound to a single object
//! size, and allocate/free fixed-size objects against it. Internally each
//! cache grows a pool of equal-sized slabs backed by anonymous page
//! mappings, tracked across `free`/`partial`/`full` lists so an `alloc`
//! never has to scan for space.
//!
//! Before creating a cache with `DESCR_ON_SLAB` unset, call
//! [`bootstrap_init`] once for the process.

mod bootstrap;
mod cache;
mod error;
mod page_source;
mod reclaim;
mod slab;

#[cfg(test)]
mod tests;

pub use bootstrap::{bootstrap_destroy, bootstrap_init};
pub use cache::{Cache, CacheFlags, CacheStats};
pub use error::{CacheInitError, PageSourceError};
pub use page_source::{OsPageSource, PageSource};
pub use reclaim::{ReclaimPolicy, DEFAULT_MAX_FREE_SLABS};
