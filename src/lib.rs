//! Caching for decoded resources which are expensive to produce and expensive to hold.
//!
//! Think of images or models fetched over the network: the encoded bytes are worth keeping on disk, the decoded form is
//! worth keeping in memory for as long as there's room, and two callers asking for the same thing at the same time
//! should never cause it to be fetched twice.  This crate provides the pieces for that, which can be used separately:
//!
//! [CostBasedLru] is a standard Lru cache which supports giving each item a cost.  Everything else is built on it, and
//! it's exposed because it's useful in other contexts.
//!
//! [DiskLruStore] is a size-bounded store of entries in a directory, each holding a fixed number of byte values.  All
//! changes go through a journal, so the store survives crashes: edits that were in progress are discarded on the next
//! open, and a journal which can't be understood wipes the store rather than failing.  Reads return a [Snapshot] and
//! writes go through an [Editor], at most one per entry at a time.
//!
//! [ReferenceCounter] counts who holds a decoded [Resource] and recycles it when nobody does.  Callers hold resources
//! through [Acquired] handles.
//!
//! [MemoryCache] is a byte-bounded LRU of resources which reports every eviction to an [EvictionListener].
//!
//! The [LoadEngine] ties these together.  A load is served from memory, from a resource some other caller still holds,
//! from a [LoadJob] already running for the same key, or by running a caller-supplied [Pipeline] on a worker thread
//! with the disk store in front of it.
//!
//! To use the engine, implement [Resource] for your decoded type and [Pipeline] for each way of producing it, then
//! construct a [LoadEngine] from a [CacheConfig].
mod config;
mod cost_based_lru;
mod disk_store;
mod editor;
mod engine;
mod executor;
mod job;
mod journal;
mod key;
mod memory_cache;
mod reference_counter;
mod traits;

#[cfg(test)]
mod test_support;

pub use config::*;
pub use cost_based_lru::*;
pub use disk_store::*;
pub use editor::*;
pub use engine::*;
pub use job::*;
pub use key::*;
pub use memory_cache::*;
pub use reference_counter::*;
pub use traits::*;
