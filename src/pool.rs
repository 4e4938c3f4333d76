//! Shared registry of per-segment readers and pending updates.
//!
//! The [`ReaderPool`] keeps at most one [`ReadersAndUpdates`] entry per
//! segment identity. Flush, merge, search and packet application all go
//! through that entry, so every consumer sees the same live docs and no
//! update is applied twice.
//!
//! Entries are reference counted. The pool holds one reference of its own
//! for as long as the entry is registered; every [`ReaderPool::get`] adds
//! one that the caller gives back with [`ReaderPool::release`].

use std::sync::Arc;

use crate::config::UpdatesConfig;
use crate::segment::{SegmentFormat, SegmentOpener};
use crate::storage::Storage;

pub mod merge;
pub mod reader_pool;
pub mod readers_and_updates;

pub use merge::{CompactingDocMap, MergeCarryOver, MergeDocMap, MergeHandle, MergeReader};
pub use reader_pool::ReaderPool;
pub use readers_and_updates::ReadersAndUpdates;

/// Collaborators shared by the pool and all of its entries.
#[derive(Debug)]
pub(crate) struct PoolContext {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) opener: Arc<dyn SegmentOpener>,
    pub(crate) format: Arc<dyn SegmentFormat>,
    pub(crate) config: UpdatesConfig,
}
