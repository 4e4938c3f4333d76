//! # Palisade
//!
//! Deletion and field-update reconciliation for segmented, append-only
//! search indexes.
//!
//! ## Features
//!
//! - Buffered term, query and doc-values updates with per-entry doc cutoffs
//! - Generation-stamped, prefix-compressed update packets
//! - Copy-on-write live-docs tracking with hard and soft deletes
//! - A ref-counted reader pool shared by search, flush and merge
//! - Carry-over of concurrent deletes and updates across merges
//! - Pluggable storage backends

pub mod config;
pub mod error;
pub mod live_docs;
pub mod pool;
pub mod segment;
pub mod storage;
pub mod update;
pub mod util;

pub mod prelude {
    pub use crate::config::UpdatesConfig;
    pub use crate::error::{PalisadeError, Result};
    pub use crate::live_docs::{LiveDocs, LiveDocsTracker, PendingDeletes, PendingSoftDeletes};
    pub use crate::pool::{CompactingDocMap, MergeDocMap, MergeHandle, ReaderPool, ReadersAndUpdates};
    pub use crate::segment::{
        SegmentCommitInfo, SegmentFormat, SegmentId, SegmentInfo, SegmentOpener, SegmentReader,
        SegmentSource, StructuredFormat,
    };
    pub use crate::storage::Storage;
    pub use crate::update::{
        ApplyResult, BufferedUpdates, BufferedUpdatesStream, DeleteQuery, FrozenBufferedUpdates,
        Term, TermQuery, UpdateValue,
    };
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
