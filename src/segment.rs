//! Segment identity, commit descriptors and the collaborator traits the
//! reconciliation core consumes.
//!
//! - [`commit`]: per-segment generation counters and delete counts
//! - [`source`]: read-only term, postings and doc-values access
//! - [`format`]: persistence of live-docs and field-update generations
//! - [`reader`]: a source bound to a specific live-docs view
//! - [`memory`]: an in-memory segment used by tests and benchmarks

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod commit;
pub mod format;
pub mod memory;
pub mod reader;
pub mod source;

pub use commit::{SegmentCommitInfo, SegmentInfo};
pub use format::{SegmentFormat, StructuredFormat};
pub use reader::{SegmentOpener, SegmentReader};
pub use source::{NO_MORE_DOCS, PostingIterator, SegmentSource, TermsEnum};

/// Identity of a segment: its name plus a random 128-bit id.
///
/// Two segments with the same name written by different writers never
/// compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentId {
    name: String,
    id: [u8; 16],
}

impl SegmentId {
    /// Create an identity with a fresh random id.
    pub fn new<S: Into<String>>(name: S) -> Self {
        SegmentId {
            name: name.into(),
            id: *Uuid::new_v4().as_bytes(),
        }
    }

    /// Create an identity from a previously persisted id.
    pub fn with_id<S: Into<String>>(name: S, id: [u8; 16]) -> Self {
        SegmentId {
            name: name.into(),
            id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &[u8; 16] {
        &self.id
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
