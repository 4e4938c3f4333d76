//! A segment source bound to one live-docs view.

use std::fmt::Debug;
use std::sync::Arc;

use crate::error::{PalisadeError, Result};
use crate::live_docs::LiveDocs;
use crate::segment::{SegmentCommitInfo, SegmentSource};

/// Factory for segment sources.
pub trait SegmentOpener: Send + Sync + Debug {
    /// Open the immutable contents of the segment `info` describes.
    fn open(&self, info: &SegmentCommitInfo) -> Result<Arc<dyn SegmentSource>>;
}

/// Point-in-time reader over a segment.
///
/// The reader never changes after construction. Reopening with fresher
/// deletes produces a new reader that shares the same source.
#[derive(Debug, Clone)]
pub struct SegmentReader {
    source: Arc<dyn SegmentSource>,
    info: SegmentCommitInfo,
    live_docs: Option<LiveDocs>,
    hard_live_docs: Option<LiveDocs>,
    num_docs: u32,
}

impl SegmentReader {
    /// Open a reader where hard and visible deletions coincide.
    pub fn open(
        source: Arc<dyn SegmentSource>,
        info: SegmentCommitInfo,
        live_docs: Option<LiveDocs>,
    ) -> Result<Self> {
        let hard_live_docs = live_docs.clone();
        Self::with_live_docs(source, info, live_docs, hard_live_docs)
    }

    /// Bind `source` to explicit live and hard-live views.
    ///
    /// `live_docs` hides hard and soft deletes alike; `hard_live_docs` hides
    /// hard deletes only. `None` means every document is live.
    pub fn with_live_docs(
        source: Arc<dyn SegmentSource>,
        info: SegmentCommitInfo,
        live_docs: Option<LiveDocs>,
        hard_live_docs: Option<LiveDocs>,
    ) -> Result<Self> {
        let max_doc = info.max_doc();
        if source.max_doc() != max_doc {
            return Err(PalisadeError::illegal_state(format!(
                "source of segment {} has {} docs, descriptor says {max_doc}",
                info.id(),
                source.max_doc()
            )));
        }
        for bits in [&live_docs, &hard_live_docs].into_iter().flatten() {
            if bits.len() != max_doc as usize {
                return Err(PalisadeError::illegal_state(format!(
                    "live docs of length {} for segment {} with max_doc {max_doc}",
                    bits.len(),
                    info.id()
                )));
            }
        }

        let num_docs = live_docs.as_ref().map_or(max_doc, |bits| bits.num_live());
        Ok(SegmentReader {
            source,
            info,
            live_docs,
            hard_live_docs,
            num_docs,
        })
    }

    pub fn source(&self) -> &Arc<dyn SegmentSource> {
        &self.source
    }

    /// Descriptor snapshot the reader was opened against.
    pub fn info(&self) -> &SegmentCommitInfo {
        &self.info
    }

    pub fn max_doc(&self) -> u32 {
        self.info.max_doc()
    }

    /// Documents visible to searches.
    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    pub fn num_deleted_docs(&self) -> u32 {
        self.max_doc() - self.num_docs
    }

    pub fn has_deletions(&self) -> bool {
        self.live_docs.is_some()
    }

    pub fn live_docs(&self) -> Option<&LiveDocs> {
        self.live_docs.as_ref()
    }

    pub fn hard_live_docs(&self) -> Option<&LiveDocs> {
        self.hard_live_docs.as_ref()
    }

    pub fn is_live(&self, doc: u32) -> bool {
        self.live_docs.as_ref().is_none_or(|bits| bits.get(doc))
    }

    pub fn ram_bytes_used(&self) -> u64 {
        let bits = self
            .live_docs
            .as_ref()
            .map_or(0, |bits| bits.len().div_ceil(8) as u64);
        self.source.ram_bytes_used() + bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::memory::MemorySegment;
    use crate::segment::{SegmentId, SegmentInfo};
    use bit_vec::BitVec;

    fn info(max_doc: u32) -> SegmentCommitInfo {
        SegmentCommitInfo::new_flushed(SegmentInfo::new(SegmentId::new("_0"), max_doc))
    }

    #[test]
    fn test_open_without_deletions() {
        let reader = SegmentReader::open(Arc::new(MemorySegment::new(5)), info(5), None).unwrap();
        assert_eq!(reader.num_docs(), 5);
        assert!(!reader.has_deletions());
        assert!(reader.is_live(4));
    }

    #[test]
    fn test_soft_and_hard_views() {
        let mut hard = BitVec::from_elem(5, true);
        hard.set(0, false);
        let mut live = hard.clone();
        live.set(2, false);

        let reader = SegmentReader::with_live_docs(
            Arc::new(MemorySegment::new(5)),
            info(5),
            Some(LiveDocs::new(live)),
            Some(LiveDocs::new(hard)),
        )
        .unwrap();

        assert_eq!(reader.num_docs(), 3);
        assert_eq!(reader.num_deleted_docs(), 2);
        assert!(!reader.is_live(2));
        assert!(reader.hard_live_docs().unwrap().get(2));
    }

    #[test]
    fn test_length_mismatch_is_invariant_violation() {
        let err = SegmentReader::open(
            Arc::new(MemorySegment::new(5)),
            info(5),
            Some(LiveDocs::all_live(4)),
        )
        .unwrap_err();
        assert!(err.is_invariant_violation());

        let err = SegmentReader::open(Arc::new(MemorySegment::new(6)), info(5), None).unwrap_err();
        assert!(err.is_invariant_violation());
    }
}
