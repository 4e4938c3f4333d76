//! Carrying deletes and updates across a merge.
//!
//! A merge reads its source segments as they were when it started. Deletes
//! and doc-values updates that land on a source while the merge runs are
//! replayed onto the merged segment when the merge commits: deletes by
//! diffing the source's hard live docs against the merge-start snapshot,
//! updates from the shadow map the source entry fills while merging.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::live_docs::LiveDocs;
use crate::pool::ReadersAndUpdates;
use crate::segment::{SegmentId, SegmentReader};
use crate::update::DocValuesFieldUpdates;

/// A source segment as the merge sees it.
#[derive(Debug, Clone)]
pub struct MergeReader {
    reader: Arc<SegmentReader>,
}

impl MergeReader {
    pub(crate) fn new(reader: Arc<SegmentReader>) -> Self {
        MergeReader { reader }
    }

    pub fn reader(&self) -> &Arc<SegmentReader> {
        &self.reader
    }

    pub fn id(&self) -> &SegmentId {
        self.reader.info().id()
    }

    pub fn max_doc(&self) -> u32 {
        self.reader.max_doc()
    }

    /// Hard live docs at merge start; `None` means all live.
    pub fn hard_live_docs(&self) -> Option<&LiveDocs> {
        self.reader.hard_live_docs()
    }

    pub fn is_hard_live(&self, doc: u32) -> bool {
        doc < self.max_doc() && self.hard_live_docs().is_none_or(|bits| bits.get(doc))
    }

    /// Docs the merge copies into the merged segment.
    pub fn num_hard_live(&self) -> u32 {
        self.hard_live_docs().map_or(self.max_doc(), LiveDocs::num_live)
    }
}

/// What happened to a source segment while it was being merged.
#[derive(Debug, Default)]
pub struct MergeCarryOver {
    /// Source doc ids hard-deleted since the merge started.
    pub deleted: Vec<u32>,
    /// Doc-values updates received since the merge started, oldest first per field.
    pub updates: BTreeMap<String, Vec<DocValuesFieldUpdates>>,
}

/// Maps source doc ids to doc ids of the merged segment.
pub trait MergeDocMap: Send + Sync + Debug {
    /// Merged doc id of `doc` in the `source`-th segment, or `None` if the
    /// merge dropped it.
    fn map(&self, source: usize, doc: u32) -> Option<u32>;

    /// Number of docs in the merged segment.
    fn max_doc(&self) -> u32;
}

#[derive(Debug, Clone)]
struct SourceDocs {
    base: u32,
    max_doc: u32,
    /// Live docs and, per doc, how many live docs precede it.
    live: Option<(LiveDocs, Vec<u32>)>,
}

/// Doc map of a merge that concatenates its sources in order and drops
/// hard-deleted docs.
#[derive(Debug, Clone)]
pub struct CompactingDocMap {
    sources: Vec<SourceDocs>,
    max_doc: u32,
}

impl CompactingDocMap {
    pub fn new(readers: &[MergeReader]) -> Self {
        let mut sources = Vec::with_capacity(readers.len());
        let mut base = 0u32;
        for reader in readers {
            let live = reader.hard_live_docs().map(|bits| {
                let mut ranks = Vec::with_capacity(bits.len());
                let mut live_before = 0u32;
                for doc in 0..reader.max_doc() {
                    ranks.push(live_before);
                    if bits.get(doc) {
                        live_before += 1;
                    }
                }
                (bits.clone(), ranks)
            });
            sources.push(SourceDocs {
                base,
                max_doc: reader.max_doc(),
                live,
            });
            base += reader.num_hard_live();
        }
        CompactingDocMap {
            sources,
            max_doc: base,
        }
    }
}

impl MergeDocMap for CompactingDocMap {
    fn map(&self, source: usize, doc: u32) -> Option<u32> {
        let docs = self.sources.get(source)?;
        if doc >= docs.max_doc {
            return None;
        }
        match &docs.live {
            None => Some(docs.base + doc),
            Some((bits, ranks)) => bits
                .get(doc)
                .then(|| docs.base + ranks.get(doc as usize).copied().unwrap_or(0)),
        }
    }

    fn max_doc(&self) -> u32 {
        self.max_doc
    }
}

/// A merge in progress.
///
/// Holds a reference on every source entry until it is handed back to
/// [`ReaderPool::commit_merge`](crate::pool::ReaderPool::commit_merge) or
/// [`ReaderPool::abort_merge`](crate::pool::ReaderPool::abort_merge).
#[derive(Debug)]
pub struct MergeHandle {
    pub(crate) entries: Vec<Arc<ReadersAndUpdates>>,
    pub(crate) readers: Vec<MergeReader>,
}

impl MergeHandle {
    /// Source views, in merge order.
    pub fn readers(&self) -> &[MergeReader] {
        &self.readers
    }

    pub fn segments(&self) -> impl Iterator<Item = &SegmentId> {
        self.entries.iter().map(|entry| entry.id())
    }

    /// Doc map for a merge that keeps every hard-live doc in source order.
    pub fn doc_map(&self) -> CompactingDocMap {
        CompactingDocMap::new(&self.readers)
    }

    /// Docs the merged segment will hold.
    pub fn merged_max_doc(&self) -> u32 {
        self.readers.iter().map(MergeReader::num_hard_live).sum()
    }

    /// Oldest packet generation reflected in every source.
    pub fn min_buffered_deletes_gen(&self) -> i64 {
        self.entries
            .iter()
            .map(|entry| entry.buffered_deletes_gen())
            .min()
            .unwrap_or(0)
    }
}
