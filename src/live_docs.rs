//! Live-document tracking.
//!
//! A set bit in a live-docs bitmap means the document is visible. Bitmaps
//! are published as immutable [`LiveDocs`] snapshots that any number of
//! readers may hold; the tracker that owns a segment's deletions mutates a
//! private copy and only shares it again when a new snapshot is requested.
//!
//! Two trackers implement [`LiveDocsTracker`]:
//!
//! - [`PendingDeletes`] tracks hard deletes only.
//! - [`PendingSoftDeletes`] layers soft deletes, driven by a doc-values
//!   field, over a hard-delete tracker.

use std::fmt::Debug;
use std::sync::Arc;

use bit_vec::BitVec;

use crate::config::UpdatesConfig;
use crate::error::Result;
use crate::segment::{SegmentCommitInfo, SegmentFormat, SegmentReader};
use crate::storage::Storage;
use crate::update::DocValuesFieldUpdates;

pub mod pending;
pub mod soft;

pub use pending::PendingDeletes;
pub use soft::PendingSoftDeletes;

/// Immutable, shareable live-docs bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveDocs(Arc<BitVec>);

impl LiveDocs {
    pub fn new(bits: BitVec) -> Self {
        LiveDocs(Arc::new(bits))
    }

    /// Bitmap of `max_doc` documents, all live.
    pub fn all_live(max_doc: u32) -> Self {
        LiveDocs::new(BitVec::from_elem(max_doc as usize, true))
    }

    /// Whether `doc` is live. Out-of-range docs are reported as deleted.
    pub fn get(&self, doc: u32) -> bool {
        self.0.get(doc as usize).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn num_live(&self) -> u32 {
        self.0.iter().filter(|live| *live).count() as u32
    }

    pub fn bits(&self) -> &BitVec {
        &self.0
    }

    /// Whether both snapshots are the same published bitmap.
    pub fn ptr_eq(&self, other: &LiveDocs) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Reclaim the bitmap, copying it if other snapshots still share it.
    pub fn into_bits(self) -> BitVec {
        Arc::unwrap_or_clone(self.0)
    }
}

/// Ownership state of a tracker's bitmap.
///
/// `AllLive` avoids allocating until the first delete. `Shared` is the
/// last published snapshot. `Owned` is the private writable copy, created
/// by the first mutation after a publish.
#[derive(Debug, Clone, Default)]
pub enum LiveDocsState {
    #[default]
    AllLive,
    Shared(LiveDocs),
    Owned(BitVec),
}

impl LiveDocsState {
    pub fn get(&self, doc: u32) -> bool {
        match self {
            LiveDocsState::AllLive => true,
            LiveDocsState::Shared(bits) => bits.get(doc),
            LiveDocsState::Owned(bits) => bits.get(doc as usize).unwrap_or(false),
        }
    }

    pub fn is_all_live(&self) -> bool {
        matches!(self, LiveDocsState::AllLive)
    }

    /// Publish the current bitmap, or `None` if every doc is live.
    pub fn snapshot(&mut self) -> Option<LiveDocs> {
        match std::mem::take(self) {
            LiveDocsState::AllLive => None,
            LiveDocsState::Shared(bits) => {
                *self = LiveDocsState::Shared(bits.clone());
                Some(bits)
            }
            LiveDocsState::Owned(bits) => {
                let bits = LiveDocs::new(bits);
                *self = LiveDocsState::Shared(bits.clone());
                Some(bits)
            }
        }
    }

    /// Take ownership of a writable bitmap, copying a shared snapshot.
    pub fn writable(&mut self, max_doc: u32) -> &mut BitVec {
        let bits = match std::mem::take(self) {
            LiveDocsState::AllLive => BitVec::from_elem(max_doc as usize, true),
            LiveDocsState::Shared(bits) => bits.into_bits(),
            LiveDocsState::Owned(bits) => bits,
        };
        *self = LiveDocsState::Owned(bits);
        match self {
            LiveDocsState::Owned(bits) => bits,
            _ => unreachable!(),
        }
    }

    /// Whether `reader` was opened against the currently published bitmap.
    pub fn matches(&self, reader_live_docs: Option<&LiveDocs>) -> bool {
        match (self, reader_live_docs) {
            (LiveDocsState::AllLive, None) => true,
            (LiveDocsState::Shared(bits), Some(other)) => bits.ptr_eq(other),
            _ => false,
        }
    }
}

/// Owner of one segment's deletions.
///
/// The tracker owns the segment's [`SegmentCommitInfo`]; generation and
/// delete-count changes go through it so the counts it reports never drift
/// from the descriptor.
pub trait LiveDocsTracker: Send + Sync + Debug {
    fn info(&self) -> &SegmentCommitInfo;

    fn info_mut(&mut self) -> &mut SegmentCommitInfo;

    /// Delete `doc`, returning whether it transitioned from live to deleted.
    fn delete(&mut self, doc: u32) -> Result<bool>;

    /// Whether `doc` is visible, counting hard and soft deletes.
    fn is_live(&self, doc: u32) -> bool;

    /// Whether `doc` survives hard deletes.
    fn is_hard_live(&self, doc: u32) -> bool;

    /// Publish the visible live docs; `None` means all live.
    fn live_docs(&mut self) -> Option<LiveDocs>;

    /// Publish the hard-delete view.
    fn hard_live_docs(&mut self) -> Option<LiveDocs>;

    /// Deletes not yet written. May be negative while soft deletes are being
    /// converted to hard deletes.
    fn num_pending_deletes(&self) -> i64;

    /// Durable hard and soft deletes plus pending ones.
    fn del_count(&self) -> u32 {
        let info = self.info();
        let total = info.del_count() as i64 + info.soft_del_count() as i64 + self.num_pending_deletes();
        total.max(0) as u32
    }

    fn num_docs(&self) -> u32 {
        self.info().max_doc().saturating_sub(self.del_count())
    }

    fn is_fully_deleted(&self) -> bool {
        self.del_count() == self.info().max_doc()
    }

    /// Initialize from a freshly opened reader.
    fn on_new_reader(&mut self, reader: &SegmentReader) -> Result<()>;

    /// Observe resolved doc-values updates for `field`.
    fn on_doc_values_update(&mut self, field: &str, updates: &DocValuesFieldUpdates) -> Result<()>;

    /// Persist pending hard deletes, returning whether a file was written.
    fn write_live_docs(&mut self, format: &dyn SegmentFormat, storage: &dyn Storage) -> Result<bool>;

    /// Forget pending changes after they were persisted or abandoned.
    fn drop_changes(&mut self);

    fn is_initialized(&self) -> bool;

    /// Whether `reader` lags behind the tracker's current view.
    fn needs_refresh(&self, reader: &SegmentReader) -> bool;

    fn soft_deletes_field(&self) -> Option<&str>;
}

/// Build the tracker `config` asks for.
pub fn new_tracker(info: SegmentCommitInfo, config: &UpdatesConfig) -> Box<dyn LiveDocsTracker> {
    match &config.soft_deletes_field {
        Some(field) => Box::new(PendingSoftDeletes::new(
            field.clone(),
            info,
            config.check_segment_integrity,
        )),
        None => Box::new(PendingDeletes::new(info)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_on_write_leaves_snapshot_untouched() {
        let mut state = LiveDocsState::default();
        assert!(state.snapshot().is_none());

        state.writable(4).set(1, false);
        let first = state.snapshot().unwrap();
        assert!(!first.get(1));

        state.writable(4).set(2, false);
        assert!(first.get(2));
        assert!(!state.get(2));

        let second = state.snapshot().unwrap();
        assert!(!second.ptr_eq(&first));
        assert!(state.matches(Some(&second)));
        assert!(!state.matches(Some(&first)));
        assert_eq!(second.num_live(), 2);
    }

    #[test]
    fn test_repeated_snapshots_share_bits() {
        let mut state = LiveDocsState::Owned(BitVec::from_elem(3, true));
        let a = state.snapshot().unwrap();
        let b = state.snapshot().unwrap();
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn test_writable_reuses_unshared_snapshot() {
        let mut state = LiveDocsState::default();
        state.writable(3).set(0, false);
        drop(state.snapshot());
        // No outstanding snapshot, so the bitmap is reclaimed rather than copied.
        assert!(!state.writable(3)[0]);
        assert!(LiveDocsState::AllLive.matches(None));
    }

    #[test]
    fn test_out_of_range_is_not_live() {
        let bits = LiveDocs::all_live(3);
        assert!(bits.get(2));
        assert!(!bits.get(3));
    }
}
