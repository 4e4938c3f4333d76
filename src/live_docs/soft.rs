//! Soft deletes layered over hard deletes.
//!
//! A document is soft-deleted when it has a value in the soft-deletes
//! doc-values field. Soft-deleted documents stay on disk and stay live in
//! the hard view, but searches must not see them. The tracker keeps two
//! bitmaps: the hard one, owned by an inner [`PendingDeletes`], and a
//! visible view that additionally hides soft-deleted documents.

use crate::error::{PalisadeError, Result};
use crate::live_docs::{LiveDocs, LiveDocsState, LiveDocsTracker, PendingDeletes};
use crate::segment::{SegmentCommitInfo, SegmentFormat, SegmentReader};
use crate::storage::Storage;
use crate::update::DocValuesFieldUpdates;

/// The descriptor's doc-values generation has never been observed.
const UNSEEN_DV_GEN: i64 = -2;

/// Hard and soft delete tracking for one segment.
#[derive(Debug)]
pub struct PendingSoftDeletes {
    field: String,
    hard: PendingDeletes,
    view: LiveDocsState,
    /// Soft deletes not yet folded into the descriptor. Negative when
    /// soft-deleted documents were hard-deleted or un-soft-deleted.
    soft_pending: i64,
    /// Doc-values generation the view was last reconciled against.
    dv_generation: i64,
    check_integrity: bool,
}

impl PendingSoftDeletes {
    pub fn new(field: String, info: SegmentCommitInfo, check_integrity: bool) -> Self {
        PendingSoftDeletes {
            field,
            hard: PendingDeletes::new(info),
            view: LiveDocsState::AllLive,
            soft_pending: 0,
            dv_generation: UNSEEN_DV_GEN,
            check_integrity,
        }
    }

    /// The hard-delete tracker underneath.
    pub fn hard_deletes(&self) -> &PendingDeletes {
        &self.hard
    }

    pub fn soft_pending(&self) -> i64 {
        self.soft_pending
    }

    fn check_initialized(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(PalisadeError::illegal_state(format!(
                "soft deletes of segment {} are not initialized",
                self.info().id()
            )));
        }
        Ok(())
    }

    /// Hide every hard-live doc that has a soft-deletes value, returning how many there are.
    fn apply_soft_deletes(&mut self, reader: &SegmentReader) -> Result<i64> {
        let Some(mut docs) = reader.source().doc_values(&self.field)? else {
            return Ok(0);
        };

        let max_doc = self.info().max_doc();
        let mut soft_deleted = 0;
        while docs.next()? {
            let doc = docs.doc_id();
            if doc >= max_doc {
                return Err(PalisadeError::illegal_state(format!(
                    "soft delete of doc {doc} beyond max_doc {max_doc} in segment {}",
                    self.info().id()
                )));
            }
            if !self.hard.is_live(doc) {
                continue;
            }
            soft_deleted += 1;
            if self.view.get(doc) {
                self.view.writable(max_doc).set(doc as usize, false);
            }
        }
        Ok(soft_deleted)
    }
}

impl LiveDocsTracker for PendingSoftDeletes {
    fn info(&self) -> &SegmentCommitInfo {
        self.hard.info()
    }

    fn info_mut(&mut self) -> &mut SegmentCommitInfo {
        self.hard.info_mut()
    }

    fn delete(&mut self, doc: u32) -> Result<bool> {
        self.check_initialized()?;
        if !self.hard.delete(doc)? {
            return Ok(false);
        }
        if self.view.get(doc) {
            let max_doc = self.info().max_doc();
            self.view.writable(max_doc).set(doc as usize, false);
        } else {
            // Already soft-deleted; it now counts as a hard delete instead.
            self.soft_pending -= 1;
        }
        Ok(true)
    }

    fn is_live(&self, doc: u32) -> bool {
        doc < self.info().max_doc() && self.view.get(doc)
    }

    fn is_hard_live(&self, doc: u32) -> bool {
        self.hard.is_live(doc)
    }

    fn live_docs(&mut self) -> Option<LiveDocs> {
        self.view.snapshot()
    }

    fn hard_live_docs(&mut self) -> Option<LiveDocs> {
        self.hard.live_docs()
    }

    fn num_pending_deletes(&self) -> i64 {
        self.hard.num_pending_deletes() + self.soft_pending
    }

    fn on_new_reader(&mut self, reader: &SegmentReader) -> Result<()> {
        self.hard.on_new_reader(reader)?;

        if self.dv_generation == UNSEEN_DV_GEN {
            self.view = match reader.live_docs() {
                Some(bits) => LiveDocsState::Shared(bits.clone()),
                None => LiveDocsState::AllLive,
            };
        }

        let dv_gen = self.info().doc_values_gen();
        if self.dv_generation < dv_gen {
            let soft_deleted = self.apply_soft_deletes(reader)?;
            let expected = self.info().soft_del_count() as i64 + self.soft_pending;
            if self.check_integrity && soft_deleted != expected {
                return Err(PalisadeError::illegal_state(format!(
                    "segment {} has {soft_deleted} soft-deleted docs in field {}, expected {expected}",
                    self.info().id(),
                    self.field
                )));
            }
            self.dv_generation = dv_gen;
            log::trace!(
                "segment {}: {soft_deleted} soft deletes at doc values generation {dv_gen}",
                self.info().id()
            );
        }
        Ok(())
    }

    fn on_doc_values_update(&mut self, field: &str, updates: &DocValuesFieldUpdates) -> Result<()> {
        if field != self.field {
            return Ok(());
        }
        self.check_initialized()?;

        let max_doc = self.info().max_doc();
        for (doc, value) in updates.iter() {
            if doc >= max_doc {
                return Err(PalisadeError::illegal_state(format!(
                    "doc values update for doc {doc} beyond max_doc {max_doc}"
                )));
            }
            if value.is_some() {
                if self.view.get(doc) {
                    self.view.writable(max_doc).set(doc as usize, false);
                    self.soft_pending += 1;
                }
            } else if !self.view.get(doc) && self.hard.is_live(doc) {
                self.view.writable(max_doc).set(doc as usize, true);
                self.soft_pending -= 1;
            }
        }
        Ok(())
    }

    fn write_live_docs(&mut self, format: &dyn SegmentFormat, storage: &dyn Storage) -> Result<bool> {
        // Fold soft deletes first: a soft-deleted doc that was hard-deleted
        // must leave the soft count before it enters the hard count.
        let previous = self.info().soft_del_count();
        let folded = previous as i64 + self.soft_pending;
        if folded < 0 || folded > self.info().max_doc() as i64 {
            return Err(PalisadeError::illegal_state(format!(
                "segment {}: soft delete count would become {folded}",
                self.info().id()
            )));
        }
        if self.soft_pending != 0 {
            self.hard.info_mut().set_soft_del_count(folded as u32)?;
        }
        let soft_pending = std::mem::take(&mut self.soft_pending);

        match self.hard.write_live_docs(format, storage) {
            Ok(written) => Ok(written),
            Err(err) => {
                if let Err(restore) = self.hard.info_mut().set_soft_del_count(previous) {
                    log::warn!(
                        "could not restore soft delete count of segment {}: {restore}",
                        self.info().id()
                    );
                }
                self.soft_pending = soft_pending;
                Err(err)
            }
        }
    }

    fn drop_changes(&mut self) {
        self.hard.drop_changes();
        self.soft_pending = 0;
    }

    fn is_initialized(&self) -> bool {
        self.hard.is_initialized() && self.dv_generation != UNSEEN_DV_GEN
    }

    fn needs_refresh(&self, reader: &SegmentReader) -> bool {
        !self.view.matches(reader.live_docs())
            || !self.hard.state().matches(reader.hard_live_docs())
            || reader.num_deleted_docs() != self.del_count()
    }

    fn soft_deletes_field(&self) -> Option<&str> {
        Some(&self.field)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::segment::memory::MemorySegment;
    use crate::segment::{SegmentId, SegmentInfo, StructuredFormat};
    use crate::storage::memory::MemoryStorage;
    use crate::update::{DocValuesType, UpdateValue};

    const SOFT: &str = "__soft_deletes";

    /// Segment of `max_doc` docs where `soft` docs carry a soft-deletes value.
    fn open(max_doc: u32, soft: &[u32], soft_del_count: u32) -> (PendingSoftDeletes, SegmentReader) {
        let mut segment = MemorySegment::new(max_doc);
        for &doc in soft {
            segment.set_doc_value(SOFT, doc, UpdateValue::Numeric(1)).unwrap();
        }
        let info = SegmentCommitInfo::new(
            SegmentInfo::new(SegmentId::new("_5"), max_doc),
            0,
            soft_del_count,
            -1,
            -1,
            -1,
        )
        .unwrap();
        let reader = SegmentReader::open(Arc::new(segment), info.clone(), None).unwrap();
        (PendingSoftDeletes::new(SOFT.to_string(), info, true), reader)
    }

    #[test]
    fn test_requires_initialization() {
        let (mut deletes, reader) = open(4, &[], 0);
        assert!(!deletes.is_initialized());
        assert!(deletes.delete(0).unwrap_err().is_invariant_violation());

        deletes.on_new_reader(&reader).unwrap();
        assert!(deletes.is_initialized());
        assert!(deletes.delete(0).unwrap());
    }

    #[test]
    fn test_soft_deleted_doc_hidden_but_hard_live() {
        let (mut deletes, reader) = open(4, &[1], 1);
        deletes.on_new_reader(&reader).unwrap();

        assert!(!deletes.is_live(1));
        assert!(deletes.is_hard_live(1));
        assert_eq!(deletes.del_count(), 1);
        assert_eq!(deletes.num_docs(), 3);

        let live = deletes.live_docs().unwrap();
        assert!(!live.get(1));
        assert!(deletes.hard_live_docs().is_none());
    }

    #[test]
    fn test_soft_count_mismatch_is_detected() {
        let (mut deletes, reader) = open(4, &[1, 2], 1);
        let err = deletes.on_new_reader(&reader).unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn test_hard_delete_of_soft_deleted_doc_moves_the_count() {
        let storage = MemoryStorage::new_default();
        let format = StructuredFormat::new();
        let (mut deletes, reader) = open(4, &[1], 1);
        deletes.on_new_reader(&reader).unwrap();

        assert!(deletes.delete(1).unwrap());
        assert!(!deletes.delete(1).unwrap());
        assert_eq!(deletes.soft_pending(), -1);
        assert_eq!(deletes.del_count(), 1);

        assert!(deletes.write_live_docs(&format, &storage).unwrap());
        assert_eq!(deletes.info().del_count(), 1);
        assert_eq!(deletes.info().soft_del_count(), 0);
        assert_eq!(deletes.num_pending_deletes(), 0);
        assert_eq!(deletes.del_count(), 1);
    }

    #[test]
    fn test_doc_values_updates_soft_delete_and_restore() {
        let (mut deletes, reader) = open(5, &[1], 1);
        deletes.on_new_reader(&reader).unwrap();
        deletes.delete(4).unwrap();

        let mut updates = DocValuesFieldUpdates::new(SOFT, DocValuesType::Numeric, 1, 5);
        updates.add(2, Some(UpdateValue::Numeric(1))).unwrap();
        updates.add(1, None).unwrap();
        // Hard-deleted docs are never brought back.
        updates.add(4, None).unwrap();
        updates.finish();
        deletes.on_doc_values_update(SOFT, &updates).unwrap();

        assert!(!deletes.is_live(2));
        assert!(deletes.is_live(1));
        assert!(!deletes.is_live(4));
        assert_eq!(deletes.soft_pending(), 0);
        assert_eq!(deletes.del_count(), 2);

        let mut other = DocValuesFieldUpdates::new("price", DocValuesType::Numeric, 1, 5);
        other.add(0, Some(UpdateValue::Numeric(9))).unwrap();
        other.finish();
        deletes.on_doc_values_update("price", &other).unwrap();
        assert!(deletes.is_live(0));
    }

    #[test]
    fn test_fully_deleted_counts_soft_deletes() {
        let (mut deletes, reader) = open(3, &[0, 1], 2);
        deletes.on_new_reader(&reader).unwrap();
        assert!(!deletes.is_fully_deleted());

        deletes.delete(2).unwrap();
        assert!(deletes.is_fully_deleted());
        // The soft-deleted docs are still reachable through the hard view.
        let hard = deletes.hard_live_docs().unwrap();
        assert!(hard.get(0) && hard.get(1) && !hard.get(2));
    }

    #[test]
    fn test_needs_refresh_tracks_view() {
        let (mut deletes, reader) = open(4, &[], 0);
        deletes.on_new_reader(&reader).unwrap();
        assert!(!deletes.needs_refresh(&reader));

        deletes.delete(3).unwrap();
        assert!(deletes.needs_refresh(&reader));

        let refreshed = SegmentReader::with_live_docs(
            Arc::clone(reader.source()),
            deletes.info().clone(),
            deletes.live_docs(),
            deletes.hard_live_docs(),
        )
        .unwrap();
        assert!(!deletes.needs_refresh(&refreshed));
    }
}
