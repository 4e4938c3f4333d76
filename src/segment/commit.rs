//! Commit descriptor for one segment.
//!
//! A [`SegmentCommitInfo`] pairs the immutable [`SegmentInfo`] with the
//! mutable per-commit state: delete counts and three independent generation
//! counters (live docs, field infos, doc values). Each counter is `-1` until
//! the first successful write of that facet and has a "next write"
//! companion naming the generation the next write will produce.
//!
//! Descriptors are plain values. Code that hands a descriptor to another
//! consumer clones it rather than sharing a mutable reference, so every
//! observer sees one consistent point in time.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{PalisadeError, Result};
use crate::segment::SegmentId;
use crate::storage::Storage;

/// Immutable description of a written segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// Segment identity.
    pub id: SegmentId,

    /// Number of documents in the segment, deleted or not.
    pub max_doc: u32,

    /// Files written when the segment was flushed or merged.
    pub files: BTreeSet<String>,
}

impl SegmentInfo {
    pub fn new(id: SegmentId, max_doc: u32) -> Self {
        SegmentInfo {
            id,
            max_doc,
            files: BTreeSet::new(),
        }
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }
}

/// Per-commit state of a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentCommitInfo {
    info: Arc<SegmentInfo>,

    del_count: u32,
    soft_del_count: u32,

    del_gen: i64,
    next_write_del_gen: i64,

    field_infos_gen: i64,
    next_write_field_infos_gen: i64,

    doc_values_gen: i64,
    next_write_doc_values_gen: i64,

    /// Generation of the newest update packet already reflected in this segment.
    buffered_deletes_gen: i64,

    field_infos_files: BTreeSet<String>,

    /// Field-update files by field name.
    doc_values_updates_files: BTreeMap<String, BTreeSet<String>>,
}

fn next_write(generation: i64) -> i64 {
    if generation == -1 { 1 } else { generation + 1 }
}

impl SegmentCommitInfo {
    /// Create a descriptor, validating generations and delete counts.
    pub fn new(
        info: SegmentInfo,
        del_count: u32,
        soft_del_count: u32,
        del_gen: i64,
        field_infos_gen: i64,
        doc_values_gen: i64,
    ) -> Result<Self> {
        for (name, generation) in [
            ("del_gen", del_gen),
            ("field_infos_gen", field_infos_gen),
            ("doc_values_gen", doc_values_gen),
        ] {
            if generation < -1 || generation == 0 {
                return Err(PalisadeError::invalid_argument(format!(
                    "{name} must be -1 or positive, got {generation}"
                )));
            }
        }

        check_counts(info.max_doc, del_count, soft_del_count)?;

        Ok(SegmentCommitInfo {
            info: Arc::new(info),
            del_count,
            soft_del_count,
            del_gen,
            next_write_del_gen: next_write(del_gen),
            field_infos_gen,
            next_write_field_infos_gen: next_write(field_infos_gen),
            doc_values_gen,
            next_write_doc_values_gen: next_write(doc_values_gen),
            buffered_deletes_gen: 0,
            field_infos_files: BTreeSet::new(),
            doc_values_updates_files: BTreeMap::new(),
        })
    }

    /// Descriptor for a freshly flushed segment with no deletes and no updates.
    pub fn new_flushed(info: SegmentInfo) -> Self {
        SegmentCommitInfo {
            info: Arc::new(info),
            del_count: 0,
            soft_del_count: 0,
            del_gen: -1,
            next_write_del_gen: 1,
            field_infos_gen: -1,
            next_write_field_infos_gen: 1,
            doc_values_gen: -1,
            next_write_doc_values_gen: 1,
            buffered_deletes_gen: 0,
            field_infos_files: BTreeSet::new(),
            doc_values_updates_files: BTreeMap::new(),
        }
    }

    pub fn info(&self) -> &SegmentInfo {
        &self.info
    }

    pub fn id(&self) -> &SegmentId {
        &self.info.id
    }

    pub fn max_doc(&self) -> u32 {
        self.info.max_doc
    }

    pub fn del_count(&self) -> u32 {
        self.del_count
    }

    pub fn soft_del_count(&self) -> u32 {
        self.soft_del_count
    }

    /// Set the durable hard-delete count.
    pub fn set_del_count(&mut self, del_count: u32) -> Result<()> {
        check_counts(self.info.max_doc, del_count, self.soft_del_count)?;
        self.del_count = del_count;
        Ok(())
    }

    /// Set the durable soft-delete count.
    pub fn set_soft_del_count(&mut self, soft_del_count: u32) -> Result<()> {
        check_counts(self.info.max_doc, self.del_count, soft_del_count)?;
        self.soft_del_count = soft_del_count;
        Ok(())
    }

    pub fn del_gen(&self) -> i64 {
        self.del_gen
    }

    pub fn next_write_del_gen(&self) -> i64 {
        self.next_write_del_gen
    }

    /// Move `del_gen` to the generation that was just written.
    pub fn advance_del_gen(&mut self) {
        self.del_gen = self.next_write_del_gen;
        self.next_write_del_gen = self.del_gen + 1;
    }

    pub fn field_infos_gen(&self) -> i64 {
        self.field_infos_gen
    }

    pub fn next_write_field_infos_gen(&self) -> i64 {
        self.next_write_field_infos_gen
    }

    pub fn advance_field_infos_gen(&mut self) {
        self.field_infos_gen = self.next_write_field_infos_gen;
        self.next_write_field_infos_gen = self.field_infos_gen + 1;
    }

    pub fn doc_values_gen(&self) -> i64 {
        self.doc_values_gen
    }

    pub fn next_write_doc_values_gen(&self) -> i64 {
        self.next_write_doc_values_gen
    }

    pub fn advance_doc_values_gen(&mut self) {
        self.doc_values_gen = self.next_write_doc_values_gen;
        self.next_write_doc_values_gen = self.doc_values_gen + 1;
    }

    pub fn buffered_deletes_gen(&self) -> i64 {
        self.buffered_deletes_gen
    }

    /// Record that every packet up to `generation` is reflected in this segment.
    ///
    /// Generations never move backwards.
    pub fn set_buffered_deletes_gen(&mut self, generation: i64) -> Result<()> {
        if generation < self.buffered_deletes_gen {
            return Err(PalisadeError::illegal_state(format!(
                "segment {} buffered deletes generation cannot move from {} back to {generation}",
                self.info.id, self.buffered_deletes_gen
            )));
        }
        self.buffered_deletes_gen = generation;
        Ok(())
    }

    /// Whether a live-docs generation has been written.
    pub fn has_deletions(&self) -> bool {
        self.del_gen != -1
    }

    /// Whether any field-update generation has been written.
    pub fn has_field_updates(&self) -> bool {
        self.field_infos_gen != -1
    }

    /// File holding the current live-docs generation, if any.
    pub fn live_docs_file_name(&self) -> Option<String> {
        if self.has_deletions() {
            Some(live_docs_file_name(&self.info.id, self.del_gen))
        } else {
            None
        }
    }

    pub fn field_infos_files(&self) -> &BTreeSet<String> {
        &self.field_infos_files
    }

    pub fn set_field_infos_files(&mut self, files: BTreeSet<String>) {
        self.field_infos_files = files;
    }

    pub fn doc_values_updates_files(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.doc_values_updates_files
    }

    /// Replace the update files recorded for `field`.
    pub fn set_doc_values_updates_files(&mut self, field: &str, files: BTreeSet<String>) {
        self.doc_values_updates_files.insert(field.to_string(), files);
    }

    /// Every file that belongs to this commit of the segment.
    pub fn files(&self) -> BTreeSet<String> {
        let mut files = self.info.files.clone();
        if let Some(name) = self.live_docs_file_name() {
            files.insert(name);
        }
        files.extend(self.field_infos_files.iter().cloned());
        for field_files in self.doc_values_updates_files.values() {
            files.extend(field_files.iter().cloned());
        }
        files
    }

    /// Total size of [`files`](Self::files) in `storage`.
    pub fn size_in_bytes(&self, storage: &dyn Storage) -> Result<u64> {
        let mut total = 0;
        for file in self.files() {
            total += storage.file_size(&file)?;
        }
        Ok(total)
    }
}

fn check_counts(max_doc: u32, del_count: u32, soft_del_count: u32) -> Result<()> {
    if del_count as u64 + soft_del_count as u64 > max_doc as u64 {
        return Err(PalisadeError::illegal_state(format!(
            "del_count {del_count} + soft_del_count {soft_del_count} exceeds max_doc {max_doc}"
        )));
    }
    Ok(())
}

/// Name of the live-docs file for `generation`.
pub fn live_docs_file_name(id: &SegmentId, generation: i64) -> String {
    format!("{}_{generation}.liv", id.name())
}

/// Name of a field-update file for `field` at `generation`.
pub fn field_updates_file_name(id: &SegmentId, generation: i64, field: &str) -> String {
    format!("{}_{generation}_{field}.dvu", id.name())
}

/// Name of the field-infos file for `generation`.
pub fn field_infos_file_name(id: &SegmentId, generation: i64) -> String {
    format!("{}_{generation}.fnm", id.name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use std::io::Write;

    fn info(max_doc: u32) -> SegmentInfo {
        SegmentInfo::new(SegmentId::new("_0"), max_doc).with_files(["_0.seg"])
    }

    #[test]
    fn test_new_flushed_is_unwritten() {
        let sci = SegmentCommitInfo::new_flushed(info(10));
        assert_eq!(sci.del_gen(), -1);
        assert_eq!(sci.next_write_del_gen(), 1);
        assert_eq!(sci.doc_values_gen(), -1);
        assert!(!sci.has_deletions());
        assert!(!sci.has_field_updates());
        assert!(sci.live_docs_file_name().is_none());
        assert_eq!(sci.buffered_deletes_gen(), 0);
    }

    #[test]
    fn test_advance_generations_independently() {
        let mut sci = SegmentCommitInfo::new_flushed(info(10));

        sci.advance_del_gen();
        assert_eq!(sci.del_gen(), 1);
        assert_eq!(sci.next_write_del_gen(), 2);
        assert_eq!(sci.field_infos_gen(), -1);

        sci.advance_doc_values_gen();
        sci.advance_doc_values_gen();
        assert_eq!(sci.doc_values_gen(), 2);
        assert_eq!(sci.del_gen(), 1);

        assert_eq!(sci.live_docs_file_name().unwrap(), "_0_1.liv");
    }

    #[test]
    fn test_existing_generations() {
        let sci = SegmentCommitInfo::new(info(10), 2, 1, 3, -1, 5).unwrap();
        assert_eq!(sci.next_write_del_gen(), 4);
        assert_eq!(sci.next_write_field_infos_gen(), 1);
        assert_eq!(sci.next_write_doc_values_gen(), 6);

        assert!(SegmentCommitInfo::new(info(10), 0, 0, 0, -1, -1).is_err());
        assert!(SegmentCommitInfo::new(info(10), 0, 0, -2, -1, -1).is_err());
    }

    #[test]
    fn test_delete_counts_bounded_by_max_doc() {
        assert!(SegmentCommitInfo::new(info(10), 6, 5, -1, -1, -1).is_err());

        let mut sci = SegmentCommitInfo::new_flushed(info(10));
        sci.set_del_count(7).unwrap();
        assert!(sci.set_soft_del_count(4).is_err());
        sci.set_soft_del_count(3).unwrap();
        assert_eq!(sci.del_count() + sci.soft_del_count(), 10);
    }

    #[test]
    fn test_buffered_deletes_gen_is_monotonic() {
        let mut sci = SegmentCommitInfo::new_flushed(info(10));
        sci.set_buffered_deletes_gen(4).unwrap();
        sci.set_buffered_deletes_gen(4).unwrap();
        assert!(sci.set_buffered_deletes_gen(3).is_err());
        assert_eq!(sci.buffered_deletes_gen(), 4);
    }

    #[test]
    fn test_clone_is_a_point_in_time_snapshot() {
        let mut sci = SegmentCommitInfo::new_flushed(info(10));
        let before = sci.clone();
        sci.advance_del_gen();
        sci.set_del_count(1).unwrap();

        assert_eq!(before.del_gen(), -1);
        assert_eq!(before.del_count(), 0);
        assert_eq!(before.id(), sci.id());
    }

    #[test]
    fn test_files_and_size() {
        let storage = MemoryStorage::new_default();
        let mut sci = SegmentCommitInfo::new_flushed(info(10));
        sci.advance_del_gen();
        sci.set_doc_values_updates_files(
            "price",
            BTreeSet::from([field_updates_file_name(sci.id(), 1, "price")]),
        );

        let files = sci.files();
        assert!(files.contains("_0.seg"));
        assert!(files.contains("_0_1.liv"));
        assert!(files.contains("_0_1_price.dvu"));

        for (name, len) in [("_0.seg", 100usize), ("_0_1.liv", 8), ("_0_1_price.dvu", 12)] {
            let mut output = storage.create_output(name).unwrap();
            output.write_all(&vec![0u8; len]).unwrap();
            output.close().unwrap();
        }
        assert_eq!(sci.size_in_bytes(&storage).unwrap(), 120);
    }
}
