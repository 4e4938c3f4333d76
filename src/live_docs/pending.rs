//! Hard-delete tracking for a single segment.

use crate::error::{PalisadeError, Result};
use crate::live_docs::{LiveDocs, LiveDocsState, LiveDocsTracker};
use crate::segment::{SegmentCommitInfo, SegmentFormat, SegmentReader};
use crate::storage::Storage;
use crate::update::DocValuesFieldUpdates;

/// Tracks hard deletes and persists them as live-docs generations.
#[derive(Debug)]
pub struct PendingDeletes {
    info: SegmentCommitInfo,
    live_docs: LiveDocsState,
    pending_delete_count: u32,
    /// False until the on-disk bitmap has been loaded through a reader.
    initialized: bool,
}

impl PendingDeletes {
    /// Segments without a written live-docs generation start initialized.
    pub fn new(info: SegmentCommitInfo) -> Self {
        let initialized = !info.has_deletions();
        PendingDeletes {
            info,
            live_docs: LiveDocsState::AllLive,
            pending_delete_count: 0,
            initialized,
        }
    }

    pub fn pending_delete_count(&self) -> u32 {
        self.pending_delete_count
    }

    pub(crate) fn state(&self) -> &LiveDocsState {
        &self.live_docs
    }

    fn check_writable(&self, doc: u32) -> Result<()> {
        if !self.initialized {
            return Err(PalisadeError::illegal_state(format!(
                "live docs of segment {} are not initialized",
                self.info.id()
            )));
        }
        if doc >= self.info.max_doc() {
            return Err(PalisadeError::illegal_state(format!(
                "doc {doc} out of range for segment {} with max_doc {}",
                self.info.id(),
                self.info.max_doc()
            )));
        }
        Ok(())
    }
}

impl LiveDocsTracker for PendingDeletes {
    fn info(&self) -> &SegmentCommitInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut SegmentCommitInfo {
        &mut self.info
    }

    fn delete(&mut self, doc: u32) -> Result<bool> {
        self.check_writable(doc)?;
        if !self.live_docs.get(doc) {
            return Ok(false);
        }
        self.live_docs
            .writable(self.info.max_doc())
            .set(doc as usize, false);
        self.pending_delete_count += 1;
        Ok(true)
    }

    fn is_live(&self, doc: u32) -> bool {
        doc < self.info.max_doc() && self.live_docs.get(doc)
    }

    fn is_hard_live(&self, doc: u32) -> bool {
        self.is_live(doc)
    }

    fn live_docs(&mut self) -> Option<LiveDocs> {
        self.live_docs.snapshot()
    }

    fn hard_live_docs(&mut self) -> Option<LiveDocs> {
        self.live_docs.snapshot()
    }

    fn num_pending_deletes(&self) -> i64 {
        self.pending_delete_count as i64
    }

    fn on_new_reader(&mut self, reader: &SegmentReader) -> Result<()> {
        if self.initialized {
            return Ok(());
        }

        match reader.hard_live_docs() {
            Some(bits) => {
                if bits.len() != self.info.max_doc() as usize {
                    return Err(PalisadeError::illegal_state(format!(
                        "live docs of length {} for segment {} with max_doc {}",
                        bits.len(),
                        self.info.id(),
                        self.info.max_doc()
                    )));
                }
                let deleted = self.info.max_doc() - bits.num_live();
                if deleted != self.info.del_count() {
                    return Err(PalisadeError::illegal_state(format!(
                        "segment {} reader has {deleted} hard deletes, descriptor says {}",
                        self.info.id(),
                        self.info.del_count()
                    )));
                }
                self.live_docs = LiveDocsState::Shared(bits.clone());
            }
            None if self.info.del_count() > 0 => {
                return Err(PalisadeError::illegal_state(format!(
                    "segment {} records {} deletes but the reader has no live docs",
                    self.info.id(),
                    self.info.del_count()
                )));
            }
            None => self.live_docs = LiveDocsState::AllLive,
        }
        self.initialized = true;
        Ok(())
    }

    fn on_doc_values_update(&mut self, _field: &str, _updates: &DocValuesFieldUpdates) -> Result<()> {
        Ok(())
    }

    fn write_live_docs(&mut self, format: &dyn SegmentFormat, storage: &dyn Storage) -> Result<bool> {
        if self.pending_delete_count == 0 {
            return Ok(false);
        }

        let new_del_count = self.info.del_count() + self.pending_delete_count;
        if new_del_count as u64 + self.info.soft_del_count() as u64 > self.info.max_doc() as u64 {
            return Err(PalisadeError::illegal_state(format!(
                "segment {}: {new_del_count} hard + {} soft deletes exceed max_doc {}",
                self.info.id(),
                self.info.soft_del_count(),
                self.info.max_doc()
            )));
        }

        let bits = match &self.live_docs {
            LiveDocsState::Owned(bits) => bits,
            LiveDocsState::Shared(bits) => bits.bits(),
            LiveDocsState::AllLive => {
                return Err(PalisadeError::illegal_state(format!(
                    "segment {} has pending deletes but no live docs",
                    self.info.id()
                )));
            }
        };

        let file = format.write_live_docs(storage, &self.info, bits, new_del_count)?;

        self.info.advance_del_gen();
        self.info.set_del_count(new_del_count)?;
        log::debug!(
            "wrote {file} for segment {}: {} new deletes, {new_del_count} total",
            self.info.id(),
            self.pending_delete_count
        );
        self.drop_changes();
        Ok(true)
    }

    fn drop_changes(&mut self) {
        self.pending_delete_count = 0;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn needs_refresh(&self, reader: &SegmentReader) -> bool {
        !self.live_docs.matches(reader.live_docs()) || reader.num_deleted_docs() != self.del_count()
    }

    fn soft_deletes_field(&self) -> Option<&str> {
        None
    }
}
