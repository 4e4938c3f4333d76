//! Registry entry for one segment.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{PalisadeError, Result};
use crate::live_docs::{LiveDocs, LiveDocsTracker, new_tracker};
use crate::pool::merge::{MergeCarryOver, MergeReader};
use crate::pool::PoolContext;
use crate::segment::{SegmentCommitInfo, SegmentId, SegmentReader, SegmentSource};
use crate::update::DocValuesFieldUpdates;
use crate::update::frozen::{ResolvedUpdates, TargetOutcome};

type FieldUpdatesMap = BTreeMap<String, Vec<DocValuesFieldUpdates>>;

/// Where the segment stands with respect to merging.
#[derive(Debug, Default)]
enum MergeState {
    #[default]
    Idle,
    /// Being merged. Updates that arrive meanwhile are mirrored here so
    /// they can be replayed onto the merged segment.
    Merging { updates: FieldUpdatesMap },
    /// The merge committed; the segment only lingers for in-flight holders.
    MergedAway,
}

#[derive(Debug)]
struct EntryState {
    deletes: Box<dyn LiveDocsTracker>,
    source: Option<Arc<dyn SegmentSource>>,
    reader: Option<Arc<SegmentReader>>,
    /// Resolved doc-values updates not yet written, oldest first per field.
    pending_dv_updates: FieldUpdatesMap,
    merge: MergeState,
}

/// Reader, live docs and pending doc-values updates of one segment.
///
/// All mutation happens under the entry's lock. The reference count is
/// managed by the [`ReaderPool`](crate::pool::ReaderPool).
#[derive(Debug)]
pub struct ReadersAndUpdates {
    id: SegmentId,
    ref_count: AtomicUsize,
    ctx: Arc<PoolContext>,
    state: Mutex<EntryState>,
}

impl ReadersAndUpdates {
    /// Entry holding the pool's own reference.
    pub(crate) fn new(info: SegmentCommitInfo, ctx: Arc<PoolContext>) -> Self {
        let deletes = new_tracker(info, &ctx.config);
        ReadersAndUpdates {
            id: deletes.info().id().clone(),
            ref_count: AtomicUsize::new(1),
            ctx,
            state: Mutex::new(EntryState {
                deletes,
                source: None,
                reader: None,
                pending_dv_updates: BTreeMap::new(),
                merge: MergeState::Idle,
            }),
        }
    }

    pub fn id(&self) -> &SegmentId {
        &self.id
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Take a reference, unless the entry was already released for good.
    pub fn inc_ref(&self) -> bool {
        self.ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count > 0).then_some(count + 1)
            })
            .is_ok()
    }

    /// Give a reference back, returning how many remain.
    pub fn dec_ref(&self) -> Result<usize> {
        self.ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
            .map(|previous| previous - 1)
            .map_err(|_| {
                PalisadeError::illegal_state(format!("ref count of segment {} dropped below zero", self.id))
            })
    }

    /// Snapshot of the segment's commit descriptor.
    pub fn info(&self) -> SegmentCommitInfo {
        self.state.lock().deletes.info().clone()
    }

    pub fn buffered_deletes_gen(&self) -> i64 {
        self.state.lock().deletes.info().buffered_deletes_gen()
    }

    /// Hard and soft deletes, durable and pending.
    pub fn del_count(&self) -> u32 {
        self.state.lock().deletes.del_count()
    }

    pub fn num_pending_deletes(&self) -> i64 {
        self.state.lock().deletes.num_pending_deletes()
    }

    pub fn is_fully_deleted(&self) -> bool {
        self.state.lock().deletes.is_fully_deleted()
    }

    /// Reader over the current live docs.
    ///
    /// The segment is opened once; later calls rewrap the shared source
    /// with fresher live docs instead of reopening it.
    pub fn reader(&self) -> Result<Arc<SegmentReader>> {
        let mut state = self.state.lock();
        self.load_reader(&mut state)
    }

    fn load_reader(&self, state: &mut EntryState) -> Result<Arc<SegmentReader>> {
        if let Some(reader) = &state.reader
            && is_current(reader, state.deletes.as_ref())
        {
            return Ok(Arc::clone(reader));
        }

        let (source, opened) = match state.source.clone() {
            Some(source) => (source, false),
            None => {
                let source = self.ctx.opener.open(state.deletes.info())?;
                state.source = Some(Arc::clone(&source));
                (source, true)
            }
        };

        if opened || !state.deletes.is_initialized() {
            if let Err(err) = self.initialize(state, &source) {
                state.source = None;
                state.reader = None;
                return Err(err);
            }
        }

        let reader = Arc::new(SegmentReader::with_live_docs(
            source,
            state.deletes.info().clone(),
            state.deletes.live_docs(),
            state.deletes.hard_live_docs(),
        )?);
        state.reader = Some(Arc::clone(&reader));
        Ok(reader)
    }

    /// Let the tracker observe a freshly opened source.
    fn initialize(&self, state: &mut EntryState, source: &Arc<dyn SegmentSource>) -> Result<()> {
        let info = state.deletes.info().clone();
        let reader = if state.deletes.is_initialized() {
            let live = state.deletes.live_docs();
            let hard = state.deletes.hard_live_docs();
            SegmentReader::with_live_docs(Arc::clone(source), info, live, hard)?
        } else {
            let on_disk = if info.has_deletions() {
                let bits = self.ctx.format.read_live_docs(self.ctx.storage.as_ref(), &info)?;
                Some(LiveDocs::new(bits))
            } else {
                None
            };
            SegmentReader::open(Arc::clone(source), info, on_disk)?
        };
        state.deletes.on_new_reader(&reader)
    }

    fn ensure_initialized(&self, state: &mut EntryState) -> Result<()> {
        if !state.deletes.is_initialized() {
            self.load_reader(state)?;
        }
        Ok(())
    }

    /// Delete `doc`, returning whether it was live.
    pub fn delete(&self, doc: u32) -> Result<bool> {
        let mut state = self.state.lock();
        self.ensure_initialized(&mut state)?;
        state.deletes.delete(doc)
    }

    /// Visible live docs; `None` means every doc is live.
    pub fn live_docs(&self) -> Result<Option<LiveDocs>> {
        let mut state = self.state.lock();
        self.ensure_initialized(&mut state)?;
        Ok(state.deletes.live_docs())
    }

    /// Live docs ignoring soft deletes.
    pub fn hard_live_docs(&self) -> Result<Option<LiveDocs>> {
        let mut state = self.state.lock();
        self.ensure_initialized(&mut state)?;
        Ok(state.deletes.hard_live_docs())
    }

    /// Queue resolved updates of one field for the next write.
    pub fn add_dv_update(&self, updates: DocValuesFieldUpdates) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_initialized(&mut state)?;
        add_dv_update(&mut state, updates)
    }

    pub fn has_pending_dv_updates(&self) -> bool {
        !self.state.lock().pending_dv_updates.is_empty()
    }

    /// Bytes held by pending doc-values updates.
    pub fn ram_bytes_used(&self) -> u64 {
        self.state
            .lock()
            .pending_dv_updates
            .values()
            .flatten()
            .map(DocValuesFieldUpdates::ram_bytes_used)
            .sum()
    }

    /// Commit one packet's resolved deletes and updates.
    ///
    /// Returns `None` when the generation gate closed between resolving and
    /// committing, or when the segment was merged away meanwhile.
    pub(crate) fn apply_resolved(&self, generation: i64, resolved: ResolvedUpdates) -> Result<Option<TargetOutcome>> {
        let mut state = self.state.lock();
        if state.deletes.info().buffered_deletes_gen() >= generation
            || matches!(state.merge, MergeState::MergedAway)
            || self.ref_count() <= 1
        {
            return Ok(None);
        }
        self.ensure_initialized(&mut state)?;

        let mut outcome = TargetOutcome::default();
        for doc in resolved.deletes {
            if state.deletes.delete(doc)? {
                outcome.deleted += 1;
            }
        }
        for mut updates in resolved.updates {
            // Docs this packet deleted get no update.
            let deletes = &state.deletes;
            updates.retain(|doc| deletes.is_hard_live(doc));
            if updates.is_empty() {
                continue;
            }
            outcome.updated += updates.len() as u64;
            add_dv_update(&mut state, updates)?;
        }

        state.deletes.info_mut().set_buffered_deletes_gen(generation)?;
        outcome.fully_deleted =
            !self.ctx.config.keep_fully_deleted_segments && state.deletes.is_fully_deleted();
        log::trace!(
            "segment {} at generation {generation}: {} deleted, {} updated",
            self.id,
            outcome.deleted,
            outcome.updated
        );
        Ok(Some(outcome))
    }

    /// Replay deletes and updates carried over from merged-away segments.
    pub(crate) fn apply_carry_over(&self, deletes: &[u32], updates: FieldUpdatesMap) -> Result<u64> {
        let mut state = self.state.lock();
        self.ensure_initialized(&mut state)?;
        let mut mutated = 0;
        for &doc in deletes {
            if state.deletes.delete(doc)? {
                mutated += 1;
            }
        }
        for mut updates in updates.into_values().flatten() {
            let deletes = &state.deletes;
            updates.retain(|doc| deletes.is_hard_live(doc));
            if !updates.is_empty() {
                mutated += updates.len() as u64;
                add_dv_update(&mut state, updates)?;
            }
        }
        Ok(mutated)
    }

    /// Persist pending hard deletes, returning whether a file was written.
    ///
    /// Pending updates of the soft-deletes field are written first so the
    /// soft delete count folded into the descriptor matches what a reopened
    /// segment will show.
    pub fn write_live_docs(&self) -> Result<bool> {
        let mut state = self.state.lock();
        if let Some(field) = state.deletes.soft_deletes_field().map(str::to_string)
            && state.pending_dv_updates.contains_key(&field)
        {
            self.write_field_updates_locked(&mut state, Some(&field))?;
        }
        let written = state
            .deletes
            .write_live_docs(self.ctx.format.as_ref(), self.ctx.storage.as_ref())?;
        if written {
            state.reader = None;
        }
        Ok(written)
    }

    /// Persist every pending doc-values update, returning whether anything was written.
    pub fn write_field_updates(&self) -> Result<bool> {
        let mut state = self.state.lock();
        self.write_field_updates_locked(&mut state, None)
    }

    fn write_field_updates_locked(&self, state: &mut EntryState, only: Option<&str>) -> Result<bool> {
        let fields: Vec<String> = state
            .pending_dv_updates
            .keys()
            .filter(|field| only.is_none_or(|only| only == field.as_str()))
            .cloned()
            .collect();
        if fields.is_empty() {
            return Ok(false);
        }

        let info = state.deletes.info().clone();
        let mut written = Vec::with_capacity(fields.len());
        let field_infos = match self.write_field_files(state, &info, &fields, &mut written) {
            Ok(file) => file,
            Err(err) => {
                for (_, file) in &written {
                    if let Err(delete_err) = self.ctx.storage.delete_file(file) {
                        log::warn!("could not delete {file} after failed field update write: {delete_err}");
                    }
                }
                return Err(err);
            }
        };

        let info = state.deletes.info_mut();
        info.advance_doc_values_gen();
        info.advance_field_infos_gen();
        for (field, file) in written {
            info.set_doc_values_updates_files(&field, BTreeSet::from([file]));
        }
        info.set_field_infos_files(BTreeSet::from([field_infos]));
        for field in &fields {
            state.pending_dv_updates.remove(field);
        }
        log::debug!(
            "segment {}: wrote updates of {} fields at doc values generation {}",
            self.id,
            fields.len(),
            state.deletes.info().doc_values_gen()
        );

        // Reopen with the new generation so the soft view is reconciled.
        state.source = None;
        state.reader = None;
        Ok(true)
    }

    /// Write the cumulative updates of `fields`, recording each file in
    /// `written` as it lands, then the field-infos file, whose name is returned.
    fn write_field_files(
        &self,
        state: &EntryState,
        info: &SegmentCommitInfo,
        fields: &[String],
        written: &mut Vec<(String, String)>,
    ) -> Result<String> {
        let storage = self.ctx.storage.as_ref();
        let format = self.ctx.format.as_ref();

        let mut field_types = format.read_field_infos(storage, info)?;
        for field in fields {
            let Some(pending) = state.pending_dv_updates.get(field) else {
                continue;
            };
            let existing = format.read_field_updates(storage, info, field)?;
            let parts: Vec<&DocValuesFieldUpdates> = existing.iter().chain(pending.iter()).collect();
            let merged = DocValuesFieldUpdates::merge(&parts)?;
            field_types.insert(field.clone(), merged.dv_type());
            let file = format.write_field_updates(storage, info, &merged)?;
            written.push((field.clone(), file));
        }
        format.write_field_infos(storage, info, &field_types)
    }

    /// Forget unwritten deletes and updates.
    pub fn drop_changes(&self) {
        let mut state = self.state.lock();
        let pending = state.deletes.num_pending_deletes();
        if pending != 0 || !state.pending_dv_updates.is_empty() {
            log::warn!(
                "dropping {pending} pending deletes and updates of {} fields for segment {}",
                state.pending_dv_updates.len(),
                self.id
            );
        }
        state.deletes.drop_changes();
        state.pending_dv_updates.clear();
    }

    /// Release the cached source and reader.
    pub fn drop_readers(&self) {
        let mut state = self.state.lock();
        state.reader = None;
        state.source = None;
    }

    /// Start merging this segment, returning the view the merge reads.
    ///
    /// Pending updates are written first so the merge sees them.
    pub fn set_is_merging(&self) -> Result<MergeReader> {
        let mut state = self.state.lock();
        if !matches!(state.merge, MergeState::Idle) {
            return Err(PalisadeError::illegal_state(format!(
                "segment {} is already merging or merged away",
                self.id
            )));
        }
        self.write_field_updates_locked(&mut state, None)?;
        let reader = self.load_reader(&mut state)?;
        state.merge = MergeState::Merging {
            updates: BTreeMap::new(),
        };
        log::debug!("segment {} is merging with {} live docs", self.id, reader.num_docs());
        Ok(MergeReader::new(reader))
    }

    pub fn is_merging(&self) -> bool {
        matches!(self.state.lock().merge, MergeState::Merging { .. })
    }

    /// Collect what changed since the merge started and mark the segment
    /// merged away. Succeeds once per merge.
    pub fn take_merging_updates(&self, start: &MergeReader) -> Result<MergeCarryOver> {
        let mut state = self.state.lock();
        let updates = match std::mem::take(&mut state.merge) {
            MergeState::Merging { updates } => updates,
            other => {
                state.merge = other;
                return Err(PalisadeError::illegal_state(format!(
                    "segment {} has no merge in progress",
                    self.id
                )));
            }
        };
        state.merge = MergeState::MergedAway;

        let deleted = (0..start.max_doc())
            .filter(|&doc| start.is_hard_live(doc) && !state.deletes.is_hard_live(doc))
            .collect();
        Ok(MergeCarryOver { deleted, updates })
    }

    /// Abandon the merge, discarding the mirrored updates.
    ///
    /// Also reverts a drained merge that failed to commit; the segment's own
    /// deletes and pending updates were never touched by the merge.
    pub fn drop_merging_updates(&self) {
        self.state.lock().merge = MergeState::Idle;
    }
}

/// Hand resolved updates to the tracker and queue them, mirroring them into
/// the merge state while a merge runs.
fn add_dv_update(state: &mut EntryState, updates: DocValuesFieldUpdates) -> Result<()> {
    if !updates.is_finished() {
        return Err(PalisadeError::illegal_state(format!(
            "updates of field {} must be finished before they are queued",
            updates.field()
        )));
    }
    let max_doc = state.deletes.info().max_doc();
    if updates.max_doc() != max_doc {
        return Err(PalisadeError::illegal_state(format!(
            "updates of field {} sized for {} docs, segment has {max_doc}",
            updates.field(),
            updates.max_doc()
        )));
    }

    state.deletes.on_doc_values_update(updates.field(), &updates)?;
    if let MergeState::Merging { updates: mirrored } = &mut state.merge {
        mirrored
            .entry(updates.field().to_string())
            .or_default()
            .push(updates.clone());
    }
    state
        .pending_dv_updates
        .entry(updates.field().to_string())
        .or_default()
        .push(updates);
    Ok(())
}

/// Whether `reader` still matches the tracker's descriptor and live docs.
fn is_current(reader: &SegmentReader, deletes: &dyn LiveDocsTracker) -> bool {
    let (seen, now) = (reader.info(), deletes.info());
    seen.del_gen() == now.del_gen()
        && seen.doc_values_gen() == now.doc_values_gen()
        && seen.del_count() == now.del_count()
        && seen.soft_del_count() == now.soft_del_count()
        && !deletes.needs_refresh(reader)
}
