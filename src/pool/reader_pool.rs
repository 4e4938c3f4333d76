//! The registry itself.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::config::UpdatesConfig;
use crate::error::{PalisadeError, Result};
use crate::pool::merge::{MergeDocMap, MergeHandle};
use crate::pool::{PoolContext, ReadersAndUpdates};
use crate::segment::{SegmentCommitInfo, SegmentFormat, SegmentId, SegmentOpener, SegmentReader};
use crate::storage::Storage;
use crate::update::{BufferedUpdatesStream, DocValuesFieldUpdates};

#[derive(Debug, Default)]
struct PoolState {
    readers: AHashMap<SegmentId, Arc<ReadersAndUpdates>>,
    /// Last descriptor of entries that were evicted, so a later `get`
    /// resumes from what the pool wrote.
    evicted: AHashMap<SegmentId, SegmentCommitInfo>,
}

/// Keeps one [`ReadersAndUpdates`] per segment.
///
/// Without pooling, an entry is evicted as soon as the last outside
/// reference is released, after its pending deletes have been written.
/// Once pooling is enabled, entries stay until dropped or the pool closes.
#[derive(Debug)]
pub struct ReaderPool {
    ctx: Arc<PoolContext>,
    state: Mutex<PoolState>,
    pooling: AtomicBool,
    closed: AtomicBool,
}

impl ReaderPool {
    /// Create a pool over the given collaborators.
    pub fn new(
        storage: Arc<dyn Storage>,
        opener: Arc<dyn SegmentOpener>,
        format: Arc<dyn SegmentFormat>,
        config: UpdatesConfig,
    ) -> Result<Self> {
        config.validate()?;
        let pooling = config.pool_readers;
        Ok(ReaderPool {
            ctx: Arc::new(PoolContext {
                storage,
                opener,
                format,
                config,
            }),
            state: Mutex::new(PoolState::default()),
            pooling: AtomicBool::new(pooling),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &UpdatesConfig {
        &self.ctx.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.ctx.storage
    }

    /// Take a reference on the entry for `info`, creating it if `create` is set.
    ///
    /// Every entry returned must be handed back through [`release`](Self::release).
    pub fn get(&self, info: &SegmentCommitInfo, create: bool) -> Result<Option<Arc<ReadersAndUpdates>>> {
        let mut state = self.state.lock();
        if let Some(entry) = state.readers.get(info.id()) {
            if entry.info().max_doc() != info.max_doc() {
                return Err(PalisadeError::illegal_state(format!(
                    "segment {} is pooled with {} docs, caller has {}",
                    info.id(),
                    entry.info().max_doc(),
                    info.max_doc()
                )));
            }
            if !entry.inc_ref() {
                return Err(PalisadeError::illegal_state(format!(
                    "pooled segment {} was already released",
                    info.id()
                )));
            }
            return Ok(Some(Arc::clone(entry)));
        }

        if !create {
            return Ok(None);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(PalisadeError::already_closed("reader pool is closed"));
        }

        let info = match state.evicted.remove(info.id()) {
            Some(known) if is_newer_or_same(&known, info) => known,
            _ => info.clone(),
        };
        let entry = Arc::new(ReadersAndUpdates::new(info, Arc::clone(&self.ctx)));
        entry.inc_ref();
        state.readers.insert(entry.id().clone(), Arc::clone(&entry));
        log::trace!("pooled segment {}", entry.id());
        Ok(Some(entry))
    }

    /// Give back a reference taken with [`get`](Self::get).
    ///
    /// When pooling is off and only the pool's own reference remains, the
    /// entry's deletes are written and it is evicted, unless doc-values
    /// updates are still pending. Returns whether anything was written.
    pub fn release(&self, entry: &Arc<ReadersAndUpdates>) -> Result<bool> {
        let mut state = self.state.lock();
        let remaining = entry.dec_ref()?;
        let pooled = state
            .readers
            .get(entry.id())
            .is_some_and(|pooled| Arc::ptr_eq(pooled, entry));
        if !pooled || remaining != 1 || self.is_reader_pooling_enabled() || entry.is_merging() {
            return Ok(false);
        }

        let changed = entry.write_live_docs()?;
        if entry.has_pending_dv_updates() {
            log::trace!("segment {} stays pooled until its field updates are written", entry.id());
            return Ok(changed);
        }
        entry.drop_readers();
        state.readers.remove(entry.id());
        state.evicted.insert(entry.id().clone(), entry.info());
        entry.dec_ref()?;
        log::trace!("evicted segment {}", entry.id());
        Ok(changed)
    }

    /// Keep entries after their last release. Cannot be turned off again.
    pub fn enable_pooling(&self) {
        if !self.pooling.swap(true, Ordering::AcqRel) {
            log::debug!("reader pooling enabled");
        }
    }

    pub fn is_reader_pooling_enabled(&self) -> bool {
        self.pooling.load(Ordering::Acquire)
    }

    /// Remove the entry for `info`, discarding unwritten changes.
    ///
    /// Returns whether an entry was registered.
    pub fn drop(&self, info: &SegmentCommitInfo) -> Result<bool> {
        let mut state = self.state.lock();
        state.evicted.remove(info.id());
        let Some(entry) = state.readers.remove(info.id()) else {
            return Ok(false);
        };
        entry.drop_changes();
        entry.drop_readers();
        entry.dec_ref()?;
        log::debug!("dropped segment {}", info.id());
        Ok(true)
    }

    /// Remove every entry, discarding unwritten changes.
    pub fn drop_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        let entries: Vec<Arc<ReadersAndUpdates>> = state.readers.drain().map(|(_, entry)| entry).collect();
        let mut first_err = None;
        for entry in entries {
            if entry.ref_count() > 1 {
                log::warn!(
                    "dropping segment {} while {} references are outstanding",
                    entry.id(),
                    entry.ref_count() - 1
                );
            }
            entry.drop_changes();
            entry.drop_readers();
            state.evicted.insert(entry.id().clone(), entry.info());
            if let Err(err) = entry.dec_ref() {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Write pending doc-values updates and deletes, then drop every entry.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let written = self
            .write_all_doc_values_updates()
            .and_then(|_| self.write_all_live_docs());
        let dropped = self.drop_all();
        written?;
        dropped
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn entries(&self) -> Vec<Arc<ReadersAndUpdates>> {
        self.state.lock().readers.values().cloned().collect()
    }

    /// Whether any entry has deletes that are not written yet.
    pub fn any_pending_deletes(&self) -> bool {
        self.state
            .lock()
            .readers
            .values()
            .any(|entry| entry.num_pending_deletes() != 0)
    }

    pub fn any_doc_values_changes(&self) -> bool {
        self.state
            .lock()
            .readers
            .values()
            .any(|entry| entry.has_pending_dv_updates())
    }

    /// Write the pending deletes of every entry, returning how many wrote a file.
    pub fn write_all_live_docs(&self) -> Result<usize> {
        let mut written = 0;
        for entry in self.entries() {
            if entry.write_live_docs()? {
                written += 1;
            }
        }
        if written > 0 {
            log::debug!("wrote live docs of {written} segments");
        }
        Ok(written)
    }

    /// Write the pending doc-values updates of every entry.
    pub fn write_all_doc_values_updates(&self) -> Result<usize> {
        let mut written = 0;
        for entry in self.entries() {
            if entry.write_field_updates()? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Entries sorted by the RAM their pending updates hold, largest first.
    ///
    /// The returned handles carry no reference of their own.
    pub fn readers_by_ram(&self) -> Vec<Arc<ReadersAndUpdates>> {
        let mut entries: Vec<(u64, Arc<ReadersAndUpdates>)> = self
            .entries()
            .into_iter()
            .map(|entry| (entry.ram_bytes_used(), entry))
            .collect();
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        entries.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Deleted docs of `info`, counting pending deletes when it is pooled.
    pub fn num_deleted_docs(&self, info: &SegmentCommitInfo) -> u32 {
        match self.state.lock().readers.get(info.id()) {
            Some(entry) => entry.del_count(),
            None => info.del_count() + info.soft_del_count(),
        }
    }

    /// Current descriptor of a segment the pool knows about.
    pub fn info(&self, id: &SegmentId) -> Option<SegmentCommitInfo> {
        let state = self.state.lock();
        match state.readers.get(id) {
            Some(entry) => Some(entry.info()),
            None => state.evicted.get(id).cloned(),
        }
    }

    /// Descriptors of every segment the pool knows about, pooled or evicted.
    pub fn segment_infos(&self) -> Vec<SegmentCommitInfo> {
        let state = self.state.lock();
        let mut infos: Vec<SegmentCommitInfo> = state
            .readers
            .values()
            .map(|entry| entry.info())
            .chain(state.evicted.values().cloned())
            .collect();
        infos.sort_by(|a, b| a.id().cmp(b.id()));
        infos
    }

    /// Reader reflecting every delete applied so far, for near-real-time search.
    ///
    /// Handing out such readers turns pooling on, since later deletes must
    /// reach the same entry.
    pub fn nrt_reader(&self, info: &SegmentCommitInfo) -> Result<Arc<SegmentReader>> {
        self.enable_pooling();
        let entry = self
            .get(info, true)?
            .ok_or_else(|| PalisadeError::index(format!("segment {} is not pooled", info.id())))?;
        let reader = entry.reader();
        self.release(&entry)?;
        reader
    }

    pub fn contains(&self, id: &SegmentId) -> bool {
        self.state.lock().readers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().readers.is_empty()
    }

    /// Mark the segments `infos` as merging.
    ///
    /// Every packet pushed to `stream` so far is applied to the sources
    /// first, so they all reflect the same generation when their docs are
    /// copied. On failure every segment marked so far is returned to idle.
    pub fn begin_merge(&self, infos: &[SegmentCommitInfo], stream: &BufferedUpdatesStream) -> Result<MergeHandle> {
        stream.apply_all(self, infos)?;

        let mut handle = MergeHandle {
            entries: Vec::with_capacity(infos.len()),
            readers: Vec::with_capacity(infos.len()),
        };
        for info in infos {
            let started = self.get(info, true).and_then(|entry| {
                let entry = entry
                    .ok_or_else(|| PalisadeError::index(format!("segment {} is not pooled", info.id())))?;
                match entry.set_is_merging() {
                    Ok(reader) => Ok((entry, reader)),
                    Err(err) => {
                        self.release(&entry)?;
                        Err(err)
                    }
                }
            });
            match started {
                Ok((entry, reader)) => {
                    handle.entries.push(entry);
                    handle.readers.push(reader);
                }
                Err(err) => {
                    if let Err(abort_err) = self.abort_merge(handle) {
                        log::warn!("could not abort merge after failed start: {abort_err}");
                    }
                    return Err(err);
                }
            }
        }
        log::debug!(
            "merge started over {} segments, {} docs",
            handle.entries.len(),
            handle.merged_max_doc()
        );
        Ok(handle)
    }

    /// Commit a merge whose result is described by `merged`.
    ///
    /// Deletes and updates that reached the sources while the merge ran are
    /// replayed onto the merged segment through `doc_map`, the sources are
    /// dropped, and a referenced entry for the merged segment is returned.
    pub fn commit_merge(
        &self,
        handle: MergeHandle,
        merged: &SegmentCommitInfo,
        doc_map: &dyn MergeDocMap,
    ) -> Result<Arc<ReadersAndUpdates>> {
        if doc_map.max_doc() != merged.max_doc() {
            self.abort_merge(handle)?;
            return Err(PalisadeError::invalid_argument(format!(
                "doc map covers {} docs, merged segment {} has {}",
                doc_map.max_doc(),
                merged.id(),
                merged.max_doc()
            )));
        }

        // Sources caught up when the merge began. A packet that reached only
        // some of them since is carried over and applies again idempotently.
        let mut merged = merged.clone();
        merged.set_buffered_deletes_gen(handle.min_buffered_deletes_gen().max(merged.buffered_deletes_gen()))?;

        let mut deletes = Vec::new();
        let mut updates: BTreeMap<String, Vec<DocValuesFieldUpdates>> = BTreeMap::new();
        let MergeHandle { entries, readers } = handle;
        let mut carried = Ok(());
        for (source, (entry, start)) in entries.iter().zip(&readers).enumerate() {
            let carry = match entry.take_merging_updates(start) {
                Ok(carry) => carry,
                Err(err) => {
                    carried = Err(err);
                    break;
                }
            };
            deletes.extend(carry.deleted.into_iter().filter_map(|doc| doc_map.map(source, doc)));
            for (field, parts) in carry.updates {
                for part in parts {
                    match part.remap(merged.max_doc(), |doc| doc_map.map(source, doc)) {
                        Ok(remapped) if remapped.is_empty() => {}
                        Ok(remapped) => updates.entry(field.clone()).or_default().push(remapped),
                        Err(err) => carried = Err(err),
                    }
                }
            }
        }

        let target = carried.and_then(|()| {
            let target = self
                .get(&merged, true)?
                .ok_or_else(|| PalisadeError::index(format!("segment {} is not pooled", merged.id())))?;
            match target.apply_carry_over(&deletes, updates) {
                Ok(mutated) => {
                    log::debug!(
                        "merged {} segments into {}: carried over {} deletes, {mutated} changes applied",
                        entries.len(),
                        merged.id(),
                        deletes.len()
                    );
                    Ok(target)
                }
                Err(err) => {
                    self.release(&target)?;
                    Err(err)
                }
            }
        });

        for entry in &entries {
            if target.is_ok() {
                self.drop(&entry.info())?;
            } else {
                entry.drop_merging_updates();
            }
            self.release(entry)?;
        }
        target
    }

    /// Abandon a merge, returning its sources to idle.
    pub fn abort_merge(&self, handle: MergeHandle) -> Result<()> {
        let mut first_err = None;
        for entry in &handle.entries {
            entry.drop_merging_updates();
            if let Err(err) = self.release(entry) {
                first_err.get_or_insert(err);
            }
        }
        log::debug!("merge over {} segments aborted", handle.entries.len());
        first_err.map_or(Ok(()), Err)
    }
}

/// Whether `known` reflects at least every write `info` does.
fn is_newer_or_same(known: &SegmentCommitInfo, info: &SegmentCommitInfo) -> bool {
    known.del_gen() >= info.del_gen()
        && known.doc_values_gen() >= info.doc_values_gen()
        && known.buffered_deletes_gen() >= info.buffered_deletes_gen()
}
