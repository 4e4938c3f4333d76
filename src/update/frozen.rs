//! Immutable, generation-stamped update packets.
//!
//! Applying a packet runs in two phases. The resolve phase turns terms,
//! queries and field updates into doc ids for every eligible target; it is
//! read-only and runs on the rayon pool. The commit phase then takes each
//! target's lock in turn, re-checks the generation gate, deletes the
//! resolved docs, hands the resolved updates over and stamps the target
//! with the packet's generation. A failure in the resolve phase leaves
//! every target untouched.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;
use rayon::prelude::*;

use crate::error::{PalisadeError, Result};
use crate::pool::ReadersAndUpdates;
use crate::segment::source::PostingIterator;
use crate::segment::{SegmentId, SegmentReader, TermsEnum};
use crate::update::{
    BYTES_PER_DEL_QUERY, DeleteQuery, DocValuesFieldUpdates, FieldUpdatesBuffer, PrefixCodedTerms,
    Term,
};

/// Generation of a packet that has not been pushed yet.
pub const UNPUSHED: i64 = -1;

/// Outcome of applying one or more packets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyResult {
    /// Documents that went from live to deleted.
    pub deleted: u64,
    /// Doc-values updates handed to targets.
    pub updated: u64,
    /// Targets the packet was committed to.
    pub segments_applied: usize,
    /// Segments left without a live document.
    pub fully_deleted: Vec<SegmentId>,
}

impl ApplyResult {
    /// Documents deleted or updated.
    pub fn mutated(&self) -> u64 {
        self.deleted + self.updated
    }

    pub fn merge(&mut self, other: ApplyResult) {
        self.deleted += other.deleted;
        self.updated += other.updated;
        self.segments_applied += other.segments_applied;
        for id in other.fully_deleted {
            if !self.fully_deleted.contains(&id) {
                self.fully_deleted.push(id);
            }
        }
    }
}

/// Doc ids and updates resolved for one target.
#[derive(Debug, Default)]
pub(crate) struct ResolvedUpdates {
    pub(crate) deletes: Vec<u32>,
    pub(crate) updates: Vec<DocValuesFieldUpdates>,
}

/// What committing a packet did to one target.
#[derive(Debug, Default)]
pub(crate) struct TargetOutcome {
    pub(crate) deleted: u64,
    pub(crate) updated: u64,
    pub(crate) fully_deleted: bool,
}

/// A frozen batch of deletes and updates.
#[derive(Debug)]
pub struct FrozenBufferedUpdates {
    delete_terms: PrefixCodedTerms,
    /// Cutoff of each delete term, parallel to `delete_terms`.
    term_limits: Vec<u32>,
    delete_queries: Vec<(Arc<dyn DeleteQuery>, u32)>,
    field_updates: Vec<FieldUpdatesBuffer>,
    private_segment: Option<SegmentId>,
    num_term_deletes: u64,
    bytes_used: u64,
    del_gen: AtomicI64,
    total_applied: AtomicU64,
    apply_lock: Mutex<()>,
}

impl FrozenBufferedUpdates {
    pub(crate) fn new(
        delete_terms: BTreeMap<Term, u32>,
        delete_queries: Vec<(Arc<dyn DeleteQuery>, u32)>,
        field_updates: Vec<FieldUpdatesBuffer>,
        private_segment: Option<SegmentId>,
        num_term_deletes: u64,
        buffered_bytes: u64,
    ) -> Result<Self> {
        let mut builder = PrefixCodedTerms::builder();
        let mut term_limits = Vec::with_capacity(delete_terms.len());
        for (term, limit) in &delete_terms {
            builder.add(term)?;
            term_limits.push(*limit);
        }
        let delete_terms = builder.finish();

        let bytes_used = delete_terms.ram_bytes_used()
            + term_limits.len() as u64 * 4
            + delete_queries
                .iter()
                .map(|(query, _)| BYTES_PER_DEL_QUERY + query.ram_bytes_used())
                .sum::<u64>()
            + field_updates.iter().map(FieldUpdatesBuffer::ram_bytes_used).sum::<u64>();

        log::trace!(
            "froze {} delete terms, {} queries, {} field updates ({buffered_bytes} buffered bytes, {bytes_used} frozen)",
            delete_terms.size(),
            delete_queries.len(),
            field_updates.len()
        );

        Ok(FrozenBufferedUpdates {
            delete_terms,
            term_limits,
            delete_queries,
            field_updates,
            private_segment,
            num_term_deletes,
            bytes_used,
            del_gen: AtomicI64::new(UNPUSHED),
            total_applied: AtomicU64::new(0),
            apply_lock: Mutex::new(()),
        })
    }

    /// Generation assigned at push, or [`UNPUSHED`].
    pub fn del_gen(&self) -> i64 {
        self.del_gen.load(Ordering::Acquire)
    }

    pub fn is_pushed(&self) -> bool {
        self.del_gen() != UNPUSHED
    }

    /// Stamp the packet. A packet is stamped exactly once.
    pub(crate) fn set_del_gen(&self, generation: i64) -> Result<()> {
        if generation <= 0 {
            return Err(PalisadeError::illegal_state(format!(
                "packet generation must be positive, got {generation}"
            )));
        }
        self.del_gen
            .compare_exchange(UNPUSHED, generation, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|current| {
                PalisadeError::illegal_state(format!(
                    "packet already has generation {current}, cannot assign {generation}"
                ))
            })
    }

    /// Segment the packet is private to, if it came from a flush.
    pub fn private_segment(&self) -> Option<&SegmentId> {
        self.private_segment.as_ref()
    }

    pub fn any(&self) -> bool {
        self.any_deletes() || !self.field_updates.is_empty()
    }

    pub fn any_deletes(&self) -> bool {
        !self.delete_terms.is_empty() || !self.delete_queries.is_empty()
    }

    pub fn delete_terms(&self) -> &PrefixCodedTerms {
        &self.delete_terms
    }

    pub fn num_term_deletes(&self) -> u64 {
        self.num_term_deletes
    }

    pub fn num_delete_queries(&self) -> usize {
        self.delete_queries.len()
    }

    pub fn num_field_updates(&self) -> usize {
        self.field_updates.iter().map(FieldUpdatesBuffer::len).sum()
    }

    pub fn ram_bytes_used(&self) -> u64 {
        self.bytes_used
    }

    /// Documents mutated by every apply of this packet so far.
    pub fn total_applied(&self) -> u64 {
        self.total_applied.load(Ordering::Relaxed)
    }

    /// Apply the packet to every target whose generation lags behind it.
    ///
    /// Targets must be registry entries the caller holds a reference to. A
    /// target is skipped when it already reflects this generation, when the
    /// packet is private to another segment, or when the caller's reference
    /// is the only one left because the segment was merged away meanwhile.
    pub fn apply(&self, targets: &[Arc<ReadersAndUpdates>]) -> Result<ApplyResult> {
        let generation = self.del_gen();
        if generation == UNPUSHED {
            return Err(PalisadeError::illegal_state(
                "cannot apply a packet that was never pushed",
            ));
        }
        let _guard = self.apply_lock.lock();

        let eligible: Vec<&Arc<ReadersAndUpdates>> = targets
            .iter()
            .filter(|target| self.is_eligible(target, generation))
            .collect();
        if eligible.is_empty() {
            log::trace!("packet {generation}: no eligible targets among {}", targets.len());
            return Ok(ApplyResult::default());
        }

        let resolved = eligible
            .par_iter()
            .map(|target| {
                let reader = target.reader()?;
                let is_private = self.private_segment.as_ref() == Some(target.id());
                Ok((*target, self.resolve(&reader, generation, is_private)?))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut result = ApplyResult::default();
        for (target, resolved) in resolved {
            let Some(outcome) = target.apply_resolved(generation, resolved)? else {
                continue;
            };
            result.deleted += outcome.deleted;
            result.updated += outcome.updated;
            result.segments_applied += 1;
            if outcome.fully_deleted {
                result.fully_deleted.push(target.id().clone());
            }
        }

        self.total_applied.fetch_add(result.mutated(), Ordering::Relaxed);
        log::debug!(
            "packet {generation}: {} deleted, {} updated across {} of {} segments",
            result.deleted,
            result.updated,
            result.segments_applied,
            targets.len()
        );
        Ok(result)
    }

    fn is_eligible(&self, target: &ReadersAndUpdates, generation: i64) -> bool {
        if let Some(private) = &self.private_segment
            && private != target.id()
        {
            return false;
        }
        if target.buffered_deletes_gen() >= generation {
            log::trace!("packet {generation}: segment {} already at a later generation", target.id());
            return false;
        }
        if target.ref_count() <= 1 {
            log::trace!("packet {generation}: segment {} was merged away", target.id());
            return false;
        }
        true
    }

    /// Resolve the packet against one reader without mutating anything.
    fn resolve(&self, reader: &SegmentReader, generation: i64, is_private: bool) -> Result<ResolvedUpdates> {
        // Cutoffs are doc ids of the private segment. Every doc of an older
        // segment precedes a global delete.
        let limit = |cutoff: u32| if is_private { cutoff } else { u32::MAX };

        let mut deletes = Vec::new();
        let mut terms = FieldTerms::default();
        for (term, cutoff) in self.delete_terms.iter().zip(&self.term_limits) {
            let term = term?;
            if let Some(postings) = terms.postings(reader, &term)? {
                collect_below(postings, limit(*cutoff), |doc| deletes.push(doc))?;
            }
        }

        for (query, cutoff) in &self.delete_queries {
            let matches = query
                .matches(reader)
                .map_err(|err| PalisadeError::from(err.context(format!("delete query {} failed", query.key()))))?;
            if let Some(matches) = matches {
                collect_below(matches, limit(*cutoff), |doc| deletes.push(doc))?;
            }
        }
        deletes.sort_unstable();
        deletes.dedup();

        let hard_live = reader.hard_live_docs();
        let mut updates = Vec::with_capacity(self.field_updates.len());
        for buffer in &self.field_updates {
            let mut resolved =
                DocValuesFieldUpdates::new(buffer.field(), buffer.dv_type(), generation, reader.max_doc());
            let mut terms = FieldTerms::default();
            for update in buffer.iter() {
                let Some(postings) = terms.postings(reader, &update.term)? else {
                    continue;
                };
                let mut matched = Vec::new();
                collect_below(postings, limit(update.doc_id_up_to), |doc| {
                    if hard_live.is_none_or(|bits| bits.get(doc)) {
                        matched.push(doc);
                    }
                })?;
                for doc in matched {
                    resolved.add(doc, update.value.clone())?;
                }
            }
            resolved.finish();
            if !resolved.is_empty() {
                updates.push(resolved);
            }
        }

        Ok(ResolvedUpdates { deletes, updates })
    }
}

/// Caches the terms enum of the field most recently looked up.
#[derive(Default)]
struct FieldTerms {
    field: Option<String>,
    terms: Option<Box<dyn TermsEnum>>,
}

impl FieldTerms {
    fn postings(&mut self, reader: &SegmentReader, term: &Term) -> Result<Option<Box<dyn PostingIterator>>> {
        if self.field.as_deref() != Some(term.field()) {
            self.terms = reader.source().terms(term.field())?;
            self.field = Some(term.field().to_string());
        }
        let Some(terms) = self.terms.as_mut() else {
            return Ok(None);
        };
        if !terms.seek_exact(term.bytes())? {
            return Ok(None);
        }
        terms.postings().map(Some)
    }
}

/// Feed every doc of `postings` below `limit` to `sink`.
fn collect_below<F>(mut postings: Box<dyn PostingIterator>, limit: u32, mut sink: F) -> Result<()>
where
    F: FnMut(u32),
{
    while postings.next()? {
        let doc = postings.doc_id();
        if doc >= limit {
            break;
        }
        sink(doc);
    }
    Ok(())
}
