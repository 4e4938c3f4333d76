//! In-RAM accumulator of deletes and updates for one segment.
//!
//! Every entry carries a `doc_id_up_to` cutoff: it applies only to documents
//! with a smaller doc id in the segment the accumulator belongs to. Repeated
//! deletes of the same term or query keep the largest cutoff, so a thread
//! that indexed a document later always wins over a racing older writer.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;

use crate::config::UpdatesConfig;
use crate::error::{PalisadeError, Result};
use crate::segment::SegmentId;
use crate::update::{
    BYTES_PER_DEL_QUERY, BYTES_PER_DEL_TERM, DeleteQuery, DocValuesType, FieldUpdatesBuffer,
    FrozenBufferedUpdates, MatchAllDocsQuery, Term, UpdateValue,
};

/// Pending deletes and doc-values updates, before freezing.
///
/// Not synchronized; callers serialize access.
#[derive(Debug, Default)]
pub struct BufferedUpdates {
    segment: Option<SegmentId>,
    delete_terms: BTreeMap<Term, u32>,
    delete_queries: BTreeMap<String, (Arc<dyn DeleteQuery>, u32)>,
    field_updates: BTreeMap<String, FieldUpdatesBuffer>,
    num_term_deletes: u64,
    num_field_updates: u64,
    bytes_used: u64,
}

impl BufferedUpdates {
    /// Accumulator for updates that target every existing segment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulator private to the segment `segment` being written.
    pub fn for_segment(segment: SegmentId) -> Self {
        BufferedUpdates {
            segment: Some(segment),
            ..Default::default()
        }
    }

    pub fn segment(&self) -> Option<&SegmentId> {
        self.segment.as_ref()
    }

    /// Delete docs containing `term` below `doc_id_up_to`.
    pub fn add_term(&mut self, term: Term, doc_id_up_to: u32) {
        self.num_term_deletes += 1;
        match self.delete_terms.entry(term) {
            Entry::Occupied(mut entry) => {
                if doc_id_up_to > *entry.get() {
                    entry.insert(doc_id_up_to);
                }
            }
            Entry::Vacant(entry) => {
                self.bytes_used += BYTES_PER_DEL_TERM + entry.key().ram_bytes_used();
                entry.insert(doc_id_up_to);
            }
        }
    }

    /// Delete docs matching `query` below `doc_id_up_to`.
    pub fn add_query(&mut self, query: Arc<dyn DeleteQuery>, doc_id_up_to: u32) {
        match self.delete_queries.entry(query.key()) {
            Entry::Occupied(mut entry) => {
                let (_, cutoff) = entry.get_mut();
                if doc_id_up_to > *cutoff {
                    *cutoff = doc_id_up_to;
                }
            }
            Entry::Vacant(entry) => {
                self.bytes_used += BYTES_PER_DEL_QUERY + query.ram_bytes_used();
                entry.insert((query, doc_id_up_to));
            }
        }
    }

    /// Delete every doc below `doc_id_up_to`.
    pub fn delete_all(&mut self, doc_id_up_to: u32) {
        self.add_query(Arc::new(MatchAllDocsQuery), doc_id_up_to);
    }

    /// Set `field` to `value` on docs containing `term` below `doc_id_up_to`.
    pub fn add_numeric_update(&mut self, term: Term, field: &str, value: i64, doc_id_up_to: u32) -> Result<()> {
        self.add_doc_values_update(term, field, DocValuesType::Numeric, Some(UpdateValue::Numeric(value)), doc_id_up_to)
    }

    pub fn add_binary_update(&mut self, term: Term, field: &str, value: Vec<u8>, doc_id_up_to: u32) -> Result<()> {
        self.add_doc_values_update(term, field, DocValuesType::Binary, Some(UpdateValue::Binary(value)), doc_id_up_to)
    }

    /// Update `field` on docs containing `term`; a `None` value removes it.
    pub fn add_doc_values_update(
        &mut self,
        term: Term,
        field: &str,
        dv_type: DocValuesType,
        value: Option<UpdateValue>,
        doc_id_up_to: u32,
    ) -> Result<()> {
        let buffer = self
            .field_updates
            .entry(field.to_string())
            .or_insert_with(|| FieldUpdatesBuffer::new(field, dv_type));
        if buffer.dv_type() != dv_type {
            return Err(PalisadeError::invalid_argument(format!(
                "field {field} already takes {:?} updates, not {dv_type:?}",
                buffer.dv_type()
            )));
        }

        let before = buffer.ram_bytes_used();
        buffer.add(term, value, doc_id_up_to)?;
        self.bytes_used += buffer.ram_bytes_used() - before;
        self.num_field_updates += 1;
        Ok(())
    }

    /// Whether anything is buffered.
    pub fn any(&self) -> bool {
        !self.delete_terms.is_empty() || !self.delete_queries.is_empty() || !self.field_updates.is_empty()
    }

    pub fn clear(&mut self) {
        self.delete_terms.clear();
        self.delete_queries.clear();
        self.field_updates.clear();
        self.num_term_deletes = 0;
        self.num_field_updates = 0;
        self.bytes_used = 0;
    }

    /// Cutoff recorded for `term`, if it is buffered.
    pub fn term_cutoff(&self, term: &Term) -> Option<u32> {
        self.delete_terms.get(term).copied()
    }

    pub fn query_cutoff(&self, query: &dyn DeleteQuery) -> Option<u32> {
        self.delete_queries.get(&query.key()).map(|(_, cutoff)| *cutoff)
    }

    /// Every `add_term` call, including repeats of the same term.
    pub fn num_term_deletes(&self) -> u64 {
        self.num_term_deletes
    }

    pub fn num_delete_terms(&self) -> usize {
        self.delete_terms.len()
    }

    pub fn num_delete_queries(&self) -> usize {
        self.delete_queries.len()
    }

    pub fn num_field_updates(&self) -> u64 {
        self.num_field_updates
    }

    pub fn ram_bytes_used(&self) -> u64 {
        self.bytes_used
    }

    /// Whether the buffer has outgrown the configured limits.
    pub fn needs_flush(&self, config: &UpdatesConfig) -> bool {
        if self.bytes_used >= config.ram_buffer_size_bytes() {
            return true;
        }
        config
            .max_buffered_delete_terms
            .is_some_and(|max| self.delete_terms.len() >= max)
    }

    /// Compact everything into a frozen packet and clear the accumulator.
    pub fn freeze(&mut self) -> Result<FrozenBufferedUpdates> {
        let delete_terms = std::mem::take(&mut self.delete_terms);
        let queries = std::mem::take(&mut self.delete_queries).into_values().collect();
        let field_updates = std::mem::take(&mut self.field_updates).into_values().collect();

        let frozen = FrozenBufferedUpdates::new(
            delete_terms,
            queries,
            field_updates,
            self.segment.clone(),
            self.num_term_deletes,
            self.bytes_used,
        )?;
        log::trace!(
            "froze {} term deletes, {} queries and {} field updates into {} bytes",
            self.num_term_deletes,
            frozen.num_delete_queries(),
            self.num_field_updates,
            frozen.ram_bytes_used()
        );
        self.clear();
        Ok(frozen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::TermQuery;

    #[test]
    fn test_cutoff_keeps_maximum() {
        let mut updates = BufferedUpdates::new();
        let term = Term::new("id", "7");
        for cutoff in [5, 9, 3, 9, 7] {
            updates.add_term(term.clone(), cutoff);
        }
        assert_eq!(updates.term_cutoff(&term), Some(9));
        assert_eq!(updates.num_term_deletes(), 5);
        assert_eq!(updates.num_delete_terms(), 1);
    }

    #[test]
    fn test_query_cutoff_keeps_maximum() {
        let mut updates = BufferedUpdates::new();
        let query = TermQuery::new(Term::new("tag", "red"));
        updates.add_query(Arc::new(query.clone()), 4);
        updates.add_query(Arc::new(query.clone()), 2);
        assert_eq!(updates.query_cutoff(&query), Some(4));
        updates.add_query(Arc::new(query.clone()), 6);
        assert_eq!(updates.query_cutoff(&query), Some(6));
        assert_eq!(updates.num_delete_queries(), 1);
    }

    #[test]
    fn test_ram_accounting_and_clear() {
        let mut updates = BufferedUpdates::new();
        assert!(!updates.any());

        updates.add_term(Term::new("id", "1"), 1);
        let after_one = updates.ram_bytes_used();
        assert!(after_one >= BYTES_PER_DEL_TERM);
        updates.add_term(Term::new("id", "1"), 2);
        assert_eq!(updates.ram_bytes_used(), after_one);

        updates.add_numeric_update(Term::new("id", "1"), "price", 10, 3).unwrap();
        updates.delete_all(4);
        assert!(updates.any());
        assert!(updates.ram_bytes_used() > after_one);

        updates.clear();
        assert!(!updates.any());
        assert_eq!(updates.ram_bytes_used(), 0);
        assert_eq!(updates.num_term_deletes(), 0);
    }

    #[test]
    fn test_field_type_is_fixed_per_field() {
        let mut updates = BufferedUpdates::new();
        updates.add_numeric_update(Term::new("id", "1"), "price", 10, 3).unwrap();
        assert!(updates.add_binary_update(Term::new("id", "1"), "price", vec![1], 3).is_err());
        updates.add_doc_values_update(Term::new("id", "2"), "price", DocValuesType::Numeric, None, 3).unwrap();
        assert_eq!(updates.num_field_updates(), 2);
    }

    #[test]
    fn test_needs_flush() {
        let config = UpdatesConfig::default().with_max_buffered_delete_terms(2);
        let mut updates = BufferedUpdates::new();
        updates.add_term(Term::new("id", "1"), 1);
        assert!(!updates.needs_flush(&config));
        updates.add_term(Term::new("id", "2"), 1);
        assert!(updates.needs_flush(&config));

        let tiny = UpdatesConfig::default().with_ram_buffer_size_mb(0.0001);
        let mut updates = BufferedUpdates::new();
        for i in 0..10 {
            updates.add_term(Term::new("id", i.to_string()), 1);
        }
        assert!(updates.needs_flush(&tiny));
    }

    #[test]
    fn test_freeze_clears() {
        let mut updates = BufferedUpdates::for_segment(SegmentId::new("_4"));
        updates.add_term(Term::new("id", "1"), 1);
        let frozen = updates.freeze().unwrap();
        assert!(!updates.any());
        assert!(frozen.any());
        assert!(frozen.private_segment().is_some());
        assert_eq!(frozen.del_gen(), -1);
    }
}
