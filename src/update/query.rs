//! Queries that select documents for deletion.
//!
//! A delete query only has to enumerate matching doc ids; scoring is not
//! involved. Matching runs against a [`SegmentReader`] while a packet is
//! resolved and must not mutate anything.
//!
//! Queries are often implemented outside this crate, so matching reports
//! failures as [`anyhow::Error`]; the packet wraps them with the query key.

use std::fmt::Debug;

use crate::segment::SegmentReader;
use crate::segment::source::{AllDocsIterator, PostingIterator};
use crate::update::Term;

/// A query whose matches get deleted.
pub trait DeleteQuery: Send + Sync + Debug {
    /// Identity used to merge repeated deletes of the same query.
    fn key(&self) -> String;

    /// Matching docs in `reader`, in increasing doc-id order, or `None` if
    /// nothing can match.
    fn matches(&self, reader: &SegmentReader) -> anyhow::Result<Option<Box<dyn PostingIterator>>>;

    fn ram_bytes_used(&self) -> u64 {
        64
    }
}

/// Matches every document containing a term.
#[derive(Debug, Clone)]
pub struct TermQuery {
    term: Term,
}

impl TermQuery {
    pub fn new(term: Term) -> Self {
        TermQuery { term }
    }

    pub fn term(&self) -> &Term {
        &self.term
    }
}

impl DeleteQuery for TermQuery {
    fn key(&self) -> String {
        format!("term({})", self.term)
    }

    fn matches(&self, reader: &SegmentReader) -> anyhow::Result<Option<Box<dyn PostingIterator>>> {
        let Some(mut terms) = reader.source().terms(self.term.field())? else {
            return Ok(None);
        };
        if !terms.seek_exact(self.term.bytes())? {
            return Ok(None);
        }
        Ok(Some(terms.postings()?))
    }

    fn ram_bytes_used(&self) -> u64 {
        32 + self.term.ram_bytes_used()
    }
}

/// Matches every document of the segment.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchAllDocsQuery;

impl DeleteQuery for MatchAllDocsQuery {
    fn key(&self) -> String {
        "*:*".to_string()
    }

    fn matches(&self, reader: &SegmentReader) -> anyhow::Result<Option<Box<dyn PostingIterator>>> {
        Ok(Some(Box::new(AllDocsIterator::new(reader.max_doc()))))
    }

    fn ram_bytes_used(&self) -> u64 {
        16
    }
}

/// Matches documents that have a value in a doc-values field.
#[derive(Debug, Clone)]
pub struct DocValuesExistsQuery {
    field: String,
}

impl DocValuesExistsQuery {
    pub fn new<S: Into<String>>(field: S) -> Self {
        DocValuesExistsQuery {
            field: field.into(),
        }
    }
}

impl DeleteQuery for DocValuesExistsQuery {
    fn key(&self) -> String {
        format!("exists({})", self.field)
    }

    fn matches(&self, reader: &SegmentReader) -> anyhow::Result<Option<Box<dyn PostingIterator>>> {
        Ok(reader.source().doc_values(&self.field)?)
    }
}
