//! Read-only access to a segment's terms, postings and doc values.
//!
//! These traits are the only view of segment contents the reconciliation
//! core needs. They are consumed while packets are resolved and must not
//! mutate anything.

use std::fmt::Debug;

use crate::error::Result;
use crate::update::UpdateValue;

/// Sentinel doc id returned once an iterator is exhausted.
pub const NO_MORE_DOCS: u32 = u32::MAX;

/// Iterator over posting lists.
///
/// A fresh iterator is unpositioned: `doc_id()` returns [`NO_MORE_DOCS`]
/// until the first successful `next()` or `skip_to()`.
pub trait PostingIterator: Send + Debug {
    /// Get the current document ID.
    fn doc_id(&self) -> u32;

    /// Move to the next document.
    fn next(&mut self) -> Result<bool>;

    /// Skip to the first document >= target.
    fn skip_to(&mut self, target: u32) -> Result<bool>;

    /// Get the cost of iterating through this posting list.
    fn cost(&self) -> u64;

    /// Get the term frequency in the current document.
    fn term_freq(&self) -> u32 {
        1
    }

    /// Get the positions of the term in the current document.
    fn positions(&self) -> Result<Vec<u32>> {
        Ok(Vec::new())
    }
}

/// Cursor over the term dictionary of one field.
pub trait TermsEnum: Send + Debug {
    /// Position on `term`, returning whether it exists.
    fn seek_exact(&mut self, term: &[u8]) -> Result<bool>;

    /// Postings of the term the enum is positioned on.
    fn postings(&self) -> Result<Box<dyn PostingIterator>>;
}

/// Immutable contents of a segment.
pub trait SegmentSource: Send + Sync + Debug {
    /// Number of documents in the segment.
    fn max_doc(&self) -> u32;

    /// Terms of `field`, or `None` if the field is not indexed.
    fn terms(&self, field: &str) -> Result<Option<Box<dyn TermsEnum>>>;

    /// Documents that have a value for the doc-values `field`.
    fn doc_values(&self, field: &str) -> Result<Option<Box<dyn PostingIterator>>>;

    /// Doc-values value of `field` for `doc`.
    fn doc_value(&self, field: &str, doc: u32) -> Result<Option<UpdateValue>>;

    /// Approximate heap usage.
    fn ram_bytes_used(&self) -> u64;
}

/// Postings backed by a sorted list of doc ids.
#[derive(Debug, Clone)]
pub struct SortedDocsIterator {
    docs: Vec<u32>,
    position: Option<usize>,
}

impl SortedDocsIterator {
    /// `docs` must be sorted and free of duplicates.
    pub fn new(docs: Vec<u32>) -> Self {
        debug_assert!(docs.windows(2).all(|w| w[0] < w[1]));
        SortedDocsIterator {
            docs,
            position: None,
        }
    }
}

impl PostingIterator for SortedDocsIterator {
    fn doc_id(&self) -> u32 {
        match self.position {
            Some(pos) if pos < self.docs.len() => self.docs[pos],
            _ => NO_MORE_DOCS,
        }
    }

    fn next(&mut self) -> Result<bool> {
        let next = self.position.map_or(0, |pos| pos + 1);
        self.position = Some(next.min(self.docs.len()));
        Ok(next < self.docs.len())
    }

    fn skip_to(&mut self, target: u32) -> Result<bool> {
        let start = self.position.unwrap_or(0);
        let offset = self.docs[start.min(self.docs.len())..].partition_point(|&doc| doc < target);
        let pos = start + offset;
        self.position = Some(pos.min(self.docs.len()));
        Ok(pos < self.docs.len())
    }

    fn cost(&self) -> u64 {
        self.docs.len() as u64
    }
}

/// Postings matching every doc id below `max_doc`.
#[derive(Debug, Clone)]
pub struct AllDocsIterator {
    max_doc: u32,
    current: Option<u32>,
}

impl AllDocsIterator {
    pub fn new(max_doc: u32) -> Self {
        AllDocsIterator {
            max_doc,
            current: None,
        }
    }
}

impl PostingIterator for AllDocsIterator {
    fn doc_id(&self) -> u32 {
        match self.current {
            Some(doc) if doc < self.max_doc => doc,
            _ => NO_MORE_DOCS,
        }
    }

    fn next(&mut self) -> Result<bool> {
        let next = self.current.map_or(0, |doc| doc.saturating_add(1));
        self.current = Some(next.min(self.max_doc));
        Ok(next < self.max_doc)
    }

    fn skip_to(&mut self, target: u32) -> Result<bool> {
        let next = match self.current {
            Some(doc) => target.max(doc),
            None => target,
        };
        self.current = Some(next.min(self.max_doc));
        Ok(next < self.max_doc)
    }

    fn cost(&self) -> u64 {
        self.max_doc as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(mut iter: impl PostingIterator) -> Vec<u32> {
        let mut docs = Vec::new();
        while iter.next().unwrap() {
            docs.push(iter.doc_id());
        }
        assert_eq!(iter.doc_id(), NO_MORE_DOCS);
        docs
    }

    #[test]
    fn test_sorted_docs_iterator() {
        let iter = SortedDocsIterator::new(vec![1, 4, 9]);
        assert_eq!(iter.doc_id(), NO_MORE_DOCS);
        assert_eq!(iter.cost(), 3);
        assert_eq!(collect(iter), vec![1, 4, 9]);

        assert!(collect(SortedDocsIterator::new(Vec::new())).is_empty());
    }

    #[test]
    fn test_sorted_docs_skip_to() {
        let mut iter = SortedDocsIterator::new(vec![1, 4, 9, 12]);
        assert!(iter.skip_to(5).unwrap());
        assert_eq!(iter.doc_id(), 9);
        assert!(iter.skip_to(9).unwrap());
        assert_eq!(iter.doc_id(), 9);
        assert!(iter.next().unwrap());
        assert_eq!(iter.doc_id(), 12);
        assert!(!iter.skip_to(13).unwrap());
        assert_eq!(iter.doc_id(), NO_MORE_DOCS);
    }

    #[test]
    fn test_all_docs_iterator() {
        assert_eq!(collect(AllDocsIterator::new(4)), vec![0, 1, 2, 3]);
        assert!(collect(AllDocsIterator::new(0)).is_empty());

        let mut iter = AllDocsIterator::new(10);
        assert!(iter.skip_to(7).unwrap());
        assert_eq!(iter.doc_id(), 7);
        assert!(!iter.skip_to(10).unwrap());
    }
}
