//! In-memory segments.
//!
//! [`MemorySegment`] holds postings and doc values in ordinary maps and
//! [`MemorySegmentOpener`] serves them by segment identity, overlaying any
//! field updates recorded in the commit descriptor. Both back the unit
//! tests, the integration tests and the benchmarks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::error::{PalisadeError, Result};
use crate::segment::reader::SegmentOpener;
use crate::segment::source::{PostingIterator, SegmentSource, SortedDocsIterator, TermsEnum};
use crate::segment::{SegmentCommitInfo, SegmentFormat, SegmentId};
use crate::storage::Storage;
use crate::update::{DocValuesFieldUpdates, UpdateValue};

type TermMap = BTreeMap<Vec<u8>, Arc<Vec<u32>>>;

/// A segment whose contents live entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySegment {
    max_doc: u32,
    postings: BTreeMap<String, Arc<TermMap>>,
    doc_values: BTreeMap<String, BTreeMap<u32, UpdateValue>>,
}

impl MemorySegment {
    pub fn new(max_doc: u32) -> Self {
        MemorySegment {
            max_doc,
            ..Default::default()
        }
    }

    fn check_doc(&self, doc: u32) -> Result<()> {
        if doc >= self.max_doc {
            return Err(PalisadeError::invalid_argument(format!(
                "doc {doc} out of range for segment with {} docs",
                self.max_doc
            )));
        }
        Ok(())
    }

    /// Index `term` of `field` for `doc`.
    pub fn add_term(&mut self, field: &str, term: impl AsRef<[u8]>, doc: u32) -> Result<()> {
        self.check_doc(doc)?;
        let terms = Arc::make_mut(self.postings.entry(field.to_string()).or_default());
        let docs = Arc::make_mut(terms.entry(term.as_ref().to_vec()).or_default());
        if let Err(pos) = docs.binary_search(&doc) {
            docs.insert(pos, doc);
        }
        Ok(())
    }

    /// Set the doc-values value of `field` for `doc`.
    pub fn set_doc_value(&mut self, field: &str, doc: u32, value: UpdateValue) -> Result<()> {
        self.check_doc(doc)?;
        self.doc_values
            .entry(field.to_string())
            .or_default()
            .insert(doc, value);
        Ok(())
    }

    /// Overlay resolved field updates; a `None` value removes the doc's value.
    pub fn apply_field_updates(&mut self, updates: &DocValuesFieldUpdates) -> Result<()> {
        let values = self.doc_values.entry(updates.field().to_string()).or_default();
        for (doc, value) in updates.iter() {
            if doc >= self.max_doc {
                return Err(PalisadeError::invalid_argument(format!(
                    "update for doc {doc} out of range for segment with {} docs",
                    self.max_doc
                )));
            }
            match value {
                Some(value) => values.insert(doc, value.clone()),
                None => values.remove(&doc),
            };
        }
        Ok(())
    }
}

impl SegmentSource for MemorySegment {
    fn max_doc(&self) -> u32 {
        self.max_doc
    }

    fn terms(&self, field: &str) -> Result<Option<Box<dyn TermsEnum>>> {
        Ok(self.postings.get(field).map(|terms| {
            Box::new(MemoryTermsEnum {
                terms: Arc::clone(terms),
                current: None,
            }) as Box<dyn TermsEnum>
        }))
    }

    fn doc_values(&self, field: &str) -> Result<Option<Box<dyn PostingIterator>>> {
        Ok(self.doc_values.get(field).map(|values| {
            Box::new(SortedDocsIterator::new(values.keys().copied().collect()))
                as Box<dyn PostingIterator>
        }))
    }

    fn doc_value(&self, field: &str, doc: u32) -> Result<Option<UpdateValue>> {
        Ok(self
            .doc_values
            .get(field)
            .and_then(|values| values.get(&doc))
            .cloned())
    }

    fn ram_bytes_used(&self) -> u64 {
        let postings: usize = self
            .postings
            .values()
            .flat_map(|terms| terms.iter())
            .map(|(term, docs)| term.len() + docs.len() * 4 + 48)
            .sum();
        let doc_values: usize = self
            .doc_values
            .values()
            .flat_map(|values| values.values())
            .map(|value| value.ram_bytes_used() as usize + 8)
            .sum();
        (postings + doc_values) as u64
    }
}

#[derive(Debug)]
struct MemoryTermsEnum {
    terms: Arc<TermMap>,
    current: Option<Arc<Vec<u32>>>,
}

impl TermsEnum for MemoryTermsEnum {
    fn seek_exact(&mut self, term: &[u8]) -> Result<bool> {
        self.current = self.terms.get(term).cloned();
        Ok(self.current.is_some())
    }

    fn postings(&self) -> Result<Box<dyn PostingIterator>> {
        let docs = self
            .current
            .as_ref()
            .ok_or_else(|| PalisadeError::illegal_state("terms enum is not positioned"))?;
        Ok(Box::new(SortedDocsIterator::new(docs.as_ref().clone())))
    }
}

/// Serves registered [`MemorySegment`]s, overlaying persisted field updates.
#[derive(Debug)]
pub struct MemorySegmentOpener {
    segments: RwLock<AHashMap<SegmentId, Arc<MemorySegment>>>,
    storage: Arc<dyn Storage>,
    format: Arc<dyn SegmentFormat>,
    opens: AtomicUsize,
}

impl MemorySegmentOpener {
    pub fn new(storage: Arc<dyn Storage>, format: Arc<dyn SegmentFormat>) -> Self {
        MemorySegmentOpener {
            segments: RwLock::new(AHashMap::new()),
            storage,
            format,
            opens: AtomicUsize::new(0),
        }
    }

    /// Make `segment` available under `id`.
    pub fn register(&self, id: SegmentId, segment: MemorySegment) {
        self.segments.write().insert(id, Arc::new(segment));
    }

    /// How many times a source has been opened.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }
}

impl SegmentOpener for MemorySegmentOpener {
    fn open(&self, info: &SegmentCommitInfo) -> Result<Arc<dyn SegmentSource>> {
        let base = self
            .segments
            .read()
            .get(info.id())
            .cloned()
            .ok_or_else(|| PalisadeError::index(format!("unknown segment {}", info.id())))?;

        if base.max_doc() != info.max_doc() {
            return Err(PalisadeError::illegal_state(format!(
                "segment {} has {} docs, descriptor says {}",
                info.id(),
                base.max_doc(),
                info.max_doc()
            )));
        }
        self.opens.fetch_add(1, Ordering::Relaxed);

        if info.doc_values_updates_files().is_empty() {
            return Ok(base);
        }

        let mut segment = base.as_ref().clone();
        for field in info.doc_values_updates_files().keys() {
            if let Some(updates) =
                self.format
                    .read_field_updates(self.storage.as_ref(), info, field)?
            {
                segment.apply_field_updates(&updates)?;
            }
        }
        Ok(Arc::new(segment))
    }
}

#[cfg(test)]
pub(crate) use faulty::FaultyStorage;

#[cfg(test)]
mod faulty {
    use std::io::Write;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::error::{PalisadeError, Result};
    use crate::storage::memory::MemoryStorage;
    use crate::storage::{Storage, StorageInput, StorageOutput};

    /// Memory storage whose outputs can be told to fail after publishing.
    #[derive(Debug)]
    pub(crate) struct FaultyStorage {
        inner: MemoryStorage,
        fail: Arc<AtomicBool>,
    }

    impl FaultyStorage {
        pub(crate) fn new() -> Self {
            FaultyStorage {
                inner: MemoryStorage::new_default(),
                fail: Arc::new(AtomicBool::new(false)),
            }
        }

        pub(crate) fn fail_writes(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }
    }

    #[derive(Debug)]
    struct FaultyOutput {
        inner: Box<dyn StorageOutput>,
        fail: Arc<AtomicBool>,
    }

    impl Write for FaultyOutput {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.inner.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.inner.flush()
        }
    }

    impl StorageOutput for FaultyOutput {
        fn flush_and_sync(&mut self) -> Result<()> {
            self.inner.flush_and_sync()
        }

        fn position(&self) -> Result<u64> {
            self.inner.position()
        }

        fn close(&mut self) -> Result<()> {
            self.inner.close()?;
            if self.fail.load(Ordering::SeqCst) {
                return Err(PalisadeError::storage("injected sync failure"));
            }
            Ok(())
        }
    }

    impl Storage for FaultyStorage {
        fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
            self.inner.open_input(name)
        }

        fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
            Ok(Box::new(FaultyOutput {
                inner: self.inner.create_output(name)?,
                fail: Arc::clone(&self.fail),
            }))
        }

        fn file_exists(&self, name: &str) -> bool {
            self.inner.file_exists(name)
        }

        fn delete_file(&self, name: &str) -> Result<()> {
            self.inner.delete_file(name)
        }

        fn list_files(&self) -> Result<Vec<String>> {
            self.inner.list_files()
        }

        fn file_size(&self, name: &str) -> Result<u64> {
            self.inner.file_size(name)
        }

        fn sync(&self) -> Result<()> {
            self.inner.sync()
        }
    }
}
