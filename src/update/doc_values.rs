//! Doc-values updates, buffered by term and resolved to doc ids.

use serde::{Deserialize, Serialize};

use crate::error::{PalisadeError, Result};
use crate::update::{BYTES_PER_FIELD_UPDATE, Term};

/// Kind of doc-values field an update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DocValuesType {
    Numeric = 0,
    Binary = 1,
}

impl DocValuesType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(DocValuesType::Numeric),
            1 => Ok(DocValuesType::Binary),
            other => Err(PalisadeError::serialization(format!(
                "unknown doc values type {other}"
            ))),
        }
    }
}

/// New value of a doc-values field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateValue {
    Numeric(i64),
    Binary(Vec<u8>),
}

impl UpdateValue {
    pub fn dv_type(&self) -> DocValuesType {
        match self {
            UpdateValue::Numeric(_) => DocValuesType::Numeric,
            UpdateValue::Binary(_) => DocValuesType::Binary,
        }
    }

    pub fn ram_bytes_used(&self) -> u64 {
        match self {
            UpdateValue::Numeric(_) => 8,
            UpdateValue::Binary(bytes) => 24 + bytes.len() as u64,
        }
    }
}

fn check_type(field: &str, expected: DocValuesType, value: Option<&UpdateValue>) -> Result<()> {
    match value {
        Some(value) if value.dv_type() != expected => Err(PalisadeError::invalid_argument(format!(
            "field {field} takes {expected:?} updates, got {:?}",
            value.dv_type()
        ))),
        _ => Ok(()),
    }
}

/// One buffered update: every doc matching `term` below `doc_id_up_to`
/// gets `value`. A `None` value removes the field's value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldUpdate {
    pub term: Term,
    pub value: Option<UpdateValue>,
    pub doc_id_up_to: u32,
}

/// Updates of one doc-values field, in arrival order.
///
/// When two updates select the same document, the later one wins.
#[derive(Debug, Clone)]
pub struct FieldUpdatesBuffer {
    field: String,
    dv_type: DocValuesType,
    updates: Vec<FieldUpdate>,
    bytes_used: u64,
}

impl FieldUpdatesBuffer {
    pub fn new<S: Into<String>>(field: S, dv_type: DocValuesType) -> Self {
        FieldUpdatesBuffer {
            field: field.into(),
            dv_type,
            updates: Vec::new(),
            bytes_used: 0,
        }
    }

    pub fn add(&mut self, term: Term, value: Option<UpdateValue>, doc_id_up_to: u32) -> Result<()> {
        check_type(&self.field, self.dv_type, value.as_ref())?;
        self.bytes_used += BYTES_PER_FIELD_UPDATE
            + term.ram_bytes_used()
            + value.as_ref().map_or(0, UpdateValue::ram_bytes_used);
        self.updates.push(FieldUpdate {
            term,
            value,
            doc_id_up_to,
        });
        Ok(())
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn dv_type(&self) -> DocValuesType {
        self.dv_type
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldUpdate> {
        self.updates.iter()
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn ram_bytes_used(&self) -> u64 {
        self.bytes_used
    }
}

/// Updates of one field resolved against one segment.
///
/// Entries are added in resolution order. [`finish`](Self::finish) sorts
/// them by doc id and keeps the last entry per doc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocValuesFieldUpdates {
    field: String,
    dv_type: DocValuesType,
    /// Generation of the packet the updates came from.
    generation: i64,
    max_doc: u32,
    entries: Vec<(u32, Option<UpdateValue>)>,
    finished: bool,
}

impl DocValuesFieldUpdates {
    pub fn new<S: Into<String>>(field: S, dv_type: DocValuesType, generation: i64, max_doc: u32) -> Self {
        DocValuesFieldUpdates {
            field: field.into(),
            dv_type,
            generation,
            max_doc,
            entries: Vec::new(),
            finished: false,
        }
    }

    pub fn add(&mut self, doc: u32, value: Option<UpdateValue>) -> Result<()> {
        if self.finished {
            return Err(PalisadeError::illegal_state(format!(
                "updates of field {} are already finished",
                self.field
            )));
        }
        if doc >= self.max_doc {
            return Err(PalisadeError::illegal_state(format!(
                "update of doc {doc} beyond max_doc {}",
                self.max_doc
            )));
        }
        check_type(&self.field, self.dv_type, value.as_ref())?;
        self.entries.push((doc, value));
        Ok(())
    }

    /// Sort by doc id, keeping the last value added for each doc.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        // Stable, so entries for one doc stay in arrival order.
        self.entries.sort_by_key(|(doc, _)| *doc);
        let mut deduped: Vec<(u32, Option<UpdateValue>)> = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            match deduped.last_mut() {
                Some(last) if last.0 == entry.0 => *last = entry,
                _ => deduped.push(entry),
            }
        }
        self.entries = deduped;
        self.finished = true;
    }

    /// Combine `parts`, oldest first; later parts win for the same doc.
    pub fn merge(parts: &[&DocValuesFieldUpdates]) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| PalisadeError::invalid_argument("nothing to merge"))?;
        let mut merged = DocValuesFieldUpdates::new(
            first.field.clone(),
            first.dv_type,
            parts.iter().map(|p| p.generation).max().unwrap_or(first.generation),
            first.max_doc,
        );
        for part in parts {
            if part.field != merged.field || part.dv_type != merged.dv_type || part.max_doc != merged.max_doc {
                return Err(PalisadeError::invalid_argument(format!(
                    "cannot merge updates of {}/{:?} into {}/{:?}",
                    part.field, part.dv_type, merged.field, merged.dv_type
                )));
            }
            merged.entries.extend(part.entries.iter().cloned());
        }
        merged.finish();
        Ok(merged)
    }

    /// Translate doc ids into another segment, dropping docs that `map` drops.
    pub fn remap<F>(&self, max_doc: u32, map: F) -> Result<Self>
    where
        F: Fn(u32) -> Option<u32>,
    {
        let mut remapped = DocValuesFieldUpdates::new(self.field.clone(), self.dv_type, self.generation, max_doc);
        for (doc, value) in &self.entries {
            if let Some(target) = map(*doc) {
                remapped.add(target, value.clone())?;
            }
        }
        remapped.finish();
        Ok(remapped)
    }

    /// Keep only the docs `keep` accepts.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(u32) -> bool,
    {
        self.entries.retain(|(doc, _)| keep(*doc));
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, Option<&UpdateValue>)> {
        self.entries.iter().map(|(doc, value)| (*doc, value.as_ref()))
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn dv_type(&self) -> DocValuesType {
        self.dv_type
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub fn max_doc(&self) -> u32 {
        self.max_doc
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn ram_bytes_used(&self) -> u64 {
        self.entries
            .iter()
            .map(|(_, value)| 16 + value.as_ref().map_or(0, UpdateValue::ram_bytes_used))
            .sum()
    }
}
