//! Persistence of live-docs and field-update generations.
//!
//! The byte layout is owned by the [`SegmentFormat`] implementation. The
//! core only relies on the contract: a write targets the descriptor's
//! next-write generation, leaves no file behind when it fails, and a read
//! returns exactly what the matching write stored.

use std::collections::BTreeMap;
use std::fmt::Debug;

use bit_vec::BitVec;

use crate::error::{PalisadeError, Result};
use crate::segment::SegmentCommitInfo;
use crate::segment::commit::{field_infos_file_name, field_updates_file_name, live_docs_file_name};
use crate::storage::{Storage, StorageInput, StructReader, StructWriter};
use crate::update::{DocValuesFieldUpdates, DocValuesType, UpdateValue};

/// Codec for the per-generation files the reconciliation core writes.
pub trait SegmentFormat: Send + Sync + Debug {
    /// Read the live-docs bitmap at the descriptor's current `del_gen`.
    fn read_live_docs(&self, storage: &dyn Storage, info: &SegmentCommitInfo) -> Result<BitVec>;

    /// Write `live_docs` at the descriptor's next-write `del_gen`.
    ///
    /// `new_del_count` is the total number of hard deletes the bitmap
    /// encodes. Returns the name of the written file.
    fn write_live_docs(
        &self,
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
        live_docs: &BitVec,
        new_del_count: u32,
    ) -> Result<String>;

    /// Read the field updates recorded for `field`, if any were written.
    fn read_field_updates(
        &self,
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
        field: &str,
    ) -> Result<Option<DocValuesFieldUpdates>>;

    /// Write the cumulative updates of one field at the next-write `doc_values_gen`.
    fn write_field_updates(
        &self,
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
        updates: &DocValuesFieldUpdates,
    ) -> Result<String>;

    /// Read the updated fields recorded at the descriptor's `field_infos_gen`.
    fn read_field_infos(
        &self,
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
    ) -> Result<BTreeMap<String, DocValuesType>>;

    /// Write the updated fields at the next-write `field_infos_gen`.
    fn write_field_infos(
        &self,
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
        fields: &BTreeMap<String, DocValuesType>,
    ) -> Result<String>;
}

const LIVE_DOCS_MAGIC: u32 = 0x4C49_5645; // "LIVE"
const FIELD_UPDATES_MAGIC: u32 = 0x4456_5550; // "DVUP"
const FIELD_INFOS_MAGIC: u32 = 0x464E_4653; // "FNFS"
const VERSION: u8 = 1;

const VALUE_NONE: u8 = 0;
const VALUE_NUMERIC: u8 = 1;
const VALUE_BINARY: u8 = 2;

/// Checksummed little-endian format built on [`StructWriter`].
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredFormat;

impl StructuredFormat {
    pub fn new() -> Self {
        StructuredFormat
    }

    fn check_header<R: StorageInput>(
        reader: &mut StructReader<R>,
        magic: u32,
        info: &SegmentCommitInfo,
        generation: i64,
        file: &str,
    ) -> Result<()> {
        let found = reader.read_u32()?;
        if found != magic {
            return Err(PalisadeError::index(format!(
                "{file}: bad magic {found:#010x}, expected {magic:#010x}"
            )));
        }
        let version = reader.read_u8()?;
        if version != VERSION {
            return Err(PalisadeError::index(format!(
                "{file}: unsupported version {version}"
            )));
        }
        let id = reader.read_bytes()?;
        if id.as_slice() != info.id().id() {
            return Err(PalisadeError::index(format!(
                "{file}: written for a different segment than {}",
                info.id()
            )));
        }
        let found_gen = reader.read_i64()?;
        if found_gen != generation {
            return Err(PalisadeError::index(format!(
                "{file}: generation {found_gen}, expected {generation}"
            )));
        }
        let max_doc = reader.read_u32()?;
        if max_doc != info.max_doc() {
            return Err(PalisadeError::illegal_state(format!(
                "{file}: max_doc {max_doc} disagrees with segment max_doc {}",
                info.max_doc()
            )));
        }
        Ok(())
    }

    fn encode_live_docs(
        storage: &dyn Storage,
        name: &str,
        info: &SegmentCommitInfo,
        generation: i64,
        live_docs: &BitVec,
        new_del_count: u32,
    ) -> Result<()> {
        let mut writer = StructWriter::new(storage.create_output(name)?);
        writer.write_u32(LIVE_DOCS_MAGIC)?;
        writer.write_u8(VERSION)?;
        writer.write_bytes(info.id().id())?;
        writer.write_i64(generation)?;
        writer.write_u32(info.max_doc())?;
        writer.write_u32(new_del_count)?;
        writer.write_bytes(&live_docs.to_bytes())?;
        writer.close()
    }

    fn encode_field_updates(
        storage: &dyn Storage,
        name: &str,
        info: &SegmentCommitInfo,
        generation: i64,
        updates: &DocValuesFieldUpdates,
    ) -> Result<()> {
        let mut writer = StructWriter::new(storage.create_output(name)?);
        writer.write_u32(FIELD_UPDATES_MAGIC)?;
        writer.write_u8(VERSION)?;
        writer.write_bytes(info.id().id())?;
        writer.write_i64(generation)?;
        writer.write_u32(info.max_doc())?;
        writer.write_string(updates.field())?;
        writer.write_u8(updates.dv_type() as u8)?;
        writer.write_varint(updates.len() as u64)?;

        let mut last_doc = 0u32;
        for (doc, value) in updates.iter() {
            writer.write_varint((doc - last_doc) as u64)?;
            last_doc = doc;
            match value {
                None => writer.write_u8(VALUE_NONE)?,
                Some(UpdateValue::Numeric(v)) => {
                    writer.write_u8(VALUE_NUMERIC)?;
                    writer.write_i64(*v)?;
                }
                Some(UpdateValue::Binary(bytes)) => {
                    writer.write_u8(VALUE_BINARY)?;
                    writer.write_bytes(bytes)?;
                }
            }
        }
        writer.close()
    }

    fn encode_field_infos(
        storage: &dyn Storage,
        name: &str,
        info: &SegmentCommitInfo,
        generation: i64,
        fields: &BTreeMap<String, DocValuesType>,
    ) -> Result<()> {
        let mut writer = StructWriter::new(storage.create_output(name)?);
        writer.write_u32(FIELD_INFOS_MAGIC)?;
        writer.write_u8(VERSION)?;
        writer.write_bytes(info.id().id())?;
        writer.write_i64(generation)?;
        writer.write_u32(info.max_doc())?;
        writer.write_varint(fields.len() as u64)?;
        for (field, dv_type) in fields {
            writer.write_string(field)?;
            writer.write_u8(*dv_type as u8)?;
        }
        writer.close()
    }

    fn read_field_infos_file(
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
        name: &str,
    ) -> Result<BTreeMap<String, DocValuesType>> {
        let mut reader = StructReader::new(storage.open_input(name)?)?;
        Self::check_header(&mut reader, FIELD_INFOS_MAGIC, info, info.field_infos_gen(), name)?;
        let count = reader.read_varint()?;
        let mut fields = BTreeMap::new();
        for _ in 0..count {
            let field = reader.read_string()?;
            let dv_type = DocValuesType::from_u8(reader.read_u8()?)?;
            fields.insert(field, dv_type);
        }
        reader.verify_checksum()?;
        Ok(fields)
    }
}

/// Remove a partially written file so a retry can reuse its name.
fn discard_partial(storage: &dyn Storage, name: &str, err: PalisadeError) -> PalisadeError {
    log::warn!("write of {name} failed, discarding partial file: {err}");
    if let Err(delete_err) = storage.delete_file(name) {
        log::warn!("could not delete partial file {name}: {delete_err}");
    }
    err
}

impl SegmentFormat for StructuredFormat {
    fn read_live_docs(&self, storage: &dyn Storage, info: &SegmentCommitInfo) -> Result<BitVec> {
        let name = info.live_docs_file_name().ok_or_else(|| {
            PalisadeError::illegal_state(format!("segment {} has no live docs file", info.id()))
        })?;

        let mut reader = StructReader::new(storage.open_input(&name)?)?;
        Self::check_header(&mut reader, LIVE_DOCS_MAGIC, info, info.del_gen(), &name)?;
        let del_count = reader.read_u32()?;
        let bytes = reader.read_bytes()?;
        reader.verify_checksum()?;

        let max_doc = info.max_doc() as usize;
        if bytes.len() != max_doc.div_ceil(8) {
            return Err(PalisadeError::illegal_state(format!(
                "{name}: bitmap of {} bytes cannot hold {max_doc} docs",
                bytes.len()
            )));
        }
        let mut bits = BitVec::from_bytes(&bytes);
        bits.truncate(max_doc);

        let deleted = bits.iter().filter(|live| !live).count() as u32;
        if deleted != del_count || deleted != info.del_count() {
            return Err(PalisadeError::index(format!(
                "{name}: bitmap has {deleted} deletions, header says {del_count}, descriptor says {}",
                info.del_count()
            )));
        }
        Ok(bits)
    }

    fn write_live_docs(
        &self,
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
        live_docs: &BitVec,
        new_del_count: u32,
    ) -> Result<String> {
        if live_docs.len() != info.max_doc() as usize {
            return Err(PalisadeError::illegal_state(format!(
                "live docs length {} disagrees with max_doc {} of segment {}",
                live_docs.len(),
                info.max_doc(),
                info.id()
            )));
        }
        let deleted = live_docs.iter().filter(|live| !live).count() as u32;
        if deleted != new_del_count {
            return Err(PalisadeError::illegal_state(format!(
                "segment {}: bitmap has {deleted} deletions but {new_del_count} were expected",
                info.id()
            )));
        }

        let generation = info.next_write_del_gen();
        let name = live_docs_file_name(info.id(), generation);
        Self::encode_live_docs(storage, &name, info, generation, live_docs, new_del_count)
            .map_err(|err| discard_partial(storage, &name, err))?;
        Ok(name)
    }

    fn read_field_updates(
        &self,
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
        field: &str,
    ) -> Result<Option<DocValuesFieldUpdates>> {
        // The newest file of a field holds its cumulative updates.
        let Some(name) = info
            .doc_values_updates_files()
            .get(field)
            .and_then(|files| files.iter().max_by_key(|name| file_gen(info, name).unwrap_or(-1)))
        else {
            return Ok(None);
        };

        let generation = file_gen(info, name)?;
        let mut reader = StructReader::new(storage.open_input(name)?)?;
        Self::check_header(&mut reader, FIELD_UPDATES_MAGIC, info, generation, name)?;

        let stored_field = reader.read_string()?;
        if stored_field != field {
            return Err(PalisadeError::index(format!(
                "{name}: holds field {stored_field}, expected {field}"
            )));
        }
        let dv_type = DocValuesType::from_u8(reader.read_u8()?)?;
        let count = reader.read_varint()?;

        let mut updates = DocValuesFieldUpdates::new(field, dv_type, generation, info.max_doc());
        let mut doc = 0u32;
        for _ in 0..count {
            doc += reader.read_varint()? as u32;
            let value = match reader.read_u8()? {
                VALUE_NONE => None,
                VALUE_NUMERIC => Some(UpdateValue::Numeric(reader.read_i64()?)),
                VALUE_BINARY => Some(UpdateValue::Binary(reader.read_bytes()?)),
                other => {
                    return Err(PalisadeError::index(format!(
                        "{name}: unknown value tag {other}"
                    )));
                }
            };
            updates.add(doc, value)?;
        }
        reader.verify_checksum()?;
        updates.finish();
        Ok(Some(updates))
    }

    fn write_field_updates(
        &self,
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
        updates: &DocValuesFieldUpdates,
    ) -> Result<String> {
        if updates.max_doc() != info.max_doc() {
            return Err(PalisadeError::illegal_state(format!(
                "updates for {} sized for {} docs, segment {} has {}",
                updates.field(),
                updates.max_doc(),
                info.id(),
                info.max_doc()
            )));
        }
        let generation = info.next_write_doc_values_gen();
        let name = field_updates_file_name(info.id(), generation, updates.field());
        Self::encode_field_updates(storage, &name, info, generation, updates)
            .map_err(|err| discard_partial(storage, &name, err))?;
        Ok(name)
    }

    fn read_field_infos(
        &self,
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
    ) -> Result<BTreeMap<String, DocValuesType>> {
        if info.field_infos_gen() == -1 {
            return Ok(BTreeMap::new());
        }
        let name = field_infos_file_name(info.id(), info.field_infos_gen());
        Self::read_field_infos_file(storage, info, &name)
    }

    fn write_field_infos(
        &self,
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
        fields: &BTreeMap<String, DocValuesType>,
    ) -> Result<String> {
        let generation = info.next_write_field_infos_gen();
        let name = field_infos_file_name(info.id(), generation);
        Self::encode_field_infos(storage, &name, info, generation, fields)
            .map_err(|err| discard_partial(storage, &name, err))?;
        Ok(name)
    }
}


/// Generation encoded in a field-update file name (`{segment}_{generation}_{field}.dvu`).
fn file_gen(info: &SegmentCommitInfo, name: &str) -> Result<i64> {
    name.strip_prefix(info.id().name())
        .and_then(|rest| rest.strip_prefix('_'))
        .and_then(|rest| rest.split('_').next())
        .and_then(|generation| generation.parse().ok())
        .ok_or_else(|| PalisadeError::index(format!("malformed field update file name {name}")))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::segment::memory::FaultyStorage;
    use crate::segment::{SegmentId, SegmentInfo};
    use crate::storage::memory::MemoryStorage;

    fn segment(max_doc: u32) -> SegmentCommitInfo {
        SegmentCommitInfo::new_flushed(SegmentInfo::new(SegmentId::new("_3"), max_doc))
    }

    #[test]
    fn test_live_docs_roundtrip() {
        let storage = MemoryStorage::new_default();
        let format = StructuredFormat::new();
        let mut info = segment(13);

        let mut bits = BitVec::from_elem(13, true);
        bits.set(3, false);
        bits.set(12, false);

        let name = format.write_live_docs(&storage, &info, &bits, 2).unwrap();
        assert_eq!(name, "_3_1.liv");

        info.advance_del_gen();
        info.set_del_count(2).unwrap();
        let read = format.read_live_docs(&storage, &info).unwrap();
        assert_eq!(read, bits);
    }

    #[test]
    fn test_live_docs_count_mismatch_is_rejected() {
        let storage = MemoryStorage::new_default();
        let format = StructuredFormat::new();
        let info = segment(8);

        let mut bits = BitVec::from_elem(8, true);
        bits.set(1, false);
        let err = format.write_live_docs(&storage, &info, &bits, 2).unwrap_err();
        assert!(err.is_invariant_violation());

        let short = BitVec::from_elem(7, true);
        let err = format.write_live_docs(&storage, &info, &short, 0).unwrap_err();
        assert!(err.is_invariant_violation());
        assert_eq!(storage.file_count(), 0);
    }

    #[test]
    fn test_failed_write_leaves_no_file() {
        let storage = FaultyStorage::new();
        let format = StructuredFormat::new();
        let info = segment(4);
        let bits = BitVec::from_elem(4, true);

        storage.fail_writes(true);
        let err = format.write_live_docs(&storage, &info, &bits, 0).unwrap_err();
        assert!(err.is_retryable());
        assert!(!storage.file_exists("_3_1.liv"));

        storage.fail_writes(false);
        let name = format.write_live_docs(&storage, &info, &bits, 0).unwrap();
        assert_eq!(name, "_3_1.liv");
    }

    #[test]
    fn test_field_updates_roundtrip() {
        let storage = MemoryStorage::new_default();
        let format = StructuredFormat::new();
        let mut info = segment(10);

        let mut updates = DocValuesFieldUpdates::new("price", DocValuesType::Numeric, 1, 10);
        updates.add(7, Some(UpdateValue::Numeric(-3))).unwrap();
        updates.add(2, Some(UpdateValue::Numeric(40))).unwrap();
        updates.add(5, None).unwrap();
        updates.finish();

        let name = format.write_field_updates(&storage, &info, &updates).unwrap();
        assert_eq!(name, "_3_1_price.dvu");
        info.advance_doc_values_gen();
        info.set_doc_values_updates_files("price", BTreeSet::from([name]));

        let read = format
            .read_field_updates(&storage, &info, "price")
            .unwrap()
            .unwrap();
        let entries: Vec<_> = read.iter().map(|(doc, v)| (doc, v.cloned())).collect();
        assert_eq!(
            entries,
            vec![
                (2, Some(UpdateValue::Numeric(40))),
                (5, None),
                (7, Some(UpdateValue::Numeric(-3))),
            ]
        );

        assert!(format.read_field_updates(&storage, &info, "title").unwrap().is_none());
    }

    #[test]
    fn test_field_infos_roundtrip() {
        let storage = MemoryStorage::new_default();
        let format = StructuredFormat::new();
        let mut info = segment(6);
        assert!(format.read_field_infos(&storage, &info).unwrap().is_empty());

        let fields = BTreeMap::from([
            ("price".to_string(), DocValuesType::Numeric),
            ("title".to_string(), DocValuesType::Binary),
        ]);
        let name = format.write_field_infos(&storage, &info, &fields).unwrap();
        assert_eq!(name, "_3_1.fnm");
        info.advance_field_infos_gen();
        assert_eq!(format.read_field_infos(&storage, &info).unwrap(), fields);
    }
}
