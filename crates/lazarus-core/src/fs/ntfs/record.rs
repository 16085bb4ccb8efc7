/// MFT file records
use anyhow::Result;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use super::attribute::{
    AttributeBody, AttributeListEntry, AttributeRecord, AttributeType, FileNameAttr,
    StandardInformation, END_OF_ATTRIBUTES,
};
use super::runs::merge_runs;
use crate::stream::{ByteStream, SharedStream};

pub const MFT_RECORD_MAGIC: &[u8; 4] = b"FILE";

pub const RECORD_FLAG_IN_USE: u16 = 0x0001;
pub const RECORD_FLAG_DIRECTORY: u16 = 0x0002;

/// Well-known record numbers
pub const RECORD_MFT: u64 = 0;
pub const RECORD_ROOT: u64 = 5;
pub const RECORD_BITMAP: u64 = 6;
/// Records below this are filesystem metadata
pub const FIRST_USER_RECORD: u64 = 16;

/// Whether the stream starts with the `FILE` signature
pub fn has_record_magic(stream: &dyn ByteStream) -> bool {
    matches!(stream.get_bytes(0, 4), Ok(magic) if magic == MFT_RECORD_MAGIC)
}

#[derive(Debug, Clone)]
pub struct MftRecord {
    pub record_number: u64,
    pub sequence_number: u16,
    pub link_count: u16,
    pub flags: u16,
    pub bytes_in_use: u32,
    /// Base record for extension records, 0 otherwise
    pub base_record: u64,
    pub attributes: Vec<AttributeRecord>,
    pub standard_info: Option<StandardInformation>,
    /// Preferred name: the first seen, replaced only while it looks like a short name
    pub file_name: Option<FileNameAttr>,
    /// The fixup check failed on at least one stride
    pub torn: bool,
}

impl MftRecord {
    /// Parse a fixed-up record. `record_number` is used when the header
    /// predates the on-disk record number field.
    pub fn parse(stream: SharedStream, record_number: u64, torn: bool) -> Result<Self> {
        let length = stream.length();
        let header = stream.get_bytes(0, 0x30)?;
        if &header[0..4] != MFT_RECORD_MAGIC {
            anyhow::bail!("Record {} has no FILE signature", record_number);
        }

        let mut cursor = Cursor::new(&header[..]);
        cursor.set_position(0x10);
        let sequence_number = cursor.read_u16::<LittleEndian>()?;
        let link_count = cursor.read_u16::<LittleEndian>()?;
        let attrs_offset = cursor.read_u16::<LittleEndian>()? as u64;
        let flags = cursor.read_u16::<LittleEndian>()?;
        let bytes_in_use = cursor.read_u32::<LittleEndian>()?;
        let _bytes_allocated = cursor.read_u32::<LittleEndian>()?;
        let base_reference = cursor.read_u64::<LittleEndian>()?;
        cursor.set_position(0x2C);
        let stored_number = cursor.read_u32::<LittleEndian>()? as u64;

        let mut record = MftRecord {
            record_number: if attrs_offset >= 0x30 && stored_number != 0 {
                stored_number
            } else {
                record_number
            },
            sequence_number,
            link_count,
            flags,
            bytes_in_use,
            base_record: base_reference & 0x0000_FFFF_FFFF_FFFF,
            attributes: Vec::new(),
            standard_info: None,
            file_name: None,
            torn,
        };

        let limit = if bytes_in_use as u64 > 0 && (bytes_in_use as u64) <= length {
            bytes_in_use as u64
        } else {
            length
        };

        let mut pos = align8(attrs_offset);
        while pos + 8 <= limit {
            let type_code = stream.get_u32(pos)?;
            if type_code == END_OF_ATTRIBUTES {
                break;
            }
            let attr_length = stream.get_u32(pos + 4)? as u64;
            if attr_length < 16 || pos + attr_length > length {
                tracing::debug!(
                    "Record {}: attribute 0x{:x} at 0x{:x} has bad length {}, stopping",
                    record.record_number,
                    type_code,
                    pos,
                    attr_length
                );
                break;
            }

            match AttributeRecord::parse(&stream, pos) {
                Ok(attr) => record.add_attribute(attr),
                Err(e) => tracing::debug!(
                    "Record {}: skipping attribute at 0x{:x}: {}",
                    record.record_number,
                    pos,
                    e
                ),
            }
            pos = align8(pos + attr_length);
        }

        Ok(record)
    }

    fn add_attribute(&mut self, attr: AttributeRecord) {
        match attr.attr_type {
            AttributeType::StandardInformation => {
                if let Ok(data) = attr.resident_bytes() {
                    match StandardInformation::parse(&data) {
                        Ok(info) => self.standard_info = Some(info),
                        Err(e) => tracing::debug!("Record {}: {}", self.record_number, e),
                    }
                }
            }
            AttributeType::FileName => {
                if let Ok(data) = attr.resident_bytes() {
                    match FileNameAttr::parse(&data) {
                        Ok(name) => self.observe_name(name),
                        Err(e) => tracing::debug!("Record {}: {}", self.record_number, e),
                    }
                }
            }
            _ => {}
        }
        self.attributes.push(attr);
    }

    fn observe_name(&mut self, name: FileNameAttr) {
        let replace = match &self.file_name {
            None => true,
            Some(current) => current.name.contains('~'),
        };
        if replace {
            self.file_name = Some(name);
        }
    }

    pub fn is_in_use(&self) -> bool {
        self.flags & RECORD_FLAG_IN_USE != 0
    }

    pub fn is_directory(&self) -> bool {
        self.flags & RECORD_FLAG_DIRECTORY != 0
    }

    /// Extension records only carry overflow attributes of a base record
    pub fn is_extension(&self) -> bool {
        self.base_record != 0
    }

    pub fn name(&self) -> Option<&str> {
        self.file_name.as_ref().map(|name| name.name.as_str())
    }

    pub fn parent_record(&self) -> Option<u64> {
        self.file_name.as_ref().map(|name| name.parent_record)
    }

    pub fn attributes_of(&self, attr_type: AttributeType) -> impl Iterator<Item = &AttributeRecord> {
        self.attributes
            .iter()
            .filter(move |attr| attr.attr_type == attr_type)
    }

    /// First attribute of a type with the given stream name
    pub fn attribute(&self, attr_type: AttributeType, name: Option<&str>) -> Option<&AttributeRecord> {
        self.attributes_of(attr_type).find(|attr| attr.has_name(name))
    }

    /// Names of the `$DATA` streams, primary (`None`) first
    pub fn data_stream_names(&self) -> Vec<Option<String>> {
        let mut names: Vec<Option<String>> = Vec::new();
        for attr in self.attributes_of(AttributeType::Data) {
            if !names.contains(&attr.name) {
                names.push(attr.name.clone());
            }
        }
        names.sort_by_key(|name| name.is_some());
        names
    }

    pub fn primary_data(&self) -> Option<&AttributeRecord> {
        self.attribute(AttributeType::Data, None)
    }

    /// Pull the attributes named by `entries` out of an extension record.
    /// Non-resident extents of an attribute already present are merged into
    /// it; anything else is appended.
    pub fn absorb_extension(&mut self, extension: &MftRecord, entries: &[&AttributeListEntry]) {
        for entry in entries {
            let Some(attr) = extension.attributes.iter().find(|attr| {
                attr.attr_type == entry.attr_type && attr.id == entry.attribute_id
            }) else {
                tracing::debug!(
                    "Record {}: attribute id {} not found in extension {}",
                    self.record_number,
                    entry.attribute_id,
                    extension.record_number
                );
                continue;
            };

            let existing = self.attributes.iter_mut().find(|own| {
                own.attr_type == attr.attr_type && own.name == attr.name && !own.is_resident()
            });

            match (existing, &attr.body) {
                (Some(own), AttributeBody::NonResident(extent)) => {
                    if let AttributeBody::NonResident(base) = &mut own.body {
                        merge_extent(base, extent);
                    }
                }
                _ => self.add_attribute(attr.clone()),
            }
        }
    }
}

fn merge_extent(base: &mut super::attribute::NonResident, extent: &super::attribute::NonResident) {
    if base.run_error.is_none() {
        base.run_error = extent.run_error.clone();
    }
    merge_runs(&mut base.runs, &extent.runs);
    if extent.low_vcn == 0 {
        base.allocated_size = extent.allocated_size;
        base.data_size = extent.data_size;
        base.initialized_size = extent.initialized_size;
    }
    base.low_vcn = base.low_vcn.min(extent.low_vcn);
    base.high_vcn = base.high_vcn.max(extent.high_vcn);
}

fn align8(value: u64) -> u64 {
    (value + 7) & !7
}
