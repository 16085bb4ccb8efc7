/// MFT attribute records and the fixed-layout attribute values we decode
use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, Utc};
use std::io::Cursor;

use super::runs::{decode_runs, Run, RunListError};
use crate::fs::common::{decode_utf16le, filetime_to_datetime};
use crate::stream::{ByteStream, SharedStream, SubStream};

/// Attribute type codes found in MFT records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    StandardInformation,
    AttributeList,
    FileName,
    ObjectId,
    SecurityDescriptor,
    VolumeName,
    VolumeInformation,
    Data,
    IndexRoot,
    IndexAllocation,
    Bitmap,
    ReparsePoint,
    Other(u32),
}

impl AttributeType {
    pub fn from_code(code: u32) -> Self {
        match code {
            0x10 => AttributeType::StandardInformation,
            0x20 => AttributeType::AttributeList,
            0x30 => AttributeType::FileName,
            0x40 => AttributeType::ObjectId,
            0x50 => AttributeType::SecurityDescriptor,
            0x60 => AttributeType::VolumeName,
            0x70 => AttributeType::VolumeInformation,
            0x80 => AttributeType::Data,
            0x90 => AttributeType::IndexRoot,
            0xA0 => AttributeType::IndexAllocation,
            0xB0 => AttributeType::Bitmap,
            0xC0 => AttributeType::ReparsePoint,
            other => AttributeType::Other(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            AttributeType::StandardInformation => 0x10,
            AttributeType::AttributeList => 0x20,
            AttributeType::FileName => 0x30,
            AttributeType::ObjectId => 0x40,
            AttributeType::SecurityDescriptor => 0x50,
            AttributeType::VolumeName => 0x60,
            AttributeType::VolumeInformation => 0x70,
            AttributeType::Data => 0x80,
            AttributeType::IndexRoot => 0x90,
            AttributeType::IndexAllocation => 0xA0,
            AttributeType::Bitmap => 0xB0,
            AttributeType::ReparsePoint => 0xC0,
            AttributeType::Other(code) => code,
        }
    }
}

/// Marks the end of the attribute list in a record
pub const END_OF_ATTRIBUTES: u32 = 0xFFFF_FFFF;

pub const ATTR_FLAG_COMPRESSED: u16 = 0x0001;
pub const ATTR_FLAG_ENCRYPTED: u16 = 0x4000;
pub const ATTR_FLAG_SPARSE: u16 = 0x8000;

#[derive(Debug, Clone)]
pub struct NonResident {
    pub low_vcn: u64,
    pub high_vcn: i64,
    pub compression_unit: u16,
    pub allocated_size: u64,
    pub data_size: u64,
    pub initialized_size: u64,
    pub runs: Vec<Run>,
    /// Set when the run list failed to decode; the attribute is kept but unusable
    pub run_error: Option<RunListError>,
}

#[derive(Debug, Clone)]
pub enum AttributeBody {
    /// Value stored inside the record, as a bounded view of it
    Resident(SharedStream),
    NonResident(NonResident),
}

#[derive(Debug, Clone)]
pub struct AttributeRecord {
    pub attr_type: AttributeType,
    pub name: Option<String>,
    pub id: u16,
    pub flags: u16,
    /// Length of the attribute record inside the MFT record
    pub record_length: u32,
    pub body: AttributeBody,
}

impl AttributeRecord {
    /// Parse the attribute header at `offset` of a fixed-up MFT record
    pub fn parse(record: &SharedStream, offset: u64) -> Result<Self> {
        let header = record.get_bytes(offset, 16)?;
        let mut cursor = Cursor::new(&header[..]);
        let type_code = cursor.read_u32::<LittleEndian>()?;
        let record_length = cursor.read_u32::<LittleEndian>()?;
        let non_resident = cursor.read_u8()? != 0;
        let name_length = cursor.read_u8()? as u64;
        let name_offset = cursor.read_u16::<LittleEndian>()? as u64;
        let flags = cursor.read_u16::<LittleEndian>()?;
        let id = cursor.read_u16::<LittleEndian>()?;

        let length = record_length as u64;
        if length < 16 || offset + length > record.length() {
            anyhow::bail!("Attribute at 0x{:x} has bad length {}", offset, record_length);
        }

        let name = if name_length > 0 {
            if name_offset + name_length * 2 > length {
                anyhow::bail!("Attribute name at 0x{:x} overruns the attribute", offset);
            }
            let raw = record.get_bytes(offset + name_offset, (name_length * 2) as usize)?;
            Some(decode_utf16le(&raw))
        } else {
            None
        };

        let body = if non_resident {
            AttributeBody::NonResident(Self::parse_non_resident(record, offset, length)?)
        } else {
            let value_length = record.get_u32(offset + 0x10)? as u64;
            let value_offset = record.get_u16(offset + 0x14)? as u64;
            if value_offset + value_length > length {
                anyhow::bail!("Resident value at 0x{:x} overruns the attribute", offset);
            }
            AttributeBody::Resident(
                SubStream::new(record.clone(), offset + value_offset, value_length)?.shared(),
            )
        };

        Ok(AttributeRecord {
            attr_type: AttributeType::from_code(type_code),
            name,
            id,
            flags,
            record_length,
            body,
        })
    }

    fn parse_non_resident(record: &SharedStream, offset: u64, length: u64) -> Result<NonResident> {
        if length < 0x40 {
            anyhow::bail!("Non-resident attribute at 0x{:x} is too short", offset);
        }
        let fields = record.get_bytes(offset + 0x10, 0x30)?;
        let mut cursor = Cursor::new(&fields[..]);
        let low_vcn = cursor.read_u64::<LittleEndian>()?;
        let high_vcn = cursor.read_i64::<LittleEndian>()?;
        let runs_offset = cursor.read_u16::<LittleEndian>()? as u64;
        let compression_unit = cursor.read_u16::<LittleEndian>()?;
        cursor.set_position(0x18);
        let allocated_size = cursor.read_u64::<LittleEndian>()?;
        let data_size = cursor.read_u64::<LittleEndian>()?;
        let initialized_size = cursor.read_u64::<LittleEndian>()?;

        let (runs, run_error) = if runs_offset >= length {
            (Vec::new(), Some(RunListError::Truncated { position: 0 }))
        } else {
            let data = record.get_bytes(offset + runs_offset, (length - runs_offset) as usize)?;
            match decode_runs(&data, low_vcn, high_vcn) {
                Ok(runs) => (runs, None),
                Err(e) => {
                    tracing::warn!("Invalid run list in attribute at 0x{:x}: {}", offset, e);
                    (Vec::new(), Some(e))
                }
            }
        };

        Ok(NonResident {
            low_vcn,
            high_vcn,
            compression_unit,
            allocated_size,
            data_size,
            initialized_size,
            runs,
            run_error,
        })
    }

    pub fn is_resident(&self) -> bool {
        matches!(self.body, AttributeBody::Resident(_))
    }

    /// False when a non-resident run list could not be decoded
    pub fn is_valid(&self) -> bool {
        match &self.body {
            AttributeBody::Resident(_) => true,
            AttributeBody::NonResident(nr) => nr.run_error.is_none(),
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & ATTR_FLAG_COMPRESSED != 0
    }

    /// Logical size of the attribute's value
    pub fn data_size(&self) -> u64 {
        match &self.body {
            AttributeBody::Resident(value) => value.length(),
            AttributeBody::NonResident(nr) => nr.data_size,
        }
    }

    pub fn runs(&self) -> &[Run] {
        match &self.body {
            AttributeBody::Resident(_) => &[],
            AttributeBody::NonResident(nr) => &nr.runs,
        }
    }

    /// The resident value view, if resident
    pub fn value(&self) -> Option<&SharedStream> {
        match &self.body {
            AttributeBody::Resident(value) => Some(value),
            AttributeBody::NonResident(_) => None,
        }
    }

    /// Read a resident value into memory
    pub fn resident_bytes(&self) -> Result<Vec<u8>> {
        let value = self
            .value()
            .context("Attribute value is not resident")?;
        Ok(value.get_bytes(0, value.length() as usize)?)
    }

    pub fn has_name(&self, name: Option<&str>) -> bool {
        self.name.as_deref() == name
    }
}

/// $STANDARD_INFORMATION
#[derive(Debug, Clone, Default)]
pub struct StandardInformation {
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub mft_modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
    pub file_attributes: u32,
}

impl StandardInformation {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 0x24 {
            anyhow::bail!("Standard information too short: {} bytes", data.len());
        }
        let mut cursor = Cursor::new(data);
        let created = filetime_to_datetime(cursor.read_u64::<LittleEndian>()?);
        let modified = filetime_to_datetime(cursor.read_u64::<LittleEndian>()?);
        let mft_modified = filetime_to_datetime(cursor.read_u64::<LittleEndian>()?);
        let accessed = filetime_to_datetime(cursor.read_u64::<LittleEndian>()?);
        let file_attributes = cursor.read_u32::<LittleEndian>()?;

        Ok(StandardInformation {
            created,
            modified,
            mft_modified,
            accessed,
            file_attributes,
        })
    }
}

/// Filename namespaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileNameNamespace {
    Posix,
    Win32,
    Dos,
    Win32AndDos,
}

impl FileNameNamespace {
    fn from_byte(byte: u8) -> Self {
        match byte {
            1 => FileNameNamespace::Win32,
            2 => FileNameNamespace::Dos,
            3 => FileNameNamespace::Win32AndDos,
            _ => FileNameNamespace::Posix,
        }
    }
}

/// $FILE_NAME, either from an MFT record or as an index entry key
#[derive(Debug, Clone)]
pub struct FileNameAttr {
    pub parent_record: u64,
    pub parent_sequence: u16,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub allocated_size: u64,
    pub data_size: u64,
    pub flags: u32,
    pub namespace: FileNameNamespace,
    pub name: String,
}

impl FileNameAttr {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 0x42 {
            anyhow::bail!("File name attribute too short: {} bytes", data.len());
        }
        let mut cursor = Cursor::new(data);
        let parent_reference = cursor.read_u64::<LittleEndian>()?;
        let created = filetime_to_datetime(cursor.read_u64::<LittleEndian>()?);
        let modified = filetime_to_datetime(cursor.read_u64::<LittleEndian>()?);
        cursor.set_position(0x28);
        let allocated_size = cursor.read_u64::<LittleEndian>()?;
        let data_size = cursor.read_u64::<LittleEndian>()?;
        let flags = cursor.read_u32::<LittleEndian>()?;
        cursor.set_position(0x40);
        let name_length = cursor.read_u8()? as usize;
        let namespace = FileNameNamespace::from_byte(cursor.read_u8()?);

        let name_end = 0x42 + name_length * 2;
        if name_end > data.len() {
            anyhow::bail!("File name overruns its attribute");
        }

        Ok(FileNameAttr {
            parent_record: parent_reference & 0x0000_FFFF_FFFF_FFFF,
            parent_sequence: (parent_reference >> 48) as u16,
            created,
            modified,
            allocated_size,
            data_size,
            flags,
            namespace,
            name: decode_utf16le(&data[0x42..name_end]),
        })
    }

    pub fn is_dos_only(&self) -> bool {
        self.namespace == FileNameNamespace::Dos
    }
}

/// One entry of an $ATTRIBUTE_LIST
#[derive(Debug, Clone)]
pub struct AttributeListEntry {
    pub attr_type: AttributeType,
    pub name: Option<String>,
    pub starting_vcn: u64,
    pub segment_record: u64,
    pub attribute_id: u16,
}

/// Decode every entry of an attribute list value
pub fn parse_attribute_list(data: &[u8]) -> Vec<AttributeListEntry> {
    let mut entries = Vec::new();
    let mut pos = 0usize;

    while pos + 0x1A <= data.len() {
        let mut cursor = Cursor::new(&data[pos..]);
        let Ok(type_code) = cursor.read_u32::<LittleEndian>() else {
            break;
        };
        let length = cursor.read_u16::<LittleEndian>().unwrap_or(0) as usize;
        let name_length = cursor.read_u8().unwrap_or(0) as usize;
        let name_offset = cursor.read_u8().unwrap_or(0) as usize;
        let starting_vcn = cursor.read_u64::<LittleEndian>().unwrap_or(0);
        let reference = cursor.read_u64::<LittleEndian>().unwrap_or(0);
        let attribute_id = cursor.read_u16::<LittleEndian>().unwrap_or(0);

        if type_code == END_OF_ATTRIBUTES || length < 0x1A || pos + length > data.len() {
            break;
        }

        let name = if name_length > 0 && name_offset + name_length * 2 <= length {
            let start = pos + name_offset;
            Some(decode_utf16le(&data[start..start + name_length * 2]))
        } else {
            None
        };

        entries.push(AttributeListEntry {
            attr_type: AttributeType::from_code(type_code),
            name,
            starting_vcn,
            segment_record: reference & 0x0000_FFFF_FFFF_FFFF,
            attribute_id,
        });
        pos += (length + 7) & !7;
    }

    entries
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::stream::ArrayBackedStream;

    pub(crate) fn utf16(name: &str) -> Vec<u8> {
        name.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect()
    }

    pub(crate) fn file_name_value(parent: u64, name: &str, namespace: u8, size: u64) -> Vec<u8> {
        let mut value = vec![0u8; 0x42];
        value[0..8].copy_from_slice(&(parent | (1u64 << 48)).to_le_bytes());
        value[0x30..0x38].copy_from_slice(&size.to_le_bytes());
        value[0x40] = name.encode_utf16().count() as u8;
        value[0x41] = namespace;
        value.extend_from_slice(&utf16(name));
        value
    }

    #[test]
    fn test_parse_resident_attribute() {
        let mut record = vec![0u8; 128];
        let value = b"hello";
        record[0..4].copy_from_slice(&0x80u32.to_le_bytes());
        record[4..8].copy_from_slice(&40u32.to_le_bytes());
        record[0x0E..0x10].copy_from_slice(&3u16.to_le_bytes());
        record[0x10..0x14].copy_from_slice(&(value.len() as u32).to_le_bytes());
        record[0x14..0x16].copy_from_slice(&0x18u16.to_le_bytes());
        record[0x18..0x1D].copy_from_slice(value);

        let stream = ArrayBackedStream::with_origin(record, 4096).shared();
        let attr = AttributeRecord::parse(&stream, 0).unwrap();
        assert_eq!(attr.attr_type, AttributeType::Data);
        assert_eq!(attr.id, 3);
        assert!(attr.is_resident());
        assert_eq!(attr.data_size(), 5);
        assert_eq!(attr.resident_bytes().unwrap(), b"hello");
        assert_eq!(attr.value().unwrap().device_offset(), 4096 + 0x18);
    }

    #[test]
    fn test_bad_run_list_keeps_attribute() {
        let mut record = vec![0u8; 128];
        record[0..4].copy_from_slice(&0x80u32.to_le_bytes());
        record[4..8].copy_from_slice(&0x48u32.to_le_bytes());
        record[8] = 1;
        // low 0, high 0, runs at 0x40
        record[0x20..0x22].copy_from_slice(&0x40u16.to_le_bytes());
        record[0x30..0x38].copy_from_slice(&512u64.to_le_bytes());
        // delta -1 from zero
        record[0x40..0x44].copy_from_slice(&[0x11, 0x01, 0xFF, 0x00]);

        let stream = ArrayBackedStream::new(record).shared();
        let attr = AttributeRecord::parse(&stream, 0).unwrap();
        assert!(!attr.is_valid());
        assert!(attr.runs().is_empty());
        assert_eq!(attr.data_size(), 512);
    }

    #[test]
    fn test_file_name_value() {
        let value = file_name_value(5, "secret.txt", 1, 1234);
        let parsed = FileNameAttr::parse(&value).unwrap();
        assert_eq!(parsed.parent_record, 5);
        assert_eq!(parsed.parent_sequence, 1);
        assert_eq!(parsed.name, "secret.txt");
        assert_eq!(parsed.data_size, 1234);
        assert_eq!(parsed.namespace, FileNameNamespace::Win32);
    }

    #[test]
    fn test_attribute_list_entries() {
        let mut data = vec![0u8; 0x40];
        data[0..4].copy_from_slice(&0x80u32.to_le_bytes());
        data[4..6].copy_from_slice(&0x20u16.to_le_bytes());
        data[0x08..0x10].copy_from_slice(&7u64.to_le_bytes());
        data[0x10..0x18].copy_from_slice(&(42u64 | (3u64 << 48)).to_le_bytes());
        data[0x18..0x1A].copy_from_slice(&2u16.to_le_bytes());
        data[0x20..0x24].copy_from_slice(&END_OF_ATTRIBUTES.to_le_bytes());

        let entries = parse_attribute_list(&data);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attr_type, AttributeType::Data);
        assert_eq!(entries[0].starting_vcn, 7);
        assert_eq!(entries[0].segment_record, 42);
        assert_eq!(entries[0].attribute_id, 2);
    }
}
