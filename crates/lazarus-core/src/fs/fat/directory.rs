//! FAT directory entry parsing
//!
//! Directories are arrays of 32-byte entries:
//! - first byte 0x00: end of directory
//! - first byte 0xE5: deleted entry (the first name character is lost)
//! - attribute 0x0F: long-name fragment, 13 UTF-16 units each, stored in
//!   reverse order before the 8.3 entry they belong to

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};

use crate::fs::common::{decode_utf16le, fat_datetime};

/// Directory entry size in bytes
pub const ENTRY_SIZE: usize = 32;

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_LONG_NAME: u8 = 0x0F;

pub const END_MARKER: u8 = 0x00;
pub const DELETED_MARKER: u8 = 0xE5;
/// Stands in for a real leading 0xE5 byte
pub const KANJI_MARKER: u8 = 0x05;

const LFN_LAST: u8 = 0x40;
const LFN_UNITS: usize = 13;

/// 8.3 entry as stored on disk
#[derive(Debug, Clone)]
pub struct ShortEntry {
    pub raw_name: [u8; 11],
    pub attributes: u8,
    pub case_flags: u8,
    pub create_time: u16,
    pub create_date: u16,
    pub write_time: u16,
    pub write_date: u16,
    pub first_cluster: u32,
    pub size: u32,
    pub deleted: bool,
}

impl ShortEntry {
    pub fn is_directory(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }

    /// "." or ".." entries
    pub fn is_dot(&self) -> bool {
        self.raw_name == *b".          " || self.raw_name == *b"..         "
    }

    /// Displayable 8.3 name; deleted entries show `_` for the lost character
    pub fn display_name(&self) -> String {
        let mut base = self.raw_name[..8].to_vec();
        if self.deleted {
            base[0] = b'_';
        } else if base[0] == KANJI_MARKER {
            base[0] = DELETED_MARKER;
        }

        let to_text = |bytes: &[u8], lower: bool| -> String {
            let text: String = bytes.iter().map(|b| *b as char).collect();
            let text = text.trim_end().to_string();
            if lower {
                text.to_lowercase()
            } else {
                text
            }
        };
        let base = to_text(&base, self.case_flags & 0x08 != 0);
        let ext = to_text(&self.raw_name[8..], self.case_flags & 0x10 != 0);

        if ext.is_empty() {
            base
        } else {
            format!("{}.{}", base, ext)
        }
    }
}

/// One long-name entry
#[derive(Debug, Clone)]
pub struct LongNameFragment {
    pub ordinal: u8,
    pub checksum: u8,
    pub units: [u16; LFN_UNITS],
    pub deleted: bool,
}

impl LongNameFragment {
    pub fn is_last(&self) -> bool {
        !self.deleted && self.ordinal & LFN_LAST != 0
    }

    pub fn sequence(&self) -> u8 {
        self.ordinal & 0x1F
    }
}

#[derive(Debug, Clone)]
pub enum RawEntry {
    End,
    LongName(LongNameFragment),
    Short(ShortEntry),
    VolumeLabel,
    /// Structurally impossible entry; the directory is not trusted past it
    Invalid(&'static str),
}

/// 8.3 checksum that long-name fragments carry
pub fn short_name_checksum(raw_name: &[u8; 11]) -> u8 {
    raw_name
        .iter()
        .fold(0u8, |sum, byte| sum.rotate_right(1).wrapping_add(*byte))
}

fn valid_date(date: u16) -> bool {
    if date == 0 {
        return true;
    }
    let month = (date >> 5) & 0x0F;
    let day = date & 0x1F;
    (1..=12).contains(&month) && (1..=31).contains(&day)
}

fn valid_time(time: u16) -> bool {
    let hour = time >> 11;
    let minute = (time >> 5) & 0x3F;
    let seconds = time & 0x1F;
    hour < 24 && minute < 60 && seconds < 30
}

/// Classify one 32-byte entry
pub fn parse_entry(data: &[u8], fat32: bool) -> RawEntry {
    let first = data[0];
    if first == END_MARKER {
        return RawEntry::End;
    }
    let deleted = first == DELETED_MARKER;
    let attributes = data[0x0B];

    if attributes & 0x3F == ATTR_LONG_NAME {
        let cluster = LittleEndian::read_u16(&data[0x1A..0x1C]);
        if data[0x0C] != 0 || cluster != 0 {
            return RawEntry::Invalid("long-name entry with a type or cluster");
        }
        let ordinal = first;
        if !deleted && (ordinal & 0x1F == 0 || ordinal & 0x1F > 20 || ordinal & 0xA0 != 0) {
            return RawEntry::Invalid("long-name entry with a bad ordinal");
        }

        let mut units = [0u16; LFN_UNITS];
        let ranges = [(0x01, 5), (0x0E, 6), (0x1C, 2)];
        let mut index = 0;
        for (start, count) in ranges {
            for i in 0..count {
                let pos = start + i * 2;
                units[index] = LittleEndian::read_u16(&data[pos..pos + 2]);
                index += 1;
            }
        }

        return RawEntry::LongName(LongNameFragment {
            ordinal,
            checksum: data[0x0D],
            units,
            deleted,
        });
    }

    if attributes & 0xC0 != 0 {
        return RawEntry::Invalid("reserved attribute bits set");
    }
    if attributes & (ATTR_VOLUME_ID | ATTR_DIRECTORY) == ATTR_VOLUME_ID | ATTR_DIRECTORY {
        return RawEntry::Invalid("volume label marked as directory");
    }

    let name_start = if deleted { 1 } else { 0 };
    if data[name_start..11]
        .iter()
        .enumerate()
        .any(|(i, b)| *b < 0x20 && !(i + name_start == 0 && *b == KANJI_MARKER))
    {
        return RawEntry::Invalid("control character in name");
    }

    if attributes & ATTR_VOLUME_ID != 0 {
        return RawEntry::VolumeLabel;
    }

    let create_tenths = data[0x0D];
    let create_time = LittleEndian::read_u16(&data[0x0E..0x10]);
    let create_date = LittleEndian::read_u16(&data[0x10..0x12]);
    let access_date = LittleEndian::read_u16(&data[0x12..0x14]);
    let write_time = LittleEndian::read_u16(&data[0x16..0x18]);
    let write_date = LittleEndian::read_u16(&data[0x18..0x1A]);

    if create_tenths > 199
        || !valid_time(create_time)
        || !valid_time(write_time)
        || !valid_date(create_date)
        || !valid_date(access_date)
        || !valid_date(write_date)
    {
        return RawEntry::Invalid("impossible timestamp");
    }

    let high = if fat32 {
        LittleEndian::read_u16(&data[0x14..0x16]) as u32
    } else {
        0
    };
    let low = LittleEndian::read_u16(&data[0x1A..0x1C]) as u32;

    let mut raw_name = [0u8; 11];
    raw_name.copy_from_slice(&data[..11]);

    RawEntry::Short(ShortEntry {
        raw_name,
        attributes,
        case_flags: data[0x0C],
        create_time,
        create_date,
        write_time,
        write_date,
        first_cluster: (high << 16) | low,
        size: LittleEndian::read_u32(&data[0x1C..0x20]),
        deleted,
    })
}

/// A decoded file or folder entry
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub short_name: String,
    pub attributes: u8,
    pub first_cluster: u32,
    pub size: u32,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub deleted: bool,
    /// Offset of the 8.3 entry within the directory
    pub offset: usize,
}

impl DirEntry {
    pub fn is_directory(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct DirectoryListing {
    pub entries: Vec<DirEntry>,
    /// Offset of the invalid entry that stopped enumeration
    pub halted_at: Option<usize>,
}

/// Join fragments collected before `short`, if they belong to it
fn assemble_long_name(fragments: &[LongNameFragment], short: &ShortEntry) -> Option<String> {
    let first = fragments.first()?;

    if short.deleted {
        // The lost first byte makes the checksum unverifiable; fragments must agree
        if !fragments
            .iter()
            .all(|f| f.deleted && f.checksum == first.checksum)
        {
            return None;
        }
    } else {
        let checksum = short_name_checksum(&short.raw_name);
        let count = fragments.len();
        let ordered = first.is_last()
            && first.sequence() as usize == count
            && fragments
                .iter()
                .enumerate()
                .all(|(i, f)| !f.deleted && f.sequence() as usize == count - i);
        if !ordered || fragments.iter().any(|f| f.checksum != checksum) {
            return None;
        }
    }

    let units: Vec<u16> = fragments
        .iter()
        .rev()
        .flat_map(|f| f.units.iter().copied())
        .take_while(|unit| *unit != 0x0000)
        .filter(|unit| *unit != 0xFFFF)
        .collect();
    if units.is_empty() {
        return None;
    }
    let bytes: Vec<u8> = units.iter().flat_map(|unit| unit.to_le_bytes()).collect();
    Some(decode_utf16le(&bytes))
}

/// Parse a whole directory region
pub fn parse_directory(data: &[u8], fat32: bool) -> DirectoryListing {
    let mut listing = DirectoryListing::default();
    let mut pending: Vec<LongNameFragment> = Vec::new();

    for (index, raw) in data.chunks_exact(ENTRY_SIZE).enumerate() {
        let offset = index * ENTRY_SIZE;
        match parse_entry(raw, fat32) {
            RawEntry::End => break,
            RawEntry::Invalid(reason) => {
                tracing::debug!("Directory entry at 0x{:x} invalid ({}), stopping", offset, reason);
                listing.halted_at = Some(offset);
                break;
            }
            RawEntry::VolumeLabel => pending.clear(),
            RawEntry::LongName(fragment) => {
                if fragment.is_last() {
                    pending.clear();
                }
                pending.push(fragment);
            }
            RawEntry::Short(short) => {
                let long_name = assemble_long_name(&pending, &short);
                pending.clear();
                if short.is_dot() {
                    continue;
                }

                let short_name = short.display_name();
                listing.entries.push(DirEntry {
                    name: long_name.unwrap_or_else(|| short_name.clone()),
                    short_name,
                    attributes: short.attributes,
                    first_cluster: short.first_cluster,
                    size: short.size,
                    created: fat_datetime(short.create_date, short.create_time),
                    modified: fat_datetime(short.write_date, short.write_time),
                    deleted: short.deleted,
                    offset,
                });
            }
        }
    }

    listing
}

/// Whether a cluster starts with the "." and ".." entries of a subdirectory
pub fn is_directory_start(cluster: &[u8]) -> bool {
    if cluster.len() < 2 * ENTRY_SIZE {
        return false;
    }
    let dot = &cluster[..11] == b".          " && cluster[0x0B] & ATTR_DIRECTORY != 0;
    let dotdot = &cluster[32..43] == b"..         " && cluster[32 + 0x0B] & ATTR_DIRECTORY != 0;
    dot && dotdot
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn short_entry(name: &[u8; 11], attributes: u8, cluster: u32, size: u32) -> [u8; 32] {
        let mut entry = [0u8; 32];
        entry[..11].copy_from_slice(name);
        entry[0x0B] = attributes;
        // 2021-03-14 12:00:00
        let date: u16 = ((2021 - 1980) << 9) | (3 << 5) | 14;
        let time: u16 = 12 << 11;
        entry[0x0E..0x10].copy_from_slice(&time.to_le_bytes());
        entry[0x10..0x12].copy_from_slice(&date.to_le_bytes());
        entry[0x12..0x14].copy_from_slice(&date.to_le_bytes());
        entry[0x14..0x16].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
        entry[0x16..0x18].copy_from_slice(&time.to_le_bytes());
        entry[0x18..0x1A].copy_from_slice(&date.to_le_bytes());
        entry[0x1A..0x1C].copy_from_slice(&(cluster as u16).to_le_bytes());
        entry[0x1C..0x20].copy_from_slice(&size.to_le_bytes());
        entry
    }

    /// Long-name entries for `name`, in on-disk order, ending before the 8.3 entry
    pub(crate) fn long_name_entries(name: &str, short: &[u8; 11]) -> Vec<[u8; 32]> {
        let mut units: Vec<u16> = name.encode_utf16().collect();
        if units.len() % LFN_UNITS != 0 {
            units.push(0);
        }
        while units.len() % LFN_UNITS != 0 {
            units.push(0xFFFF);
        }
        let checksum = short_name_checksum(short);
        let count = units.len() / LFN_UNITS;

        let mut entries = Vec::new();
        for seq in (1..=count).rev() {
            let chunk = &units[(seq - 1) * LFN_UNITS..seq * LFN_UNITS];
            let mut entry = [0u8; 32];
            entry[0] = seq as u8 | if seq == count { LFN_LAST } else { 0 };
            entry[0x0B] = ATTR_LONG_NAME;
            entry[0x0D] = checksum;
            let positions = (0..5)
                .map(|i| 0x01 + i * 2)
                .chain((0..6).map(|i| 0x0E + i * 2))
                .chain((0..2).map(|i| 0x1C + i * 2));
            for (unit, pos) in chunk.iter().zip(positions) {
                entry[pos..pos + 2].copy_from_slice(&unit.to_le_bytes());
            }
            entries.push(entry);
        }
        entries
    }

    fn directory(entries: &[[u8; 32]]) -> Vec<u8> {
        let mut data: Vec<u8> = entries.iter().flat_map(|e| e.iter().copied()).collect();
        data.resize(data.len() + 64, 0);
        data
    }

    #[test]
    fn test_long_name_overrides_short_name() {
        let short = *b"QUARTE~1XLS";
        let mut entries = long_name_entries("Quarterly report.xlsx", &short);
        entries.push(short_entry(&short, ATTR_ARCHIVE, 5, 1000));

        let listing = parse_directory(&directory(&entries), false);
        assert_eq!(listing.entries.len(), 1);
        assert_eq!(listing.entries[0].name, "Quarterly report.xlsx");
        assert_eq!(listing.entries[0].short_name, "QUARTE~1.XLS");
        assert_eq!(listing.entries[0].offset, 2 * ENTRY_SIZE);
        assert!(listing.entries[0].modified.is_some());
    }

    #[test]
    fn test_checksum_mismatch_keeps_short_name() {
        let mut entries = long_name_entries("Other name.txt", b"OTHERN~1TXT");
        entries.push(short_entry(b"README  TXT", ATTR_ARCHIVE, 5, 10));
        let listing = parse_directory(&directory(&entries), false);
        assert_eq!(listing.entries[0].name, "README.TXT");
    }

    #[test]
    fn test_deleted_entries() {
        let short = *b"SECRET  TXT";
        let mut entries = long_name_entries("secret-plans.txt", &short);
        for entry in entries.iter_mut() {
            entry[0] = DELETED_MARKER;
        }
        let mut deleted = short_entry(&short, ATTR_ARCHIVE, 9, 2048);
        deleted[0] = DELETED_MARKER;
        entries.push(deleted);
        let mut plain = short_entry(b"NOTES   TXT", ATTR_ARCHIVE, 12, 5);
        plain[0] = DELETED_MARKER;
        entries.push(plain);

        let listing = parse_directory(&directory(&entries), false);
        assert_eq!(listing.entries.len(), 2);
        assert_eq!(listing.entries[0].name, "secret-plans.txt");
        assert!(listing.entries[0].deleted);
        assert_eq!(listing.entries[1].name, "_OTES.TXT");
    }

    #[test]
    fn test_invalid_entry_halts_enumeration() {
        let mut bad = short_entry(b"BAD     BIN", ATTR_ARCHIVE, 7, 1);
        bad[0x0B] = 0x80;
        let entries = [
            short_entry(b"GOOD    BIN", ATTR_ARCHIVE, 6, 1),
            bad,
            short_entry(b"AFTER   BIN", ATTR_ARCHIVE, 8, 1),
        ];
        let listing = parse_directory(&directory(&entries), false);
        assert_eq!(listing.entries.len(), 1);
        assert_eq!(listing.halted_at, Some(ENTRY_SIZE));

        let mut bad_date = short_entry(b"BADDATE BIN", ATTR_ARCHIVE, 7, 1);
        bad_date[0x18..0x1A].copy_from_slice(&((41u16 << 9) | (13 << 5) | 1).to_le_bytes());
        assert!(matches!(parse_entry(&bad_date, false), RawEntry::Invalid(_)));
    }

    #[test]
    fn test_dot_entries_mark_a_directory_cluster() {
        let entries = [
            short_entry(b".          ", ATTR_DIRECTORY, 5, 0),
            short_entry(b"..         ", ATTR_DIRECTORY, 0, 0),
            short_entry(b"FILE    TXT", ATTR_ARCHIVE, 6, 3),
        ];
        let data = directory(&entries);
        assert!(is_directory_start(&data));
        let listing = parse_directory(&data, false);
        assert_eq!(listing.entries.len(), 1);
        assert!(!is_directory_start(&data[32..]));
    }

    #[test]
    fn test_fat32_high_cluster_word() {
        let entry = short_entry(b"BIG     DAT", ATTR_ARCHIVE, 0x0003_0010, 1);
        match parse_entry(&entry, true) {
            RawEntry::Short(short) => assert_eq!(short.first_cluster, 0x0003_0010),
            other => panic!("unexpected {:?}", other),
        }
        match parse_entry(&entry, false) {
            RawEntry::Short(short) => assert_eq!(short.first_cluster, 0x0010),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_checksum_known_value() {
        // Sum of rotations over "FOO     BAR"
        let mut expected = 0u8;
        for byte in b"FOO     BAR" {
            expected = ((expected & 1) << 7).wrapping_add(expected >> 1).wrapping_add(*byte);
        }
        assert_eq!(short_name_checksum(b"FOO     BAR"), expected);
    }
}
