//! A small NTFS volume built record by record
use super::{align8, put_u16, put_u32, put_u64, utf16};

pub const CLUSTER_SIZE: u64 = 512;
pub const RECORD_SIZE: usize = 1024;
pub const TOTAL_CLUSTERS: u64 = 4096;
pub const MFT_LCN: u64 = 16;
pub const MFT_RECORDS: u64 = 64;
pub const BITMAP_LCN: u64 = 200;

const FLAG_IN_USE: u16 = 0x0001;
const FLAG_DIRECTORY: u16 = 0x0002;
const USN: u16 = 0x0007;

/// One run of a non-resident attribute: `(Some(lcn), length)`, or
/// `(None, length)` for a sparse run
pub type Extent = (Option<u64>, u64);

enum Value {
    Resident(Vec<u8>),
    NonResident {
        extents: Vec<Extent>,
        low_vcn: u64,
        size: u64,
    },
}

struct Attribute {
    code: u32,
    name: Option<String>,
    value: Value,
}

impl Attribute {
    fn encode(&self, id: u16) -> Vec<u8> {
        let name = self.name.as_deref().map(utf16).unwrap_or_default();
        match &self.value {
            Value::Resident(value) => {
                let value_offset = align8(0x18 + name.len());
                let length = align8(value_offset + value.len());
                let mut attr = vec![0u8; length];
                put_u32(&mut attr, 0x00, self.code);
                put_u32(&mut attr, 0x04, length as u32);
                attr[0x09] = (name.len() / 2) as u8;
                put_u16(&mut attr, 0x0A, 0x18);
                put_u16(&mut attr, 0x0E, id);
                put_u32(&mut attr, 0x10, value.len() as u32);
                put_u16(&mut attr, 0x14, value_offset as u16);
                attr[0x18..0x18 + name.len()].copy_from_slice(&name);
                attr[value_offset..value_offset + value.len()].copy_from_slice(value);
                attr
            }
            Value::NonResident {
                extents,
                low_vcn,
                size,
            } => {
                let runs = encode_runs(extents);
                let clusters: u64 = extents.iter().map(|(_, length)| length).sum();
                let runs_offset = align8(0x40 + name.len());
                let length = align8(runs_offset + runs.len());
                let mut attr = vec![0u8; length];
                put_u32(&mut attr, 0x00, self.code);
                put_u32(&mut attr, 0x04, length as u32);
                attr[0x08] = 1;
                attr[0x09] = (name.len() / 2) as u8;
                put_u16(&mut attr, 0x0A, 0x40);
                put_u16(&mut attr, 0x0E, id);
                put_u64(&mut attr, 0x10, *low_vcn);
                put_u64(&mut attr, 0x18, (*low_vcn as i64 + clusters as i64 - 1) as u64);
                put_u16(&mut attr, 0x20, runs_offset as u16);
                put_u64(&mut attr, 0x28, clusters * CLUSTER_SIZE);
                put_u64(&mut attr, 0x30, *size);
                put_u64(&mut attr, 0x38, *size);
                attr[0x40..0x40 + name.len()].copy_from_slice(&name);
                attr[runs_offset..runs_offset + runs.len()].copy_from_slice(&runs);
                attr
            }
        }
    }
}

/// Mapping pairs with the smallest field widths, terminated by a zero header
pub fn encode_runs(extents: &[Extent]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut previous = 0i64;
    for (lcn, length) in extents {
        let length_bytes = unsigned_width(*length);
        let (offset_bytes, delta) = match lcn {
            Some(lcn) => {
                let delta = *lcn as i64 - previous;
                previous = *lcn as i64;
                (signed_width(delta), delta)
            }
            None => (0, 0),
        };
        out.push(((offset_bytes << 4) | length_bytes) as u8);
        out.extend_from_slice(&length.to_le_bytes()[..length_bytes]);
        out.extend_from_slice(&delta.to_le_bytes()[..offset_bytes]);
    }
    out.push(0);
    out
}

fn unsigned_width(value: u64) -> usize {
    (1..8).find(|bytes| value < 1u64 << (8 * bytes)).unwrap_or(8)
}

fn signed_width(value: i64) -> usize {
    (1..8)
        .find(|bytes| {
            let limit = 1i64 << (8 * bytes - 1);
            (-limit..limit).contains(&value)
        })
        .unwrap_or(8)
}

/// `$FILE_NAME` value in the Win32 namespace
pub fn file_name_value(parent: u64, name: &str, size: u64) -> Vec<u8> {
    let encoded = utf16(name);
    let mut value = vec![0u8; 0x42 + encoded.len()];
    put_u64(&mut value, 0x00, parent | (1 << 48));
    put_u64(&mut value, 0x28, size);
    put_u64(&mut value, 0x30, size);
    value[0x40] = (encoded.len() / 2) as u8;
    value[0x41] = 1;
    value[0x42..].copy_from_slice(&encoded);
    value
}

/// `$STANDARD_INFORMATION` with every timestamp set to 2021-03-14 12:00 UTC
fn standard_info_value() -> Vec<u8> {
    const FILETIME: u64 = 132_601_968_000_000_000;
    let mut value = vec![0u8; 0x48];
    for field in 0..4 {
        put_u64(&mut value, field * 8, FILETIME);
    }
    value
}

/// `$INDEX_ROOT` of a `$I30` index small enough to live in the record
fn index_root_value(entries: &[(u64, String)], directory: u64) -> Vec<u8> {
    let mut sorted: Vec<&(u64, String)> = entries.iter().collect();
    sorted.sort_by_key(|(_, name)| name.to_uppercase());

    let mut body = Vec::new();
    for (record, name) in sorted {
        let key = file_name_value(directory, name, 0);
        let length = align8(0x10 + key.len());
        let mut entry = vec![0u8; length];
        put_u64(&mut entry, 0x00, record | (1 << 48));
        put_u16(&mut entry, 0x08, length as u16);
        put_u16(&mut entry, 0x0A, key.len() as u16);
        entry[0x10..0x10 + key.len()].copy_from_slice(&key);
        body.extend_from_slice(&entry);
    }
    let mut last = vec![0u8; 0x10];
    put_u16(&mut last, 0x08, 0x10);
    put_u32(&mut last, 0x0C, 0x02);
    body.extend_from_slice(&last);

    let mut value = vec![0u8; 0x20];
    put_u32(&mut value, 0x00, 0x30);
    put_u32(&mut value, 0x04, 1);
    put_u32(&mut value, 0x08, 4096);
    value[0x0C] = 8;
    put_u32(&mut value, 0x10, 0x10);
    put_u32(&mut value, 0x14, (0x10 + body.len()) as u32);
    put_u32(&mut value, 0x18, (0x10 + body.len()) as u32);
    value.extend_from_slice(&body);
    value
}

/// `$ATTRIBUTE_LIST` value; each entry is `(type code, starting VCN,
/// record holding the attribute, attribute id)`
fn attribute_list_value(entries: &[(u32, u64, u64, u16)]) -> Vec<u8> {
    let mut value = Vec::new();
    for (code, starting_vcn, segment, id) in entries {
        let mut entry = vec![0u8; align8(0x1A)];
        put_u32(&mut entry, 0x00, *code);
        let entry_len = entry.len() as u16;
        put_u16(&mut entry, 0x04, entry_len);
        entry[0x07] = 0x1A;
        put_u64(&mut entry, 0x08, *starting_vcn);
        put_u64(&mut entry, 0x10, segment | (1 << 48));
        put_u16(&mut entry, 0x18, *id);
        value.extend_from_slice(&entry);
    }
    value
}

pub struct Record {
    number: u64,
    flags: u16,
    base: u64,
    attributes: Vec<Attribute>,
}

impl Record {
    /// A live file record with standard information
    pub fn new(number: u64) -> Self {
        let record = Self {
            number,
            flags: FLAG_IN_USE,
            base: 0,
            attributes: Vec::new(),
        };
        record.resident(0x10, None, standard_info_value())
    }

    /// An extension record holding overflow attributes of `base`.
    /// Attribute ids start at 0 as no standard information is added.
    pub fn extension(number: u64, base: u64) -> Self {
        Self {
            number,
            flags: FLAG_IN_USE,
            base,
            attributes: Vec::new(),
        }
    }

    /// Resident `$ATTRIBUTE_LIST`, see `attribute_list_value`
    pub fn attribute_list(self, entries: &[(u32, u64, u64, u16)]) -> Self {
        self.resident(0x20, None, attribute_list_value(entries))
    }

    pub fn deleted(mut self) -> Self {
        self.flags &= !FLAG_IN_USE;
        self
    }

    pub fn named(self, parent: u64, name: &str, size: u64) -> Self {
        self.resident(0x30, None, file_name_value(parent, name, size))
    }

    /// Turn the record into a directory indexing `entries`
    pub fn directory(mut self, entries: &[(u64, &str)]) -> Self {
        self.flags |= FLAG_DIRECTORY;
        let entries: Vec<(u64, String)> = entries
            .iter()
            .map(|(record, name)| (*record, name.to_string()))
            .collect();
        let number = self.number;
        self.resident(0x90, Some("$I30"), index_root_value(&entries, number))
    }

    pub fn resident_data(self, stream: Option<&str>, data: &[u8]) -> Self {
        self.resident(0x80, stream, data.to_vec())
    }

    pub fn data_runs(self, stream: Option<&str>, extents: &[Extent], size: u64) -> Self {
        self.data_extent(stream, extents, 0, size)
    }

    /// One extent of a `$DATA` attribute starting at `low_vcn`; `size` is
    /// the whole attribute's data size
    pub fn data_extent(mut self, stream: Option<&str>, extents: &[Extent], low_vcn: u64, size: u64) -> Self {
        self.attributes.push(Attribute {
            code: 0x80,
            name: stream.map(str::to_string),
            value: Value::NonResident {
                extents: extents.to_vec(),
                low_vcn,
                size,
            },
        });
        self
    }

    fn resident(mut self, code: u32, name: Option<&str>, value: Vec<u8>) -> Self {
        self.attributes.push(Attribute {
            code,
            name: name.map(str::to_string),
            value: Value::Resident(value),
        });
        self
    }

    /// On-disk bytes with the update sequence array applied
    pub fn encode(&self) -> Vec<u8> {
        let mut data = vec![0u8; RECORD_SIZE];
        data[0..4].copy_from_slice(b"FILE");
        put_u16(&mut data, 0x04, 0x30);
        put_u16(&mut data, 0x06, 3);
        put_u16(&mut data, 0x10, 1);
        put_u16(&mut data, 0x12, 1);
        put_u16(&mut data, 0x14, 0x38);
        put_u16(&mut data, 0x16, self.flags);
        put_u32(&mut data, 0x1C, RECORD_SIZE as u32);
        if self.base != 0 {
            put_u64(&mut data, 0x20, self.base | (1 << 48));
        }
        put_u16(&mut data, 0x28, self.attributes.len() as u16);
        put_u32(&mut data, 0x2C, self.number as u32);

        let mut pos = 0x38;
        for (id, attr) in self.attributes.iter().enumerate() {
            let bytes = attr.encode(id as u16);
            data[pos..pos + bytes.len()].copy_from_slice(&bytes);
            pos += bytes.len();
        }
        put_u32(&mut data, pos, 0xFFFF_FFFF);
        put_u32(&mut data, 0x18, (pos + 8) as u32);

        put_u16(&mut data, 0x30, USN);
        for stride in 0..2 {
            let end = (stride + 1) * 512 - 2;
            let saved = [data[end], data[end + 1]];
            data[0x32 + stride * 2..0x34 + stride * 2].copy_from_slice(&saved);
            put_u16(&mut data, end, USN);
        }
        data
    }
}

/// Builds a whole volume: boot sector, `$MFT`, `$Bitmap` and the root
/// directory are added automatically
pub struct NtfsImage {
    mft_lcn: u64,
    mft_records: u64,
    total_clusters: u64,
    root_entries: Vec<(u64, String)>,
    records: Vec<Record>,
    contents: Vec<(u64, Vec<u8>)>,
    allocated: Vec<u64>,
}

impl Default for NtfsImage {
    fn default() -> Self {
        Self::new()
    }
}

impl NtfsImage {
    pub fn new() -> Self {
        Self {
            mft_lcn: MFT_LCN,
            mft_records: MFT_RECORDS,
            total_clusters: TOTAL_CLUSTERS,
            root_entries: Vec::new(),
            records: Vec::new(),
            contents: Vec::new(),
            allocated: Vec::new(),
        }
    }

    /// Move the MFT to `lcn` with room for `records` records, growing the
    /// volume to fit
    pub fn with_mft(mut self, lcn: u64, records: u64) -> Self {
        let end = lcn + records * RECORD_SIZE as u64 / CLUSTER_SIZE;
        self.mft_lcn = lcn;
        self.mft_records = records;
        self.total_clusters = TOTAL_CLUSTERS.max(end.next_multiple_of(TOTAL_CLUSTERS));
        self
    }

    pub fn record(mut self, record: Record) -> Self {
        self.records.push(record);
        self
    }

    /// List `record` in the root directory's index
    pub fn in_root(mut self, record: u64, name: &str) -> Self {
        self.root_entries.push((record, name.to_string()));
        self
    }

    /// Write `bytes` starting at cluster `lcn`
    pub fn write(mut self, lcn: u64, bytes: Vec<u8>) -> Self {
        self.contents.push((lcn, bytes));
        self
    }

    /// Mark clusters as in use by some live file
    pub fn allocate(mut self, clusters: impl IntoIterator<Item = u64>) -> Self {
        self.allocated.extend(clusters);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut image = vec![0u8; (self.total_clusters * CLUSTER_SIZE) as usize];
        image[..512].copy_from_slice(&boot_sector(self.mft_lcn, self.total_clusters));

        let mft_size = self.mft_records * RECORD_SIZE as u64;
        let mft_clusters = mft_size / CLUSTER_SIZE;
        let bitmap_size = self.total_clusters / 8;
        let bitmap_clusters = bitmap_size.div_ceil(CLUSTER_SIZE);
        let root_entries: Vec<(u64, &str)> = self
            .root_entries
            .iter()
            .map(|(record, name)| (*record, name.as_str()))
            .collect();
        let mut records = vec![
            Record::new(0)
                .named(5, "$MFT", mft_size)
                .data_runs(None, &[(Some(self.mft_lcn), mft_clusters)], mft_size),
            Record::new(5).named(5, ".", 0).directory(&root_entries),
            Record::new(6)
                .named(5, "$Bitmap", bitmap_size)
                .data_runs(None, &[(Some(BITMAP_LCN), bitmap_clusters)], bitmap_size),
        ];
        records.extend(self.records);

        let mft_start = (self.mft_lcn * CLUSTER_SIZE) as usize;
        for record in &records {
            let offset = mft_start + record.number as usize * RECORD_SIZE;
            image[offset..offset + RECORD_SIZE].copy_from_slice(&record.encode());
        }

        let mut bitmap = vec![0u8; bitmap_size as usize];
        let system = (0..MFT_LCN).chain(self.mft_lcn..self.mft_lcn + mft_clusters);
        let bitmap_area = BITMAP_LCN..BITMAP_LCN + bitmap_clusters;
        for cluster in system.chain(bitmap_area).chain(self.allocated) {
            bitmap[(cluster / 8) as usize] |= 1 << (cluster % 8);
        }
        let bitmap_start = (BITMAP_LCN * CLUSTER_SIZE) as usize;
        image[bitmap_start..bitmap_start + bitmap.len()].copy_from_slice(&bitmap);

        for (lcn, bytes) in self.contents {
            let start = (lcn * CLUSTER_SIZE) as usize;
            image[start..start + bytes.len()].copy_from_slice(&bytes);
        }
        image
    }
}

fn boot_sector(mft_lcn: u64, total_clusters: u64) -> Vec<u8> {
    let mut sector = vec![0u8; 512];
    sector[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
    sector[3..11].copy_from_slice(b"NTFS    ");
    put_u16(&mut sector, 0x0B, CLUSTER_SIZE as u16);
    sector[0x0D] = 1;
    put_u64(&mut sector, 0x28, total_clusters);
    put_u64(&mut sector, 0x30, mft_lcn);
    put_u64(&mut sector, 0x38, 2);
    sector[0x40] = 0xF6;
    sector[0x44] = 0xF4;
    put_u64(&mut sector, 0x48, 0x1234_5678_9ABC_DEF0);
    sector[510] = 0x55;
    sector[511] = 0xAA;
    sector
}

/// The volume most tests run against:
///
/// ```text
/// /docs                 record 30
/// /docs/readme.txt      record 35, live, resident
/// /docs/secret.txt      record 31, deleted, clusters 300-301 free
/// /docs/old.log         record 32, deleted, cluster 400 reused
/// /half.bin             record 33, deleted, cluster 500 reused, 501 free
/// tiny.txt              record 34, deleted, parent record 99 never existed
/// /photo.jpg            record 37, deleted, with a Zone.Identifier stream
/// /split.dat            record 38, deleted, clusters 700 then 650
/// ```
pub fn sample_image() -> Vec<u8> {
    let secret: Vec<u8> = b"the launch code is 0000\n".iter().copied().cycle().take(1000).collect();
    let mut photo = vec![0x11u8; 300];
    photo[..3].copy_from_slice(&[0xFF, 0xD8, 0xFF]);

    NtfsImage::new()
        .in_root(30, "docs")
        .record(Record::new(30).named(5, "docs", 0).directory(&[(35, "readme.txt")]))
        .record(Record::new(35).named(30, "readme.txt", 7).resident_data(None, b"read me"))
        .record(
            Record::new(31)
                .deleted()
                .named(30, "secret.txt", 1000)
                .data_runs(None, &[(Some(300), 2)], 1000),
        )
        .write(300, secret)
        .record(
            Record::new(32)
                .deleted()
                .named(30, "old.log", 512)
                .data_runs(None, &[(Some(400), 1)], 512),
        )
        .record(
            Record::new(33)
                .deleted()
                .named(5, "half.bin", 1024)
                .data_runs(None, &[(Some(500), 2)], 1024),
        )
        .allocate([400, 500])
        .record(Record::new(34).deleted().named(99, "tiny.txt", 5).resident_data(None, b"hello"))
        .record(
            Record::new(37)
                .deleted()
                .named(5, "photo.jpg", 300)
                .data_runs(None, &[(Some(600), 1)], 300)
                .resident_data(Some("Zone.Identifier"), b"[ZoneTransfer]\r\nZoneId=3\r\n"),
        )
        .write(600, photo)
        .record(
            Record::new(38)
                .deleted()
                .named(5, "split.dat", 1024)
                .data_runs(None, &[(Some(700), 1), (Some(650), 1)], 1024),
        )
        .write(700, vec![b'A'; 512])
        .write(650, vec![b'B'; 512])
        .build()
}
