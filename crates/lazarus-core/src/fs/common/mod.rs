/// Common types and utilities for file system access
use chrono::{DateTime, NaiveDate, Utc};
use encoding_rs::UTF_16LE;

pub mod device;

pub use device::{Device, ImageSource, MemorySource, RawDeviceSource, RawSource, CACHE_LINE_SIZE};

/// Decode a UTF-16LE name, dropping trailing NULs
pub fn decode_utf16le(data: &[u8]) -> String {
    let mut end = data.len() & !1;
    while end >= 2 && data[end - 2] == 0 && data[end - 1] == 0 {
        end -= 2;
    }
    let (decoded, _had_errors) = UTF_16LE.decode_without_bom_handling(&data[..end]);
    decoded.into_owned()
}

/// Seconds between 1601-01-01 and 1970-01-01
const FILETIME_UNIX_EPOCH_SECONDS: i64 = 11_644_473_600;

/// Convert an NTFS FILETIME (100ns ticks since 1601) to UTC
pub fn filetime_to_datetime(filetime: u64) -> Option<DateTime<Utc>> {
    if filetime == 0 {
        return None;
    }
    let seconds = (filetime / 10_000_000) as i64 - FILETIME_UNIX_EPOCH_SECONDS;
    let nanos = ((filetime % 10_000_000) * 100) as u32;
    DateTime::<Utc>::from_timestamp(seconds, nanos)
}

/// Convert a packed FAT date and time to UTC. Zero dates mean "not set".
pub fn fat_datetime(date: u16, time: u16) -> Option<DateTime<Utc>> {
    if date == 0 {
        return None;
    }
    let year = 1980 + (date >> 9) as i32;
    let month = ((date >> 5) & 0x0F) as u32;
    let day = (date & 0x1F) as u32;
    let hour = (time >> 11) as u32;
    let minute = ((time >> 5) & 0x3F) as u32;
    let second = ((time & 0x1F) * 2) as u32;

    NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_opt(hour, minute, second)
        .map(|naive| naive.and_utc())
}
