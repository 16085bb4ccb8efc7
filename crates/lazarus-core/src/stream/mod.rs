//! Random-access, read-only byte streams
//!
//! Every on-disk structure is reached through a composition of these views:
//! the cached device at the bottom, then sub-ranges (partitions, MFT records,
//! attribute values), fixup-corrected records and index buffers, and the
//! run-mapped / chain-mapped streams that give a file's contents.

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub mod fixup;

pub use fixup::FixupStream;

/// Errors raised by the byte stream layer
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("read of {length} bytes at offset {offset} exceeds stream length {stream_length}")]
    OutOfRange {
        offset: u64,
        length: u64,
        stream_length: u64,
    },
    #[error("device read failed at offset {offset}: {source}")]
    Io {
        offset: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("no cluster mapped for stream offset {offset}")]
    BrokenChain { offset: u64 },
}

pub type StreamResult<T> = std::result::Result<T, StreamError>;

/// Shared handle to any stream in the layer
pub type SharedStream = Arc<dyn ByteStream>;

/// Check that `[offset, offset + length)` lies inside a stream of `stream_length` bytes
pub fn check_range(stream_length: u64, offset: u64, length: u64) -> StreamResult<()> {
    match offset.checked_add(length) {
        Some(end) if end <= stream_length => Ok(()),
        _ => Err(StreamError::OutOfRange {
            offset,
            length,
            stream_length,
        }),
    }
}

/// Read-only random access over a bounded byte range.
///
/// Implementors provide `read_unchecked`; the provided methods do the bounds
/// checking so that no variant can read past its own `length`.
pub trait ByteStream: Send + Sync + fmt::Debug {
    /// Number of readable bytes
    fn length(&self) -> u64;

    /// Absolute device offset of stream offset 0
    fn device_offset(&self) -> u64;

    /// Stream this one was derived from, if any
    fn parent(&self) -> Option<SharedStream> {
        None
    }

    /// Fill `buf` from `offset`. Callers guarantee the range is in bounds.
    fn read_unchecked(&self, offset: u64, buf: &mut [u8]) -> StreamResult<()>;

    /// Absolute device offset backing `offset`, or `None` when nothing on the
    /// device backs it (sparse or unmapped ranges).
    fn device_offset_at(&self, offset: u64) -> Option<u64> {
        if offset < self.length() {
            Some(self.device_offset() + offset)
        } else {
            None
        }
    }

    fn open(&self) -> StreamResult<()> {
        match self.parent() {
            Some(parent) => parent.open(),
            None => Ok(()),
        }
    }

    fn close(&self) {
        if let Some(parent) = self.parent() {
            parent.close();
        }
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> StreamResult<()> {
        check_range(self.length(), offset, buf.len() as u64)?;
        if buf.is_empty() {
            return Ok(());
        }
        self.read_unchecked(offset, buf)
    }

    fn get_byte(&self, offset: u64) -> StreamResult<u8> {
        let mut byte = [0u8; 1];
        self.read_at(offset, &mut byte)?;
        Ok(byte[0])
    }

    fn get_bytes(&self, offset: u64, length: usize) -> StreamResult<Vec<u8>> {
        check_range(self.length(), offset, length as u64)?;
        let mut buf = vec![0u8; length];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    fn get_u16(&self, offset: u64) -> StreamResult<u16> {
        let mut buf = [0u8; 2];
        self.read_at(offset, &mut buf)?;
        Ok(LittleEndian::read_u16(&buf))
    }

    fn get_u32(&self, offset: u64) -> StreamResult<u32> {
        let mut buf = [0u8; 4];
        self.read_at(offset, &mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    fn get_u64(&self, offset: u64) -> StreamResult<u64> {
        let mut buf = [0u8; 8];
        self.read_at(offset, &mut buf)?;
        Ok(LittleEndian::read_u64(&buf))
    }
}

/// Offset/length window into a parent stream
pub struct SubStream {
    parent: SharedStream,
    start: u64,
    length: u64,
}

impl SubStream {
    /// Create a view of `length` bytes starting at `start` within `parent`
    pub fn new(parent: SharedStream, start: u64, length: u64) -> StreamResult<Self> {
        check_range(parent.length(), start, length)?;
        Ok(Self {
            parent,
            start,
            length,
        })
    }

    /// Like `new`, but clamps `length` to what the parent can supply
    pub fn clamped(parent: SharedStream, start: u64, length: u64) -> StreamResult<Self> {
        let available = parent.length().saturating_sub(start);
        Self::new(parent, start, length.min(available))
    }

    pub fn shared(self) -> SharedStream {
        Arc::new(self)
    }

    pub fn start(&self) -> u64 {
        self.start
    }
}

impl fmt::Debug for SubStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubStream")
            .field("start", &self.start)
            .field("length", &self.length)
            .field("device_offset", &self.device_offset())
            .finish()
    }
}

impl ByteStream for SubStream {
    fn length(&self) -> u64 {
        self.length
    }

    fn device_offset(&self) -> u64 {
        self.parent.device_offset() + self.start
    }

    fn parent(&self) -> Option<SharedStream> {
        Some(self.parent.clone())
    }

    fn read_unchecked(&self, offset: u64, buf: &mut [u8]) -> StreamResult<()> {
        self.parent.read_at(self.start + offset, buf)
    }

    fn device_offset_at(&self, offset: u64) -> Option<u64> {
        if offset < self.length {
            self.parent.device_offset_at(self.start + offset)
        } else {
            None
        }
    }
}

/// A single named sector of a parent stream (MBR, boot sectors)
#[derive(Debug)]
pub struct SectorStream {
    name: String,
    sector: u64,
    inner: SubStream,
}

impl SectorStream {
    pub fn new(
        parent: SharedStream,
        sector: u64,
        sector_size: u64,
        name: impl Into<String>,
    ) -> StreamResult<Self> {
        let inner = SubStream::new(parent, sector * sector_size, sector_size)?;
        Ok(Self {
            name: name.into(),
            sector,
            inner,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sector(&self) -> u64 {
        self.sector
    }

    /// Whether the sector ends with the `0x55AA` boot signature
    pub fn has_boot_signature(&self) -> bool {
        let len = self.length();
        len >= 2 && matches!(self.get_u16(len - 2), Ok(0xAA55))
    }
}

impl ByteStream for SectorStream {
    fn length(&self) -> u64 {
        self.inner.length()
    }

    fn device_offset(&self) -> u64 {
        self.inner.device_offset()
    }

    fn parent(&self) -> Option<SharedStream> {
        self.inner.parent()
    }

    fn read_unchecked(&self, offset: u64, buf: &mut [u8]) -> StreamResult<()> {
        self.inner.read_unchecked(offset, buf)
    }
}

/// Memory-backed stream
pub struct ArrayBackedStream {
    data: Vec<u8>,
    device_offset: u64,
}

impl ArrayBackedStream {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            device_offset: 0,
        }
    }

    /// Buffer that was copied from `device_offset` on the device
    pub fn with_origin(data: Vec<u8>, device_offset: u64) -> Self {
        Self {
            data,
            device_offset,
        }
    }

    pub fn shared(self) -> SharedStream {
        Arc::new(self)
    }
}

impl fmt::Debug for ArrayBackedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayBackedStream")
            .field("length", &self.data.len())
            .field("device_offset", &self.device_offset)
            .finish()
    }
}

impl ByteStream for ArrayBackedStream {
    fn length(&self) -> u64 {
        self.data.len() as u64
    }

    fn device_offset(&self) -> u64 {
        self.device_offset
    }

    fn read_unchecked(&self, offset: u64, buf: &mut [u8]) -> StreamResult<()> {
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }
}

/// Read a whole stream into memory
pub fn read_all(stream: &dyn ByteStream) -> StreamResult<Vec<u8>> {
    stream.get_bytes(0, stream.length() as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> SharedStream {
        ArrayBackedStream::with_origin((0..len).map(|i| i as u8).collect(), 1000).shared()
    }

    #[test]
    fn test_out_of_range_reads_fail() {
        let stream = sample(16);
        assert_eq!(stream.get_byte(15).unwrap(), 15);
        assert!(matches!(
            stream.get_byte(16),
            Err(StreamError::OutOfRange { offset: 16, .. })
        ));
        assert!(stream.get_bytes(10, 7).is_err());
        assert!(stream.get_bytes(u64::MAX, 2).is_err());
    }

    #[test]
    fn test_substream_offsets_compose() {
        let base = sample(64);
        let outer = SubStream::new(base, 8, 32).unwrap().shared();
        let inner = SubStream::new(outer.clone(), 4, 8).unwrap();

        assert_eq!(outer.device_offset(), 1008);
        assert_eq!(inner.device_offset(), 1012);
        assert_eq!(inner.get_byte(0).unwrap(), 12);
        assert_eq!(inner.device_offset_at(3), Some(1015));
        assert!(inner.get_byte(8).is_err());
    }

    #[test]
    fn test_substream_rejects_window_past_parent() {
        let base = sample(16);
        assert!(SubStream::new(base.clone(), 10, 7).is_err());
        let clamped = SubStream::clamped(base, 10, 7).unwrap();
        assert_eq!(clamped.length(), 6);
    }

    #[test]
    fn test_sector_stream_signature() {
        let mut data = vec![0u8; 1024];
        data[512 + 510] = 0x55;
        data[512 + 511] = 0xAA;
        let base = ArrayBackedStream::new(data).shared();

        let first = SectorStream::new(base.clone(), 0, 512, "MBR").unwrap();
        let second = SectorStream::new(base, 1, 512, "VBR").unwrap();
        assert!(!first.has_boot_signature());
        assert!(second.has_boot_signature());
        assert_eq!(second.device_offset(), 512);
        assert_eq!(second.name(), "VBR");
    }

    #[test]
    fn test_little_endian_helpers() {
        let base = ArrayBackedStream::new(vec![0x34, 0x12, 0x78, 0x56, 0, 0, 0, 0]).shared();
        assert_eq!(base.get_u16(0).unwrap(), 0x1234);
        assert_eq!(base.get_u32(0).unwrap(), 0x5678_1234);
        assert_eq!(base.get_u64(0).unwrap(), 0x5678_1234);
    }
}
