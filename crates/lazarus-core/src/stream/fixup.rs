//! NTFS update-sequence fixups
//!
//! MFT records and INDX buffers overwrite the last two bytes of every 512-byte
//! stride with the update sequence number (USN) and keep the real bytes in the
//! update sequence array (USA) described by the structure header:
//!
//! - 0x04: u16 offset of the USA
//! - 0x06: u16 number of USA entries (1 + number of strides)
//!
//! The first USA entry is the USN itself; entry `i` holds the real trailing
//! bytes of stride `i - 1`.

use std::fmt;

use super::{ByteStream, SharedStream, StreamResult};

/// Fixup granularity, independent of the volume's sector size
pub const FIXUP_STRIDE: u64 = 512;

/// A record-sized stream with the update sequence array substituted back in
pub struct FixupStream {
    inner: SharedStream,
    usn: [u8; 2],
    replacements: Vec<[u8; 2]>,
    torn_strides: Vec<u64>,
    has_array: bool,
}

impl FixupStream {
    pub fn new(inner: SharedStream) -> StreamResult<Self> {
        let usa_offset = inner.get_u16(0x04)? as u64;
        let usa_count = inner.get_u16(0x06)? as u64;
        let length = inner.length();

        let has_array = usa_count >= 2 && usa_offset + usa_count * 2 <= length;
        if !has_array {
            tracing::debug!(
                "No usable update sequence array (offset {}, count {})",
                usa_offset,
                usa_count
            );
            return Ok(Self {
                inner,
                usn: [0; 2],
                replacements: Vec::new(),
                torn_strides: Vec::new(),
                has_array: false,
            });
        }

        let array = inner.get_bytes(usa_offset, (usa_count * 2) as usize)?;
        let usn = [array[0], array[1]];
        let strides = (usa_count - 1).min(length / FIXUP_STRIDE);

        let mut replacements = Vec::with_capacity(strides as usize);
        let mut torn_strides = Vec::new();
        for stride in 0..strides {
            let entry = ((stride + 1) * 2) as usize;
            replacements.push([array[entry], array[entry + 1]]);

            let mut on_disk = [0u8; 2];
            inner.read_at(stride * FIXUP_STRIDE + FIXUP_STRIDE - 2, &mut on_disk)?;
            if on_disk != usn {
                torn_strides.push(stride);
            }
        }

        Ok(Self {
            inner,
            usn,
            replacements,
            torn_strides,
            has_array,
        })
    }

    /// The update sequence number stamped at the end of each stride
    pub fn sequence_number(&self) -> u16 {
        u16::from_le_bytes(self.usn)
    }

    /// True when the array was present and every stride carried the USN
    pub fn is_intact(&self) -> bool {
        self.has_array && self.torn_strides.is_empty()
    }

    /// Strides whose trailing bytes did not match the USN (torn writes)
    pub fn torn_strides(&self) -> &[u64] {
        &self.torn_strides
    }
}

impl fmt::Debug for FixupStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixupStream")
            .field("length", &self.inner.length())
            .field("usn", &self.sequence_number())
            .field("strides", &self.replacements.len())
            .field("torn", &self.torn_strides)
            .finish()
    }
}

impl ByteStream for FixupStream {
    fn length(&self) -> u64 {
        self.inner.length()
    }

    fn device_offset(&self) -> u64 {
        self.inner.device_offset()
    }

    fn parent(&self) -> Option<SharedStream> {
        Some(self.inner.clone())
    }

    fn device_offset_at(&self, offset: u64) -> Option<u64> {
        self.inner.device_offset_at(offset)
    }

    fn read_unchecked(&self, offset: u64, buf: &mut [u8]) -> StreamResult<()> {
        self.inner.read_at(offset, buf)?;

        let end = offset + buf.len() as u64;
        let first = offset / FIXUP_STRIDE;
        let last = (end - 1) / FIXUP_STRIDE;
        for stride in first..=last {
            let Some(real) = self.replacements.get(stride as usize) else {
                break;
            };
            let protected = stride * FIXUP_STRIDE + FIXUP_STRIDE - 2;
            for (i, byte) in real.iter().enumerate() {
                let pos = protected + i as u64;
                if pos >= offset && pos < end {
                    buf[(pos - offset) as usize] = *byte;
                }
            }
        }
        Ok(())
    }
}
