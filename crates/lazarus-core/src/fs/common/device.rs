/// Raw sources and the cached device reader
use anyhow::{Context, Result};
use memmap2::{Mmap, MmapOptions};
use parking_lot::Mutex;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::config::ReadPolicy;
use crate::stream::{ByteStream, StreamError, StreamResult};

/// Size and alignment of the device's single cache line
pub const CACHE_LINE_SIZE: usize = 4096;

/// The one primitive the engine needs from the outside world: a read-only,
/// randomly seekable byte source with a known length.
pub trait RawSource: Send {
    fn len(&self) -> u64;

    fn open(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Read into `buf` at `offset`, returning the number of bytes read.
    /// Short reads happen only at the end of the source.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    fn close(&mut self) {}
}

/// Memory-mapped disk image
pub struct ImageSource {
    _file: File,
    mmap: Mmap,
}

impl ImageSource {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path.as_ref())?;
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Ok(Self { _file: file, mmap })
    }
}

impl RawSource for ImageSource {
    fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.mmap.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let count = buf.len().min((len - offset) as usize);
        buf[..count].copy_from_slice(&self.mmap[start..start + count]);
        Ok(count)
    }
}

/// Raw block device (or any file) read with positioned reads.
/// The handle is only held between `open` and `close`.
pub struct RawDeviceSource {
    path: PathBuf,
    length: u64,
    file: Option<File>,
}

impl RawDeviceSource {
    pub fn new<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        // Block devices report a zero metadata length; seeking to the end works for both
        let mut file = File::open(&path)?;
        let length = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            path,
            length,
            file: None,
        })
    }
}

impl RawSource for RawDeviceSource {
    fn len(&self) -> u64 {
        self.length
    }

    fn open(&mut self) -> io::Result<()> {
        if self.file.is_none() {
            self.file = Some(File::open(&self.path)?);
        }
        Ok(())
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.open()?;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "device closed"))?;
        file.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    fn close(&mut self) {
        self.file = None;
    }
}

/// In-memory source, mostly for tests and extracted images
pub struct MemorySource {
    data: Vec<u8>,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl RawSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let count = buf.len().min((len - offset) as usize);
        buf[..count].copy_from_slice(&self.data[start..start + count]);
        Ok(count)
    }
}

struct DeviceState {
    source: Box<dyn RawSource>,
    cache_line: Option<u64>,
    cache: Vec<u8>,
    open_count: usize,
    raw_reads: u64,
}

/// A block device or image with a single-line read cache
pub struct Device {
    label: String,
    length: u64,
    policy: ReadPolicy,
    state: Mutex<DeviceState>,
}

impl Device {
    pub fn new(label: impl Into<String>, source: Box<dyn RawSource>, policy: ReadPolicy) -> Self {
        let length = source.len();
        Self {
            label: label.into(),
            length,
            policy,
            state: Mutex::new(DeviceState {
                source,
                cache_line: None,
                cache: vec![0u8; CACHE_LINE_SIZE],
                open_count: 0,
                raw_reads: 0,
            }),
        }
    }

    /// Open a disk image (memory-mapped) or, if mapping fails, a raw device
    pub fn open_path<P: AsRef<Path>>(path: P, policy: ReadPolicy) -> Result<Self> {
        let path = path.as_ref();
        let label = path.display().to_string();

        let source: Box<dyn RawSource> = match ImageSource::open(path) {
            Ok(image) if image.len() > 0 => Box::new(image),
            _ => Box::new(
                RawDeviceSource::new(path)
                    .with_context(|| format!("opening device {}", path.display()))?,
            ),
        };

        tracing::info!("Opened {} ({} bytes)", label, source.len());
        Ok(Self::new(label, source, policy))
    }

    pub fn from_bytes(label: impl Into<String>, data: Vec<u8>, policy: ReadPolicy) -> Self {
        Self::new(label, Box::new(MemorySource::new(data)), policy)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn policy(&self) -> ReadPolicy {
        self.policy
    }

    /// Number of raw reads issued so far (one per cache miss)
    pub fn raw_read_count(&self) -> u64 {
        self.state.lock().raw_reads
    }

    /// Index of the line currently cached
    pub fn cached_line(&self) -> Option<u64> {
        self.state.lock().cache_line
    }

    /// Read one full, aligned cache line from the source into the cache
    fn force_read(&self, state: &mut DeviceState, line: u64) -> StreamResult<()> {
        let offset = line * CACHE_LINE_SIZE as u64;
        state.raw_reads += 1;

        match state.source.read(offset, &mut state.cache) {
            Ok(count) => {
                state.cache[count..].fill(0);
                state.cache_line = Some(line);
                Ok(())
            }
            Err(source_err) => {
                state.cache_line = None;
                match self.policy {
                    ReadPolicy::Strict => Err(StreamError::Io {
                        offset,
                        source: source_err,
                    }),
                    ReadPolicy::BestEffort => {
                        tracing::warn!(
                            "Read of {} bytes at 0x{:x} on {} failed, zero-filling: {}",
                            CACHE_LINE_SIZE,
                            offset,
                            self.label,
                            source_err
                        );
                        state.cache.fill(0);
                        Ok(())
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("label", &self.label)
            .field("length", &self.length)
            .field("policy", &self.policy)
            .finish()
    }
}

impl ByteStream for Device {
    fn length(&self) -> u64 {
        self.length
    }

    fn device_offset(&self) -> u64 {
        0
    }

    fn open(&self) -> StreamResult<()> {
        let mut state = self.state.lock();
        if state.open_count == 0 {
            state
                .source
                .open()
                .map_err(|source| StreamError::Io { offset: 0, source })?;
        }
        state.open_count += 1;
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock();
        match state.open_count {
            0 => {}
            1 => {
                state.open_count = 0;
                state.cache_line = None;
                state.source.close();
            }
            _ => state.open_count -= 1,
        }
    }

    fn read_unchecked(&self, offset: u64, buf: &mut [u8]) -> StreamResult<()> {
        let mut state = self.state.lock();
        let line_size = CACHE_LINE_SIZE as u64;
        let mut done = 0usize;

        while done < buf.len() {
            let position = offset + done as u64;
            let line = position / line_size;
            if state.cache_line != Some(line) {
                self.force_read(&mut state, line)?;
            }

            let within = (position % line_size) as usize;
            let count = (CACHE_LINE_SIZE - within).min(buf.len() - done);
            buf[done..done + count].copy_from_slice(&state.cache[within..within + count]);
            done += count;
        }
        Ok(())
    }
}
