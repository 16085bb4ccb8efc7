/// Run-mapped attribute contents
use std::fmt;

use super::runs::{find_run, Run};
use crate::config::ReadPolicy;
use crate::stream::{ByteStream, SharedStream, StreamError, StreamResult};

/// A non-resident attribute's value, mapped VCN by VCN onto the volume.
///
/// Sparse runs and bytes past the initialized size read as zeros. Ranges no
/// run covers are zero-filled or fail depending on the read policy.
pub struct RunStream {
    volume: SharedStream,
    runs: Vec<Run>,
    cluster_size: u64,
    length: u64,
    initialized: u64,
    policy: ReadPolicy,
}

impl RunStream {
    pub fn new(
        volume: SharedStream,
        runs: Vec<Run>,
        cluster_size: u64,
        length: u64,
        initialized: u64,
        policy: ReadPolicy,
    ) -> Self {
        Self {
            volume,
            runs,
            cluster_size,
            length,
            initialized: initialized.min(length),
            policy,
        }
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    /// Volume offset and byte count of the contiguous piece starting at `offset`
    fn locate(&self, offset: u64) -> Option<(Option<u64>, u64)> {
        let vcn = offset / self.cluster_size;
        let run = &self.runs[find_run(&self.runs, vcn)?];
        let run_start = run.vcn() * self.cluster_size;
        let within = offset - run_start;
        let available = run.length().saturating_mul(self.cluster_size) - within;
        let volume_offset = match run.lcn() {
            // A run the volume cannot address counts as unmapped
            Some(lcn) => Some(lcn.checked_mul(self.cluster_size)?.checked_add(within)?),
            None => None,
        };
        Some((volume_offset, available))
    }
}

impl fmt::Debug for RunStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunStream")
            .field("runs", &self.runs.len())
            .field("cluster_size", &self.cluster_size)
            .field("length", &self.length)
            .field("initialized", &self.initialized)
            .finish()
    }
}

impl ByteStream for RunStream {
    fn length(&self) -> u64 {
        self.length
    }

    fn device_offset(&self) -> u64 {
        self.device_offset_at(0)
            .unwrap_or_else(|| self.volume.device_offset())
    }

    fn parent(&self) -> Option<SharedStream> {
        Some(self.volume.clone())
    }

    fn device_offset_at(&self, offset: u64) -> Option<u64> {
        if offset >= self.length {
            return None;
        }
        let (volume_offset, _) = self.locate(offset)?;
        self.volume.device_offset_at(volume_offset?)
    }

    fn read_unchecked(&self, offset: u64, buf: &mut [u8]) -> StreamResult<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let position = offset + done as u64;
            let remaining = buf.len() - done;

            if position >= self.initialized {
                buf[done..].fill(0);
                break;
            }
            let before_uninit = (self.initialized - position).min(remaining as u64) as usize;

            let count = match self.locate(position) {
                Some((volume_offset, available)) => {
                    let count = before_uninit.min(available as usize);
                    let target = &mut buf[done..done + count];
                    match volume_offset {
                        Some(volume_offset) => self.volume.read_at(volume_offset, target)?,
                        None => target.fill(0),
                    }
                    count
                }
                None => {
                    if self.policy.is_strict() {
                        return Err(StreamError::BrokenChain { offset: position });
                    }
                    let cluster_left = self.cluster_size - position % self.cluster_size;
                    let count = before_uninit.min(cluster_left as usize);
                    buf[done..done + count].fill(0);
                    count
                }
            };
            done += count;
        }
        Ok(())
    }
}
