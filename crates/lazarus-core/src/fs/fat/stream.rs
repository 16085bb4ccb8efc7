/// Cluster-chain mapped file contents
use std::fmt;

use crate::config::ReadPolicy;
use crate::stream::{ByteStream, SharedStream, StreamError, StreamResult};

/// A file's bytes laid over a list of data clusters.
///
/// Offsets past the end of the cluster list are zero-filled or fail
/// depending on the read policy.
pub struct ClusterChainStream {
    volume: SharedStream,
    clusters: Vec<u32>,
    cluster_size: u64,
    /// Volume offset of cluster 2
    data_start: u64,
    length: u64,
    policy: ReadPolicy,
}

impl ClusterChainStream {
    pub fn new(
        volume: SharedStream,
        clusters: Vec<u32>,
        cluster_size: u64,
        data_start: u64,
        length: u64,
        policy: ReadPolicy,
    ) -> Self {
        Self {
            volume,
            clusters,
            cluster_size,
            data_start,
            length,
            policy,
        }
    }

    pub fn clusters(&self) -> &[u32] {
        &self.clusters
    }

    fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_start + (cluster as u64 - 2) * self.cluster_size
    }

    /// Volume offset backing `offset`, if a cluster covers it
    fn locate(&self, offset: u64) -> Option<u64> {
        let index = (offset / self.cluster_size) as usize;
        let cluster = *self.clusters.get(index)?;
        Some(self.cluster_offset(cluster) + offset % self.cluster_size)
    }
}

impl fmt::Debug for ClusterChainStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterChainStream")
            .field("clusters", &self.clusters.len())
            .field("cluster_size", &self.cluster_size)
            .field("length", &self.length)
            .finish()
    }
}

impl ByteStream for ClusterChainStream {
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
        self.volume.device_offset_at(self.locate(offset)?)
    }

    fn read_unchecked(&self, offset: u64, buf: &mut [u8]) -> StreamResult<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let position = offset + done as u64;
            let cluster_left = (self.cluster_size - position % self.cluster_size) as usize;
            let count = cluster_left.min(buf.len() - done);
            let target = &mut buf[done..done + count];

            match self.locate(position) {
                Some(volume_offset) => match self.volume.read_at(volume_offset, target) {
                    Ok(()) => {}
                    Err(e) if self.policy.is_strict() => return Err(e),
                    Err(e) => {
                        tracing::debug!("Zero-filling unreadable cluster data at {}: {}", volume_offset, e);
                        target.fill(0);
                    }
                },
                None if self.policy.is_strict() => {
                    return Err(StreamError::BrokenChain { offset: position })
                }
                None => target.fill(0),
            }
            done += count;
        }
        Ok(())
    }
}
