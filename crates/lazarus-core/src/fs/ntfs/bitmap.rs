/// Volume cluster allocation bitmap ($Bitmap)
use super::runs::Run;
use crate::fs::node::RecoveryStatus;

#[derive(Debug, Clone)]
pub struct ClusterBitmap {
    bits: Vec<u8>,
    clusters: u64,
}

impl ClusterBitmap {
    pub fn new(bits: Vec<u8>, clusters: u64) -> Self {
        Self { bits, clusters }
    }

    pub fn cluster_count(&self) -> u64 {
        self.clusters
    }

    /// Clusters outside the bitmap count as allocated
    pub fn is_allocated(&self, lcn: u64) -> bool {
        if lcn >= self.clusters {
            return true;
        }
        match self.bits.get((lcn / 8) as usize) {
            Some(byte) => byte & (1 << (lcn % 8)) != 0,
            None => true,
        }
    }

    pub fn free_clusters(&self) -> u64 {
        (0..self.clusters).filter(|lcn| !self.is_allocated(*lcn)).count() as u64
    }

    /// Classify a deleted attribute's runs against current allocation
    pub fn classify(&self, runs: &[Run]) -> RecoveryStatus {
        let mut any_free = false;
        let mut any_allocated = false;

        for run in runs {
            let Run::Real { lcn, length, .. } = *run else {
                continue;
            };
            let end = lcn.saturating_add(length);
            // Whatever lies past the bitmap is allocated without looking
            if end > self.clusters {
                any_allocated = true;
            }
            for cluster in lcn.min(self.clusters)..end.min(self.clusters) {
                if self.is_allocated(cluster) {
                    any_allocated = true;
                } else {
                    any_free = true;
                }
                if any_free && any_allocated {
                    return RecoveryStatus::PartiallyRecoverable;
                }
            }
        }

        match (any_free, any_allocated) {
            (_, false) => RecoveryStatus::ProbablyRecoverable,
            (false, true) => RecoveryStatus::Overwritten,
            (true, true) => RecoveryStatus::PartiallyRecoverable,
        }
    }
}
