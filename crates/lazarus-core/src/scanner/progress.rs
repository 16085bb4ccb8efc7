/// Progress messages sent from the scan worker
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum ScanProgress {
    Started {
        scan_id: Uuid,
        strategy: &'static str,
    },
    /// Periodic update; `fraction` is 0 when the strategy cannot tell its total
    Progress {
        fraction: f64,
        visited: u64,
        found: usize,
    },
    Finished {
        found: usize,
        duration: Duration,
    },
    Cancelled {
        found: usize,
    },
    /// The strategy itself failed; results gathered so far are kept
    Failed {
        message: String,
    },
}

impl ScanProgress {
    /// Whether this is the last message of a scan
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ScanProgress::Finished { .. } | ScanProgress::Cancelled { .. } | ScanProgress::Failed { .. }
        )
    }
}
