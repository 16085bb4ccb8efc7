/// Linear scan over every MFT record slot
use anyhow::Result;
use std::sync::Arc;

use super::{SearchOutcome, SearchStrategy, Visitor};
use crate::fs::ntfs::NtfsFileSystem;

/// Visits each base record by number, finding deleted files whose directory
/// entries are long gone
pub struct MftScan {
    fs: Arc<NtfsFileSystem>,
}

impl MftScan {
    pub fn new(fs: Arc<NtfsFileSystem>) -> Self {
        Self { fs }
    }
}

impl SearchStrategy for MftScan {
    fn name(&self) -> &'static str {
        "mft-scan"
    }

    fn description(&self) -> &'static str {
        "Read every MFT record, in use or not"
    }

    fn search(&self, visitor: &mut Visitor<'_>) -> Result<SearchOutcome> {
        let total = self.fs.record_count();
        let mut skipped = 0u64;

        for number in 0..total {
            let record = match self.fs.record(number) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    skipped += 1;
                    tracing::debug!("Record {} unreadable: {}", number, e);
                    continue;
                }
            };
            // Extension records are folded into their base record
            if record.is_extension() {
                continue;
            }

            let meta = self.fs.metadata_for(&record);
            if !visitor(&meta, number + 1, total) {
                return Ok(SearchOutcome::Stopped);
            }
        }

        if skipped > 0 {
            tracing::warn!("{} of {} MFT records could not be read", skipped, total);
        }
        Ok(SearchOutcome::Completed)
    }
}
