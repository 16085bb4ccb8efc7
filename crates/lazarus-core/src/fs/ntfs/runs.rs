//! NTFS data runs (mapping pairs)
//!
//! Each run starts with a header byte: the low nibble is the byte count of the
//! run length, the high nibble the byte count of the LCN delta. The length is
//! unsigned, the delta signed and relative to the previous run's LCN. A delta
//! width of zero marks a sparse run. A zero header ends the list.

use thiserror::Error;

/// One contiguous range of virtual clusters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Run {
    Real { vcn: u64, lcn: u64, length: u64 },
    Sparse { vcn: u64, length: u64 },
}

impl Run {
    pub fn vcn(&self) -> u64 {
        match *self {
            Run::Real { vcn, .. } | Run::Sparse { vcn, .. } => vcn,
        }
    }

    pub fn length(&self) -> u64 {
        match *self {
            Run::Real { length, .. } | Run::Sparse { length, .. } => length,
        }
    }

    pub fn lcn(&self) -> Option<u64> {
        match *self {
            Run::Real { lcn, .. } => Some(lcn),
            Run::Sparse { .. } => None,
        }
    }

    /// First VCN past this run
    pub fn end_vcn(&self) -> u64 {
        self.vcn() + self.length()
    }

    pub fn contains(&self, vcn: u64) -> bool {
        vcn >= self.vcn() && vcn < self.end_vcn()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunListError {
    #[error("invalid run header 0x{header:02x} at byte {position}")]
    InvalidHeader { position: usize, header: u8 },
    #[error("run list truncated at byte {position}")]
    Truncated { position: usize },
    #[error("LCN accumulator went negative at VCN {vcn}")]
    NegativeLcn { vcn: u64 },
    #[error("run ending at VCN {end_vcn} passes high VCN {high_vcn}")]
    PastHighVcn { end_vcn: u64, high_vcn: i64 },
    #[error("runs cover {covered} clusters but the attribute declares {declared}")]
    LengthMismatch { covered: u64, declared: u64 },
}

/// Decode a run list for an attribute extent covering `low_vcn..=high_vcn`.
///
/// `high_vcn` is signed because an empty attribute stores -1.
pub fn decode_runs(data: &[u8], low_vcn: u64, high_vcn: i64) -> Result<Vec<Run>, RunListError> {
    let mut runs = Vec::new();
    let mut pos = 0usize;
    let mut vcn = low_vcn;
    let mut lcn: i64 = 0;

    while pos < data.len() {
        let header = data[pos];
        if header == 0 {
            break;
        }

        let length_size = (header & 0x0F) as usize;
        let offset_size = (header >> 4) as usize;
        if length_size == 0 || length_size > 8 || offset_size > 8 {
            return Err(RunListError::InvalidHeader {
                position: pos,
                header,
            });
        }
        if pos + 1 + length_size + offset_size > data.len() {
            return Err(RunListError::Truncated { position: pos });
        }

        let length = read_unsigned(&data[pos + 1..pos + 1 + length_size]);
        if length == 0 {
            return Err(RunListError::InvalidHeader {
                position: pos,
                header,
            });
        }

        let end_vcn = vcn
            .checked_add(length)
            .ok_or(RunListError::PastHighVcn { end_vcn: u64::MAX, high_vcn })?;
        if high_vcn < 0 || end_vcn - 1 > high_vcn as u64 {
            return Err(RunListError::PastHighVcn { end_vcn, high_vcn });
        }

        if offset_size == 0 {
            runs.push(Run::Sparse { vcn, length });
        } else {
            let start = pos + 1 + length_size;
            let delta = read_signed(&data[start..start + offset_size]);
            lcn = lcn
                .checked_add(delta)
                .filter(|value| *value >= 0)
                .ok_or(RunListError::NegativeLcn { vcn })?;
            runs.push(Run::Real {
                vcn,
                lcn: lcn as u64,
                length,
            });
        }

        vcn = end_vcn;
        pos += 1 + length_size + offset_size;
    }

    let covered = vcn - low_vcn;
    let end = match high_vcn.checked_add(1) {
        Some(end) => end.max(0) as u64,
        None => {
            return Err(RunListError::LengthMismatch {
                covered,
                declared: u64::MAX,
            })
        }
    };
    let declared = end - low_vcn.min(end);
    if covered != declared {
        return Err(RunListError::LengthMismatch { covered, declared });
    }

    Ok(runs)
}

fn read_unsigned(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0u64, |value, byte| (value << 8) | *byte as u64)
}

fn read_signed(bytes: &[u8]) -> i64 {
    let raw = read_unsigned(bytes);
    let shift = 64 - 8 * bytes.len() as u32;
    ((raw << shift) as i64) >> shift
}

/// Index of the run containing `vcn`, assuming runs are sorted by VCN
pub fn find_run(runs: &[Run], vcn: u64) -> Option<usize> {
    let index = runs.partition_point(|run| run.end_vcn() <= vcn);
    runs.get(index).filter(|run| run.contains(vcn)).map(|_| index)
}

/// Total clusters covered by a run list
pub fn total_clusters(runs: &[Run]) -> u64 {
    runs.iter().map(Run::length).sum()
}

/// Merge another extent's runs into `runs`, keeping VCN order
pub fn merge_runs(runs: &mut Vec<Run>, extent: &[Run]) {
    runs.extend_from_slice(extent);
    runs.sort_by_key(Run::vcn);
    runs.dedup();
}
