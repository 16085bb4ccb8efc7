use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

pub mod config;
pub mod fs;
pub mod recovery;
pub mod scanner;
pub mod search;
pub mod stream;

pub use config::{ReadPolicy, ScanConfig};
pub use fs::common::Device;
pub use fs::node::{FileNode, FolderNode, Node, NodeKind, NodeLocator, NodeMetadata, RecoveryStatus};
pub use fs::partition::Volume;
pub use fs::{open_path, try_load, FileSystem};
pub use recovery::{copy_node, SaveEvent, SaveQueue};
pub use scanner::{ScanError, ScanProgress, ScanState, Scanner};
pub use search::{SearchOutcome, SearchStrategy};
pub use stream::{ByteStream, SharedStream, StreamError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileSystemType {
    Ntfs,
    Fat12,
    Fat16,
    Fat32,
}

impl std::fmt::Display for FileSystemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileSystemType::Ntfs => write!(f, "NTFS"),
            FileSystemType::Fat12 => write!(f, "FAT12"),
            FileSystemType::Fat16 => write!(f, "FAT16"),
            FileSystemType::Fat32 => write!(f, "FAT32"),
        }
    }
}

/// A disk or image opened for recovery, split into its volumes
pub struct Disk {
    pub label: String,
    pub device: Arc<Device>,
    pub volumes: Vec<Volume>,
}

impl Disk {
    /// Open `path` (image file or block device) as disk `index`
    pub fn open(path: &Path, index: usize, policy: ReadPolicy) -> Result<Self> {
        let label = format!("disk{}", index);
        let device = Arc::new(
            Device::open_path(path, policy)
                .with_context(|| format!("opening {}", path.display()))?,
        );
        let volumes = fs::partition::volumes_for_disk(device.clone(), &label)?;
        tracing::info!(
            "{}: {} ({} bytes, {} volume(s))",
            label,
            path.display(),
            device.length(),
            volumes.len()
        );
        Ok(Self {
            label,
            device,
            volumes,
        })
    }

    pub fn volume(&self, label: &str) -> Option<&Volume> {
        self.volumes
            .iter()
            .find(|volume| volume.label.eq_ignore_ascii_case(label))
    }
}

/// Mount every recognised volume of a disk. Volumes that fail to mount are
/// logged and skipped.
pub fn mount_volumes(disk: &Disk, config: &ScanConfig) -> Vec<Arc<dyn FileSystem>> {
    let mut mounted = Vec::new();
    for volume in &disk.volumes {
        match try_load(volume.stream.clone(), &volume.label, config) {
            Ok(Some(fs)) => mounted.push(fs),
            Ok(None) => {}
            Err(e) => tracing::warn!("{}: failed to mount: {:#}", volume.label, e),
        }
    }
    mounted
}
