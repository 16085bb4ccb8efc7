/// Copying recovered file contents out of a volume
use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

pub mod queue;

pub use queue::{SaveEvent, SaveQueue};

use crate::fs::node::{Node, NodeMetadata};
use crate::fs::FileSystem;

/// Bytes read from the volume per write
pub const COPY_CHUNK: usize = 64 * 1024;

/// Write a file node's contents to `out`, calling `on_progress(written, total)`
/// after every chunk. Returns the number of bytes written.
pub fn copy_node_with_progress<W: Write>(
    fs: &dyn FileSystem,
    meta: &NodeMetadata,
    out: &mut W,
    mut on_progress: impl FnMut(u64, u64),
) -> Result<u64> {
    let Node::File(file) = fs.resolve(meta)? else {
        anyhow::bail!("{} is a folder", meta.display_path());
    };

    let total = file.len();
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut written = 0u64;
    while written < total {
        let count = (total - written).min(COPY_CHUNK as u64) as usize;
        file.read_at(written, &mut buf[..count])
            .with_context(|| format!("reading {} at offset {}", meta.display_path(), written))?;
        out.write_all(&buf[..count])?;
        written += count as u64;
        on_progress(written, total);
    }
    out.flush()?;
    Ok(written)
}

pub fn copy_node<W: Write>(fs: &dyn FileSystem, meta: &NodeMetadata, out: &mut W) -> Result<u64> {
    copy_node_with_progress(fs, meta, out, |_, _| {})
}

/// File name to save a node under; characters no host filesystem accepts
/// are replaced
pub fn recovery_file_name(meta: &NodeMetadata) -> String {
    let name: String = meta
        .name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let name = name.trim().trim_matches('.').to_string();
    if name.is_empty() {
        format!("recovered_file_{}", meta.id)
    } else {
        name
    }
}

/// Destination inside `output_dir` that does not overwrite an earlier save
pub fn recovery_path(output_dir: &Path, meta: &NodeMetadata) -> PathBuf {
    let name = recovery_file_name(meta);
    let candidate = output_dir.join(&name);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, extension) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{}", ext)),
        _ => (name.clone(), String::new()),
    };
    (1..)
        .map(|n| output_dir.join(format!("{} ({}){}", stem, n, extension)))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}
