/// Background save queue
///
/// Saves run one at a time on a single worker so that reads of the source
/// device are never interleaved.
use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use super::copy_node_with_progress;
use crate::fs::node::NodeMetadata;
use crate::fs::FileSystem;

/// Bytes between two `Progress` events of the same file
const PROGRESS_STEP: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveEvent {
    Progress {
        name: String,
        written: u64,
        total: u64,
    },
    Saved {
        name: String,
        destination: PathBuf,
        bytes: u64,
    },
    Failed {
        name: String,
        destination: PathBuf,
        message: String,
    },
}

struct SaveRequest {
    meta: NodeMetadata,
    destination: PathBuf,
}

pub struct SaveQueue {
    requests: Option<Sender<SaveRequest>>,
    events: Receiver<SaveEvent>,
    pending: Arc<AtomicUsize>,
    worker: Option<thread::JoinHandle<()>>,
}

impl SaveQueue {
    pub fn new(fs: Arc<dyn FileSystem>) -> Result<Self> {
        let (request_tx, request_rx) = crossbeam_channel::unbounded::<SaveRequest>();
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = pending.clone();

        let worker = thread::Builder::new()
            .name("lazarus-save".into())
            .spawn(move || {
                for request in request_rx {
                    let event = save_one(fs.as_ref(), &request, &event_tx);
                    worker_pending.fetch_sub(1, Ordering::SeqCst);
                    let _ = event_tx.send(event);
                }
            })
            .context("spawning save worker")?;

        Ok(Self {
            requests: Some(request_tx),
            events: event_rx,
            pending,
            worker: Some(worker),
        })
    }

    /// Queue `meta` to be written to `destination`
    pub fn enqueue(&self, meta: NodeMetadata, destination: impl Into<PathBuf>) -> Result<()> {
        let sender = self.requests.as_ref().context("save queue is shut down")?;
        self.pending.fetch_add(1, Ordering::SeqCst);
        sender
            .send(SaveRequest {
                meta,
                destination: destination.into(),
            })
            .map_err(|_| {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                anyhow::anyhow!("save worker has exited")
            })
    }

    pub fn events(&self) -> Receiver<SaveEvent> {
        self.events.clone()
    }

    /// Requests queued or in progress
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Finish every queued save, then stop the worker
    pub fn shutdown(&mut self) {
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("Save worker panicked");
            }
        }
    }
}

impl Drop for SaveQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn save_one(fs: &dyn FileSystem, request: &SaveRequest, events: &Sender<SaveEvent>) -> SaveEvent {
    let name = request.meta.display_path().to_string();
    match write_file(fs, request, events) {
        Ok(bytes) => {
            tracing::info!("Saved {} ({} bytes) to {}", name, bytes, request.destination.display());
            SaveEvent::Saved {
                name,
                destination: request.destination.clone(),
                bytes,
            }
        }
        Err(e) => {
            tracing::warn!("Failed to save {}: {:#}", name, e);
            SaveEvent::Failed {
                name,
                destination: request.destination.clone(),
                message: format!("{:#}", e),
            }
        }
    }
}

fn write_file(fs: &dyn FileSystem, request: &SaveRequest, events: &Sender<SaveEvent>) -> Result<u64> {
    if let Some(parent) = request.destination.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let file = File::create(&request.destination)
        .with_context(|| format!("creating {}", request.destination.display()))?;
    let mut out = BufWriter::new(file);

    let name = &request.meta.name;
    let mut reported = 0u64;
    copy_node_with_progress(fs, &request.meta, &mut out, |written, total| {
        if written - reported >= PROGRESS_STEP || written == total {
            reported = written;
            let _ = events.send(SaveEvent::Progress {
                name: name.clone(),
                written,
                total,
            });
        }
    })
}
