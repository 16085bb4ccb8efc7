/// Scanner module: background search for deleted files.
///
/// One worker thread runs a search strategy against a mounted filesystem,
/// collects deleted entries into a shared list and reports progress over a
/// bounded channel. Once a scan completes, paths the strategy could not know
/// are rebuilt from recorded parent links.
pub mod paths;
pub mod progress;

pub use paths::PathResolver;
pub use progress::ScanProgress;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::config::ScanConfig;
use crate::fs::node::NodeMetadata;
use crate::fs::FileSystem;
use crate::search::{select_strategy, SearchOutcome, SearchStrategy};
use crate::FileSystemType;

/// Progress messages that may queue before the worker starts dropping
/// periodic updates. Final messages are always delivered.
pub const PROGRESS_CHANNEL_CAPACITY: usize = 1_024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
    Finished,
    Cancelled,
    Failed,
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("a scan is already running")]
    AlreadyScanning,
    #[error("no search strategy named {0:?}")]
    UnknownStrategy(String),
    #[error("filesystem offers no search strategy")]
    NoStrategy,
    #[error("failed to spawn scan worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Cooperative cancellation flag shared with the worker
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

pub struct Scanner {
    fs: Arc<dyn FileSystem>,
    config: ScanConfig,
    state: Arc<Mutex<ScanState>>,
    results: Arc<Mutex<Vec<NodeMetadata>>>,
    cancel: CancelToken,
    progress_tx: Sender<ScanProgress>,
    progress_rx: Receiver<ScanProgress>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Scanner {
    pub fn new(fs: Arc<dyn FileSystem>, config: ScanConfig) -> Self {
        let (progress_tx, progress_rx) = crossbeam_channel::bounded(PROGRESS_CHANNEL_CAPACITY);
        Self {
            fs,
            config,
            state: Arc::new(Mutex::new(ScanState::Idle)),
            results: Arc::new(Mutex::new(Vec::new())),
            cancel: CancelToken::default(),
            progress_tx,
            progress_rx,
            worker: Mutex::new(None),
        }
    }

    pub fn filesystem(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    pub fn state(&self) -> ScanState {
        *self.state.lock()
    }

    /// Copy of the deleted entries found so far
    pub fn deleted_files(&self) -> Vec<NodeMetadata> {
        self.results.lock().clone()
    }

    pub fn progress(&self) -> Receiver<ScanProgress> {
        self.progress_rx.clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Ask the worker to stop at its next visited node
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Start the configured strategy, or the filesystem's default
    pub fn start_scan(&self) -> Result<Uuid, ScanError> {
        let name = self.config.strategy.as_deref();
        let strategy = select_strategy(self.fs.clone(), name).ok_or_else(|| match name {
            Some(name) => ScanError::UnknownStrategy(name.to_string()),
            None => ScanError::NoStrategy,
        })?;
        self.start_scan_with(strategy)
    }

    pub fn start_scan_with(&self, strategy: Box<dyn SearchStrategy>) -> Result<Uuid, ScanError> {
        let mut state = self.state.lock();
        if *state == ScanState::Scanning {
            return Err(ScanError::AlreadyScanning);
        }
        if let Some(previous) = self.worker.lock().take() {
            let _ = previous.join();
        }

        let scan_id = Uuid::new_v4();
        // Leftovers from the previous scan would read as this scan's messages
        while self.progress_rx.try_recv().is_ok() {}
        self.results.lock().clear();
        self.cancel.reset();

        let job = ScanJob {
            scan_id,
            strategy,
            root_id: self.fs.root_id(),
            fs_type: self.fs.fs_type(),
            config: self.config.clone(),
            state: self.state.clone(),
            results: self.results.clone(),
            cancel: self.cancel.clone(),
            progress: self.progress_tx.clone(),
            backlog: self.progress_rx.clone(),
        };

        let handle = thread::Builder::new()
            .name(format!("lazarus-scan-{}", self.fs.label()))
            .spawn(move || job.run())?;

        *state = ScanState::Scanning;
        *self.worker.lock() = Some(handle);
        Ok(scan_id)
    }

    /// Block until the current worker exits
    pub fn wait(&self) -> ScanState {
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::warn!("Scan worker panicked");
                *self.state.lock() = ScanState::Failed;
            }
        }
        self.state()
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.worker.get_mut().take() {
            let _ = handle.join();
        }
    }
}

/// Everything the worker thread owns
struct ScanJob {
    scan_id: Uuid,
    strategy: Box<dyn SearchStrategy>,
    root_id: u64,
    fs_type: FileSystemType,
    config: ScanConfig,
    state: Arc<Mutex<ScanState>>,
    results: Arc<Mutex<Vec<NodeMetadata>>>,
    cancel: CancelToken,
    progress: Sender<ScanProgress>,
    backlog: Receiver<ScanProgress>,
}

impl ScanJob {
    fn run(self) {
        let started = Instant::now();
        info!("Scan {} started with strategy {}", self.scan_id, self.strategy.name());
        self.deliver(ScanProgress::Started {
            scan_id: self.scan_id,
            strategy: self.strategy.name(),
        });

        let mut resolver = PathResolver::new(self.root_id, self.fs_type == FileSystemType::Ntfs);
        let interval = self.config.progress_interval.max(1);
        let mut visited = 0u64;

        let searched = panic::catch_unwind(AssertUnwindSafe(|| {
            self.strategy.search(&mut |meta, current, total| {
                if self.cancel.is_cancelled() {
                    return false;
                }
                visited += 1;
                resolver.record(meta);

                if meta.deleted && !meta.name.is_empty() && !self.config.is_noise(&meta.name) {
                    self.results.lock().push(meta.clone());
                }

                if visited % interval == 0 {
                    let fraction = if total > 0 {
                        (current as f64 / total as f64).min(1.0)
                    } else {
                        0.0
                    };
                    let found = self.results.lock().len();
                    let _ = self.progress.try_send(ScanProgress::Progress {
                        fraction,
                        visited,
                        found,
                    });
                }
                !self.cancel.is_cancelled()
            })
        }));
        let outcome = searched.unwrap_or_else(|payload| {
            Err(anyhow::anyhow!(
                "strategy {} panicked: {}",
                self.strategy.name(),
                panic_message(payload.as_ref())
            ))
        });

        let (final_state, message) = match outcome {
            Ok(SearchOutcome::Completed) if !self.cancel.is_cancelled() => {
                let mut results = self.results.lock();
                resolver.resolve_all(&mut results);
                let found = results.len();
                info!(
                    "Scan {} finished: {} deleted entries among {} visited in {:.2?}",
                    self.scan_id,
                    found,
                    visited,
                    started.elapsed()
                );
                (
                    ScanState::Finished,
                    ScanProgress::Finished {
                        found,
                        duration: started.elapsed(),
                    },
                )
            }
            Ok(_) => {
                let found = self.results.lock().len();
                info!("Scan {} cancelled after {} nodes", self.scan_id, visited);
                (ScanState::Cancelled, ScanProgress::Cancelled { found })
            }
            Err(e) => {
                tracing::error!("Scan {} failed: {:#}", self.scan_id, e);
                (
                    ScanState::Failed,
                    ScanProgress::Failed {
                        message: format!("{:#}", e),
                    },
                )
            }
        };

        *self.state.lock() = final_state;
        self.deliver(message);
    }

    /// Send a message that must not be lost, evicting the oldest queued
    /// update when nobody is draining the channel
    fn deliver(&self, message: ScanProgress) {
        let mut message = message;
        loop {
            match self.progress.try_send(message) {
                Ok(()) => return,
                Err(TrySendError::Full(returned)) => {
                    let _ = self.backlog.try_recv();
                    message = returned;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
