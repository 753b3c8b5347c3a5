//! The file sink: one writer thread owning the hierarchical file

use super::template::{walk_template, DeferredLink, StreamPlaceholder};
use crate::nexus_writer::hdf::{absolute_target, HdfError, HdfFile};
use log::{debug, error, info, warn};
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use tokio::sync::oneshot;

/// Queue depth above which partition workers back off before polling again.
pub const DEFAULT_QUEUE_HIGH_WATER: usize = 64 * 1024;

#[derive(Debug)]
pub enum FileSinkError {
    /// The underlying file raised; the sink itself remains usable.
    Hdf(HdfError),
    /// The writer thread has shut down.
    Closed,
    /// A writer module failed during an init or close call.
    Module(String),
}

impl fmt::Display for FileSinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileSinkError::Hdf(err) => write!(f, "file error: {}", err),
            FileSinkError::Closed => write!(f, "file sink is closed"),
            FileSinkError::Module(msg) => write!(f, "writer module error: {}", msg),
        }
    }
}

impl Error for FileSinkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FileSinkError::Hdf(err) => Some(err),
            _ => None,
        }
    }
}

impl From<HdfError> for FileSinkError {
    fn from(err: HdfError) -> Self {
        FileSinkError::Hdf(err)
    }
}

type SinkTask = Box<dyn FnOnce(&mut HdfFile) + Send>;

enum Command {
    Task(SinkTask),
    Flush(oneshot::Sender<Result<(), FileSinkError>>),
    Finalize(oneshot::Sender<Result<(), FileSinkError>>),
}

/// Handle to the single-writer file thread. Cloneable; every producer
/// enqueues through the same channel, so execution order equals enqueue
/// order and writes reach the file on exactly one thread.
#[derive(Clone)]
pub struct FileSink {
    sender: mpsc::Sender<Command>,
    depth: Arc<AtomicUsize>,
    path: PathBuf,
}

impl FileSink {
    /// Creates the file (failing if it already exists), walks the template
    /// to materialise the static tree, then starts the writer thread.
    /// Initialization failure is fatal to the job.
    pub fn initialize(
        file_path: &Path,
        template: &serde_json::Value,
    ) -> Result<(FileSink, Vec<StreamPlaceholder>), FileSinkError> {
        let mut file = HdfFile::create(file_path)?;
        let (placeholders, deferred_links) = walk_template(&mut file, template);
        info!(
            "Initialized file {} with {} stream placeholder(s), {} deferred link(s)",
            file_path.display(),
            placeholders.len(),
            deferred_links.len()
        );

        let (sender, receiver) = mpsc::channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let thread_depth = depth.clone();
        let thread_path = file_path.to_path_buf();
        thread::Builder::new()
            .name("filesink".to_string())
            .spawn(move || writer_loop(file, receiver, deferred_links, thread_depth, thread_path))
            .map_err(|e| {
                FileSinkError::Module(format!("failed to spawn writer thread: {}", e))
            })?;

        Ok((
            FileSink {
                sender,
                depth,
                path: file_path.to_path_buf(),
            },
            placeholders,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of operations enqueued but not yet executed.
    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Enqueues an operation without blocking. The returned future resolves
    /// with the operation's result once the writer thread has executed it;
    /// an operation that raises is captured in its result and the sink
    /// remains usable.
    pub fn submit<R, F>(&self, op: F) -> oneshot::Receiver<Result<R, FileSinkError>>
    where
        R: Send + 'static,
        F: FnOnce(&mut HdfFile) -> Result<R, FileSinkError> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task: SinkTask = Box::new(move |file| {
            let _ = tx.send(op(file));
        });
        self.depth.fetch_add(1, Ordering::Relaxed);
        if self.sender.send(Command::Task(task)).is_err() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            // The receiver observes Closed through the dropped sender.
            debug!("Submit to closed file sink for {}", self.path.display());
        }
        rx
    }

    /// Drains all pending operations and issues a file-level flush.
    pub async fn flush(&self) -> Result<(), FileSinkError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::Flush(tx))
            .map_err(|_| FileSinkError::Closed)?;
        rx.await.map_err(|_| FileSinkError::Closed)?
    }

    /// Closes the file, reopens it read-write and materialises the deferred
    /// links. Terminal: the writer thread exits afterwards.
    pub async fn finalize(&self) -> Result<(), FileSinkError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::Finalize(tx))
            .map_err(|_| FileSinkError::Closed)?;
        rx.await.map_err(|_| FileSinkError::Closed)?
    }
}

fn writer_loop(
    mut file: HdfFile,
    receiver: mpsc::Receiver<Command>,
    deferred_links: Vec<DeferredLink>,
    depth: Arc<AtomicUsize>,
    path: PathBuf,
) {
    debug!("File sink writer thread started for {}", path.display());
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Task(task) => {
                task(&mut file);
                depth.fetch_sub(1, Ordering::Relaxed);
            }
            Command::Flush(reply) => {
                let result = file.save().map_err(FileSinkError::from);
                if let Err(ref e) = result {
                    error!("Flush of {} failed: {}", path.display(), e);
                }
                let _ = reply.send(result);
            }
            Command::Finalize(reply) => {
                let result = finalize(file, &deferred_links, &path);
                let _ = reply.send(result);
                debug!("File sink writer thread for {} exiting", path.display());
                return;
            }
        }
    }
    // All handles dropped without finalize: persist what we have.
    if let Err(e) = file.save() {
        error!("Final save of {} failed: {}", path.display(), e);
    }
}

/// Two-pass finalize: write the tree out and close it, reopen read-write,
/// then resolve every deferred link against the now-complete tree.
fn finalize(file: HdfFile, deferred_links: &[DeferredLink], path: &Path) -> Result<(), FileSinkError> {
    file.save()?;
    drop(file);

    let mut reopened = HdfFile::open(path)?;
    for link in deferred_links {
        let target = absolute_target(&link.parent, &link.target);
        match reopened.add_link(&link.parent, &link.name, &target) {
            Ok(()) => debug!("Resolved link {}/{} -> {}", link.parent, link.name, target),
            Err(e) => warn!(
                "Could not resolve link {}/{} -> {}: {}",
                link.parent, link.name, link.target, e
            ),
        }
    }
    reopened.save()?;
    info!("Finalized file {}", path.display());
    Ok(())
}
