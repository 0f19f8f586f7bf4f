//! Turns directory trees into a snapshot.
//!
//! A file-system walker and a walker over the parent snapshot's trees feed a
//! dispatcher, which merges the two sorted streams and hands files to a pool of
//! file workers and completed directories to a pool of directory workers. All
//! blobs go through one [`BlobSaver`], so each is written at most once per run.

mod blob_saver;
mod walk;
mod workers;

pub use blob_saver::{BlobSaver, KnownBlobs};

use crate::repository::Repository;
use crate::snapshot::Snapshot;
use crate::tree::Node;
use crate::types::{ObjectID, SnapshotID};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tokio::task::JoinError;
use tracing::{debug, info, warn};

/// Called for every entry that cannot be archived. Returning `Ok` records a
/// placeholder and continues; returning an error aborts the run with it.
pub type ErrorHandler = Arc<dyn Fn(&Path, &Error) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiverOptions {
    pub file_workers: usize,
    pub dir_workers: usize,
    /// Chunks being encrypted and saved at any one time.
    pub max_concurrent_blobs: usize,
    /// Milliseconds between index checkpoints; 0 disables them.
    pub checkpoint_interval_ms: u64,
    /// Gitignore-style patterns, matched relative to each backup path.
    pub excludes: Vec<String>,
}

impl Default for ArchiverOptions {
    fn default() -> Self {
        Self {
            file_workers: 2,
            dir_workers: 2,
            max_concurrent_blobs: 8,
            checkpoint_interval_ms: 300_000,
            excludes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotOptions {
    pub parent: Option<SnapshotID>,
    pub tags: Vec<String>,
    pub hostname: Option<String>,
}

/// Stop signal shared by every task of a run.
#[derive(Debug, Clone)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    /// A signal and the sender that raises it.
    pub fn new() -> (watch::Sender<bool>, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (tx, Shutdown(rx))
    }

    /// A signal that is never raised.
    pub fn never() -> Shutdown {
        let (_, rx) = watch::channel(false);
        Shutdown(rx)
    }

    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the signal is raised.
    pub async fn triggered(&self) {
        let mut rx = self.0.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct ArchiveStats {
    pub files_new: AtomicU64,
    pub files_changed: AtomicU64,
    pub files_unchanged: AtomicU64,
    pub dirs: AtomicU64,
    pub deleted: AtomicU64,
    pub bytes_read: AtomicU64,
    pub blobs_written: AtomicU64,
    pub bytes_written: AtomicU64,
    pub errors: AtomicU64,
}

impl ArchiveStats {
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn reset(&self) {
        for counter in [
            &self.files_new,
            &self.files_changed,
            &self.files_unchanged,
            &self.dirs,
            &self.deleted,
            &self.bytes_read,
            &self.blobs_written,
            &self.bytes_written,
            &self.errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn summary(&self) -> ArchiveSummary {
        ArchiveSummary {
            files_new: self.files_new.load(Ordering::Relaxed),
            files_changed: self.files_changed.load(Ordering::Relaxed),
            files_unchanged: self.files_unchanged.load(Ordering::Relaxed),
            dirs: self.dirs.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            blobs_written: self.blobs_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveSummary {
    pub files_new: u64,
    pub files_changed: u64,
    pub files_unchanged: u64,
    pub dirs: u64,
    pub deleted: u64,
    pub bytes_read: u64,
    pub blobs_written: u64,
    pub bytes_written: u64,
    pub errors: u64,
}

/// State shared by the tasks of one run.
pub(crate) struct RunContext {
    pub repo: Arc<Repository>,
    pub saver: Arc<BlobSaver>,
    pub stats: Arc<ArchiveStats>,
    pub handler: ErrorHandler,
    pub stop: Shutdown,
    pub semaphore: Arc<Semaphore>,
    pub chunker: crate::chunker::Chunker,
    stop_tx: watch::Sender<bool>,
    fatal: Mutex<Option<Error>>,
}

impl RunContext {
    /// Records the first real error of the run and stops every task.
    pub fn fail(&self, error: Error) {
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() && !matches!(error, Error::Cancelled) {
                warn!(error = %error, "aborting archive run");
                *fatal = Some(error);
            }
        }
        self.stop_all();
    }

    pub fn stop_all(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn report(&self, path: &Path, error: &Error) -> Result<()> {
        ArchiveStats::add(&self.stats.errors, 1);
        (self.handler)(path, error)
    }

    fn take_fatal(&self) -> Option<Error> {
        self.fatal.lock().take()
    }
}

pub struct Archiver {
    repo: Arc<Repository>,
    options: ArchiverOptions,
    handler: ErrorHandler,
    stats: Arc<ArchiveStats>,
}

impl Archiver {
    pub fn new(repo: Arc<Repository>, options: ArchiverOptions) -> Self {
        Self {
            repo,
            options,
            handler: Arc::new(|path: &Path, error: &Error| {
                warn!(path = %path.display(), error = %error, "skipping entry");
                Ok(())
            }),
            stats: Arc::new(ArchiveStats::default()),
        }
    }

    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.handler = handler;
        self
    }

    /// Live counters of the current run, for progress display.
    pub fn stats(&self) -> Arc<ArchiveStats> {
        self.stats.clone()
    }

    /// Archives `paths` and saves a snapshot of them. Packs, then the index, then
    /// the snapshot record are written; a run that fails or is cancelled writes no
    /// snapshot.
    pub async fn snapshot(
        &self,
        paths: &[PathBuf],
        options: SnapshotOptions,
        shutdown: Shutdown,
    ) -> Result<(Snapshot, ArchiveSummary)> {
        if shutdown.is_triggered() {
            return Err(Error::Cancelled);
        }
        let targets = resolve_targets(paths)?;
        self.stats.reset();
        for (_, root) in &targets {
            walk::build_excludes(root, &self.options.excludes)?;
        }

        let parent_tree = match &options.parent {
            Some(parent) => Some(self.repo.load_snapshot(parent).await?.tree),
            None => None,
        };

        let root = self.run(&targets, parent_tree, shutdown).await?;
        let tree = root
            .subtree
            .ok_or_else(|| Error::Other("root directory produced no tree".to_string()))?;

        self.repo.flush().await?;
        self.repo.save_index().await?;

        let mut snapshot = Snapshot::new(targets.into_iter().map(|(_, p)| p).collect(), tree)
            .with_tags(options.tags)
            .with_excludes(self.options.excludes.clone());
        if let Some(parent) = options.parent {
            snapshot = snapshot.with_parent(parent);
        }
        if let Some(hostname) = options.hostname {
            snapshot = snapshot.with_hostname(hostname);
        }
        self.repo.save_snapshot(&mut snapshot).await?;

        let summary = self.stats.summary();
        info!(
            snapshot = %snapshot.short_id(),
            files_new = summary.files_new,
            files_changed = summary.files_changed,
            files_unchanged = summary.files_unchanged,
            bytes_written = summary.bytes_written,
            errors = summary.errors,
            "snapshot complete"
        );
        Ok((snapshot, summary))
    }

    async fn run(
        &self,
        targets: &[(OsString, PathBuf)],
        parent_tree: Option<ObjectID>,
        shutdown: Shutdown,
    ) -> Result<Node> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let ctx = Arc::new(RunContext {
            repo: self.repo.clone(),
            saver: Arc::new(BlobSaver::new(self.repo.clone(), self.stats.clone())),
            stats: self.stats.clone(),
            handler: self.handler.clone(),
            stop: Shutdown(stop_rx),
            semaphore: Arc::new(Semaphore::new(self.options.max_concurrent_blobs.max(1))),
            chunker: self.repo.chunker()?,
            stop_tx,
            fatal: Mutex::new(None),
        });

        let forward = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                shutdown.triggered().await;
                debug!("archive run cancelled");
                ctx.fail(Error::Cancelled);
            })
        };

        let (new_tx, new_rx) = mpsc::channel(256);
        let (old_tx, old_rx) = mpsc::channel(256);
        let fs_walker = walk::spawn_fs_walker(targets.to_vec(), self.options.excludes.clone(), new_tx);
        let old_walker = walk::spawn_old_walker(self.repo.clone(), parent_tree, old_tx);

        let (file_tx, file_rx) = flume::unbounded();
        let (dir_tx, dir_rx) = flume::unbounded();
        let mut workers = Vec::new();
        for _ in 0..self.options.file_workers.max(1) {
            workers.push(tokio::spawn(workers::file_worker(ctx.clone(), file_rx.clone())));
        }
        for _ in 0..self.options.dir_workers.max(1) {
            workers.push(tokio::spawn(workers::dir_worker(ctx.clone(), dir_rx.clone())));
        }
        drop(file_rx);
        drop(dir_rx);

        let (done_tx, done_rx) = oneshot::channel();
        let checkpoint = match self.options.checkpoint_interval_ms {
            0 => None,
            ms => Some(tokio::spawn(checkpoint_loop(
                ctx.clone(),
                Duration::from_millis(ms),
                done_rx,
            ))),
        };

        let dispatcher = walk::Dispatcher::new(ctx.clone(), new_rx, old_rx, file_tx, dir_tx);
        let result = match dispatcher.run().await {
            Ok(root_rx) => {
                tokio::select! {
                    root = root_rx => root.map_err(|_| Error::Cancelled).and_then(|r| r),
                    _ = ctx.stop.triggered() => Err(Error::Cancelled),
                }
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            debug!(error = %e, "archive run stopped");
            ctx.stop_all();
        }

        let _ = done_tx.send(());
        let mut joined = Vec::new();
        for worker in workers {
            joined.push(("worker", worker.await));
        }
        if let Some(checkpoint) = checkpoint {
            joined.push(("checkpoint", checkpoint.await));
        }
        joined.push(("file walker", fs_walker.await));
        joined.push(("parent walker", old_walker.await));
        forward.abort();
        for (task, outcome) in joined {
            if let Some(error) = panic_error(task, outcome) {
                ctx.fail(error);
            }
        }

        if let Some(fatal) = ctx.take_fatal() {
            return Err(fatal);
        }
        result
    }
}

async fn checkpoint_loop(ctx: Arc<RunContext>, period: Duration, mut done: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match ctx.repo.save_full_index().await {
                    Ok(ids) if !ids.is_empty() => debug!(saved = ids.len(), "index checkpoint"),
                    Ok(_) => {}
                    Err(e) => {
                        ctx.fail(e);
                        return;
                    }
                }
            }
            _ = &mut done => return,
            _ = ctx.stop.triggered() => return,
        }
    }
}

/// A panicked task becomes the run's error; a cancelled one is already accounted for.
fn panic_error(task: &str, outcome: std::result::Result<(), JoinError>) -> Option<Error> {
    match outcome {
        Err(e) if e.is_panic() => Some(Error::Other(format!("archive {} panicked: {}", task, e))),
        _ => None,
    }
}

/// Absolute backup paths paired with the name they get in the root tree, sorted by name.
fn resolve_targets(paths: &[PathBuf]) -> Result<Vec<(OsString, PathBuf)>> {
    if paths.is_empty() {
        return Err(Error::Other("nothing to back up".to_string()));
    }

    let mut targets = Vec::with_capacity(paths.len());
    for path in paths {
        let absolute = std::path::absolute(path)?;
        let name = absolute
            .file_name()
            .unwrap_or(absolute.as_os_str())
            .to_os_string();
        targets.push((name, absolute));
    }
    targets.sort_by(|a, b| a.0.cmp(&b.0));

    for pair in targets.windows(2) {
        if pair[0].0 == pair[1].0 {
            return Err(Error::Other(format!(
                "{} and {} would both be stored as {:?}",
                pair[0].1.display(),
                pair[1].1.display(),
                pair[0].0
            )));
        }
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_targets_sorts_and_rejects_duplicates() {
        let targets =
            resolve_targets(&[PathBuf::from("/tmp/b"), PathBuf::from("/srv/a")]).unwrap();
        let names: Vec<&OsString> = targets.iter().map(|(n, _)| n).collect();
        assert_eq!(names, [&OsString::from("a"), &OsString::from("b")]);

        assert!(resolve_targets(&[PathBuf::from("/x/same"), PathBuf::from("/y/same")]).is_err());
        assert!(resolve_targets(&[]).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_targets_keeps_raw_names() {
        use std::os::unix::ffi::OsStrExt;

        let raw = std::ffi::OsStr::from_bytes(b"dir\xff");
        let targets = resolve_targets(&[Path::new("/tmp").join(raw)]).unwrap();
        assert_eq!(targets[0].0, raw);
    }

    #[tokio::test]
    async fn test_panicked_task_becomes_error() {
        let panicked = tokio::spawn(async { panic!("boom"); }).await;
        let error = panic_error("worker", panicked).unwrap();
        assert!(error.to_string().contains("archive worker panicked"));

        let aborted = tokio::spawn(std::future::pending::<()>());
        aborted.abort();
        assert!(panic_error("worker", aborted.await).is_none());
        assert!(panic_error("worker", Ok(())).is_none());
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let (tx, shutdown) = Shutdown::new();
        assert!(!shutdown.is_triggered());

        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.triggered().await })
        };
        tx.send(true).unwrap();
        waiter.await.unwrap();
        assert!(shutdown.is_triggered());
        assert!(!Shutdown::never().is_triggered());
    }
}
