use super::{ArchiveStats, RunContext};
use crate::chunker::Chunk;
use crate::tree::{Node, Tree};
use crate::types::{BlobType, ObjectID};
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

pub(crate) type NodeResult = Result<Node>;

pub(crate) struct FileJob {
    pub fs_path: PathBuf,
    pub node: Node,
    pub old: Option<Node>,
    pub tx: oneshot::Sender<NodeResult>,
}

/// A directory whose entries have all been dispatched. The receivers are in
/// walk order.
pub(crate) struct DirJob {
    pub is_root: bool,
    pub node: Node,
    pub tx: oneshot::Sender<NodeResult>,
    pub children: Vec<oneshot::Receiver<NodeResult>>,
}

/// Chunks read ahead of the saver per file.
const READ_AHEAD: usize = 4;

pub(crate) async fn file_worker(ctx: Arc<RunContext>, jobs: flume::Receiver<FileJob>) {
    loop {
        let job = tokio::select! {
            job = jobs.recv_async() => match job {
                Ok(job) => job,
                Err(_) => break,
            },
            _ = ctx.stop.triggered() => break,
        };

        let FileJob {
            fs_path,
            node,
            old,
            tx,
        } = job;
        match archive_file(&ctx, &fs_path, node, old.as_ref()).await {
            Ok(node) => {
                let _ = tx.send(Ok(node));
            }
            Err(e) => {
                ctx.fail(e);
                let _ = tx.send(Err(Error::Cancelled));
                break;
            }
        }
    }
}

pub(crate) async fn dir_worker(ctx: Arc<RunContext>, jobs: flume::Receiver<DirJob>) {
    loop {
        let job = tokio::select! {
            job = jobs.recv_async() => match job {
                Ok(job) => job,
                Err(_) => break,
            },
            _ = ctx.stop.triggered() => break,
        };

        let DirJob {
            is_root,
            node,
            tx,
            children,
        } = job;
        match archive_dir(&ctx, node, is_root, children).await {
            Ok(node) => {
                let _ = tx.send(Ok(node));
            }
            Err(e) => {
                ctx.fail(e);
                let _ = tx.send(Err(Error::Cancelled));
                break;
            }
        }
    }
}

/// Produces the node for a regular file, reusing the parent's content when the
/// file is unchanged and its blobs are still stored. Read failures become error
/// nodes through the error handler; save failures are returned.
async fn archive_file(
    ctx: &RunContext,
    path: &Path,
    mut node: Node,
    old: Option<&Node>,
) -> Result<Node> {
    if let Some(old) = old {
        if node.content_unchanged(old) {
            match ctx.saver.first_missing_blob(&old.content).await? {
                None => {
                    trace!(path = %path.display(), "unchanged");
                    node.content = old.content.clone();
                    ArchiveStats::add(&ctx.stats.files_unchanged, 1);
                    return Ok(node);
                }
                Some(id) => {
                    ctx.report(
                        path,
                        &Error::BlobNotFound {
                            id,
                            blob_type: BlobType::Data,
                        },
                    )?;
                    debug!(path = %path.display(), "stored content incomplete, rechunking");
                }
            }
        }
    }

    match chunk_file(ctx, path).await? {
        Ok(content) => {
            node.content = content;
            let counter = if old.is_some() {
                &ctx.stats.files_changed
            } else {
                &ctx.stats.files_new
            };
            ArchiveStats::add(counter, 1);
            Ok(node)
        }
        Err(read_error) => {
            ctx.report(path, &read_error)?;
            node.content.clear();
            node.error = Some(read_error.to_string());
            Ok(node)
        }
    }
}

/// Streams the file through the chunker and saves each chunk. The outer result
/// carries save failures and cancellation, the inner one read failures.
async fn chunk_file(ctx: &RunContext, path: &Path) -> Result<std::result::Result<Vec<ObjectID>, Error>> {
    let chunker = ctx.chunker;
    let (tx, mut rx) = mpsc::channel::<Result<Chunk>>(READ_AHEAD);
    let reader_path = path.to_path_buf();
    let reader = tokio::task::spawn_blocking(move || {
        let file = match std::fs::File::open(&reader_path) {
            Ok(file) => file,
            Err(e) => {
                let _ = tx.blocking_send(Err(e.into()));
                return;
            }
        };
        for chunk in chunker.stream(std::io::BufReader::new(file)) {
            let failed = chunk.is_err();
            if tx.blocking_send(chunk).is_err() || failed {
                return;
            }
        }
    });

    let mut pending: Vec<JoinHandle<Result<ObjectID>>> = Vec::new();
    let mut read_error = None;
    loop {
        let next = tokio::select! {
            next = rx.recv() => next,
            _ = ctx.stop.triggered() => return cancel(pending),
        };
        let chunk = match next {
            None => break,
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                read_error = Some(e);
                break;
            }
        };
        ArchiveStats::add(&ctx.stats.bytes_read, chunk.data.len() as u64);

        let permit = tokio::select! {
            permit = ctx.semaphore.clone().acquire_owned() => permit.map_err(|_| Error::Cancelled)?,
            _ = ctx.stop.triggered() => return cancel(pending),
        };
        let saver = ctx.saver.clone();
        pending.push(tokio::spawn(async move {
            let _permit = permit;
            saver.save(BlobType::Data, chunk.data).await
        }));
    }
    drop(rx);
    reader
        .await
        .map_err(|e| Error::Other(format!("file reader failed: {}", e)))?;

    let mut content = Vec::with_capacity(pending.len());
    for handle in pending {
        let id = handle
            .await
            .map_err(|e| Error::Other(format!("blob save failed: {}", e)))??;
        content.push(id);
    }

    Ok(match read_error {
        Some(e) => Err(e),
        None => Ok(content),
    })
}

fn cancel<T>(pending: Vec<JoinHandle<Result<ObjectID>>>) -> Result<T> {
    for handle in pending {
        handle.abort();
    }
    Err(Error::Cancelled)
}

/// Waits for every child, then saves the directory's tree.
async fn archive_dir(
    ctx: &RunContext,
    mut node: Node,
    is_root: bool,
    children: Vec<oneshot::Receiver<NodeResult>>,
) -> Result<Node> {
    let mut tree = Tree::new();
    for child in children {
        let child = tokio::select! {
            child = child => child.map_err(|_| Error::Cancelled)??,
            _ = ctx.stop.triggered() => return Err(Error::Cancelled),
        };
        tree.insert(child)?;
    }

    let id = ctx.saver.save(BlobType::Tree, tree.to_json()?).await?;
    node.subtree = Some(id);
    if !is_root {
        ArchiveStats::add(&ctx.stats.dirs, 1);
    }
    Ok(node)
}
