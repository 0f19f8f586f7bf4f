use super::workers::{DirJob, FileJob, NodeResult};
use super::{ArchiveStats, RunContext};
use crate::repository::Repository;
use crate::tree::{Node, NodeType, encode_name};
use crate::types::ObjectID;
use crate::{Error, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::cmp::Ordering;
use std::ffi::{OsStr, OsString};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Item of the file-system stream. Paths are relative to the snapshot root:
/// the first component is the name of the backup path.
pub(crate) enum WalkItem {
    Entry(FsEntry),
    Error { path: PathBuf, error: Error },
}

pub(crate) struct FsEntry {
    pub logical: PathBuf,
    pub fs_path: PathBuf,
    pub depth: usize,
    pub metadata: Metadata,
}

pub(crate) struct OldEntry {
    pub logical: PathBuf,
    pub node: Node,
}

pub(crate) fn build_excludes(root: &Path, patterns: &[String]) -> Result<Gitignore> {
    let mut builder = GitignoreBuilder::new(root);
    for pattern in patterns {
        builder
            .add_line(None, pattern)
            .map_err(|e| Error::Other(format!("invalid exclude pattern {:?}: {}", pattern, e)))?;
    }
    builder
        .build()
        .map_err(|e| Error::Other(format!("invalid exclude patterns: {}", e)))
}

fn walk_error(error: walkdir::Error) -> (PathBuf, Error) {
    let path = error.path().map(Path::to_path_buf).unwrap_or_default();
    let message = error.to_string();
    let error = match error.into_io_error() {
        Some(io) => Error::Io(io),
        None => Error::Other(message),
    };
    (path, error)
}

/// Walks every backup path in order on a blocking thread. Stops when the
/// receiver goes away.
pub(crate) fn spawn_fs_walker(
    targets: Vec<(OsString, PathBuf)>,
    excludes: Vec<String>,
    tx: mpsc::Sender<WalkItem>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        for (name, root) in targets {
            if !walk_target(&name, &root, &excludes, &tx) {
                debug!("file walker stopped");
                return;
            }
        }
    })
}

fn walk_target(name: &OsStr, root: &Path, excludes: &[String], tx: &mpsc::Sender<WalkItem>) -> bool {
    let matcher = match build_excludes(root, excludes) {
        Ok(matcher) => matcher,
        Err(error) => {
            return tx
                .blocking_send(WalkItem::Error {
                    path: root.to_path_buf(),
                    error,
                })
                .is_ok();
        }
    };

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !matcher
                    .matched(entry.path(), entry.file_type().is_dir())
                    .is_ignore()
        });

    for entry in walker {
        let item = match entry {
            Ok(entry) => match entry.metadata() {
                Ok(metadata) => {
                    let mut logical = PathBuf::from(name);
                    if let Ok(relative) = entry.path().strip_prefix(root) {
                        logical.push(relative);
                    }
                    WalkItem::Entry(FsEntry {
                        logical,
                        fs_path: entry.path().to_path_buf(),
                        depth: entry.depth() + 1,
                        metadata,
                    })
                }
                Err(e) => {
                    let (_, error) = walk_error(e);
                    WalkItem::Error {
                        path: entry.path().to_path_buf(),
                        error,
                    }
                }
            },
            Err(e) => {
                let (path, error) = walk_error(e);
                WalkItem::Error { path, error }
            }
        };
        if tx.blocking_send(item).is_err() {
            return false;
        }
    }
    true
}

/// Walks the parent snapshot's trees in the same order as the file walker.
/// Subtrees that fail to load are skipped; their entries then count as new.
pub(crate) fn spawn_old_walker(
    repo: Arc<Repository>,
    root: Option<ObjectID>,
    tx: mpsc::Sender<OldEntry>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(root) = root else {
            return;
        };
        let tree = match repo.load_tree(&root).await {
            Ok(tree) => tree,
            Err(e) => {
                warn!(tree = %root.short_string(), error = %e, "cannot load parent tree");
                return;
            }
        };

        let mut stack = vec![(PathBuf::new(), tree.nodes.into_iter())];
        loop {
            let next = match stack.last_mut() {
                Some((prefix, nodes)) => nodes.next().map(|node| (prefix.clone(), node)),
                None => break,
            };
            let Some((prefix, node)) = next else {
                stack.pop();
                continue;
            };
            let logical = match node.os_name() {
                Ok(name) => prefix.join(name),
                Err(e) => {
                    warn!(path = %prefix.display(), error = %e, "skipping parent entry with bad name");
                    continue;
                }
            };

            let subtree = if node.is_dir() { node.subtree } else { None };
            if tx
                .send(OldEntry {
                    logical: logical.clone(),
                    node,
                })
                .await
                .is_err()
            {
                return;
            }

            if let Some(id) = subtree {
                match repo.load_tree(&id).await {
                    Ok(tree) => stack.push((logical, tree.nodes.into_iter())),
                    Err(e) => {
                        warn!(path = %logical.display(), error = %e, "cannot load parent subtree")
                    }
                }
            }
        }
    })
}

struct PendingDir {
    depth: usize,
    node: Node,
    tx: oneshot::Sender<NodeResult>,
    children: Vec<oneshot::Receiver<NodeResult>>,
}

/// Merges the new and old streams and turns entries into jobs.
pub(crate) struct Dispatcher {
    ctx: Arc<RunContext>,
    new_rx: mpsc::Receiver<WalkItem>,
    old_rx: mpsc::Receiver<OldEntry>,
    file_tx: flume::Sender<FileJob>,
    dir_tx: flume::Sender<DirJob>,
}

impl Dispatcher {
    pub fn new(
        ctx: Arc<RunContext>,
        new_rx: mpsc::Receiver<WalkItem>,
        old_rx: mpsc::Receiver<OldEntry>,
        file_tx: flume::Sender<FileJob>,
        dir_tx: flume::Sender<DirJob>,
    ) -> Self {
        Self {
            ctx,
            new_rx,
            old_rx,
            file_tx,
            dir_tx,
        }
    }

    /// Dispatches every entry and returns the receiver for the root directory node.
    pub async fn run(mut self) -> Result<oneshot::Receiver<NodeResult>> {
        let (root_tx, root_rx) = oneshot::channel();
        let mut stack = vec![PendingDir {
            depth: 0,
            node: Node::new("", NodeType::Dir),
            tx: root_tx,
            children: Vec::new(),
        }];

        let mut next_old = self.recv_old().await?;
        loop {
            let item = tokio::select! {
                item = self.new_rx.recv() => item,
                _ = self.ctx.stop.triggered() => return Err(Error::Cancelled),
            };
            let entry = match item {
                None => break,
                Some(WalkItem::Error { path, error }) => {
                    self.ctx.report(&path, &error)?;
                    continue;
                }
                Some(WalkItem::Entry(entry)) => entry,
            };

            let mut old = None;
            while let Some(candidate) = next_old.take() {
                match candidate.logical.cmp(&entry.logical) {
                    Ordering::Less => {
                        ArchiveStats::add(&self.ctx.stats.deleted, 1);
                        next_old = self.recv_old().await?;
                    }
                    Ordering::Equal => {
                        old = Some(candidate.node);
                        next_old = self.recv_old().await?;
                        break;
                    }
                    Ordering::Greater => {
                        next_old = Some(candidate);
                        break;
                    }
                }
            }

            self.close_dirs(&mut stack, entry.depth)?;
            self.dispatch(&mut stack, entry, old)?;
        }

        while next_old.is_some() {
            ArchiveStats::add(&self.ctx.stats.deleted, 1);
            next_old = self.recv_old().await?;
        }

        self.close_dirs(&mut stack, 0)?;
        Ok(root_rx)
    }

    async fn recv_old(&mut self) -> Result<Option<OldEntry>> {
        tokio::select! {
            entry = self.old_rx.recv() => Ok(entry),
            _ = self.ctx.stop.triggered() => Err(Error::Cancelled),
        }
    }

    /// Emits jobs for every open directory at `depth` or deeper; they are complete.
    fn close_dirs(&self, stack: &mut Vec<PendingDir>, depth: usize) -> Result<()> {
        while stack.last().is_some_and(|dir| dir.depth >= depth) {
            let Some(dir) = stack.pop() else { break };
            self.dir_tx
                .send(DirJob {
                    is_root: dir.depth == 0,
                    node: dir.node,
                    tx: dir.tx,
                    children: dir.children,
                })
                .map_err(|_| Error::Cancelled)?;
        }
        Ok(())
    }

    fn dispatch(&self, stack: &mut Vec<PendingDir>, entry: FsEntry, old: Option<Node>) -> Result<()> {
        let name = entry.logical.file_name().map(encode_name).unwrap_or_default();

        let node = match Node::from_fs(name.clone(), &entry.fs_path, &entry.metadata) {
            Ok(node) => node,
            Err(e) => {
                self.ctx.report(&entry.fs_path, &e)?;
                let file_type = entry.metadata.file_type();
                let node_type = if file_type.is_dir() {
                    NodeType::Dir
                } else if file_type.is_symlink() {
                    NodeType::Symlink
                } else {
                    NodeType::File
                };
                Node::with_error(name, node_type, &e)
            }
        };

        let (tx, rx) = oneshot::channel();
        let parent = stack
            .last_mut()
            .ok_or_else(|| Error::Other(format!("no parent for {}", entry.logical.display())))?;
        parent.children.push(rx);

        if node.error.is_some() && !node.is_dir() {
            let _ = tx.send(Ok(node));
            return Ok(());
        }

        match node.node_type {
            NodeType::File => self
                .file_tx
                .send(FileJob {
                    fs_path: entry.fs_path,
                    node,
                    old,
                    tx,
                })
                .map_err(|_| Error::Cancelled),
            NodeType::Dir => {
                stack.push(PendingDir {
                    depth: entry.depth,
                    node,
                    tx,
                    children: Vec::new(),
                });
                Ok(())
            }
            _ => {
                let _ = tx.send(Ok(node));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_order_matches_preorder() {
        // "a/b" sorts before "a.txt" component-wise, as a pre-order walk emits it
        let mut paths = vec![
            PathBuf::from("a.txt"),
            PathBuf::from("a/b"),
            PathBuf::from("a"),
            PathBuf::from("a/b/c"),
            PathBuf::from("b"),
        ];
        paths.sort();
        let expected: Vec<PathBuf> = ["a", "a/b", "a/b/c", "a.txt", "b"]
            .iter()
            .map(PathBuf::from)
            .collect();
        assert_eq!(paths, expected);
    }

    #[test]
    fn test_excludes_match_relative_to_root() {
        let matcher = build_excludes(
            Path::new("/backup"),
            &["*.log".to_string(), "/cache".to_string()],
        )
        .unwrap();
        assert!(matcher.matched("/backup/app/x.log", false).is_ignore());
        assert!(matcher.matched("/backup/cache", true).is_ignore());
        assert!(!matcher.matched("/backup/app/cache", true).is_ignore());
        assert!(!matcher.matched("/backup/app/x.txt", false).is_ignore());
    }

    #[tokio::test]
    async fn test_fs_walker_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("src");
        std::fs::create_dir_all(root.join("a/b")).unwrap();
        std::fs::write(root.join("a.txt"), b"1").unwrap();
        std::fs::write(root.join("a/b/c"), b"2").unwrap();
        std::fs::write(root.join("skip.log"), b"3").unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let handle = spawn_fs_walker(
            vec![(OsString::from("src"), root.clone())],
            vec!["*.log".to_string()],
            tx,
        );

        let mut seen = Vec::new();
        while let Some(item) = rx.recv().await {
            if let WalkItem::Entry(entry) = item {
                seen.push((entry.logical, entry.depth));
            }
        }
        handle.await.unwrap();

        let expected: Vec<(PathBuf, usize)> = vec![
            (PathBuf::from("src"), 1),
            (PathBuf::from("src/a"), 2),
            (PathBuf::from("src/a/b"), 3),
            (PathBuf::from("src/a/b/c"), 4),
            (PathBuf::from("src/a.txt"), 2),
        ];
        assert_eq!(seen, expected);
    }
}
