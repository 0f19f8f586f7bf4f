use crate::repository::Repository;
use crate::tree::{Node, NodeType, decode_name};
use crate::types::{BlobType, ObjectID};
use crate::{Error, Result};
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub bytes: u64,
    /// Error placeholders and node types that cannot be recreated.
    pub skipped: u64,
}

/// Writes the contents of a tree back to disk.
pub struct Restorer<'a> {
    repo: &'a Repository,
}

impl<'a> Restorer<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Self { repo }
    }

    /// Recreates everything below `tree` inside `target`.
    pub async fn restore(&self, tree: &ObjectID, target: &Path) -> Result<RestoreSummary> {
        let mut summary = RestoreSummary::default();
        let mut dir_modes = Vec::new();
        let mut stack = vec![(*tree, target.to_path_buf())];
        fs::create_dir_all(target).await?;

        while let Some((tree_id, dir)) = stack.pop() {
            let tree = self.repo.load_tree(&tree_id).await?;
            for node in tree.nodes {
                let name = node.os_name()?;
                check_name(&name)?;
                let path = dir.join(&name);
                if let Some(error) = &node.error {
                    warn!(path = %path.display(), error = %error, "not restoring entry that failed to archive");
                    summary.skipped += 1;
                    continue;
                }

                match node.node_type {
                    NodeType::Dir => {
                        fs::create_dir_all(&path).await?;
                        summary.dirs += 1;
                        dir_modes.push((path.clone(), node.mode));
                        if let Some(subtree) = node.subtree {
                            stack.push((subtree, path));
                        }
                    }
                    NodeType::File => {
                        summary.bytes += self.restore_file(&node, &path).await?;
                        set_mode(&path, node.mode).await?;
                        summary.files += 1;
                    }
                    NodeType::Symlink => {
                        if restore_symlink(&node, &path)? {
                            summary.symlinks += 1;
                        } else {
                            summary.skipped += 1;
                        }
                    }
                    other => {
                        debug!(path = %path.display(), node_type = ?other, "skipping special file");
                        summary.skipped += 1;
                    }
                }
            }
        }

        // deepest first so read-only directories are locked last
        for (path, mode) in dir_modes.into_iter().rev() {
            set_mode(&path, mode).await?;
        }
        Ok(summary)
    }

    async fn restore_file(&self, node: &Node, path: &Path) -> Result<u64> {
        let mut file = fs::File::create(path).await?;
        let mut written = 0u64;
        for id in &node.content {
            let data = self.repo.load_blob(BlobType::Data, id).await?;
            file.write_all(&data).await?;
            written += data.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

/// Node names come from the repository; refuse any that would escape the target.
fn check_name(name: &OsStr) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(single)), None) if single == name => Ok(()),
        _ => Err(Error::Other(format!("refusing to restore entry named {:?}", name))),
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode == 0 {
        return Ok(());
    }
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn restore_symlink(node: &Node, path: &Path) -> Result<bool> {
    match &node.link_target {
        Some(target) => {
            std::os::unix::fs::symlink(decode_name(target)?, path)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

#[cfg(not(unix))]
fn restore_symlink(_node: &Node, _path: &Path) -> Result<bool> {
    Ok(false)
}

/// Every node below `tree` with its path, in walk order.
pub async fn walk_tree(repo: &Repository, tree: &ObjectID) -> Result<Vec<(PathBuf, Node)>> {
    let mut entries = Vec::new();
    let root = repo.load_tree(tree).await?;
    let mut stack = vec![(PathBuf::new(), root.nodes.into_iter())];

    loop {
        let next = match stack.last_mut() {
            Some((prefix, nodes)) => nodes.next().map(|node| (prefix.clone(), node)),
            None => break,
        };
        let Some((prefix, node)) = next else {
            stack.pop();
            continue;
        };
        let path = prefix.join(node.os_name()?);

        let subtree = if node.is_dir() { node.subtree } else { None };
        entries.push((path.clone(), node));
        if let Some(id) = subtree {
            stack.push((path, repo.load_tree(&id).await?.nodes.into_iter()));
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_name_rejects_traversal() {
        assert!(check_name(OsStr::new("file.txt")).is_ok());
        for bad in ["", ".", "..", "a/b", "/etc", "dir/"] {
            assert!(check_name(OsStr::new(bad)).is_err(), "{:?}", bad);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_check_name_accepts_raw_bytes() {
        use std::os::unix::ffi::OsStrExt;
        assert!(check_name(OsStr::from_bytes(b"caf\xe9")).is_ok());
        assert!(check_name(OsStr::new("back\\slash")).is_ok());
    }
}
