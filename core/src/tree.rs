use crate::types::ObjectID;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::ffi::{OsStr, OsString};
use std::fs::Metadata;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    File,
    Dir,
    Symlink,
    Dev,
    CharDev,
    Fifo,
    Socket,
}

/// Metadata of one directory entry. Files carry their content blob IDs, directories
/// the ID of their subtree blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// File name in the form produced by [`encode_name`].
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub mode: u32,
    pub mtime: DateTime<Utc>,
    pub ctime: DateTime<Utc>,
    pub uid: u32,
    pub gid: u32,
    pub inode: u64,
    pub device_id: u64,
    pub size: u64,
    /// Encoded like `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ObjectID>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtree: Option<ObjectID>,
    /// Set on placeholder nodes for entries that could not be archived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Node {
    pub fn new(name: impl Into<String>, node_type: NodeType) -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Self {
            name: name.into(),
            node_type,
            mode: 0,
            mtime: epoch,
            ctime: epoch,
            uid: 0,
            gid: 0,
            inode: 0,
            device_id: 0,
            size: 0,
            link_target: None,
            content: Vec::new(),
            subtree: None,
            error: None,
        }
    }

    /// Captures the portable metadata of `path`. Content and subtree are filled in later.
    pub fn from_fs(name: impl Into<String>, path: &Path, metadata: &Metadata) -> Result<Self> {
        let file_type = metadata.file_type();
        let node_type = node_type_of(&file_type);
        let mut node = Node::new(name, node_type);

        if let Ok(modified) = metadata.modified() {
            node.mtime = modified.into();
        }
        node.ctime = node.mtime;

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            node.mode = metadata.mode();
            node.uid = metadata.uid();
            node.gid = metadata.gid();
            node.inode = metadata.ino();
            node.device_id = metadata.dev();
            if let Some(ctime) = DateTime::from_timestamp(metadata.ctime(), metadata.ctime_nsec() as u32) {
                node.ctime = ctime;
            }
        }
        #[cfg(not(unix))]
        {
            node.mode = if metadata.permissions().readonly() { 0o444 } else { 0o644 };
        }

        match node_type {
            NodeType::File => node.size = metadata.len(),
            NodeType::Symlink => {
                let target = std::fs::read_link(path)?;
                node.link_target = Some(encode_name(target.as_os_str()));
            }
            _ => {}
        }
        Ok(node)
    }

    /// Placeholder recorded in place of an entry that failed to archive.
    pub fn with_error(name: impl Into<String>, node_type: NodeType, error: &Error) -> Self {
        let mut node = Node::new(name, node_type);
        node.error = Some(error.to_string());
        node
    }

    pub fn is_file(&self) -> bool {
        self.node_type == NodeType::File
    }

    pub fn is_dir(&self) -> bool {
        self.node_type == NodeType::Dir
    }

    pub fn is_symlink(&self) -> bool {
        self.node_type == NodeType::Symlink
    }

    /// The name as the file system spells it.
    pub fn os_name(&self) -> Result<OsString> {
        decode_name(&self.name)
    }

    /// Raw name bytes; trees are ordered by these, like the file walker.
    fn sort_key(&self) -> Cow<'_, [u8]> {
        if !self.name.contains('\\') {
            return Cow::Borrowed(self.name.as_bytes());
        }
        match unescape(&self.name) {
            Ok(bytes) => Cow::Owned(bytes),
            Err(_) => Cow::Borrowed(self.name.as_bytes()),
        }
    }

    /// Whether `self` (freshly read from disk) still describes the same file
    /// content as `old`. Inodes only count when both sides know theirs.
    pub fn content_unchanged(&self, old: &Node) -> bool {
        if !self.is_file() || !old.is_file() || old.error.is_some() {
            return false;
        }
        if self.mtime != old.mtime || self.size != old.size {
            return false;
        }
        if self.inode != 0 && old.inode != 0 && self.inode != old.inode {
            return false;
        }
        true
    }
}

fn node_type_of(file_type: &std::fs::FileType) -> NodeType {
    if file_type.is_dir() {
        return NodeType::Dir;
    }
    if file_type.is_symlink() {
        return NodeType::Symlink;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if file_type.is_block_device() {
            return NodeType::Dev;
        }
        if file_type.is_char_device() {
            return NodeType::CharDev;
        }
        if file_type.is_fifo() {
            return NodeType::Fifo;
        }
        if file_type.is_socket() {
            return NodeType::Socket;
        }
    }
    NodeType::File
}

/// Turns an OS name into the string stored in a tree. Valid UTF-8 is kept as is,
/// a backslash becomes `\\` and every byte of an invalid sequence becomes `\xHH`,
/// so distinct names never share an encoding.
pub fn encode_name(name: &OsStr) -> String {
    let bytes = name_bytes(name);
    let mut out = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        for c in chunk.valid().chars() {
            if c == '\\' {
                out.push_str("\\\\");
            } else {
                out.push(c);
            }
        }
        for byte in chunk.invalid() {
            out.push_str(&format!("\\x{:02x}", byte));
        }
    }
    out
}

/// Inverse of [`encode_name`].
pub fn decode_name(name: &str) -> Result<OsString> {
    let bytes = unescape(name)?;
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStringExt;
        Ok(OsString::from_vec(bytes))
    }
    #[cfg(not(unix))]
    {
        Ok(OsString::from(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

#[cfg(unix)]
fn name_bytes(name: &OsStr) -> Cow<'_, [u8]> {
    use std::os::unix::ffi::OsStrExt;
    Cow::Borrowed(name.as_bytes())
}

#[cfg(not(unix))]
fn name_bytes(name: &OsStr) -> Cow<'_, [u8]> {
    match name.to_string_lossy() {
        Cow::Borrowed(s) => Cow::Borrowed(s.as_bytes()),
        Cow::Owned(s) => Cow::Owned(s.into_bytes()),
    }
}

fn unescape(name: &str) -> Result<Vec<u8>> {
    let invalid = || Error::Other(format!("malformed escape in name {:?}", name));
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        match bytes.get(i + 1) {
            Some(b'\\') => {
                out.push(b'\\');
                i += 2;
            }
            Some(b'x') => {
                let hex = name.get(i + 2..i + 4).ok_or_else(invalid)?;
                out.push(u8::from_str_radix(hex, 16).map_err(|_| invalid())?);
                i += 4;
            }
            _ => return Err(invalid()),
        }
    }
    Ok(out)
}

/// Directory listing kept sorted by raw name bytes; stored as a tree blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

impl Tree {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn insert(&mut self, node: Node) -> Result<()> {
        let found = {
            let key = node.sort_key();
            self.nodes
                .binary_search_by(|n| n.sort_key().as_ref().cmp(key.as_ref()))
        };
        match found {
            Ok(_) => Err(Error::Other(format!("duplicate tree entry {:?}", node.name))),
            Err(pos) => {
                self.nodes.insert(pos, node);
                Ok(())
            }
        }
    }

    pub fn find(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_keeps_name_order() {
        let mut tree = Tree::new();
        for name in ["c", "a", "b"] {
            tree.insert(Node::new(name, NodeType::File)).unwrap();
        }
        let names: Vec<&str> = tree.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert!(tree.find("b").is_some());
        assert!(tree.find("d").is_none());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut tree = Tree::new();
        tree.insert(Node::new("x", NodeType::File)).unwrap();
        assert!(tree.insert(Node::new("x", NodeType::Dir)).is_err());
    }

    #[test]
    fn test_json_is_stable() {
        let mut tree = Tree::new();
        let mut file = Node::new("file", NodeType::File);
        file.content = vec![ObjectID::from_data(b"chunk")];
        file.size = 5;
        tree.insert(file).unwrap();
        tree.insert(Node::new("dir", NodeType::Dir)).unwrap();

        let first = tree.to_json().unwrap();
        let parsed = Tree::from_json(&first).unwrap();
        assert_eq!(parsed, tree);
        assert_eq!(parsed.to_json().unwrap(), first);

        let value: serde_json::Value = serde_json::from_slice(&first).unwrap();
        assert_eq!(value["nodes"][0]["type"], "dir");
        assert!(value["nodes"][0].get("content").is_none());
    }

    #[test]
    fn test_content_unchanged() {
        let mut old = Node::new("f", NodeType::File);
        old.size = 10;
        old.inode = 42;
        let mut new = old.clone();
        assert!(new.content_unchanged(&old));

        new.inode = 0;
        assert!(new.content_unchanged(&old));

        new.inode = 43;
        assert!(!new.content_unchanged(&old));

        new.inode = 42;
        new.size = 11;
        assert!(!new.content_unchanged(&old));
    }

    #[test]
    fn test_from_fs_reads_file_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello").unwrap();
        let metadata = std::fs::symlink_metadata(&path).unwrap();

        let node = Node::from_fs("hello.txt", &path, &metadata).unwrap();
        assert!(node.is_file());
        assert_eq!(node.size, 5);
        assert!(node.content.is_empty());
    }

    #[test]
    fn test_name_encoding_is_reversible() {
        for name in ["plain.txt", "späß", "back\\slash", "\\x41"] {
            let encoded = encode_name(OsStr::new(name));
            assert_eq!(decode_name(&encoded).unwrap(), OsStr::new(name));
        }
        assert_eq!(encode_name(OsStr::new("plain.txt")), "plain.txt");
        assert_eq!(encode_name(OsStr::new("a\\b")), "a\\\\b");
        assert_ne!(encode_name(OsStr::new("\\x41")), "\\x41");
    }

    #[test]
    fn test_decode_rejects_malformed_escapes() {
        for bad in ["trailing\\", "\\q", "\\x4", "\\xzz"] {
            assert!(decode_name(bad).is_err(), "{bad:?}");
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_invalid_utf8_names_stay_distinct() {
        use std::os::unix::ffi::OsStrExt;

        let fe = OsStr::from_bytes(b"a\xfe");
        let ff = OsStr::from_bytes(b"a\xff");
        assert_eq!(encode_name(fe), "a\\xfe");
        assert_eq!(decode_name(&encode_name(ff)).unwrap(), ff);

        let mut tree = Tree::new();
        for name in [ff, OsStr::new("b"), fe, OsStr::new("a~"), OsStr::new("a")] {
            tree.insert(Node::new(encode_name(name), NodeType::File)).unwrap();
        }
        let order: Vec<OsString> = tree.nodes.iter().map(|n| n.os_name().unwrap()).collect();
        assert_eq!(order, [OsStr::new("a"), OsStr::new("a~"), fe, ff, OsStr::new("b")]);
        assert!(tree.insert(Node::new(encode_name(fe), NodeType::Dir)).is_err());
    }

    #[test]
    fn test_order_follows_raw_bytes_with_escapes() {
        let mut tree = Tree::new();
        for name in ["a]", "a\\b", "a["] {
            tree.insert(Node::new(encode_name(OsStr::new(name)), NodeType::File)).unwrap();
        }
        let order: Vec<OsString> = tree.nodes.iter().map(|n| n.os_name().unwrap()).collect();
        assert_eq!(order, [OsStr::new("a["), OsStr::new("a\\b"), OsStr::new("a]")]);
    }
}
