use crate::crypto::{current_hostname, current_username};
use crate::types::{ObjectID, SnapshotID};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Record of one archive run. Its ID is the content ID of the stored file, so it
/// is not part of the serialized form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(skip)]
    pub id: Option<SnapshotID>,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<SnapshotID>,
    pub tree: ObjectID,
    pub paths: Vec<PathBuf>,
    pub hostname: String,
    pub username: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
}

impl Snapshot {
    pub fn new(paths: Vec<PathBuf>, tree: ObjectID) -> Self {
        Self {
            id: None,
            time: Utc::now(),
            parent: None,
            tree,
            paths,
            hostname: current_hostname(),
            username: current_username(),
            tags: Vec::new(),
            excludes: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent: SnapshotID) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_excludes(mut self, excludes: Vec<String>) -> Self {
        self.excludes = excludes;
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn short_id(&self) -> String {
        self.id
            .map(|id| id.short_string())
            .unwrap_or_else(|| "unsaved".to_string())
    }

    pub fn summary(&self) -> String {
        format!(
            "{} - {} paths on {} at {}",
            self.short_id(),
            self.paths.len(),
            self.hostname,
            self.time.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }

    /// Whether this snapshot covers exactly `paths`, in any order.
    pub fn has_paths(&self, paths: &[PathBuf]) -> bool {
        let mut ours = self.paths.clone();
        let mut theirs = paths.to_vec();
        ours.sort();
        theirs.sort();
        ours == theirs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_is_not_serialized() {
        let mut snapshot = Snapshot::new(vec![PathBuf::from("/data")], ObjectID::from_data(b"tree"))
            .with_tags(vec!["daily".to_string()]);
        snapshot.id = Some(ObjectID::from_data(b"id"));

        let value = serde_json::to_value(&snapshot).unwrap();
        assert!(value.get("id").is_none());
        assert!(value.get("parent").is_none());
        assert_eq!(value["tags"][0], "daily");

        let parsed: Snapshot = serde_json::from_value(value).unwrap();
        assert!(parsed.id.is_none());
        assert_eq!(parsed.tree, snapshot.tree);
    }

    #[test]
    fn test_has_paths_ignores_order() {
        let snapshot = Snapshot::new(
            vec![PathBuf::from("/a"), PathBuf::from("/b")],
            ObjectID::default(),
        );
        assert!(snapshot.has_paths(&[PathBuf::from("/b"), PathBuf::from("/a")]));
        assert!(!snapshot.has_paths(&[PathBuf::from("/a")]));
        assert_eq!(snapshot.short_id(), "unsaved");
    }
}
