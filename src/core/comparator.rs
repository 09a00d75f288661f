use crate::core::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

/// 两次快照之间的变化
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(default)]
    pub added: BTreeSet<PathBuf>,
    #[serde(default)]
    pub modified: BTreeSet<PathBuf>,
    #[serde(default)]
    pub deleted: BTreeSet<PathBuf>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// 需要上传的路径（新增 + 修改）
    pub fn uploads(&self) -> impl Iterator<Item = &PathBuf> {
        self.added.iter().chain(self.modified.iter())
    }

    pub fn total(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }

    /// 合并一次更新的变化，保持三个集合互不相交
    pub fn merge(&mut self, other: ChangeSet) {
        for path in other.deleted {
            self.added.remove(&path);
            self.modified.remove(&path);
            self.deleted.insert(path);
        }
        for path in other.added {
            self.deleted.remove(&path);
            self.added.insert(path);
        }
        for path in other.modified {
            if !self.added.contains(&path) {
                self.deleted.remove(&path);
                self.modified.insert(path);
            }
        }
    }
}

/// 比较阶段仍然存在且可读的普通文件
fn still_readable(path: &Path) -> bool {
    path.is_file() && File::open(path).is_ok()
}

/// 比较两次快照
///
/// 两边都有且哈希不同的路径，只有在比较时文件仍然存在且可读才算修改。
pub fn diff(current: &Snapshot, previous: &Snapshot) -> ChangeSet {
    let mut changes = ChangeSet::default();

    for (path, hash) in current.iter() {
        match previous.get(path) {
            None => {
                changes.added.insert(path.clone());
            }
            Some(old) if old != hash.as_str() => {
                if still_readable(path) {
                    changes.modified.insert(path.clone());
                }
            }
            Some(_) => {}
        }
    }

    for path in previous.paths() {
        if !current.contains(path) {
            changes.deleted.insert(path.clone());
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::snapshot::Snapshotter;
    use std::fs;

    fn scan(dir: &Path) -> Snapshot {
        Snapshotter::new().scan(dir).unwrap()
    }

    #[test]
    fn unchanged_tree_has_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"b").unwrap();

        let changes = diff(&scan(dir.path()), &scan(dir.path()));
        assert!(changes.is_empty());
    }

    #[test]
    fn new_file_is_added_not_modified() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let before = scan(dir.path());

        fs::write(dir.path().join("new.txt"), b"fresh").unwrap();
        let after = scan(dir.path());
        let changes = diff(&after, &before);

        let new = dir.path().canonicalize().unwrap().join("new.txt");
        assert_eq!(changes.added, BTreeSet::from([new]));
        assert!(changes.modified.is_empty());
        assert!(changes.deleted.is_empty());
    }

    #[test]
    fn rewritten_file_is_modified_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, b"one").unwrap();
        let before = scan(dir.path());

        fs::write(&path, b"two").unwrap();
        let changes = diff(&scan(dir.path()), &before);

        let path = path.canonicalize().unwrap();
        assert_eq!(changes.modified, BTreeSet::from([path]));
        assert!(changes.added.is_empty());
        assert!(changes.deleted.is_empty());
    }

    #[test]
    fn removed_file_is_deleted_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.txt");
        fs::write(&path, b"bye").unwrap();
        let canonical = path.canonicalize().unwrap();
        let before = scan(dir.path());

        fs::remove_file(&path).unwrap();
        let changes = diff(&scan(dir.path()), &before);

        assert_eq!(changes.deleted, BTreeSet::from([canonical.clone()]));
        assert!(!changes.added.contains(&canonical));
        assert!(!changes.modified.contains(&canonical));
    }

    #[test]
    fn delete_then_identical_recreate_is_no_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("same.txt");
        fs::write(&path, b"content").unwrap();
        let before = scan(dir.path());

        fs::remove_file(&path).unwrap();
        fs::write(&path, b"content").unwrap();

        assert!(diff(&scan(dir.path()), &before).is_empty());
    }

    #[test]
    fn vanished_file_is_not_reported_as_modified() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flaky.txt");
        fs::write(&path, b"v1").unwrap();
        let before = scan(dir.path());
        fs::write(&path, b"v2").unwrap();
        let after = scan(dir.path());

        // 文件在哈希之后、比较之前消失
        fs::remove_file(&path).unwrap();
        let changes = diff(&after, &before);

        assert!(changes.is_empty());
    }

    #[test]
    fn merge_keeps_sets_disjoint() {
        let mut pending = ChangeSet {
            added: BTreeSet::from([PathBuf::from("/a")]),
            modified: BTreeSet::from([PathBuf::from("/m")]),
            deleted: BTreeSet::new(),
        };
        pending.merge(ChangeSet {
            added: BTreeSet::new(),
            modified: BTreeSet::from([PathBuf::from("/a")]),
            deleted: BTreeSet::from([PathBuf::from("/m")]),
        });

        assert_eq!(pending.added, BTreeSet::from([PathBuf::from("/a")]));
        assert!(pending.modified.is_empty());
        assert_eq!(pending.deleted, BTreeSet::from([PathBuf::from("/m")]));
    }

    #[test]
    fn change_set_json_shape() {
        let changes = ChangeSet {
            added: BTreeSet::from([PathBuf::from("/x/new.txt")]),
            ..Default::default()
        };
        let json = serde_json::to_value(&changes).unwrap();
        assert_eq!(json["added"][0], "/x/new.txt");
        assert!(json["modified"].as_array().unwrap().is_empty());
        assert!(json["deleted"].as_array().unwrap().is_empty());
    }
}
