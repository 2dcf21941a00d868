//! Shadow snapshot store.
//!
//! Lives outside the workspace, one directory per task:
//!
//! ```text
//! <store>/<task_id>/objects/<sha256>          file contents
//! <store>/<task_id>/snapshots/<hash>.json     manifest: path -> object
//! ```
//!
//! A snapshot's hash is the SHA-256 of its file map, so two snapshots of the
//! same tree share a hash. Excluded directory names are skipped at any depth,
//! both when snapshotting and when restoring.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tasklane_core::error::CheckpointError;
use tracing::debug;

use super::{ChangeKind, FileChange, SnapshotBackend};

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    label: String,
    parent: Option<String>,
    created_at: DateTime<Utc>,
    files: BTreeMap<String, String>,
}

#[derive(Clone)]
pub struct ShadowStore {
    workspace: PathBuf,
    root: PathBuf,
    exclude: Vec<String>,
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn tree_hash(files: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (path, object) in files {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(object.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

impl ShadowStore {
    /// `store_dir` is the shared checkpoint directory; each task gets its own
    /// subdirectory.
    pub fn new(workspace: impl Into<PathBuf>, store_dir: &Path, task_id: &str, exclude: Vec<String>) -> Self {
        Self {
            workspace: workspace.into(),
            root: store_dir.join(task_id),
            exclude,
        }
    }

    fn objects(&self) -> PathBuf {
        self.root.join("objects")
    }

    fn manifest_path(&self, hash: &str) -> PathBuf {
        self.root.join("snapshots").join(format!("{hash}.json"))
    }

    fn is_excluded(&self, name: &str) -> bool {
        self.exclude.iter().any(|e| e == name)
    }

    /// Workspace files as relative `/`-separated paths.
    fn walk(&self) -> Result<Vec<String>, CheckpointError> {
        let mut out = Vec::new();
        let mut stack = vec![self.workspace.clone()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                let file_type = entry.file_type()?;
                let name = entry.file_name().to_string_lossy().to_string();
                if file_type.is_dir() {
                    if !self.is_excluded(&name) && path != self.root {
                        stack.push(path);
                    }
                } else if file_type.is_file() {
                    if let Ok(rel) = path.strip_prefix(&self.workspace) {
                        out.push(rel.to_string_lossy().replace('\\', "/"));
                    }
                }
            }
        }
        out.sort();
        Ok(out)
    }

    fn read_manifest(&self, hash: &str) -> Result<Manifest, CheckpointError> {
        let path = self.manifest_path(hash);
        let raw = std::fs::read(&path).map_err(|_| CheckpointError::NotFound(hash.to_string()))?;
        serde_json::from_slice(&raw)
            .map_err(|e| CheckpointError::Backend(format!("corrupt manifest {hash}: {e}")))
    }

    fn read_object(&self, object: &str) -> Result<Vec<u8>, CheckpointError> {
        Ok(std::fs::read(self.objects().join(object))?)
    }

    /// Current workspace state as path -> content hash, without storing blobs.
    fn current_tree(&self) -> Result<BTreeMap<String, String>, CheckpointError> {
        let mut files = BTreeMap::new();
        for rel in self.walk()? {
            let bytes = std::fs::read(self.workspace.join(&rel))?;
            files.insert(rel, sha256_hex(&bytes));
        }
        Ok(files)
    }

    fn snapshot_blocking(&self, label: &str, parent: Option<&str>) -> Result<String, CheckpointError> {
        std::fs::create_dir_all(self.objects())?;
        std::fs::create_dir_all(self.root.join("snapshots"))?;

        let mut files = BTreeMap::new();
        for rel in self.walk()? {
            let bytes = std::fs::read(self.workspace.join(&rel))?;
            let object = sha256_hex(&bytes);
            let object_path = self.objects().join(&object);
            if !object_path.exists() {
                std::fs::write(&object_path, &bytes)?;
            }
            files.insert(rel, object);
        }

        let hash = tree_hash(&files);
        let manifest_path = self.manifest_path(&hash);
        if !manifest_path.exists() {
            let manifest = Manifest {
                label: label.to_string(),
                parent: parent.map(str::to_string),
                created_at: Utc::now(),
                files,
            };
            let json = serde_json::to_vec_pretty(&manifest)
                .map_err(|e| CheckpointError::Backend(e.to_string()))?;
            std::fs::write(&manifest_path, json)?;
        }
        debug!(hash = %hash, label, "Snapshot stored");
        Ok(hash)
    }

    fn diff_blocking(&self, from: &str, to: Option<&str>) -> Result<Vec<FileChange>, CheckpointError> {
        let before = self.read_manifest(from)?.files;
        let after = match to {
            Some(hash) => self.read_manifest(hash)?.files,
            None => self.current_tree()?,
        };
        let read_after = |rel: &str, object: &str| -> Result<Vec<u8>, CheckpointError> {
            match to {
                Some(_) => self.read_object(object),
                None => Ok(std::fs::read(self.workspace.join(rel))?),
            }
        };

        let mut changes = Vec::new();
        for (rel, object) in &before {
            match after.get(rel) {
                None => changes.push(FileChange {
                    path: rel.clone(),
                    kind: ChangeKind::Deleted,
                    before: Some(lossy(self.read_object(object)?)),
                    after: None,
                }),
                Some(new_object) if new_object != object => changes.push(FileChange {
                    path: rel.clone(),
                    kind: ChangeKind::Modified,
                    before: Some(lossy(self.read_object(object)?)),
                    after: Some(lossy(read_after(rel, new_object)?)),
                }),
                Some(_) => {}
            }
        }
        for (rel, object) in &after {
            if !before.contains_key(rel) {
                changes.push(FileChange {
                    path: rel.clone(),
                    kind: ChangeKind::Added,
                    before: None,
                    after: Some(lossy(read_after(rel, object)?)),
                });
            }
        }
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(changes)
    }

    fn restore_blocking(&self, hash: &str) -> Result<(), CheckpointError> {
        let manifest = self.read_manifest(hash)?;
        let current = self.current_tree()?;

        for rel in current.keys() {
            if !manifest.files.contains_key(rel) {
                std::fs::remove_file(self.workspace.join(rel))?;
            }
        }
        for (rel, object) in &manifest.files {
            if current.get(rel) == Some(object) {
                continue;
            }
            let target = self.workspace.join(rel);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, self.read_object(object)?)?;
        }
        debug!(hash = %hash, files = manifest.files.len(), "Workspace restored");
        Ok(())
    }
}

fn lossy(bytes: Vec<u8>) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}

fn join_error(e: tokio::task::JoinError) -> CheckpointError {
    CheckpointError::Backend(e.to_string())
}

#[async_trait]
impl SnapshotBackend for ShadowStore {
    async fn init(&self) -> Result<(), CheckpointError> {
        let workspace = self.workspace.clone();
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            if !workspace.is_dir() {
                return Err(CheckpointError::Backend(format!(
                    "workspace {} is not a directory",
                    workspace.display()
                )));
            }
            if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
                if workspace == home {
                    return Err(CheckpointError::Backend(
                        "refusing to snapshot the home directory".into(),
                    ));
                }
            }
            std::fs::create_dir_all(root.join("objects"))?;
            std::fs::create_dir_all(root.join("snapshots"))?;
            Ok(())
        })
        .await
        .map_err(join_error)?
    }

    async fn snapshot(&self, label: &str, parent: Option<&str>) -> Result<String, CheckpointError> {
        let store = self.clone();
        let label = label.to_string();
        let parent = parent.map(str::to_string);
        tokio::task::spawn_blocking(move || store.snapshot_blocking(&label, parent.as_deref()))
            .await
            .map_err(join_error)?
    }

    async fn diff(&self, from: &str, to: Option<&str>) -> Result<Vec<FileChange>, CheckpointError> {
        let store = self.clone();
        let from = from.to_string();
        let to = to.map(str::to_string);
        tokio::task::spawn_blocking(move || store.diff_blocking(&from, to.as_deref()))
            .await
            .map_err(join_error)?
    }

    async fn restore(&self, hash: &str) -> Result<(), CheckpointError> {
        let store = self.clone();
        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || store.restore_blocking(&hash))
            .await
            .map_err(join_error)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(ws: &Path, shadow: &Path) -> ShadowStore {
        ShadowStore::new(ws, shadow, "task-1", vec![".git".into(), "target".into()])
    }

    #[tokio::test]
    async fn same_tree_same_hash() {
        let ws = tempfile::tempdir().unwrap();
        let shadow = tempfile::tempdir().unwrap();
        std::fs::write(ws.path().join("a.txt"), "one").unwrap();
        let s = store(ws.path(), shadow.path());
        s.init().await.unwrap();

        let h1 = s.snapshot("first", None).await.unwrap();
        let h2 = s.snapshot("again", Some(&h1)).await.unwrap();
        assert_eq!(h1, h2);

        std::fs::write(ws.path().join("a.txt"), "two").unwrap();
        let h3 = s.snapshot("changed", Some(&h1)).await.unwrap();
        assert_ne!(h1, h3);
    }

    #[tokio::test]
    async fn diff_reports_each_kind() {
        let ws = tempfile::tempdir().unwrap();
        let shadow = tempfile::tempdir().unwrap();
        std::fs::write(ws.path().join("keep.txt"), "same").unwrap();
        std::fs::write(ws.path().join("edit.txt"), "old").unwrap();
        std::fs::write(ws.path().join("gone.txt"), "bye").unwrap();
        let s = store(ws.path(), shadow.path());
        s.init().await.unwrap();
        let base = s.snapshot("base", None).await.unwrap();

        std::fs::write(ws.path().join("edit.txt"), "new").unwrap();
        std::fs::remove_file(ws.path().join("gone.txt")).unwrap();
        std::fs::create_dir(ws.path().join("src")).unwrap();
        std::fs::write(ws.path().join("src/new.rs"), "fn x() {}").unwrap();

        let changes = s.diff(&base, None).await.unwrap();
        let summary: Vec<(&str, ChangeKind)> =
            changes.iter().map(|c| (c.path.as_str(), c.kind)).collect();
        assert_eq!(
            summary,
            vec![
                ("edit.txt", ChangeKind::Modified),
                ("gone.txt", ChangeKind::Deleted),
                ("src/new.rs", ChangeKind::Added),
            ]
        );
        assert_eq!(changes[0].before.as_deref(), Some("old"));
        assert_eq!(changes[0].after.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn restore_then_diff_is_empty() {
        let ws = tempfile::tempdir().unwrap();
        let shadow = tempfile::tempdir().unwrap();
        std::fs::write(ws.path().join("main.rs"), "v1").unwrap();
        let s = store(ws.path(), shadow.path());
        s.init().await.unwrap();
        let base = s.snapshot("base", None).await.unwrap();

        std::fs::write(ws.path().join("main.rs"), "v2").unwrap();
        std::fs::write(ws.path().join("extra.rs"), "x").unwrap();
        s.restore(&base).await.unwrap();

        assert!(s.diff(&base, None).await.unwrap().is_empty());
        assert_eq!(std::fs::read_to_string(ws.path().join("main.rs")).unwrap(), "v1");
        assert!(!ws.path().join("extra.rs").exists());
    }

    #[tokio::test]
    async fn excluded_dirs_are_left_alone() {
        let ws = tempfile::tempdir().unwrap();
        let shadow = tempfile::tempdir().unwrap();
        std::fs::create_dir(ws.path().join("target")).unwrap();
        let s = store(ws.path(), shadow.path());
        s.init().await.unwrap();
        let base = s.snapshot("base", None).await.unwrap();

        std::fs::write(ws.path().join("target/build.o"), "bin").unwrap();
        assert!(s.diff(&base, None).await.unwrap().is_empty());
        s.restore(&base).await.unwrap();
        assert!(ws.path().join("target/build.o").exists());
    }

    #[tokio::test]
    async fn unknown_hash_is_not_found() {
        let ws = tempfile::tempdir().unwrap();
        let shadow = tempfile::tempdir().unwrap();
        let s = store(ws.path(), shadow.path());
        s.init().await.unwrap();
        let err = s.restore("deadbeef").await.unwrap_err();
        assert!(matches!(err, CheckpointError::NotFound(_)));
    }
}
