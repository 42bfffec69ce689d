//! File-write collaborators.
//!
//! [`MemoryWorkspace`] keeps the project as a virtual file map;
//! [`DiskWorkspace`] writes under a root directory. Both normalise paths the
//! same way: leading `./` and `/` are stripped and `..` is rejected.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use walkdir::WalkDir;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub path: String,
    pub size: usize,
}

#[async_trait]
pub trait Workspace: Send + Sync {
    async fn write_file(&self, path: &str, content: &str) -> Result<()>;

    /// `None` when the file does not exist
    async fn read_file(&self, path: &str) -> Result<Option<String>>;

    /// Returns false when there was nothing to delete
    async fn delete_file(&self, path: &str) -> Result<bool>;

    /// Every file, sorted by path
    async fn list_files(&self) -> Result<Vec<FileEntry>>;

    async fn snapshot(&self) -> Result<BTreeMap<String, String>> {
        let mut files = BTreeMap::new();
        for entry in self.list_files().await? {
            if let Some(content) = self.read_file(&entry.path).await? {
                files.insert(entry.path, content);
            }
        }
        Ok(files)
    }
}

/// Workspace-relative form of `path`
pub fn normalize_path(path: &str) -> Result<String> {
    let unified = path.trim().replace('\\', "/");
    let mut parts = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(WorkspaceError::InvalidPath(path.to_string())),
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(WorkspaceError::InvalidPath(path.to_string()));
    }
    Ok(parts.join("/"))
}

#[derive(Debug, Default)]
pub struct MemoryWorkspace {
    files: RwLock<BTreeMap<String, String>>,
}

impl MemoryWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files<I, P, C>(files: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: AsRef<str>,
        C: Into<String>,
    {
        let map = files
            .into_iter()
            .filter_map(|(p, c)| normalize_path(p.as_ref()).ok().map(|p| (p, c.into())))
            .collect();
        Self {
            files: RwLock::new(map),
        }
    }

    fn poisoned() -> WorkspaceError {
        WorkspaceError::Internal("workspace lock poisoned".to_string())
    }
}

#[async_trait]
impl Workspace for MemoryWorkspace {
    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let path = normalize_path(path)?;
        let mut files = self.files.write().map_err(|_| Self::poisoned())?;
        files.insert(path, content.to_string());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Option<String>> {
        let path = normalize_path(path)?;
        let files = self.files.read().map_err(|_| Self::poisoned())?;
        Ok(files.get(&path).cloned())
    }

    async fn delete_file(&self, path: &str) -> Result<bool> {
        let path = normalize_path(path)?;
        let mut files = self.files.write().map_err(|_| Self::poisoned())?;
        Ok(files.remove(&path).is_some())
    }

    async fn list_files(&self) -> Result<Vec<FileEntry>> {
        let files = self.files.read().map_err(|_| Self::poisoned())?;
        Ok(files
            .iter()
            .map(|(path, content)| FileEntry {
                path: path.clone(),
                size: content.len(),
            })
            .collect())
    }

    async fn snapshot(&self) -> Result<BTreeMap<String, String>> {
        let files = self.files.read().map_err(|_| Self::poisoned())?;
        Ok(files.clone())
    }
}

/// Directories never listed from a disk workspace
const SKIPPED_DIRS: &[&str] = &["node_modules", "target", "dist"];

#[derive(Debug, Clone)]
pub struct DiskWorkspace {
    root: PathBuf,
}

impl DiskWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        Ok(self.root.join(normalize_path(path)?))
    }
}

#[async_trait]
impl Workspace for DiskWorkspace {
    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, content).await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Option<String>> {
        let full = self.resolve(path)?;
        match tokio::fs::read_to_string(&full).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_file(&self, path: &str) -> Result<bool> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_files(&self) -> Result<Vec<FileEntry>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let mut entries = Vec::new();
            let walker = WalkDir::new(&root).into_iter().filter_entry(|e| {
                if e.depth() == 0 || !e.file_type().is_dir() {
                    return true;
                }
                let name = e.file_name().to_string_lossy();
                !name.starts_with('.') && !SKIPPED_DIRS.contains(&name.as_ref())
            });
            for entry in walker {
                let entry = entry.map_err(|e| WorkspaceError::Internal(e.to_string()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let size = entry.metadata().map(|m| m.len() as usize).unwrap_or(0);
                entries.push(FileEntry {
                    path: relative.to_string_lossy().replace('\\', "/"),
                    size,
                });
            }
            entries.sort_by(|a, b| a.path.cmp(&b.path));
            Ok(entries)
        })
        .await
        .map_err(|e| WorkspaceError::Internal(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("./src/App.tsx").unwrap(), "src/App.tsx");
        assert_eq!(normalize_path("/src//a.ts").unwrap(), "src/a.ts");
        assert_eq!(normalize_path("src\\b.ts").unwrap(), "src/b.ts");
        assert!(normalize_path("../etc/passwd").is_err());
        assert!(normalize_path("a/../../b").is_err());
        assert!(normalize_path("  ").is_err());
    }

    #[tokio::test]
    async fn test_memory_workspace() {
        let ws = MemoryWorkspace::new();
        ws.write_file("./src/a.ts", "export {}").await.unwrap();
        assert_eq!(
            ws.read_file("src/a.ts").await.unwrap().as_deref(),
            Some("export {}")
        );
        assert_eq!(ws.read_file("missing.ts").await.unwrap(), None);

        let listed = ws.list_files().await.unwrap();
        assert_eq!(
            listed,
            vec![FileEntry {
                path: "src/a.ts".to_string(),
                size: 9
            }]
        );

        assert!(ws.delete_file("/src/a.ts").await.unwrap());
        assert!(!ws.delete_file("src/a.ts").await.unwrap());
        assert!(ws.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disk_workspace_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ws = DiskWorkspace::new(dir.path());

        ws.write_file("src/deep/x.txt", "hi").await.unwrap();
        ws.write_file("b.txt", "bee").await.unwrap();
        assert_eq!(ws.read_file("src/deep/x.txt").await.unwrap().as_deref(), Some("hi"));
        assert_eq!(ws.read_file("nope.txt").await.unwrap(), None);

        let paths: Vec<String> = ws
            .list_files()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(paths, vec!["b.txt", "src/deep/x.txt"]);

        let snapshot = ws.snapshot().await.unwrap();
        assert_eq!(snapshot.get("b.txt").map(String::as_str), Some("bee"));

        assert!(ws.delete_file("b.txt").await.unwrap());
        assert!(!ws.delete_file("b.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_disk_workspace_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let ws = DiskWorkspace::new(dir.path());
        let err = ws.write_file("../outside.txt", "x").await.unwrap_err();
        assert!(matches!(err, WorkspaceError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn test_disk_workspace_skips_hidden_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let ws = DiskWorkspace::new(dir.path());
        ws.write_file(".git/config", "x").await.unwrap();
        ws.write_file("node_modules/p/index.js", "x").await.unwrap();
        ws.write_file("main.ts", "x").await.unwrap();
        let listed = ws.list_files().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, "main.ts");
    }
}
