use std::path::{Component, Path, PathBuf};

use crate::Error;

/// A session's private directory. Built-in file functions resolve every
/// path against it and refuse anything that lands outside.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open (or create) a workspace at the given root directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        if !root.exists() {
            std::fs::create_dir_all(&root).map_err(|e| {
                Error::Workspace(format!(
                    "failed to create workspace at {}: {e}",
                    root.display()
                ))
            })?;
        }
        // Canonical root so symlinked temp dirs compare correctly
        let root = root.canonicalize().map_err(|e| {
            Error::Workspace(format!(
                "failed to canonicalize workspace path {}: {e}",
                root.display()
            ))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` against the root. Relative and absolute paths are both
    /// accepted as long as the normalized result stays inside the root.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, Error> {
        let p = Path::new(path);
        let candidate = if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        };
        let normalized = normalize_path(&candidate);

        if !normalized.starts_with(&self.root) {
            return Err(Error::Workspace(format!(
                "path '{path}' escapes workspace root ({})",
                self.root.display()
            )));
        }
        Ok(normalized)
    }

    pub async fn read(&self, path: &str) -> Result<String, Error> {
        let resolved = self.resolve(path)?;
        tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| Error::Workspace(format!("failed to read '{path}': {e}")))
    }

    /// Write `content`, creating parent directories. Returns bytes written.
    pub async fn write(&self, path: &str, content: &str) -> Result<usize, Error> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Workspace(format!("failed to create directories for '{path}': {e}"))
            })?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| Error::Workspace(format!("failed to write '{path}': {e}")))?;
        Ok(content.len())
    }

    /// Sorted entry names of a directory; directories get a trailing `/`.
    pub async fn list(&self, path: &str) -> Result<Vec<String>, Error> {
        let resolved = self.resolve(path)?;
        let mut reader = tokio::fs::read_dir(&resolved)
            .await
            .map_err(|e| Error::Workspace(format!("failed to list '{path}': {e}")))?;

        let mut names = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| Error::Workspace(format!("failed to list '{path}': {e}")))?
        {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    /// One-paragraph listing of the root for seeding a session, capped at
    /// `max_entries` names.
    pub async fn preview(&self, max_entries: usize) -> Result<String, Error> {
        let names = self.list(".").await?;
        if names.is_empty() {
            return Ok("The workspace directory is empty.".to_string());
        }
        let shown = names.len().min(max_entries);
        let mut preview = format!(
            "The workspace directory contains: {}",
            names[..shown].join(", ")
        );
        if names.len() > shown {
            preview.push_str(&format!(" (and {} more)", names.len() - shown));
        }
        Ok(preview)
    }
}

/// Resolve `.` and `..` without touching the filesystem, so paths that do
/// not exist yet can still be checked.
fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => match components.last() {
                Some(Component::Normal(_)) => {
                    components.pop();
                }
                _ => components.push(component),
            },
            Component::CurDir => {}
            _ => components.push(component),
        }
    }
    components.iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let ws_path = dir.path().join("session");
        assert!(!ws_path.exists());

        let ws = Workspace::open(&ws_path).unwrap();
        assert!(ws_path.exists());
        assert!(ws.root().is_absolute());
    }

    #[test]
    fn resolve_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        assert_eq!(ws.resolve("notes.md").unwrap(), ws.root().join("notes.md"));
        assert_eq!(
            ws.resolve("./sub/../file.txt").unwrap(),
            ws.root().join("file.txt")
        );
    }

    #[test]
    fn resolve_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        let err = ws.resolve("../../etc/passwd").unwrap_err();
        assert!(matches!(err, Error::Workspace(_)));
        assert!(err.to_string().contains("escapes workspace root"));
    }

    #[test]
    fn resolve_absolute_outside_root_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        assert!(ws.resolve("/etc/hosts").is_err());

        let inside = ws.root().join("a.txt");
        assert_eq!(ws.resolve(inside.to_str().unwrap()).unwrap(), inside);
    }

    #[tokio::test]
    async fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        let written = ws.write("deep/nested/out.txt", "hello").await.unwrap();
        assert_eq!(written, 5);
        assert_eq!(ws.read("deep/nested/out.txt").await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn read_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        let err = ws.read("missing.txt").await.unwrap_err();
        assert!(err.to_string().contains("failed to read 'missing.txt'"));
    }

    #[tokio::test]
    async fn list_marks_directories_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        ws.write("b.txt", "").await.unwrap();
        ws.write("a/inner.txt", "").await.unwrap();
        assert_eq!(ws.list(".").await.unwrap(), ["a/", "b.txt"]);
    }

    #[tokio::test]
    async fn preview_caps_entries() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path()).unwrap();
        assert_eq!(
            ws.preview(10).await.unwrap(),
            "The workspace directory is empty."
        );
        for name in ["a.csv", "b.csv", "c.csv"] {
            ws.write(name, "x").await.unwrap();
        }
        assert_eq!(
            ws.preview(2).await.unwrap(),
            "The workspace directory contains: a.csv, b.csv (and 1 more)"
        );
    }
}
