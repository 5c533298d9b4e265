// src/fs/mock.rs

use super::FileSystem;
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// In-memory filesystem. Directories exist implicitly as parents of files.
#[derive(Debug, Clone, Default)]
pub struct MockFileSystem {
    files: Arc<Mutex<BTreeMap<PathBuf, Vec<u8>>>>,
}

impl MockFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) {
        self.files
            .lock()
            .insert(path.as_ref().to_path_buf(), content.into());
    }

    fn is_dir(files: &BTreeMap<PathBuf, Vec<u8>>, path: &Path) -> bool {
        files
            .keys()
            .any(|p| p != path && p.starts_with(path))
    }
}

impl FileSystem for MockFileSystem {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let files = self.files.lock();
        match files.get(path) {
            Some(content) => Ok(content.clone()),
            None if Self::is_dir(&files, path) => Err(anyhow!("Is a directory: {:?}", path)),
            None => Err(anyhow!("File not found: {:?}", path)),
        }
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.add_file(path, contents);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        let files = self.files.lock();
        files.contains_key(path) || Self::is_dir(&files, path)
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let files = self.files.lock();
        if !Self::is_dir(&files, path) {
            return Err(anyhow!("Not a directory or not found: {:?}", path));
        }
        let mut children: Vec<PathBuf> = files
            .keys()
            .filter_map(|p| {
                let rest = p.strip_prefix(path).ok()?;
                let first = rest.components().next()?;
                Some(path.join(first))
            })
            .collect();
        children.dedup();
        Ok(children)
    }
}
