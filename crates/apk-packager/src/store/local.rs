use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};
use crate::executor::host::atomic_write;
use crate::store::AssetStore;

/// Filesystem-backed store rooted at a directory; keys map to relative paths.
#[derive(Debug, Clone)]
pub struct LocalAssetStore {
    root: PathBuf,
}

impl LocalAssetStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key.trim_start_matches('/'));
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::msg(format!("invalid asset key '{key}'")));
        }
        Ok(self.root.join(rel))
    }
}

impl AssetStore for LocalAssetStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let p = self.path_for(key)?;
        match fs::read(&p) {
            Ok(b) => Ok(Some(b)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::msg(format!("failed to read {}: {e}", p.display()))),
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let p = self.path_for(key)?;
        atomic_write(&p, bytes)?;
        Ok(p.display().to_string())
    }

    fn delete(&self, prefix: &str) -> Result<()> {
        let trimmed = prefix.trim_start_matches('/');
        // "projects/P1/" names a directory; "projects/P1/app" matches files by name prefix.
        if trimmed.ends_with('/') {
            let dir = self.path_for(trimmed.trim_end_matches('/'))?;
            return match fs::remove_dir_all(&dir) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::msg(format!("failed to remove {}: {e}", dir.display()))),
            };
        }

        let target = self.path_for(trimmed)?;
        let (Some(parent), Some(stem)) = (target.parent(), target.file_name()) else {
            return Ok(());
        };
        let stem = stem.to_string_lossy().into_owned();
        let entries = match fs::read_dir(parent) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(Error::msg(format!("failed to list {}: {e}", parent.display())));
            }
        };
        for entry in entries.flatten() {
            if !entry.file_name().to_string_lossy().starts_with(&stem) {
                continue;
            }
            let p = entry.path();
            let res = if p.is_dir() {
                fs::remove_dir_all(&p)
            } else {
                fs::remove_file(&p)
            };
            res.map_err(|e| Error::msg(format!("failed to remove {}: {e}", p.display())))?;
        }
        Ok(())
    }
}
