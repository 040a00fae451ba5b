//! Stable storage for committed configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use super::{ConfigTree, StoreError};

/// Where committed documents are kept.
pub trait ConfigPersistence: Send + Sync {
    /// The most recent document, if any was ever saved.
    fn load_latest(&self) -> Result<Option<ConfigTree>, StoreError>;

    fn save(&self, tree: &ConfigTree) -> Result<(), StoreError>;
}

/// One pretty-printed JSON file per version: `<dir>/<version>.json`.
#[derive(Debug, Clone)]
pub struct FileConfigPersistence {
    dir: PathBuf,
}

impl FileConfigPersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, version: u64) -> PathBuf {
        self.dir.join(format!("{version}.json"))
    }

    /// Versions present in the directory, ascending.
    pub fn versions(&self) -> Result<Vec<u64>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut versions = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()).map(str::parse::<u64>) {
                Some(Ok(version)) => versions.push(version),
                _ => debug!(path = %path.display(), "Ignoring unrelated file"),
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    fn ensure_dir(&self) -> Result<(), StoreError> {
        if self.dir.is_dir() {
            return Ok(());
        }
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(&self.dir)?;
        Ok(())
    }
}

impl ConfigPersistence for FileConfigPersistence {
    fn load_latest(&self) -> Result<Option<ConfigTree>, StoreError> {
        let Some(version) = self.versions()?.pop() else {
            return Ok(None);
        };
        let path = self.path_for(version);
        let data = fs::read(&path)?;
        let tree: ConfigTree = serde_json::from_slice(&data).map_err(|e| StoreError::Corrupt {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        if tree.version() != version {
            warn!(
                path = %path.display(),
                version = tree.version(),
                "Document version does not match its file name"
            );
        }
        Ok(Some(tree))
    }

    fn save(&self, tree: &ConfigTree) -> Result<(), StoreError> {
        self.ensure_dir()?;

        let path = self.path_for(tree.version());
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(tree)?)?;
        fs::rename(&tmp, &path)?;

        debug!(path = %path.display(), "Saved configuration");
        Ok(())
    }
}

/// Keeps saved documents in memory.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    saved: Mutex<Vec<ConfigTree>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start as if `tree` had been saved before.
    pub fn with(tree: ConfigTree) -> Self {
        Self {
            saved: Mutex::new(vec![tree]),
        }
    }

    /// Every document saved so far, oldest first.
    pub fn saved(&self) -> Vec<ConfigTree> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ConfigPersistence for MemoryPersistence {
    fn load_latest(&self) -> Result<Option<ConfigTree>, StoreError> {
        Ok(self
            .saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned())
    }

    fn save(&self, tree: &ConfigTree) -> Result<(), StoreError> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tree.clone());
        Ok(())
    }
}
