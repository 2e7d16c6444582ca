use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::util::ensure_directory;

pub trait BlobStore: Send + Sync {
    fn append(&self, key: &str, data: &str) -> Result<()>;
    fn write(&self, key: &str, data: &str) -> Result<()>;
    fn read(&self, key: &str) -> Result<Option<String>>;
}

pub fn run_events_key(run_id: &str) -> String {
    format!("runs/{run_id}/run_events.ndjson")
}

pub fn run_summary_key(run_id: &str) -> String {
    format!("runs/{run_id}/run.json")
}

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)));
        if key.trim().is_empty() || escapes {
            bail!("invalid blob key: {key:?}");
        }
        Ok(self.root.join(relative))
    }

    fn prepare_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            ensure_directory(parent)?;
        }
        Ok(())
    }
}

impl BlobStore for FsBlobStore {
    fn append(&self, key: &str, data: &str) -> Result<()> {
        let path = self.resolve(key)?;
        Self::prepare_parent(&path)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {} for append", path.display()))?;
        file.write_all(data.as_bytes())
            .with_context(|| format!("failed to append to {}", path.display()))
    }

    fn write(&self, key: &str, data: &str) -> Result<()> {
        let path = self.resolve(key)?;
        Self::prepare_parent(&path)?;

        fs::write(&path, data).with_context(|| format!("failed to write {}", path.display()))
    }

    fn read(&self, key: &str) -> Result<Option<String>> {
        let path = self.resolve(key)?;
        if !path.exists() {
            return Ok(None);
        }

        fs::read_to_string(&path)
            .map(Some)
            .with_context(|| format!("failed to read {}", path.display()))
    }
}
