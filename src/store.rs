#![forbid(unsafe_code)]

//! Durable record of source videos that have already been republished.
//!
//! The file is a pretty-printed JSON array of source ids, which keeps it
//! compatible with hand edits (removing an id makes that video eligible
//! again). Every query re-reads the file instead of trusting an in-memory
//! copy, and every write goes through a temp file plus rename so a crash can
//! never leave a half-written array behind.

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PublishedStore {
    path: PathBuf,
}

impl PublishedStore {
    /// Points the store at `path`. Nothing is read until the first query.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns every recorded id in insertion order. A missing file is an
    /// empty store; a corrupt one is an error so history is never dropped.
    pub fn load(&self) -> Result<Vec<String>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", self.path.display()))
    }

    pub fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.load()?.iter().any(|entry| entry == id))
    }

    /// Adds `id` unless it is already present. Returns whether the file
    /// changed.
    pub fn record(&self, id: &str) -> Result<bool> {
        let mut ids = self.load()?;
        if ids.iter().any(|entry| entry == id) {
            debug!(video_id = %id, "already recorded");
            return Ok(false);
        }
        ids.push(id.to_string());
        self.persist(&ids)?;
        Ok(true)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.load()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn persist(&self, ids: &[String]) -> Result<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;

        let mut tmp = NamedTempFile::new_in(parent)
            .with_context(|| format!("creating temp file in {}", parent.display()))?;
        let payload = serde_json::to_vec_pretty(ids)?;
        tmp.write_all(&payload)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}
