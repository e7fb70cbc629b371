use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::normalize::normalize_key;

/// Durable set of keys that are fully processed. Backed by a plain-text,
/// newline-delimited file that is only ever appended to.
pub struct CheckpointStore {
    path: PathBuf,
    keys: HashSet<String>,
    file: File,
}

impl CheckpointStore {
    /// Read every committed key. A missing file is an empty store; any other
    /// read failure is fatal so a run never mistakes old work for new.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create checkpoint directory {:?}", dir))?;
        }

        let keys: HashSet<String> = match fs::read_to_string(&path) {
            Ok(text) => text
                .lines()
                .map(normalize_key)
                .filter(|k| !k.is_empty())
                .collect(),
            Err(e) if e.kind() == ErrorKind::NotFound => HashSet::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("Checkpoint file {:?} is unreadable", path))
            }
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open checkpoint file {:?} for append", path))?;

        info!(path = %path.display(), keys = keys.len(), "Loaded checkpoint");
        Ok(Self { path, keys, file })
    }

    /// Merge keys known from elsewhere (e.g. names already in output tables).
    /// In memory only.
    pub fn seed<I, S>(&mut self, keys: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let before = self.keys.len();
        self.keys.extend(
            keys.into_iter()
                .map(|k| normalize_key(k.as_ref()))
                .filter(|k| !k.is_empty()),
        );
        self.keys.len() - before
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(&normalize_key(key))
    }

    /// Append the key durably. Re-committing a known key writes nothing.
    pub fn commit(&mut self, key: &str) -> Result<()> {
        let key = normalize_key(key);
        if key.is_empty() || self.keys.contains(&key) {
            return Ok(());
        }
        // one write per line so concurrent appenders never interleave mid-key
        self.file
            .write_all(format!("{}\n", key).as_bytes())
            .and_then(|_| self.file.flush())
            .with_context(|| format!("Failed to append to checkpoint {:?}", self.path))?;
        debug!(key = %key, "Checkpointed");
        self.keys.insert(key);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
