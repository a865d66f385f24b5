//! Durable call log: one JSON array per named partition.
//!
//! The log doubles as the response cache. Successful calls are looked up by
//! exact `(prompt, model)` equality; partitions whose name contains `error`
//! only hold rejected attempts and are never consulted for lookups.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Result, BrokerError};

pub const DEFAULT_PARTITION: &str = "default";
pub const ERROR_PARTITION: &str = "error";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub model: String,
    pub prompt: String,
    pub response: Value,
    /// Rejection reason; `null` for successful calls
    pub message: Option<String>,
}

impl CallRecord {
    pub fn success(model: &str, prompt: &str, response: Value) -> Self {
        Self {
            model: model.to_string(),
            prompt: prompt.to_string(),
            response,
            message: None,
        }
    }

    pub fn failure(model: &str, prompt: &str, response: Value, message: impl Into<String>) -> Self {
        Self {
            model: model.to_string(),
            prompt: prompt.to_string(),
            response,
            message: Some(message.into()),
        }
    }
}

/// Partition store rooted at a single directory.
///
/// Holds no lock of its own; concurrent access is serialized by the
/// broker that owns it.
#[derive(Debug, Clone)]
pub struct PersistentCallLog {
    dir: PathBuf,
}

impl PersistentCallLog {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn partition_path(&self, partition: &str) -> PathBuf {
        self.dir.join(format!("{}.json", partition))
    }

    pub fn is_error_partition(partition: &str) -> bool {
        partition.contains(ERROR_PARTITION)
    }

    /// Reject names that cannot hold cacheable success records: empty
    /// names, anything that would escape the log directory, and error
    /// partitions that lookups never read.
    pub fn check_partition_name(partition: &str) -> Result<()> {
        if partition.trim().is_empty() {
            return Err(BrokerError::Config("log partition name is empty".to_string()));
        }
        if partition.contains(['/', '\\']) || partition.contains("..") {
            return Err(BrokerError::Config(format!(
                "log partition '{}' must be a plain file name", partition
            )));
        }
        if Self::is_error_partition(partition) {
            return Err(BrokerError::Config(format!(
                "log partition '{}' is reserved for failed attempts", partition
            )));
        }
        Ok(())
    }

    /// Sorted names of every partition currently on disk
    pub fn partitions(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| BrokerError::Log(format!("Failed to scan log directory: {}", e)))?;
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if let Some(stem) = path.file_stem() {
                names.push(stem.to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Records of one partition; an absent partition reads as empty
    pub fn read(&self, partition: &str) -> Result<Vec<CallRecord>> {
        let path = self.partition_path(partition);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path)?;
        serde_json::from_str(&content).map_err(|e| {
            BrokerError::Log(format!("Corrupt log partition {}: {}", path.display(), e))
        })
    }

    /// First successful record matching `(prompt, model)` exactly
    pub fn lookup(&self, prompt: &str, model: &str) -> Result<Option<CallRecord>> {
        for partition in self.partitions()? {
            if Self::is_error_partition(&partition) {
                continue;
            }

            let records = match self.read(&partition) {
                Ok(records) => records,
                Err(e) => {
                    warn!("Skipping unreadable log partition '{}': {}", partition, e);
                    continue;
                }
            };

            if let Some(record) = records.into_iter().find(|r| r.prompt == prompt && r.model == model) {
                debug!("Cache hit in partition '{}' for model {}", partition, model);
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Append a record by rewriting the whole partition.
    ///
    /// The new collection is written to a temporary file in the same
    /// directory and renamed over the old one, so readers only ever see
    /// the previous or the next complete array.
    pub fn append(&self, partition: &str, record: CallRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let mut records = self.read(partition)?;
        records.push(record);

        let content = serde_json::to_string_pretty(&records)?;
        self.replace(partition, &content)?;

        debug!("Appended record to partition '{}' ({} total)", partition, records.len());
        Ok(())
    }

    fn replace(&self, partition: &str, content: &str) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.partition_path(partition))
            .map_err(|e| BrokerError::Log(format!("Failed to replace partition {}: {}", partition, e.error)))?;
        Ok(())
    }
}
