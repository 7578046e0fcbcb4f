use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use crate::model::{RunKey, RunRecord};
use crate::{atomic_write_json_pretty, ensure_dir};

/// Name of the combined per-batch collection inside the raw directory. It is
/// a cache and is never read back as a record.
pub const COMBINED_FILE: &str = "all_results.json";

/// One JSON file per cell under `raw/`, keyed by (task, condition, run).
#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join("raw")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    pub fn batches_dir(&self) -> PathBuf {
        self.root.join("batches")
    }

    pub fn record_path(&self, key: &RunKey) -> PathBuf {
        self.raw_dir().join(key.file_name())
    }

    /// Create-or-overwrite the record's file. The path is derived from the
    /// record's key only, so updates always land on the same file.
    pub fn save(&self, record: &RunRecord) -> Result<PathBuf> {
        record.key().validate()?;
        let path = self.record_path(record.key());
        atomic_write_json_pretty(&path, record)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    pub fn load(&self, key: &RunKey) -> Result<Option<RunRecord>> {
        let path = self.record_path(key);
        if !path.exists() {
            return Ok(None);
        }
        read_record(&path).map(Some)
    }

    /// Every readable record, sorted by file name. Unreadable files are
    /// logged and skipped.
    pub fn load_all(&self) -> Result<Vec<RunRecord>> {
        let raw = self.raw_dir();
        if !raw.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in WalkDir::new(&raw)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if !name.ends_with(".json") || name == COMBINED_FILE || name.starts_with('.') {
                continue;
            }
            match read_record(entry.path()) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(path = %entry.path().display(), "skipping unreadable record: {:#}", err)
                }
            }
        }
        Ok(records)
    }

    pub fn write_combined(&self, records: &[RunRecord]) -> Result<PathBuf> {
        let path = self.raw_dir().join(COMBINED_FILE);
        atomic_write_json_pretty(&path, records)?;
        Ok(path)
    }

    fn batch_manifest_path(&self, batch_id: &str) -> PathBuf {
        self.batches_dir().join(format!("{}.json", batch_id))
    }

    /// `base`, or `base-2`, `base-3`, ... when a manifest already holds it.
    pub fn unused_batch_id(&self, base: &str) -> String {
        let mut candidate = base.to_string();
        let mut n = 2;
        while self.batch_manifest_path(&candidate).exists() {
            candidate = format!("{}-{}", base, n);
            n += 1;
        }
        candidate
    }

    pub fn write_batch_manifest<T: Serialize>(
        &self,
        batch_id: &str,
        manifest: &T,
    ) -> Result<PathBuf> {
        ensure_dir(&self.batches_dir())?;
        let path = self.batch_manifest_path(batch_id);
        atomic_write_json_pretty(&path, manifest)?;
        Ok(path)
    }
}

fn read_record(path: &Path) -> Result<RunRecord> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).with_context(|| format!("invalid record {}", path.display()))
}
