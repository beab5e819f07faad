use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use serde::Serialize;
use tracing::{debug, warn};
use updraft_core::{
    percent_of, EntryFailure, ErrorKind, Phase, StepStatus, UpdateError, UpdateResult,
};
use zip::ZipArchive;

use crate::fs_utils::{remove_dir_if_exists, to_slash_path};
use crate::store::StatusStore;

const WRAPPER_PREFIXES: [&str; 3] = ["update/", "Update/", "UPDATE/"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractionBatch {
    pub batch: u32,
    pub extracted_in_batch: u64,
    pub extracted_total: u64,
    pub total_files: u64,
    pub has_more: bool,
    pub percent: u8,
    pub next_batch: Option<u32>,
    pub errors: Vec<EntryFailure>,
}

#[derive(Debug, Clone)]
struct ArchiveEntry {
    index: usize,
    name: String,
}

/// Unpacks the merged archive into the staging directory a batch at a time.
///
/// The ordered entry list is built once per extractor and always in archive
/// order, so a batch number addresses the same entries across processes.
pub struct BatchExtractor {
    store: StatusStore,
    archive: Option<ZipArchive<File>>,
    entries: Option<Vec<ArchiveEntry>>,
}

impl BatchExtractor {
    pub fn new(store: StatusStore) -> Self {
        Self {
            store,
            archive: None,
            entries: None,
        }
    }

    pub fn extract_batch(&mut self, batch: u32, batch_size: usize) -> UpdateResult<ExtractionBatch> {
        if batch_size == 0 {
            return Err(UpdateError::session_state("extraction batch size must be positive"));
        }
        self.store.require()?;
        self.store.set_phase(Phase::Extraction)?;

        match self.extract_entries(batch, batch_size) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!(batch, error = %err, "extraction batch failed");
                let context = [("batch".to_string(), batch.to_string())].into();
                self.store
                    .record_error(ErrorKind::ExtractionFailed, err.to_string(), context)?;
                Err(err)
            }
        }
    }

    fn extract_entries(&mut self, batch: u32, batch_size: usize) -> UpdateResult<ExtractionBatch> {
        self.ensure_entries(batch_size)?;
        let entries = self.entries.clone().unwrap_or_default();
        let total = entries.len();
        let start = (batch as usize).saturating_mul(batch_size);

        if start >= total {
            let total_files = total as u64;
            let extracted_total = self.store.update_extraction(|extraction| {
                let covered = (extraction.batches_applied as usize).saturating_mul(batch_size);
                if covered >= total {
                    extraction.status = StepStatus::Completed;
                    extraction.percent = 100;
                }
                extraction.extracted_files
            })?;
            return Ok(ExtractionBatch {
                batch,
                extracted_in_batch: 0,
                extracted_total,
                total_files,
                has_more: false,
                percent: 100,
                next_batch: None,
                errors: Vec::new(),
            });
        }

        let applied = self.store.require()?.extraction.batches_applied;
        if batch > applied {
            return Err(UpdateError::session_state(format!(
                "extraction batch {batch} requested before batch {applied}"
            )));
        }

        let staging = self.store.layout().extracted_dir();
        fs::create_dir_all(&staging)
            .with_context(|| format!("failed to create {}", staging.display()))?;

        let end = (start + batch_size).min(total);
        let mut extracted_in_batch = 0_u64;
        let mut errors = Vec::new();
        for entry in &entries[start..end] {
            match self.extract_entry(entry, &staging) {
                Ok(()) => extracted_in_batch += 1,
                Err(err) => {
                    warn!(entry = %entry.name, error = %err, "skipping archive entry");
                    errors.push(EntryFailure::new(&entry.name, format!("{err:#}")));
                }
            }
        }

        let has_more = end < total;
        let replayed = batch < applied;
        let percent = percent_of(end as u64, total as u64);
        let extracted_total = self.store.update_extraction(|extraction| {
            extraction.status = if has_more {
                StepStatus::InProgress
            } else {
                StepStatus::Completed
            };
            // Only entries actually written count; a replay rewrites the same files.
            if !replayed {
                extraction.extracted_files += extracted_in_batch;
            }
            extraction.current_batch = Some(batch);
            extraction.batches_applied = extraction.batches_applied.max(batch + 1);
            extraction.percent = extraction.percent.max(percent);
            extraction.extracted_files
        })?;
        if batch % 5 == 0 || !has_more {
            self.store.append_log(format!(
                "Extracted {extracted_total} of {total} files ({percent}%)"
            ))?;
        }

        Ok(ExtractionBatch {
            batch,
            extracted_in_batch,
            extracted_total,
            total_files: total as u64,
            has_more,
            percent,
            next_batch: has_more.then_some(batch + 1),
            errors,
        })
    }

    fn extract_entry(&mut self, entry: &ArchiveEntry, staging: &Path) -> anyhow::Result<()> {
        let archive = self
            .archive
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("archive is not open"))?;
        let mut file = archive
            .by_index(entry.index)
            .with_context(|| format!("cannot read entry {}", entry.name))?;
        let relative = staged_relative_path(file.enclosed_name().map(Path::to_path_buf))
            .ok_or_else(|| anyhow::anyhow!("unsafe entry path: {}", entry.name))?;

        let output = staging.join(&relative);
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut writer = File::create(&output)
            .with_context(|| format!("failed to create {}", output.display()))?;
        io::copy(&mut file, &mut writer)
            .with_context(|| format!("failed to write {}", output.display()))?;
        Ok(())
    }

    fn open_archive(&mut self) -> UpdateResult<()> {
        if self.archive.is_some() {
            return Ok(());
        }
        let path = self.store.layout().archive_path();
        let file = File::open(&path).map_err(|err| {
            UpdateError::ArchiveCorrupt(format!("cannot open {}: {err}", path.display()))
        })?;
        let archive = ZipArchive::new(file).map_err(|err| {
            UpdateError::ArchiveCorrupt(format!("{} is not a valid zip: {err}", path.display()))
        })?;
        self.archive = Some(archive);
        Ok(())
    }

    fn build_entries(&mut self) -> UpdateResult<()> {
        if self.entries.is_some() {
            return Ok(());
        }
        self.open_archive()?;
        let Some(archive) = self.archive.as_mut() else {
            return Ok(());
        };

        let mut entries = Vec::new();
        for index in 0..archive.len() {
            let file = archive.by_index_raw(index).map_err(|err| {
                UpdateError::ArchiveCorrupt(format!("cannot read entry #{index}: {err}"))
            })?;
            let name = file.name().to_string();
            if file.is_dir() || is_archive_noise(&name) {
                continue;
            }
            entries.push(ArchiveEntry { index, name });
        }
        debug!(files = entries.len(), "built archive file list");
        self.entries = Some(entries);
        Ok(())
    }

    fn ensure_entries(&mut self, batch_size: usize) -> UpdateResult<()> {
        self.build_entries()?;
        let count = self.entries.as_ref().map(Vec::len).unwrap_or_default();
        let total_batches = count.div_ceil(batch_size) as u32;
        self.store.update_extraction(|extraction| {
            extraction.total_files = count as u64;
            extraction.total_batches = total_batches;
        })?;
        Ok(())
    }

    pub fn total_files(&mut self) -> UpdateResult<u64> {
        Ok(self.file_list()?.len() as u64)
    }

    /// Entry names in batch order, empty when no archive has been merged.
    pub fn file_list(&mut self) -> UpdateResult<Vec<String>> {
        if self.entries.is_none() && !self.store.layout().archive_path().is_file() {
            return Ok(Vec::new());
        }
        self.build_entries()?;
        Ok(self
            .entries
            .as_ref()
            .map(|entries| entries.iter().map(|entry| entry.name.clone()).collect())
            .unwrap_or_default())
    }

    /// Drops the staging directory and the cached file list.
    pub fn reset(&mut self) -> UpdateResult<()> {
        self.archive = None;
        self.entries = None;
        remove_dir_if_exists(&self.store.layout().extracted_dir())?;
        if self.store.get()?.is_some() {
            self.store.update_extraction(|extraction| {
                *extraction = Default::default();
            })?;
        }
        Ok(())
    }
}

/// Hidden files other than `.htaccess` and OS metadata never reach staging.
pub fn is_archive_noise(name: &str) -> bool {
    let file_name = name.rsplit('/').next().unwrap_or(name);
    if file_name.starts_with('.') && file_name != ".htaccess" {
        return true;
    }
    name.contains("__MACOSX") || file_name == "Thumbs.db"
}

/// Staging-relative path of an archive entry with any `update/` wrapper removed.
pub fn staged_relative_path(enclosed: Option<PathBuf>) -> Option<PathBuf> {
    let enclosed = enclosed?;
    if enclosed
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return None;
    }

    let slashed = to_slash_path(&enclosed);
    let stripped = WRAPPER_PREFIXES
        .iter()
        .find_map(|prefix| slashed.strip_prefix(prefix))
        .unwrap_or(slashed.as_str());
    if stripped.is_empty() {
        return None;
    }
    Some(PathBuf::from(stripped))
}
