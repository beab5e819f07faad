use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;
use tracing::{info, warn};
use updraft_core::{ErrorKind, Phase, StepStatus, UpdateError, UpdateResult};
use updraft_security::{hashes_match, sha256_file_hex};

use crate::downloader::ChunkDownloader;
use crate::fs_utils::remove_dir_if_exists;
use crate::store::StatusStore;
use crate::format_bytes;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub archive_path: PathBuf,
    pub size: u64,
    pub hash: String,
    pub entry_count: usize,
    /// `None` when the server declared no archive hash.
    pub hash_matches: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveInfo {
    pub path: PathBuf,
    pub size: u64,
    pub entry_count: usize,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveVerification {
    pub valid: bool,
    pub expected_hash: Option<String>,
    pub actual_hash: String,
}

/// Reassembles downloaded chunks into the update archive.
#[derive(Clone)]
pub struct ChunkMerger {
    store: StatusStore,
    downloader: ChunkDownloader,
}

impl ChunkMerger {
    pub fn new(store: StatusStore, downloader: ChunkDownloader) -> Self {
        Self { store, downloader }
    }

    pub fn merge(&self) -> UpdateResult<MergeOutcome> {
        let session = self.store.require()?;
        self.store.set_phase(Phase::Merging)?;
        self.store.append_log("Merging chunks into archive...")?;

        match self.merge_chunks(session.download.total_chunks) {
            Ok(outcome) => {
                if let Some(expected) = session.download.archive_hash.as_deref() {
                    if outcome.hash_matches == Some(false) {
                        self.store.append_log(format!(
                            "Warning: archive hash mismatch (expected {expected}, got {})",
                            outcome.hash
                        ))?;
                    }
                }
                self.store.update_download(|download| {
                    download.status = StepStatus::Completed;
                })?;
                self.store.append_log(format!(
                    "Chunks merged successfully ({}, {} entries)",
                    format_bytes(outcome.size),
                    outcome.entry_count
                ))?;
                Ok(outcome)
            }
            Err(err) => {
                warn!(error = %err, "chunk merge failed");
                self.store.record_error(
                    ErrorKind::MergeFailed,
                    err.to_string(),
                    Default::default(),
                )?;
                Err(err)
            }
        }
    }

    fn merge_chunks(&self, total_chunks: u32) -> UpdateResult<MergeOutcome> {
        let missing = self.downloader.missing(total_chunks)?;
        if !missing.is_empty() {
            return Err(UpdateError::MissingChunks(missing));
        }

        let layout = self.store.layout();
        let archive_path = layout.archive_path();
        let mut size = 0_u64;
        {
            let output = File::create(&archive_path)
                .with_context(|| format!("failed to create {}", archive_path.display()))?;
            let mut writer = BufWriter::new(output);
            for index in 0..total_chunks {
                let chunk_path = layout.chunk_path(index);
                let mut chunk = File::open(&chunk_path)
                    .with_context(|| format!("failed to open {}", chunk_path.display()))?;
                size += io::copy(&mut chunk, &mut writer).with_context(|| {
                    format!(
                        "failed to append {} to {}",
                        chunk_path.display(),
                        archive_path.display()
                    )
                })?;
            }
            writer
                .flush()
                .with_context(|| format!("failed to write {}", archive_path.display()))?;
        }

        let entry_count = open_archive_entry_count(&archive_path)?;
        let hash = sha256_file_hex(&archive_path)?;
        let declared = self
            .store
            .get()?
            .and_then(|session| session.download.archive_hash);
        let hash_matches = declared
            .as_deref()
            .map(|expected| hashes_match(expected, &hash));

        Ok(MergeOutcome {
            archive_path,
            size,
            hash,
            entry_count,
            hash_matches,
        })
    }

    /// Deletes the chunk directory once the merged archive is known to parse.
    pub fn cleanup_chunks(&self) -> UpdateResult<bool> {
        let archive_path = self.store.layout().archive_path();
        if open_archive_entry_count(&archive_path).is_err() {
            warn!("merged archive is not readable; keeping chunks");
            return Ok(false);
        }

        remove_dir_if_exists(&self.store.layout().chunks_dir())?;
        if self.store.get()?.is_some() {
            self.store.update_download(|download| {
                download.completed_chunks.clear();
                download.chunk_hashes.clear();
                download.chunk_sizes.clear();
                download.current_chunk = None;
            })?;
            self.store.append_log("Chunk files cleaned up")?;
        }
        info!("chunk directory removed");
        Ok(true)
    }

    pub fn archive_exists(&self) -> bool {
        open_archive_entry_count(&self.store.layout().archive_path()).is_ok()
    }

    pub fn archive_info(&self) -> UpdateResult<Option<ArchiveInfo>> {
        let path = self.store.layout().archive_path();
        if !path.is_file() {
            return Ok(None);
        }
        let Ok(entry_count) = open_archive_entry_count(&path) else {
            return Ok(None);
        };
        let size = fs::metadata(&path)
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();
        Ok(Some(ArchiveInfo {
            hash: sha256_file_hex(&path)?,
            path,
            size,
            entry_count,
        }))
    }

    /// Compares the merged archive with `expected`, or the declared hash.
    ///
    /// Without any hash to compare against the archive counts as valid.
    pub fn verify(&self, expected: Option<&str>) -> UpdateResult<ArchiveVerification> {
        let path = self.store.layout().archive_path();
        if !path.is_file() {
            return Err(UpdateError::ArchiveCorrupt(format!(
                "archive not found: {}",
                path.display()
            )));
        }

        let actual_hash = sha256_file_hex(&path)?;
        let expected_hash = match expected {
            Some(expected) => Some(expected.to_string()),
            None => self
                .store
                .get()?
                .and_then(|session| session.download.archive_hash),
        };
        let valid = expected_hash
            .as_deref()
            .map(|expected| hashes_match(expected, &actual_hash))
            .unwrap_or(true);

        Ok(ArchiveVerification {
            valid,
            expected_hash,
            actual_hash,
        })
    }
}

pub(crate) fn open_archive_entry_count(path: &Path) -> UpdateResult<usize> {
    let file = File::open(path).map_err(|err| {
        UpdateError::ArchiveCorrupt(format!("cannot open {}: {err}", path.display()))
    })?;
    let archive = zip::ZipArchive::new(file).map_err(|err| {
        UpdateError::ArchiveCorrupt(format!("{} is not a valid zip: {err}", path.display()))
    })?;
    Ok(archive.len())
}
