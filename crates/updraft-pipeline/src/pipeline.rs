use std::fs;
use std::io;
use std::path::Path;

use anyhow::{anyhow, Context};
use serde::Serialize;
use tracing::{info, warn};
use updraft_core::{
    percent_of, ExtractionProgress, Phase, ReplacementProgress, ResumePoint, SessionSeed,
    StepStatus, UpdateConfig, UpdateError, UpdateResult, UpdateSession,
};
use updraft_remote::UpdateCheck;
use updraft_security::sha256_file_hex;

use crate::downloader::{ChunkDownloader, ChunkReceipt};
use crate::extractor::{BatchExtractor, ExtractionBatch};
use crate::fs_utils::{remove_dir_if_exists, remove_file_if_exists, write_atomic};
use crate::host::SharedHost;
use crate::layout::{InstallTargets, UpdateLayout};
use crate::merger::{ArchiveInfo, ArchiveVerification, ChunkMerger, MergeOutcome};
use crate::migration::{MigrationOutcome, MigrationRunner};
use crate::replacer::{BatchReplacer, ReplaceFilter, ReplacementBatch};
use crate::store::StatusStore;
use crate::SharedRemote;

const VERSION_KEY: &str = "item_version";

/// The operation a driver should run next to move the session forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum NextStep {
    DownloadChunks { indices: Vec<u32> },
    Merge,
    ExtractBatch { batch: u32 },
    ReplaceBatch { batch: u32 },
    Migrate { is_tenant: bool },
    Complete,
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub session: Option<UpdateSession>,
    pub can_resume: bool,
    pub archive_ready: bool,
    pub archive: Option<ArchiveInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkProgress {
    pub total_chunks: u32,
    pub completed_chunks: Vec<u32>,
    pub missing_chunks: Vec<u32>,
    pub downloaded_size: u64,
    pub total_size: u64,
    pub percent: u8,
}

/// Sequences the update phases and is the single entry point for drivers.
pub struct UpdatePipeline {
    config: UpdateConfig,
    store: StatusStore,
    remote: SharedRemote,
    host: SharedHost,
    downloader: ChunkDownloader,
    merger: ChunkMerger,
    extractor: BatchExtractor,
    replacer: BatchReplacer,
}

impl UpdatePipeline {
    pub fn new(config: UpdateConfig, remote: SharedRemote, host: SharedHost) -> Self {
        let store = StatusStore::open(UpdateLayout::new(config.paths.state_dir()));
        Self::with_store(config, store, remote, host)
    }

    pub fn with_store(
        config: UpdateConfig,
        store: StatusStore,
        remote: SharedRemote,
        host: SharedHost,
    ) -> Self {
        let downloader = ChunkDownloader::new(store.clone(), remote.clone());
        let merger = ChunkMerger::new(store.clone(), downloader.clone());
        let extractor = BatchExtractor::new(store.clone());
        let replacer = BatchReplacer::new(
            store.clone(),
            host.clone(),
            InstallTargets::from_paths(&config.paths),
            config.replacement.clone(),
            &config.update,
        );
        Self {
            config,
            store,
            remote,
            host,
            downloader,
            merger,
            extractor,
            replacer,
        }
    }

    /// Installs a caller predicate that can veto individual file replacements.
    pub fn with_replace_filter(mut self, filter: ReplaceFilter) -> Self {
        self.replacer = self.replacer.with_filter(filter);
        self
    }

    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    /// Installed version from the version file, then from configuration.
    pub fn current_version(&self) -> UpdateResult<String> {
        if let Some(version) = read_installed_version(&self.config.paths.version_file())? {
            return Ok(version);
        }
        Ok(self.config.server.current_version.clone().unwrap_or_default())
    }

    pub fn check_for_update(&self) -> UpdateResult<UpdateCheck> {
        let current = self.current_version()?;
        let mut check = self.remote.check_for_update(&current)?;
        if check.current_version.is_none() && !current.is_empty() {
            check.current_version = Some(current);
        }
        info!(
            available = check.update_available,
            latest = check.latest_version.as_deref().unwrap_or("-"),
            "update check finished"
        );
        Ok(check)
    }

    /// Starts a session for `target_version`.
    ///
    /// Refuses while a resumable session exists; a finished, failed or
    /// cancelled leftover is wiped and superseded.
    pub fn initiate(&mut self, target_version: &str, is_tenant: bool) -> UpdateResult<UpdateSession> {
        let target_version = target_version.trim();
        if target_version.is_empty() {
            return Err(UpdateError::session_state("target version must not be empty"));
        }
        if let Some(existing) = self.store.get()? {
            if existing.can_resume() {
                return Err(UpdateError::session_state(format!(
                    "an update to {} is already in progress (phase {}); resume or cancel it first",
                    existing.version.target, existing.phase
                )));
            }
            info!(session = %existing.id, "superseding finished update session");
        }
        self.store.reset()?;
        self.forget_caches();

        let manifest = self.remote.chunk_manifest(target_version)?;
        if manifest.total_chunks == 0 {
            return Err(UpdateError::Network(format!(
                "server announced no chunks for version {target_version}"
            )));
        }

        let seed = SessionSeed {
            current_version: self.current_version()?,
            total_chunks: manifest.total_chunks,
            chunk_size: if manifest.chunk_size > 0 {
                manifest.chunk_size
            } else {
                self.config.update.chunk_size
            },
            total_size: manifest.total_size,
            archive_hash: manifest.archive_hash,
            total_files: manifest.total_files,
            skip_files: Vec::new(),
            skip_directories: Vec::new(),
            is_tenant,
        };
        let session = self.store.initiate(target_version, seed)?;
        self.store.append_log(format!(
            "Update initiated: {} -> {} ({} chunks)",
            session.version.current, session.version.target, session.download.total_chunks
        ))?;
        self.store.require()
    }

    pub fn status(&self) -> UpdateResult<StatusReport> {
        let session = self.store.get()?;
        let archive = self.merger.archive_info()?;
        Ok(StatusReport {
            can_resume: session.as_ref().is_some_and(UpdateSession::can_resume),
            archive_ready: archive.is_some(),
            archive,
            session,
        })
    }

    pub fn resume_info(&self) -> UpdateResult<Option<ResumePoint>> {
        self.store.resume_point()
    }

    /// Brings the recorded chunk set in line with the chunk files on disk.
    ///
    /// Returns the indices still missing.
    pub fn reconcile_chunks(&self) -> UpdateResult<Vec<u32>> {
        let session = self.store.require()?;
        let on_disk = self.downloader.list_completed()?;
        let total = session.download.total_chunks;

        for index in on_disk.iter().copied().filter(|index| *index < total) {
            if session.download.completed_chunks.contains(&index) {
                continue;
            }
            let path = self.store.layout().chunk_path(index);
            let hash = sha256_file_hex(&path)?;
            let size = fs::metadata(&path)
                .with_context(|| format!("failed to stat {}", path.display()))?
                .len();
            self.store.mark_chunk_completed(index, &hash, size)?;
            info!(chunk = index, "recovered chunk found on disk");
        }
        for index in session.download.completed_chunks.iter().copied() {
            if !on_disk.contains(&index) {
                self.store.update(|session| session.forget_chunk(index))?;
                warn!(chunk = index, "recorded chunk missing on disk; will download again");
                continue;
            }
            let Some(expected) = session.download.chunk_hashes.get(&index) else {
                continue;
            };
            if !self.downloader.verify(index, expected)? {
                self.downloader.delete(index)?;
                warn!(chunk = index, "chunk file no longer matches its hash; will download again");
            }
        }
        self.downloader.missing(total)
    }

    /// Derives the next operation from persisted state alone.
    pub fn resume(&self) -> UpdateResult<NextStep> {
        let Some(session) = self.store.get()? else {
            return Ok(NextStep::Idle);
        };
        if !session.can_resume() {
            return Ok(NextStep::Idle);
        }

        let step = match session.effective_phase() {
            Phase::Merging
                if self.merger.archive_exists() && self.downloader.list_completed()?.is_empty() =>
            {
                // Merged and cleaned up, but the phase change was never persisted.
                self.store.set_phase(Phase::Extraction)?;
                NextStep::ExtractBatch {
                    batch: session.extraction.batches_applied,
                }
            }
            Phase::Initialized | Phase::Download | Phase::Merging => {
                let missing = self.reconcile_chunks()?;
                if missing.is_empty() {
                    NextStep::Merge
                } else {
                    NextStep::DownloadChunks { indices: missing }
                }
            }
            Phase::Extraction if session.extraction.status == StepStatus::Completed => {
                NextStep::ReplaceBatch {
                    batch: session.replacement.batches_applied,
                }
            }
            Phase::Extraction => NextStep::ExtractBatch {
                batch: session.extraction.batches_applied,
            },
            Phase::Replacement if session.replacement.status == StepStatus::Completed => {
                NextStep::Migrate {
                    is_tenant: session.is_tenant,
                }
            }
            Phase::Replacement => NextStep::ReplaceBatch {
                batch: session.replacement.batches_applied,
            },
            Phase::Migration if session.migration.status == StepStatus::Completed => {
                NextStep::Complete
            }
            Phase::Migration => NextStep::Migrate {
                is_tenant: session.is_tenant,
            },
            Phase::Completing => NextStep::Complete,
            Phase::Completed | Phase::Error | Phase::FatalError | Phase::Cancelled => {
                NextStep::Idle
            }
        };
        Ok(step)
    }

    /// Tears down the session and all staged data, whatever phase it was in.
    pub fn cancel(&mut self) -> UpdateResult<()> {
        if let Some(session) = self.store.get()? {
            if session.maintenance_mode {
                if let Err(err) = self.host.disable_maintenance() {
                    warn!(error = %err, "could not disable maintenance mode while cancelling");
                }
            }
            if let Err(err) = self.store.mark_cancelled() {
                warn!(error = %err, "could not record cancellation");
            }
            info!(session = %session.id, "update cancelled");
        }
        self.store.reset()?;
        self.forget_caches();
        Ok(())
    }

    pub fn missing_chunks(&self) -> UpdateResult<Vec<u32>> {
        let session = self.store.require()?;
        self.downloader.missing(session.download.total_chunks)
    }

    pub fn download_chunk(&self, index: u32) -> UpdateResult<ChunkReceipt> {
        self.downloader.download(index)
    }

    pub fn redownload_chunk(&self, index: u32) -> UpdateResult<ChunkReceipt> {
        self.downloader.delete(index)?;
        self.downloader.download(index)
    }

    pub fn chunk_progress(&self) -> UpdateResult<ChunkProgress> {
        let session = self.store.require()?;
        let total = session.download.total_chunks;
        let completed = self.downloader.list_completed()?;
        let missing = self.downloader.missing(total)?;
        Ok(ChunkProgress {
            total_chunks: total,
            percent: percent_of(completed.len() as u64, u64::from(total)),
            completed_chunks: completed.into_iter().collect(),
            missing_chunks: missing,
            downloaded_size: self.downloader.downloaded_size()?,
            total_size: session.download.total_size,
        })
    }

    /// Merges all chunks, drops them once the archive parses, and enters extraction.
    pub fn merge(&self) -> UpdateResult<MergeOutcome> {
        let outcome = self.merger.merge()?;
        self.merger.cleanup_chunks()?;
        self.store.set_phase(Phase::Extraction)?;
        Ok(outcome)
    }

    /// Re-hashes the merged archive against `expected` or the declared archive hash.
    pub fn verify_archive(&self, expected: Option<&str>) -> UpdateResult<ArchiveVerification> {
        self.merger.verify(expected)
    }

    pub fn extract_batch(&mut self, batch: u32) -> UpdateResult<ExtractionBatch> {
        let session = self.store.require()?;
        if session.effective_phase() != Phase::Extraction {
            return Err(UpdateError::session_state(format!(
                "extraction is not possible in phase {}",
                session.effective_phase()
            )));
        }
        if !self.merger.archive_exists() {
            return Err(UpdateError::session_state(
                "no merged archive; merge the chunks first",
            ));
        }
        self.extractor
            .extract_batch(batch, self.config.update.extraction_batch_size)
    }

    pub fn extraction_progress(&self) -> UpdateResult<ExtractionProgress> {
        Ok(self.store.require()?.extraction)
    }

    pub fn replace_batch(&mut self, batch: u32) -> UpdateResult<ReplacementBatch> {
        let session = self.store.require()?;
        if !matches!(
            session.effective_phase(),
            Phase::Extraction | Phase::Replacement
        ) || session.extraction.status != StepStatus::Completed
        {
            return Err(UpdateError::session_state(
                "replacement requires a completed extraction",
            ));
        }
        self.replacer
            .replace_batch(batch, self.config.update.replacement_batch_size)
    }

    pub fn replacement_progress(&self) -> UpdateResult<ReplacementProgress> {
        Ok(self.store.require()?.replacement)
    }

    pub fn set_skip_files(&self, files: Vec<String>) -> UpdateResult<Vec<String>> {
        let files = normalize_list(files);
        self.store.update(|session| session.skip_files = files.clone())?;
        self.store
            .append_log(format!("Skip files updated ({} entries)", files.len()))?;
        Ok(files)
    }

    pub fn set_skip_directories(&self, directories: Vec<String>) -> UpdateResult<Vec<String>> {
        let directories = normalize_list(directories);
        self.store
            .update(|session| session.skip_directories = directories.clone())?;
        self.store.append_log(format!(
            "Skip directories updated ({} entries)",
            directories.len()
        ))?;
        Ok(directories)
    }

    pub fn set_maintenance(&self, enable: bool) -> UpdateResult<()> {
        if enable {
            self.host.enable_maintenance()?;
        } else {
            self.host.disable_maintenance()?;
        }
        if self.store.get()?.is_some() {
            self.store.update(|session| session.maintenance_mode = enable)?;
            self.store.append_log(if enable {
                "Maintenance mode enabled"
            } else {
                "Maintenance mode disabled"
            })?;
        }
        Ok(())
    }

    pub fn set_paused(&self, paused: bool) -> UpdateResult<()> {
        self.store.update(|session| session.paused = paused)?;
        self.store
            .append_log(if paused { "Update paused" } else { "Update resumed" })
    }

    pub fn is_paused(&self) -> UpdateResult<bool> {
        Ok(self.store.get()?.is_some_and(|session| session.paused))
    }

    /// Runs migrations; `None` uses the tenant flag captured at initiation.
    pub fn run_migration(&self, is_tenant: Option<bool>) -> UpdateResult<MigrationOutcome> {
        let session = self.store.require()?;
        let is_tenant = is_tenant.unwrap_or(session.is_tenant);
        MigrationRunner::new(
            self.store.clone(),
            self.host.clone(),
            self.config.update.tenant_chunk_size,
        )
        .migrate(is_tenant)
    }

    /// Records the new version, marks the session completed and purges staging.
    ///
    /// Calling it again on a completed session changes nothing.
    pub fn complete(&mut self) -> UpdateResult<UpdateSession> {
        let session = self.store.require()?;
        if session.phase == Phase::Completed {
            return Ok(session);
        }
        if session.replacement.status != StepStatus::Completed {
            return Err(UpdateError::session_state(
                "cannot complete an update before file replacement has finished",
            ));
        }
        if session.migration.status != StepStatus::Completed {
            self.store
                .append_log("Warning: completing without a successful migration run")?;
        }

        self.store.set_phase(Phase::Completing)?;
        self.replacer.update_self_package()?;
        write_installed_version(&self.config.paths.version_file(), &session.version.target)?;
        let session = self.store.mark_complete()?;
        self.purge_staging()?;
        info!(version = %session.version.target, "update completed");
        Ok(session)
    }

    /// Completes the session if needed, then deletes it. A no-op without a session.
    pub fn finalize(&mut self) -> UpdateResult<Option<UpdateSession>> {
        if self.store.get()?.is_none() {
            return Ok(None);
        }
        let session = self.complete()?;
        self.store.reset()?;
        self.forget_caches();
        Ok(Some(session))
    }

    fn purge_staging(&mut self) -> UpdateResult<()> {
        let layout = self.store.layout();
        remove_dir_if_exists(&layout.chunks_dir())?;
        remove_dir_if_exists(&layout.extracted_dir())?;
        let archive = layout.archive_path();
        remove_file_if_exists(&archive)
            .with_context(|| format!("failed to remove {}", archive.display()))?;
        self.forget_caches();
        Ok(())
    }

    fn forget_caches(&mut self) {
        self.extractor = BatchExtractor::new(self.store.clone());
        self.replacer.reset();
    }
}

fn normalize_list(values: Vec<String>) -> Vec<String> {
    let mut normalized = Vec::new();
    for value in values {
        let value = value.trim().to_string();
        if !value.is_empty() && !normalized.contains(&value) {
            normalized.push(value);
        }
    }
    normalized
}

pub fn read_installed_version(path: &Path) -> UpdateResult<Option<String>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(anyhow::Error::new(err)
                .context(format!("failed to read {}", path.display()))
                .into())
        }
    };
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|err| anyhow!("invalid version file {}: {err}", path.display()))?;
    Ok(value
        .get(VERSION_KEY)
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .map(str::to_string))
}

/// Stores `version` under `item_version`, keeping every other key of the file.
pub fn write_installed_version(path: &Path, version: &str) -> UpdateResult<()> {
    let mut object = match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(serde_json::Value::Object(object)) => object,
            _ => {
                warn!(path = %path.display(), "version file is not a JSON object; rewriting it");
                serde_json::Map::new()
            }
        },
        Err(err) if err.kind() == io::ErrorKind::NotFound => serde_json::Map::new(),
        Err(err) => {
            return Err(anyhow::Error::new(err)
                .context(format!("failed to read {}", path.display()))
                .into())
        }
    };
    object.insert(
        VERSION_KEY.to_string(),
        serde_json::Value::String(version.to_string()),
    );
    let payload = serde_json::to_vec_pretty(&serde_json::Value::Object(object))
        .context("failed to serialize version file")?;
    write_atomic(path, &payload)?;
    Ok(())
}
