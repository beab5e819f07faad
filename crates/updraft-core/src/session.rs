use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, UpdateError, UpdateResult};
use crate::phase::{Phase, StepStatus};
use crate::percent_of;

pub const LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionPair {
    pub current: String,
    pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    #[serde(default)]
    pub status: StepStatus,
    pub total_chunks: u32,
    pub chunk_size: u64,
    pub total_size: u64,
    #[serde(default)]
    pub downloaded_size: u64,
    #[serde(default)]
    pub completed_chunks: BTreeSet<u32>,
    #[serde(default)]
    pub chunk_hashes: BTreeMap<u32, String>,
    #[serde(default)]
    pub chunk_sizes: BTreeMap<u32, u64>,
    #[serde(default)]
    pub current_chunk: Option<u32>,
    #[serde(default)]
    pub archive_hash: Option<String>,
    #[serde(default)]
    pub percent: u8,
}

impl DownloadProgress {
    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|index| !self.completed_chunks.contains(index))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.total_chunks > 0 && self.missing_chunks().is_empty()
    }

    pub(crate) fn recompute(&mut self) {
        self.downloaded_size = self.chunk_sizes.values().sum();
        self.percent = if self.total_chunks == 0 {
            0
        } else {
            percent_of(
                self.completed_chunks.len() as u64,
                u64::from(self.total_chunks),
            )
        };
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionProgress {
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub total_files: u64,
    #[serde(default)]
    pub extracted_files: u64,
    #[serde(default)]
    pub current_batch: Option<u32>,
    #[serde(default)]
    pub batches_applied: u32,
    #[serde(default)]
    pub total_batches: u32,
    #[serde(default)]
    pub percent: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementProgress {
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub total_files: u64,
    #[serde(default)]
    pub replaced_files: u64,
    #[serde(default)]
    pub skipped_files: u64,
    #[serde(default)]
    pub current_batch: Option<u32>,
    #[serde(default)]
    pub batches_applied: u32,
    #[serde(default)]
    pub total_batches: u32,
    #[serde(default)]
    pub percent: u8,
    #[serde(default)]
    pub current_file: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationProgress {
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub migrations_run: bool,
    #[serde(default)]
    pub seeders_run: bool,
    #[serde(default)]
    pub tenants_total: u64,
    #[serde(default)]
    pub tenants_migrated: u64,
    #[serde(default)]
    pub tenants_failed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Analyzed,
    #[default]
    NoChanges,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionChange {
    pub old: String,
    pub new: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockedChangeKind {
    Added,
    Changed,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedChange {
    pub kind: LockedChangeKind,
    #[serde(default)]
    pub old_version: Option<String>,
    #[serde(default)]
    pub new_version: Option<String>,
}

/// Cached outcome of comparing the live and staged dependency manifests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyAnalysis {
    pub status: AnalysisStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub added: BTreeMap<String, String>,
    #[serde(default)]
    pub removed: BTreeMap<String, String>,
    #[serde(default)]
    pub changed: BTreeMap<String, VersionChange>,
    #[serde(default)]
    pub locked: BTreeMap<String, LockedChange>,
}

impl DependencyAnalysis {
    pub fn no_changes() -> Self {
        Self::default()
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: AnalysisStatus::Failed,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn has_changes(&self) -> bool {
        !self.added.is_empty()
            || !self.removed.is_empty()
            || !self.changed.is_empty()
            || !self.locked.is_empty()
    }

    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.added.is_empty() {
            parts.push(format!("{} package(s) added", self.added.len()));
        }
        if !self.removed.is_empty() {
            parts.push(format!("{} package(s) removed", self.removed.len()));
        }
        if !self.changed.is_empty() {
            parts.push(format!("{} package(s) updated", self.changed.len()));
        }
        let locked_only = self
            .locked
            .keys()
            .filter(|name| {
                !self.added.contains_key(*name)
                    && !self.removed.contains_key(*name)
                    && !self.changed.contains_key(*name)
            })
            .count();
        if locked_only > 0 {
            parts.push(format!("{locked_only} locked version change(s)"));
        }

        if parts.is_empty() {
            "No dependency changes detected".to_string()
        } else {
            format!("Dependency changes: {}", parts.join(", "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at_unix: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    pub occurred_at_unix: u64,
}

/// Metadata captured when a session is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSeed {
    pub current_version: String,
    pub total_chunks: u32,
    pub chunk_size: u64,
    pub total_size: u64,
    pub archive_hash: Option<String>,
    pub total_files: Option<u64>,
    pub skip_files: Vec<String>,
    pub skip_directories: Vec<String>,
    pub is_tenant: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSession {
    pub id: String,
    pub version: VersionPair,
    pub phase: Phase,
    #[serde(default)]
    pub failed_phase: Option<Phase>,
    pub download: DownloadProgress,
    #[serde(default)]
    pub extraction: ExtractionProgress,
    #[serde(default)]
    pub replacement: ReplacementProgress,
    #[serde(default)]
    pub migration: MigrationProgress,
    #[serde(default)]
    pub skip_files: Vec<String>,
    #[serde(default)]
    pub skip_directories: Vec<String>,
    #[serde(default)]
    pub is_tenant: bool,
    #[serde(default)]
    pub dependency_analysis: Option<DependencyAnalysis>,
    #[serde(default)]
    pub maintenance_mode: bool,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub log: Vec<LogEntry>,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    pub started_at_unix: u64,
    pub last_activity_unix: u64,
    #[serde(default)]
    pub completed_at_unix: Option<u64>,
}

impl UpdateSession {
    pub fn new(id: String, target_version: &str, seed: SessionSeed, now: u64) -> Self {
        let current = if seed.current_version.trim().is_empty() {
            "unknown".to_string()
        } else {
            seed.current_version.clone()
        };

        let mut session = Self {
            id,
            version: VersionPair {
                current,
                target: target_version.to_string(),
            },
            phase: Phase::Initialized,
            failed_phase: None,
            download: DownloadProgress {
                total_chunks: seed.total_chunks,
                chunk_size: seed.chunk_size,
                total_size: seed.total_size,
                archive_hash: seed.archive_hash.filter(|hash| !hash.trim().is_empty()),
                ..DownloadProgress::default()
            },
            extraction: ExtractionProgress {
                total_files: seed.total_files.unwrap_or_default(),
                ..ExtractionProgress::default()
            },
            replacement: ReplacementProgress::default(),
            migration: MigrationProgress::default(),
            skip_files: seed.skip_files,
            skip_directories: seed.skip_directories,
            is_tenant: seed.is_tenant,
            dependency_analysis: None,
            maintenance_mode: false,
            paused: false,
            log: Vec::new(),
            errors: Vec::new(),
            started_at_unix: now,
            last_activity_unix: now,
            completed_at_unix: None,
        };
        session.push_log("Update initialized", now);
        session
    }

    pub fn push_log(&mut self, message: impl Into<String>, now: u64) {
        self.log.push(LogEntry {
            at_unix: now,
            message: message.into(),
        });
        if self.log.len() > LOG_CAPACITY {
            let overflow = self.log.len() - LOG_CAPACITY;
            self.log.drain(..overflow);
        }
    }

    pub fn push_error(
        &mut self,
        kind: ErrorKind,
        message: impl Into<String>,
        context: BTreeMap<String, String>,
        now: u64,
    ) {
        self.errors.push(ErrorRecord {
            kind,
            message: message.into(),
            context,
            occurred_at_unix: now,
        });
        if !self.phase.is_terminal() {
            if self.phase != Phase::Error {
                self.failed_phase = Some(self.phase);
            }
            self.phase = Phase::Error;
        }
    }

    /// Phase to re-enter when resuming: the failed phase while in `Error`.
    pub fn effective_phase(&self) -> Phase {
        match (self.phase, self.failed_phase) {
            (Phase::Error, Some(failed)) => failed,
            (Phase::Error, None) => Phase::Download,
            (phase, _) => phase,
        }
    }

    pub fn transition(&mut self, next: Phase) -> UpdateResult<()> {
        if self.phase == next {
            return Ok(());
        }
        if !self.phase.can_transition_to(next, self.failed_phase) {
            return Err(UpdateError::session_state(format!(
                "cannot move update from '{}' to '{}'",
                self.phase, next
            )));
        }
        if self.phase == Phase::Error && !matches!(next, Phase::Error | Phase::FatalError) {
            self.failed_phase = None;
        }
        self.phase = next;
        Ok(())
    }

    pub fn mark_chunk_completed(&mut self, index: u32, hash: &str, size: u64) {
        self.download.completed_chunks.insert(index);
        self.download.chunk_hashes.insert(index, hash.to_string());
        self.download.chunk_sizes.insert(index, size);
        self.download.recompute();
    }

    pub fn forget_chunk(&mut self, index: u32) {
        self.download.completed_chunks.remove(&index);
        self.download.chunk_hashes.remove(&index);
        self.download.chunk_sizes.remove(&index);
        self.download.recompute();
    }

    pub fn can_resume(&self) -> bool {
        self.phase.can_resume()
    }

    pub fn resume_point(&self) -> Option<ResumePoint> {
        if !self.can_resume() {
            return None;
        }

        Some(ResumePoint {
            phase: self.phase,
            resume_phase: self.effective_phase(),
            session_id: self.id.clone(),
            target_version: self.version.target.clone(),
            completed_chunks: self.download.completed_chunks.iter().copied().collect(),
            missing_chunks: self.download.missing_chunks(),
            total_chunks: self.download.total_chunks,
            download_percent: self.download.percent,
            extraction_next_batch: self.extraction.batches_applied,
            extraction_percent: self.extraction.percent,
            replacement_next_batch: self.replacement.batches_applied,
            replacement_percent: self.replacement.percent,
            started_at_unix: self.started_at_unix,
            last_activity_unix: self.last_activity_unix,
        })
    }
}

/// Minimal persisted information needed to re-enter the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub phase: Phase,
    pub resume_phase: Phase,
    pub session_id: String,
    pub target_version: String,
    pub completed_chunks: Vec<u32>,
    pub missing_chunks: Vec<u32>,
    pub total_chunks: u32,
    pub download_percent: u8,
    pub extraction_next_batch: u32,
    pub extraction_percent: u8,
    pub replacement_next_batch: u32,
    pub replacement_percent: u8,
    pub started_at_unix: u64,
    pub last_activity_unix: u64,
}
