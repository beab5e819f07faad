use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, error, info, warn};
use updraft_core::{
    current_unix_timestamp, DownloadProgress, ErrorKind, ExtractionProgress, MigrationProgress,
    Phase, ReplacementProgress, ResumePoint, SessionSeed, UpdateError, UpdateResult,
    UpdateSession,
};

use crate::fs_utils::{clean_directory, remove_file_if_exists, write_atomic};
use crate::layout::UpdateLayout;

/// Durable home of the single session record.
pub trait SessionBackend: Send + Sync {
    fn load(&self) -> UpdateResult<Option<UpdateSession>>;

    fn save(&self, session: &UpdateSession) -> UpdateResult<()>;

    fn clear(&self) -> UpdateResult<()>;
}

/// Stores the session as pretty JSON, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionBackend for JsonFileBackend {
    fn load(&self) -> UpdateResult<Option<UpdateSession>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("failed to read {}", self.path.display()))
                    .into())
            }
        };

        serde_json::from_str(&raw).map(Some).map_err(|err| {
            UpdateError::SessionCorrupt(format!(
                "unreadable status file {}: {err}",
                self.path.display()
            ))
        })
    }

    fn save(&self, session: &UpdateSession) -> UpdateResult<()> {
        let payload = serde_json::to_vec_pretty(session)
            .context("failed to serialize update status")?;
        write_atomic(&self.path, &payload)?;
        Ok(())
    }

    fn clear(&self) -> UpdateResult<()> {
        remove_file_if_exists(&self.path)
            .with_context(|| format!("failed to remove {}", self.path.display()))?;
        Ok(())
    }
}

/// Read-modify-write access to the persisted update session.
#[derive(Clone)]
pub struct StatusStore {
    layout: UpdateLayout,
    backend: Arc<dyn SessionBackend>,
}

impl StatusStore {
    pub fn open(layout: UpdateLayout) -> Self {
        let backend = JsonFileBackend::new(layout.status_path());
        Self::with_backend(layout, Arc::new(backend))
    }

    pub fn with_backend(layout: UpdateLayout, backend: Arc<dyn SessionBackend>) -> Self {
        Self { layout, backend }
    }

    pub fn layout(&self) -> &UpdateLayout {
        &self.layout
    }

    /// Creates a fresh session, replacing whatever record existed before.
    pub fn initiate(&self, target_version: &str, seed: SessionSeed) -> UpdateResult<UpdateSession> {
        self.layout.ensure_base_dirs()?;
        let now = current_unix_timestamp();
        let id = format!(
            "upd-{now}-{}-{}",
            std::process::id(),
            updraft_core::unique_suffix()
        );
        let session = UpdateSession::new(id, target_version, seed, now);
        self.backend.save(&session)?;
        info!(
            session = %session.id,
            target = target_version,
            chunks = session.download.total_chunks,
            "update session initiated"
        );
        Ok(session)
    }

    pub fn get(&self) -> UpdateResult<Option<UpdateSession>> {
        self.backend.load()
    }

    pub fn require(&self) -> UpdateResult<UpdateSession> {
        self.get()?
            .ok_or_else(|| UpdateError::session_state("no active update session"))
    }

    pub fn update<T>(&self, apply: impl FnOnce(&mut UpdateSession) -> T) -> UpdateResult<T> {
        self.try_update(|session| Ok(apply(session)))
    }

    /// Applies `apply` and persists the result only when it succeeds.
    pub fn try_update<T>(
        &self,
        apply: impl FnOnce(&mut UpdateSession) -> UpdateResult<T>,
    ) -> UpdateResult<T> {
        let mut session = self.require()?;
        let value = apply(&mut session)?;
        session.last_activity_unix = current_unix_timestamp();
        self.backend.save(&session)?;
        Ok(value)
    }

    pub fn update_download<T>(
        &self,
        apply: impl FnOnce(&mut DownloadProgress) -> T,
    ) -> UpdateResult<T> {
        self.update(|session| apply(&mut session.download))
    }

    pub fn update_extraction<T>(
        &self,
        apply: impl FnOnce(&mut ExtractionProgress) -> T,
    ) -> UpdateResult<T> {
        self.update(|session| apply(&mut session.extraction))
    }

    pub fn update_replacement<T>(
        &self,
        apply: impl FnOnce(&mut ReplacementProgress) -> T,
    ) -> UpdateResult<T> {
        self.update(|session| apply(&mut session.replacement))
    }

    pub fn update_migration<T>(
        &self,
        apply: impl FnOnce(&mut MigrationProgress) -> T,
    ) -> UpdateResult<T> {
        self.update(|session| apply(&mut session.migration))
    }

    pub fn set_phase(&self, next: Phase) -> UpdateResult<()> {
        self.try_update(|session| {
            let previous = session.phase;
            session.transition(next)?;
            if previous != next {
                debug!(from = %previous, to = %next, "phase changed");
            }
            Ok(())
        })
    }

    /// Appends to the capped session log. Without a session this only traces.
    pub fn append_log(&self, message: impl Into<String>) -> UpdateResult<()> {
        let message = message.into();
        info!("{message}");
        if self.get()?.is_none() {
            return Ok(());
        }
        self.update(|session| session.push_log(message, current_unix_timestamp()))
    }

    pub fn record_error(
        &self,
        kind: ErrorKind,
        message: impl Into<String>,
        context: BTreeMap<String, String>,
    ) -> UpdateResult<()> {
        let message = message.into();
        warn!(kind = kind.as_str(), "{message}");
        if self.get()?.is_none() {
            return Ok(());
        }
        self.update(|session| {
            session.push_error(kind, message, context, current_unix_timestamp())
        })
    }

    /// Records an unrecoverable failure; the session can no longer resume.
    pub fn record_fatal(&self, kind: ErrorKind, message: impl Into<String>) -> UpdateResult<()> {
        let message = message.into();
        error!(kind = kind.as_str(), "{message}");
        if self.get()?.is_none() {
            return Ok(());
        }
        self.update(|session| {
            let now = current_unix_timestamp();
            session.push_error(kind, message.clone(), BTreeMap::new(), now);
            if !session.phase.is_terminal() {
                session.phase = Phase::FatalError;
            }
            session.push_log(format!("Fatal error: {message}"), now);
        })
    }

    pub fn mark_chunk_completed(&self, index: u32, hash: &str, size: u64) -> UpdateResult<()> {
        self.update(|session| {
            session.mark_chunk_completed(index, hash, size);
            session.download.current_chunk = Some(index);
        })
    }

    pub fn can_resume(&self) -> UpdateResult<bool> {
        Ok(self
            .get()?
            .map(|session| session.can_resume())
            .unwrap_or(false))
    }

    pub fn resume_point(&self) -> UpdateResult<Option<ResumePoint>> {
        Ok(self.get()?.and_then(|session| session.resume_point()))
    }

    pub fn mark_cancelled(&self) -> UpdateResult<()> {
        self.try_update(|session| {
            session.transition(Phase::Cancelled)?;
            session.push_log("Update cancelled by operator", current_unix_timestamp());
            Ok(())
        })
    }

    pub fn mark_complete(&self) -> UpdateResult<UpdateSession> {
        self.try_update(|session| {
            let now = current_unix_timestamp();
            session.transition(Phase::Completed)?;
            session.completed_at_unix = Some(now);
            session.push_log("Update completed successfully", now);
            Ok(session.clone())
        })
    }

    /// Deletes the record and everything staged under the state directory.
    pub fn reset(&self) -> UpdateResult<()> {
        self.backend.clear()?;
        clean_directory(self.layout.root())?;
        info!(root = %self.layout.root().display(), "update state reset");
        Ok(())
    }
}
