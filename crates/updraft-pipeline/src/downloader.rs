use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};

use anyhow::Context;
use serde::Serialize;
use tracing::{debug, warn};
use updraft_core::{ErrorKind, Phase, StepStatus, UpdateError, UpdateResult};
use updraft_security::{hashes_match, sha256_file_hex};

use crate::fs_utils::remove_file_if_exists;
use crate::layout::parse_chunk_file_name;
use crate::store::StatusStore;
use crate::SharedRemote;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkReceipt {
    pub index: u32,
    pub hash: String,
    pub size: u64,
    pub total_chunks: u32,
}

/// Fetches numbered chunks into the chunk directory and records them.
#[derive(Clone)]
pub struct ChunkDownloader {
    store: StatusStore,
    remote: SharedRemote,
}

impl ChunkDownloader {
    pub fn new(store: StatusStore, remote: SharedRemote) -> Self {
        Self { store, remote }
    }

    pub fn download(&self, index: u32) -> UpdateResult<ChunkReceipt> {
        let session = self.store.require()?;
        let target = session.version.target.trim().to_string();
        if target.is_empty() {
            let message = "cannot download chunk: target version missing from session";
            self.store.record_fatal(ErrorKind::SessionCorrupt, message)?;
            return Err(UpdateError::SessionCorrupt(message.to_string()));
        }

        let total_chunks = session.download.total_chunks;
        if index >= total_chunks {
            return Err(UpdateError::session_state(format!(
                "chunk index {index} is out of range (total chunks: {total_chunks})"
            )));
        }

        if matches!(
            session.effective_phase(),
            Phase::Initialized | Phase::Download
        ) {
            self.store.set_phase(Phase::Download)?;
        }

        let layout = self.store.layout().clone();
        fs::create_dir_all(layout.chunks_dir()).with_context(|| {
            format!("failed to create {}", layout.chunks_dir().display())
        })?;
        self.store.update_download(|download| {
            download.status = StepStatus::InProgress;
            download.current_chunk = Some(index);
        })?;
        self.store.append_log(format!("Downloading chunk {index}..."))?;

        match self.fetch_verified(&target, index) {
            Ok(receipt) => {
                self.store
                    .mark_chunk_completed(index, &receipt.hash, receipt.size)?;
                let all_done = self.store.update_download(|download| {
                    let done = download.is_complete();
                    if done {
                        download.status = StepStatus::Completed;
                    }
                    done
                })?;
                self.store.append_log(format!(
                    "Chunk {index} downloaded ({} bytes)",
                    receipt.size
                ))?;
                if all_done {
                    self.store.append_log("All chunks downloaded")?;
                }
                Ok(ChunkReceipt {
                    total_chunks,
                    ..receipt
                })
            }
            Err(err) => {
                warn!(chunk = index, error = %err, "chunk download failed");
                let context = BTreeMap::from([("chunk_index".to_string(), index.to_string())]);
                self.store
                    .record_error(ErrorKind::DownloadFailed, err.to_string(), context)?;
                Err(err)
            }
        }
    }

    fn fetch_verified(&self, target: &str, index: u32) -> UpdateResult<ChunkReceipt> {
        let layout = self.store.layout();
        let part_path = layout.chunk_part_path(index);
        let chunk_path = layout.chunk_path(index);

        let headers = {
            let file = File::create(&part_path)
                .with_context(|| format!("failed to create {}", part_path.display()))?;
            let mut writer = BufWriter::new(file);
            let fetched = self.remote.fetch_chunk(target, index, &mut writer);
            let flushed = writer.flush();
            match (fetched, flushed) {
                (Ok(headers), Ok(())) => headers,
                (Err(err), _) => {
                    let _ = remove_file_if_exists(&part_path);
                    return Err(err);
                }
                (Ok(_), Err(err)) => {
                    let _ = remove_file_if_exists(&part_path);
                    return Err(anyhow::Error::new(err)
                        .context(format!("failed to write {}", part_path.display()))
                        .into());
                }
            }
        };

        let actual = sha256_file_hex(&part_path)?;
        if let Some(expected) = headers.hash.as_deref() {
            if !hashes_match(expected, &actual) {
                let _ = remove_file_if_exists(&part_path);
                return Err(UpdateError::Integrity {
                    subject: format!("chunk {index}"),
                    expected: expected.to_string(),
                    actual,
                });
            }
        } else {
            debug!(chunk = index, "server sent no chunk hash; keeping local digest");
        }

        fs::rename(&part_path, &chunk_path).with_context(|| {
            format!(
                "failed to move {} to {}",
                part_path.display(),
                chunk_path.display()
            )
        })?;
        let size = fs::metadata(&chunk_path)
            .with_context(|| format!("failed to stat {}", chunk_path.display()))?
            .len();

        Ok(ChunkReceipt {
            index,
            hash: actual,
            size,
            total_chunks: headers.total_chunks.unwrap_or_default(),
        })
    }

    /// Chunk indices present on disk, independent of the session record.
    pub fn list_completed(&self) -> UpdateResult<BTreeSet<u32>> {
        let dir = self.store.layout().chunks_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("failed to read {}", dir.display()))
                    .into())
            }
        };

        let mut indices = BTreeSet::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
            if !entry.path().is_file() {
                continue;
            }
            if let Some(index) = parse_chunk_file_name(&entry.file_name().to_string_lossy()) {
                indices.insert(index);
            }
        }
        Ok(indices)
    }

    pub fn missing(&self, total_chunks: u32) -> UpdateResult<Vec<u32>> {
        let present = self.list_completed()?;
        Ok((0..total_chunks)
            .filter(|index| !present.contains(index))
            .collect())
    }

    /// Removes chunk `index` from disk and from the session so it is fetched again.
    pub fn delete(&self, index: u32) -> UpdateResult<bool> {
        let path = self.store.layout().chunk_path(index);
        let existed = path.exists();
        remove_file_if_exists(&path)
            .with_context(|| format!("failed to remove {}", path.display()))?;
        if self.store.get()?.is_some() {
            self.store.update(|session| session.forget_chunk(index))?;
        }
        Ok(existed)
    }

    pub fn downloaded_size(&self) -> UpdateResult<u64> {
        let mut total = 0;
        for index in self.list_completed()? {
            let path = self.store.layout().chunk_path(index);
            total += fs::metadata(&path)
                .with_context(|| format!("failed to stat {}", path.display()))?
                .len();
        }
        Ok(total)
    }

    pub fn verify(&self, index: u32, expected_hash: &str) -> UpdateResult<bool> {
        let path = self.store.layout().chunk_path(index);
        if !path.is_file() {
            return Ok(false);
        }
        Ok(hashes_match(expected_hash, &sha256_file_hex(&path)?))
    }
}
