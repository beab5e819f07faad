use std::io::Write;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use updraft_core::{UpdateError, UpdateResult};

/// Identity presented to the license server on every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub license_key: String,
    pub product_uid: String,
    pub site_url: String,
    pub signing_secret: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCheck {
    #[serde(default)]
    pub update_available: bool,
    #[serde(default)]
    pub current_version: Option<String>,
    #[serde(default)]
    pub latest_version: Option<String>,
    #[serde(default)]
    pub changelog: Option<String>,
}

/// Shape of a chunked release as announced by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub total_chunks: u32,
    #[serde(default)]
    pub chunk_size: u64,
    #[serde(default)]
    pub total_size: u64,
    #[serde(default, alias = "zip_hash")]
    pub archive_hash: Option<String>,
    #[serde(default)]
    pub total_files: Option<u64>,
}

/// Metadata carried in the response headers of a chunk download.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkHeaders {
    pub hash: Option<String>,
    pub total_chunks: Option<u32>,
    pub chunk_size: Option<u64>,
}

/// Source of release metadata and chunk bytes.
pub trait RemoteSource {
    fn check_for_update(&self, current_version: &str) -> UpdateResult<UpdateCheck>;

    fn chunk_manifest(&self, version: &str) -> UpdateResult<ChunkManifest>;

    /// Streams chunk `index` of `version` into `sink`.
    fn fetch_chunk(
        &self,
        version: &str,
        index: u32,
        sink: &mut dyn Write,
    ) -> UpdateResult<ChunkHeaders>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

/// Decodes a `{success, message, data}` response body.
pub fn parse_envelope<T: DeserializeOwned>(body: &str, what: &str) -> UpdateResult<T> {
    let envelope: Envelope<T> = serde_json::from_str(body)
        .map_err(|err| UpdateError::Network(format!("invalid {what} response: {err}")))?;
    if !envelope.success {
        let message = envelope
            .message
            .filter(|message| !message.trim().is_empty())
            .unwrap_or_else(|| format!("server rejected {what} request"));
        return Err(UpdateError::Network(message));
    }
    envelope
        .data
        .ok_or_else(|| UpdateError::Network(format!("{what} response has no data")))
}

/// Whether `candidate` is a strictly newer semantic version than `current`.
///
/// Unparsable input falls back to plain inequality.
pub fn is_newer_version(current: &str, candidate: &str) -> bool {
    let normalize = |value: &str| value.trim().trim_start_matches('v').to_string();
    let current = normalize(current);
    let candidate = normalize(candidate);
    if candidate.is_empty() {
        return false;
    }

    match (
        semver::Version::parse(&current),
        semver::Version::parse(&candidate),
    ) {
        (Ok(current), Ok(candidate)) => candidate > current,
        _ => candidate != current,
    }
}
