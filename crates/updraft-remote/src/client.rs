use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::{Client, Response};
use tracing::{debug, warn};
use updraft_core::{UpdateConfig, UpdateError, UpdateResult};
use updraft_security::license_signature;

use crate::types::{
    is_newer_version, parse_envelope, ChunkHeaders, ChunkManifest, Credentials, RemoteSource,
    UpdateCheck,
};

const CHUNK_HASH_HEADER: &str = "X-Chunk-Hash";
const TOTAL_CHUNKS_HEADER: &str = "X-Total-Chunks";
const CHUNK_SIZE_HEADER: &str = "X-Chunk-Size";
const SITE_URL_HEADER: &str = "X-Site-Url";

/// Blocking client for the license server's v2 update endpoints.
#[derive(Debug, Clone)]
pub struct LicenseServerClient {
    base_url: String,
    credentials: Credentials,
    signature: String,
    http: Client,
    request_timeout: Duration,
    download_timeout: Duration,
}

impl LicenseServerClient {
    pub fn new(
        base_url: &str,
        credentials: Credentials,
        request_timeout: Duration,
        download_timeout: Duration,
    ) -> Result<Self> {
        let signature = license_signature(
            &credentials.license_key,
            &credentials.site_url,
            &credentials.signing_secret,
        )?;
        let http = Client::builder()
            .user_agent(concat!("updraft/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            signature,
            http,
            request_timeout,
            download_timeout,
        })
    }

    pub fn from_config(config: &UpdateConfig) -> Result<Self> {
        let server = &config.server;
        Self::new(
            &server.base_url,
            Credentials {
                license_key: server.license_key.clone(),
                product_uid: server.product_uid.clone(),
                site_url: server.site_url.clone(),
                signing_secret: server.signing_secret.clone(),
            },
            Duration::from_secs(server.request_timeout_secs),
            Duration::from_secs(server.download_timeout_secs),
        )
    }

    pub fn update_info_url(&self) -> String {
        format!(
            "{}/v2/update-info/{}/{}",
            self.base_url, self.credentials.license_key, self.credentials.product_uid
        )
    }

    pub fn chunk_manifest_url(&self) -> String {
        format!(
            "{}/v2/update-manifest/{}/{}/chunks",
            self.base_url, self.credentials.license_key, self.credentials.product_uid
        )
    }

    pub fn chunk_url(&self, index: u32) -> String {
        format!(
            "{}/v2/download-chunk/{}/{}/{index}",
            self.base_url, self.credentials.license_key, self.credentials.product_uid
        )
    }

    /// Query parameters attached to every request, including `extra`.
    pub fn query_params<'a>(&'a self, extra: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
        let mut params = vec![
            ("site", self.credentials.site_url.as_str()),
            ("has", self.signature.as_str()),
        ];
        params.extend_from_slice(extra);
        params
    }

    fn get(&self, url: &str, extra: &[(&str, &str)], timeout: Duration) -> UpdateResult<Response> {
        debug!(url, "license server request");
        let response = self
            .http
            .get(url)
            .query(&self.query_params(extra))
            .header(SITE_URL_HEADER, &self.credentials.site_url)
            .timeout(timeout)
            .send()
            .map_err(|err| UpdateError::Network(format!("request to {url} failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            let detail = server_message(&body).unwrap_or(body);
            warn!(url, status = status.as_u16(), "license server returned an error");
            return Err(UpdateError::Network(format!(
                "HTTP {} from {url}: {}",
                status.as_u16(),
                detail.trim()
            )));
        }
        Ok(response)
    }

    fn get_text(&self, url: &str, extra: &[(&str, &str)]) -> UpdateResult<String> {
        self.get(url, extra, self.request_timeout)?
            .text()
            .map_err(|err| UpdateError::Network(format!("failed to read response from {url}: {err}")))
    }
}

fn server_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("message")
        .or_else(|| value.get("error"))
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
}

fn header_value(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl RemoteSource for LicenseServerClient {
    fn check_for_update(&self, current_version: &str) -> UpdateResult<UpdateCheck> {
        let url = self.update_info_url();
        let body = self.get_text(&url, &[("current_version", current_version)])?;
        let mut check: UpdateCheck = parse_envelope(&body, "update check")?;

        if check.current_version.is_none() {
            check.current_version = Some(current_version.to_string());
        }
        if let Some(latest) = &check.latest_version {
            check.update_available =
                check.update_available && is_newer_version(current_version, latest);
        } else {
            check.update_available = false;
        }
        Ok(check)
    }

    fn chunk_manifest(&self, version: &str) -> UpdateResult<ChunkManifest> {
        let url = self.chunk_manifest_url();
        let body = self.get_text(&url, &[("version", version)])?;
        let manifest: ChunkManifest = parse_envelope(&body, "chunk manifest")?;
        if manifest.total_chunks == 0 {
            return Err(UpdateError::Network(format!(
                "server announced no chunks for version {version}"
            )));
        }
        Ok(manifest)
    }

    fn fetch_chunk(
        &self,
        version: &str,
        index: u32,
        sink: &mut dyn Write,
    ) -> UpdateResult<ChunkHeaders> {
        let url = self.chunk_url(index);
        let mut response = self.get(&url, &[("version", version)], self.download_timeout)?;
        let headers = ChunkHeaders {
            hash: header_value(&response, CHUNK_HASH_HEADER),
            total_chunks: header_value(&response, TOTAL_CHUNKS_HEADER)
                .and_then(|value| value.parse().ok()),
            chunk_size: header_value(&response, CHUNK_SIZE_HEADER)
                .and_then(|value| value.parse().ok()),
        };

        response.copy_to(sink).map_err(|err| {
            UpdateError::Network(format!("failed streaming chunk {index}: {err}"))
        })?;
        Ok(headers)
    }
}
