use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub update: UpdateTuning,
    pub replacement: ReplacementRules,
    pub host: HostCommands,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub base_url: String,
    pub product_uid: String,
    pub license_key: String,
    pub site_url: String,
    pub signing_secret: String,
    pub current_version: Option<String>,
    pub request_timeout_secs: u64,
    pub download_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            product_uid: String::new(),
            license_key: String::new(),
            site_url: String::new(),
            signing_secret: String::new(),
            current_version: None,
            request_timeout_secs: 30,
            download_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub app_root: PathBuf,
    pub public_root: Option<PathBuf>,
    pub site_root: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub version_file: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

impl PathsConfig {
    pub fn public_root(&self) -> PathBuf {
        self.public_root
            .clone()
            .unwrap_or_else(|| self.app_root.join("public"))
    }

    /// Parent of the application root unless configured explicitly.
    pub fn site_root(&self) -> PathBuf {
        if let Some(site_root) = &self.site_root {
            return site_root.clone();
        }
        match self.app_root.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => self.app_root.clone(),
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.app_root.join("storage").join("app").join("updraft"))
    }

    pub fn version_file(&self) -> PathBuf {
        self.version_file
            .clone()
            .unwrap_or_else(|| self.app_root.join("storage").join("app").join("version.json"))
    }

    pub fn env_file(&self) -> PathBuf {
        self.env_file
            .clone()
            .unwrap_or_else(|| self.app_root.join(".env"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateTuning {
    pub chunk_size: u64,
    pub extraction_batch_size: usize,
    pub replacement_batch_size: usize,
    pub enable_backup: bool,
    pub smart_vendor_replacement: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub tenant_chunk_size: usize,
}

impl Default for UpdateTuning {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            extraction_batch_size: 100,
            replacement_batch_size: 50,
            enable_backup: true,
            smart_vendor_replacement: true,
            max_retries: 3,
            retry_delay_ms: 2000,
            tenant_chunk_size: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplacementRules {
    pub skip_files: Vec<String>,
    pub skip_directories: Vec<String>,
    pub vendor_dir: String,
    pub self_package: Option<String>,
    pub manifest_file: String,
    pub lock_file: String,
    pub staged_manifest_dir: String,
    pub change_log_file: String,
}

impl Default for ReplacementRules {
    fn default() -> Self {
        Self {
            skip_files: Vec::new(),
            skip_directories: Vec::new(),
            vendor_dir: "vendor".to_string(),
            self_package: None,
            manifest_file: "composer.json".to_string(),
            lock_file: "composer.lock".to_string(),
            staged_manifest_dir: "custom".to_string(),
            change_log_file: "change-logs.json".to_string(),
        }
    }
}

/// Shell commands the default host adapter runs inside the application root.
///
/// An empty command disables that step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostCommands {
    pub maintenance_on: Vec<String>,
    pub maintenance_off: Vec<String>,
    pub migrate: Vec<String>,
    pub seed: Vec<String>,
    pub tenant_list: Vec<String>,
    pub tenant_migrate: Vec<String>,
    pub cache_clear: Vec<String>,
    pub config_clear: Vec<String>,
    pub route_clear: Vec<String>,
    pub view_clear: Vec<String>,
    pub compiled_cache_reset: Vec<String>,
    pub compiled_invalidate: Vec<String>,
    pub compiled_extensions: Vec<String>,
    pub runtime_mode_key: String,
}

fn artisan(args: &[&str]) -> Vec<String> {
    let mut command = vec!["php".to_string(), "artisan".to_string()];
    command.extend(args.iter().map(|arg| arg.to_string()));
    command
}

impl Default for HostCommands {
    fn default() -> Self {
        Self {
            maintenance_on: artisan(&["down"]),
            maintenance_off: artisan(&["up"]),
            migrate: artisan(&["migrate", "--force"]),
            seed: artisan(&["db:seed", "--force"]),
            tenant_list: Vec::new(),
            tenant_migrate: artisan(&["tenants:migrate", "--tenants={tenant}", "--force"]),
            cache_clear: artisan(&["cache:clear"]),
            config_clear: artisan(&["config:clear"]),
            route_clear: artisan(&["route:clear"]),
            view_clear: artisan(&["view:clear"]),
            compiled_cache_reset: Vec::new(),
            compiled_invalidate: Vec::new(),
            compiled_extensions: vec!["php".to_string()],
            runtime_mode_key: "APP_ENV".to_string(),
        }
    }
}

impl UpdateConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse updraft configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let mut config = Self::from_toml_str(&content)
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        config.resolve_relative_paths(path.parent().unwrap_or_else(|| Path::new(".")));
        Ok(config)
    }

    fn resolve_relative_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() && !path.as_os_str().is_empty() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.paths.app_root);
        for path in [
            &mut self.paths.public_root,
            &mut self.paths.site_root,
            &mut self.paths.state_dir,
            &mut self.paths.version_file,
            &mut self.paths.env_file,
        ]
        .into_iter()
        .flatten()
        {
            resolve(path);
        }
    }

    /// Applies `UPDRAFT_*` overrides. `lookup` is usually `std::env::var(..).ok()`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = text("UPDRAFT_BASE_URL") {
            self.server.base_url = value;
        }
        if let Some(value) = text("UPDRAFT_LICENSE_KEY") {
            self.server.license_key = value;
        }
        if let Some(value) = text("UPDRAFT_PRODUCT_UID") {
            self.server.product_uid = value;
        }
        if let Some(value) = text("UPDRAFT_SITE_URL") {
            self.server.site_url = value;
        }
        if let Some(value) = text("UPDRAFT_SIGNING_SECRET") {
            self.server.signing_secret = value;
        }
        if let Some(value) = text("UPDRAFT_EXTRACTION_BATCH") {
            self.update.extraction_batch_size = parse_number("UPDRAFT_EXTRACTION_BATCH", &value)?;
        }
        if let Some(value) = text("UPDRAFT_REPLACEMENT_BATCH") {
            self.update.replacement_batch_size =
                parse_number("UPDRAFT_REPLACEMENT_BATCH", &value)?;
        }
        if let Some(value) = text("UPDRAFT_ENABLE_BACKUP") {
            self.update.enable_backup = parse_flag("UPDRAFT_ENABLE_BACKUP", &value)?;
        }
        if let Some(value) = text("UPDRAFT_SMART_VENDOR") {
            self.update.smart_vendor_replacement = parse_flag("UPDRAFT_SMART_VENDOR", &value)?;
        }
        if let Some(value) = text("UPDRAFT_MAX_RETRIES") {
            self.update.max_retries = parse_number("UPDRAFT_MAX_RETRIES", &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.base_url.trim().is_empty() {
            anyhow::bail!("server.base_url must not be empty");
        }
        if !self.server.base_url.starts_with("http://")
            && !self.server.base_url.starts_with("https://")
        {
            anyhow::bail!(
                "server.base_url must be an http(s) URL: {}",
                self.server.base_url
            );
        }
        if self.server.product_uid.trim().is_empty() {
            anyhow::bail!("server.product_uid must not be empty");
        }
        if self.server.license_key.trim().is_empty() {
            anyhow::bail!("server.license_key must not be empty");
        }
        if self.paths.app_root.as_os_str().is_empty() {
            anyhow::bail!("paths.app_root must not be empty");
        }
        if self.update.extraction_batch_size == 0 {
            anyhow::bail!("update.extraction_batch_size must be greater than zero");
        }
        if self.update.replacement_batch_size == 0 {
            anyhow::bail!("update.replacement_batch_size must be greater than zero");
        }
        if self.update.tenant_chunk_size == 0 {
            anyhow::bail!("update.tenant_chunk_size must be greater than zero");
        }
        if self.update.chunk_size == 0 {
            anyhow::bail!("update.chunk_size must be greater than zero");
        }
        if let Some(version) = &self.server.current_version {
            semver::Version::parse(version.trim_start_matches('v')).with_context(|| {
                format!("server.current_version is not a semantic version: {version}")
            })?;
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| anyhow::anyhow!("{key} must be a non-negative integer, got '{value}'"))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("{key} must be a boolean, got '{value}'"),
    }
}
