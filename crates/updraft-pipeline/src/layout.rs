use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use updraft_core::PathsConfig;

/// On-disk layout of the update state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateLayout {
    root: PathBuf,
}

impl UpdateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn status_path(&self) -> PathBuf {
        self.root.join(".update-status.json")
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.root.join("chunks")
    }

    pub fn chunk_path(&self, index: u32) -> PathBuf {
        self.chunks_dir().join(format!("chunk_{index:05}.bin"))
    }

    pub fn chunk_part_path(&self, index: u32) -> PathBuf {
        self.chunks_dir().join(format!("chunk_{index:05}.bin.part"))
    }

    pub fn archive_path(&self) -> PathBuf {
        self.root.join("update.zip")
    }

    pub fn extracted_dir(&self) -> PathBuf {
        self.root.join("extracted")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.root.join("backup")
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.chunks_dir(),
            self.extracted_dir(),
            self.backup_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Parses `chunk_00012.bin` into `12`.
pub fn parse_chunk_file_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("chunk_")?.strip_suffix(".bin")?;
    if digits.is_empty() || !digits.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Live installation roots that staged files are copied into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallTargets {
    pub app_root: PathBuf,
    pub public_root: PathBuf,
    pub site_root: PathBuf,
}

impl InstallTargets {
    pub fn new(app_root: impl Into<PathBuf>) -> Self {
        let app_root = app_root.into();
        let public_root = app_root.join("public");
        let site_root = match app_root.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => app_root.clone(),
        };
        Self {
            app_root,
            public_root,
            site_root,
        }
    }

    pub fn from_paths(paths: &PathsConfig) -> Self {
        Self {
            app_root: paths.app_root.clone(),
            public_root: paths.public_root(),
            site_root: paths.site_root(),
        }
    }
}
