use std::sync::Arc;

use updraft_remote::RemoteSource;

mod deps;
mod downloader;
mod extractor;
mod fs_utils;
mod host;
mod layout;
mod merger;
mod migration;
mod pipeline;
mod replacer;
mod routing;
mod store;

pub use deps::{DependencyDiffAnalyzer, DependencyRecord, PackageChange, VendorReplacePolicy};
pub use downloader::{ChunkDownloader, ChunkReceipt};
pub use extractor::{is_archive_noise, staged_relative_path, BatchExtractor, ExtractionBatch};
pub use fs_utils::detect_update_root;
pub use host::{set_env_value, CacheKind, CommandHost, HostApplication, RuntimeMode, SharedHost};
pub use layout::{parse_chunk_file_name, InstallTargets, UpdateLayout};
pub use merger::{ArchiveInfo, ArchiveVerification, ChunkMerger, MergeOutcome};
pub use migration::{MigrationOutcome, MigrationRunner};
pub use pipeline::{
    read_installed_version, write_installed_version, ChunkProgress, NextStep, StatusReport,
    UpdatePipeline,
};
pub use replacer::{BatchReplacer, ReplaceFilter, ReplacementBatch};
pub use routing::{classify_entry, DestinationRouter, EntryClass, SkipRules};
pub use store::{JsonFileBackend, SessionBackend, StatusStore};

pub type SharedRemote = Arc<dyn RemoteSource + Send + Sync>;

/// Human readable size with two decimals, e.g. `10.50 MB`.
pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

#[cfg(test)]
mod test_support;
