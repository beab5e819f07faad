mod config;
mod error;
mod phase;
mod session;

pub use config::{
    HostCommands, PathsConfig, ReplacementRules, ServerConfig, UpdateConfig, UpdateTuning,
    DEFAULT_CHUNK_SIZE,
};
pub use error::{EntryFailure, ErrorKind, UpdateError, UpdateResult};
pub use phase::{Phase, StepStatus};
pub use session::{
    AnalysisStatus, DependencyAnalysis, DownloadProgress, ErrorRecord, ExtractionProgress,
    LockedChange, LockedChangeKind, LogEntry, MigrationProgress, ReplacementProgress,
    ResumePoint, SessionSeed, UpdateSession, VersionChange, VersionPair, LOG_CAPACITY,
};

use std::time::{SystemTime, UNIX_EPOCH};

pub fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn unique_suffix() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

/// Integer percentage rounded to the nearest whole number, `100` for an empty total.
pub fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let bounded = done.min(total);
    (((bounded as f64) / (total as f64)) * 100.0).round() as u8
}

#[cfg(test)]
mod tests;
