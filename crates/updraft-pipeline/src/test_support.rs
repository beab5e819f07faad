use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

static TEST_ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Fresh directory under the system temp dir, unique per process, call and `label`.
pub(crate) fn test_root(label: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "updraft-{label}-{}-{}-{}",
        std::process::id(),
        updraft_core::unique_suffix(),
        TEST_ROOT_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&path).expect("must create test root");
    path
}
