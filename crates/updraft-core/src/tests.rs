use std::collections::BTreeMap;
use std::path::PathBuf;

use super::*;

fn seeded_session(total_chunks: u32) -> UpdateSession {
    UpdateSession::new(
        "upd-test".to_string(),
        "2.1.0",
        SessionSeed {
            current_version: "2.0.0".to_string(),
            total_chunks,
            chunk_size: 4,
            total_size: u64::from(total_chunks) * 4,
            archive_hash: Some("abc".to_string()),
            ..SessionSeed::default()
        },
        1_700_000_000,
    )
}

#[test]
fn phase_round_trips_through_its_string_form() {
    for phase in [
        Phase::Initialized,
        Phase::Download,
        Phase::Merging,
        Phase::Extraction,
        Phase::Replacement,
        Phase::Migration,
        Phase::Completing,
        Phase::Completed,
        Phase::Error,
        Phase::FatalError,
        Phase::Cancelled,
    ] {
        assert_eq!(Phase::parse(phase.as_str()).expect("must parse"), phase);
    }
    assert!(Phase::parse("paused").is_err());
}

#[test]
fn phases_only_move_forward() {
    assert!(Phase::Download.can_transition_to(Phase::Merging, None));
    assert!(Phase::Download.can_transition_to(Phase::Replacement, None));
    assert!(!Phase::Extraction.can_transition_to(Phase::Download, None));
    assert!(!Phase::Completed.can_transition_to(Phase::Download, None));
    assert!(Phase::Replacement.can_transition_to(Phase::Error, None));
    assert!(Phase::Replacement.can_transition_to(Phase::Cancelled, None));
}

#[test]
fn error_phase_reenters_failed_phase_or_later() {
    assert!(Phase::Error.can_transition_to(Phase::Extraction, Some(Phase::Extraction)));
    assert!(Phase::Error.can_transition_to(Phase::Migration, Some(Phase::Extraction)));
    assert!(!Phase::Error.can_transition_to(Phase::Download, Some(Phase::Extraction)));
}

#[test]
fn terminal_phases_cannot_resume() {
    assert!(!Phase::Completed.can_resume());
    assert!(!Phase::FatalError.can_resume());
    assert!(!Phase::Cancelled.can_resume());
    assert!(Phase::Error.can_resume());
    assert!(Phase::Initialized.can_resume());
}

#[test]
fn new_session_starts_initialized_with_every_chunk_missing() {
    let session = seeded_session(3);
    assert_eq!(session.phase, Phase::Initialized);
    assert_eq!(session.version.current, "2.0.0");
    assert_eq!(session.version.target, "2.1.0");
    assert_eq!(session.download.missing_chunks(), vec![0, 1, 2]);
    assert_eq!(session.log.len(), 1);
    assert!(session.can_resume());
}

#[test]
fn blank_current_version_is_recorded_as_unknown() {
    let session = UpdateSession::new(
        "upd-test".to_string(),
        "1.0.0",
        SessionSeed::default(),
        1,
    );
    assert_eq!(session.version.current, "unknown");
}

#[test]
fn log_keeps_only_most_recent_entries() {
    let mut session = seeded_session(1);
    for index in 0..(LOG_CAPACITY + 25) {
        session.push_log(format!("entry {index}"), index as u64);
    }
    assert_eq!(session.log.len(), LOG_CAPACITY);
    assert_eq!(
        session.log.last().map(|entry| entry.message.as_str()),
        Some("entry 124")
    );
    assert_eq!(
        session.log.first().map(|entry| entry.message.as_str()),
        Some("entry 25")
    );
}

#[test]
fn chunk_redownload_does_not_double_count_size() {
    let mut session = seeded_session(2);
    session.mark_chunk_completed(0, "h0", 4);
    session.mark_chunk_completed(0, "h0", 4);
    session.mark_chunk_completed(1, "h1", 3);
    assert_eq!(session.download.downloaded_size, 7);
    assert_eq!(session.download.percent, 100);
    assert!(session.download.is_complete());

    session.forget_chunk(1);
    assert_eq!(session.download.downloaded_size, 4);
    assert_eq!(session.download.percent, 50);
    assert_eq!(session.download.missing_chunks(), vec![1]);
}

#[test]
fn recording_error_remembers_failed_phase() {
    let mut session = seeded_session(1);
    session.transition(Phase::Extraction).expect("must advance");
    session.push_error(ErrorKind::ExtractionFailed, "boom", BTreeMap::new(), 5);
    assert_eq!(session.phase, Phase::Error);
    assert_eq!(session.failed_phase, Some(Phase::Extraction));
    assert_eq!(session.effective_phase(), Phase::Extraction);

    session.push_error(ErrorKind::ExtractionFailed, "again", BTreeMap::new(), 6);
    assert_eq!(session.failed_phase, Some(Phase::Extraction));

    let err = session
        .transition(Phase::Download)
        .expect_err("must reject backwards move");
    assert!(matches!(err, UpdateError::SessionState(_)));

    session.transition(Phase::Extraction).expect("must re-enter");
    assert_eq!(session.failed_phase, None);
}

#[test]
fn resume_point_reports_progress_and_missing_chunks() {
    let mut session = seeded_session(4);
    session.transition(Phase::Download).expect("must advance");
    session.mark_chunk_completed(0, "a", 4);
    session.mark_chunk_completed(2, "c", 4);

    let point = session.resume_point().expect("resumable");
    assert_eq!(point.phase, Phase::Download);
    assert_eq!(point.completed_chunks, vec![0, 2]);
    assert_eq!(point.missing_chunks, vec![1, 3]);
    assert_eq!(point.download_percent, 50);

    session.transition(Phase::Cancelled).expect("must cancel");
    assert!(session.resume_point().is_none());
}

#[test]
fn session_survives_json_round_trip() {
    let mut session = seeded_session(2);
    session.mark_chunk_completed(1, "beef", 4);
    session.dependency_analysis = Some(DependencyAnalysis::failed("bad manifest"));
    let encoded = serde_json::to_string(&session).expect("must serialize");
    let decoded: UpdateSession = serde_json::from_str(&encoded).expect("must deserialize");
    assert_eq!(decoded, session);
    assert!(encoded.contains("\"phase\":\"initialized\""));
}

#[test]
fn dependency_summary_lists_each_change_kind() {
    let mut analysis = DependencyAnalysis::no_changes();
    assert!(!analysis.has_changes());
    assert_eq!(analysis.summary(), "No dependency changes detected");

    analysis.status = AnalysisStatus::Analyzed;
    analysis
        .added
        .insert("acme/new".to_string(), "^1.0".to_string());
    analysis.changed.insert(
        "acme/kept".to_string(),
        VersionChange {
            old: "^1.0".to_string(),
            new: "^2.0".to_string(),
        },
    );
    analysis.locked.insert(
        "acme/transitive".to_string(),
        LockedChange {
            kind: LockedChangeKind::Changed,
            old_version: Some("1.0.0".to_string()),
            new_version: Some("1.0.1".to_string()),
        },
    );
    assert!(analysis.has_changes());
    assert_eq!(
        analysis.summary(),
        "Dependency changes: 1 package(s) added, 1 package(s) updated, 1 locked version change(s)"
    );
}

#[test]
fn percent_rounds_and_handles_empty_totals() {
    assert_eq!(percent_of(0, 0), 100);
    assert_eq!(percent_of(1, 3), 33);
    assert_eq!(percent_of(2, 3), 67);
    assert_eq!(percent_of(5, 3), 100);
}

#[test]
fn update_error_recoverability() {
    assert!(UpdateError::Network("timeout".to_string()).is_recoverable());
    assert!(UpdateError::MissingChunks(vec![1, 4]).is_recoverable());
    assert!(!UpdateError::Migration("failed".to_string()).is_recoverable());
    assert_eq!(
        UpdateError::MissingChunks(vec![1, 4]).to_string(),
        "missing chunks: 1, 4"
    );
}

#[test]
fn config_parses_with_defaults() {
    let content = r#"
[server]
base_url = "https://licenses.example.test"
product_uid = "shop"
license_key = "LIC-123"
site_url = "https://shop.example.test"

[paths]
app_root = "/srv/shop/core"

[update]
replacement_batch_size = 20

[replacement]
skip_files = ["config.php"]
self_package = "acme/updater"
"#;

    let config = UpdateConfig::from_toml_str(content).expect("config must parse");
    config.validate().expect("config must validate");
    assert_eq!(config.update.chunk_size, DEFAULT_CHUNK_SIZE);
    assert_eq!(config.update.extraction_batch_size, 100);
    assert_eq!(config.update.replacement_batch_size, 20);
    assert!(config.update.enable_backup);
    assert_eq!(config.update.max_retries, 3);
    assert_eq!(config.server.download_timeout_secs, 300);
    assert_eq!(config.replacement.vendor_dir, "vendor");
    assert_eq!(config.replacement.self_package.as_deref(), Some("acme/updater"));
    assert_eq!(config.paths.site_root(), PathBuf::from("/srv/shop"));
    assert_eq!(config.paths.public_root(), PathBuf::from("/srv/shop/core/public"));
    assert_eq!(
        config.paths.state_dir(),
        PathBuf::from("/srv/shop/core/storage/app/updraft")
    );
    assert_eq!(config.host.runtime_mode_key, "APP_ENV");
}

#[test]
fn env_overrides_replace_config_values() {
    let mut config = UpdateConfig::default();
    let vars: BTreeMap<&str, &str> = [
        ("UPDRAFT_BASE_URL", "https://override.test"),
        ("UPDRAFT_LICENSE_KEY", "LIC-9"),
        ("UPDRAFT_REPLACEMENT_BATCH", "7"),
        ("UPDRAFT_ENABLE_BACKUP", "off"),
        ("UPDRAFT_SITE_URL", "   "),
    ]
    .into_iter()
    .collect();

    config
        .apply_env_overrides(|key| vars.get(key).map(|value| value.to_string()))
        .expect("overrides must apply");
    assert_eq!(config.server.base_url, "https://override.test");
    assert_eq!(config.server.license_key, "LIC-9");
    assert_eq!(config.update.replacement_batch_size, 7);
    assert!(!config.update.enable_backup);
    assert_eq!(config.server.site_url, "");
}

#[test]
fn env_override_rejects_malformed_numbers() {
    let mut config = UpdateConfig::default();
    let err = config
        .apply_env_overrides(|key| {
            (key == "UPDRAFT_MAX_RETRIES").then(|| "many".to_string())
        })
        .expect_err("must reject");
    assert!(err.to_string().contains("UPDRAFT_MAX_RETRIES"));
}

#[test]
fn validate_rejects_zero_batch_sizes_and_bad_urls() {
    let mut config = UpdateConfig::default();
    config.server.base_url = "ftp://nope".to_string();
    config.server.product_uid = "shop".to_string();
    config.server.license_key = "LIC".to_string();
    config.paths.app_root = PathBuf::from("/srv/app");
    assert!(config.validate().is_err());

    config.server.base_url = "https://ok.test".to_string();
    config.validate().expect("must validate");

    config.update.extraction_batch_size = 0;
    assert!(config.validate().is_err());
}
