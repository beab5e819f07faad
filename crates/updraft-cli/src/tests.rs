use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::error::ErrorKind;
use clap::CommandFactory;
use updraft_core::{Phase, UpdateConfig, UpdateError, UpdateResult, UpdateTuning};
use updraft_pipeline::{
    CacheKind, HostApplication, RuntimeMode, SharedHost, SharedRemote, UpdatePipeline,
};
use updraft_remote::{is_newer_version, ChunkHeaders, ChunkManifest, RemoteSource, UpdateCheck};
use updraft_security::sha256_hex;

use super::*;
use crate::completion::write_completions_script;
use crate::dispatch::{exit_code_for, load_config, parse_csv_list, EXIT_RETRYABLE};
use crate::driver::{retry_with_backoff, run_update, RetryPolicy, RunOutcome};
use crate::render::{
    render_error_line, render_stage_summary, render_status_line, resolve_output_style,
    OutputStyle, Stage, TerminalRenderer,
};

static TEST_ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_root() -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let path = std::env::temp_dir().join(format!(
        "updraft-cli-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        TEST_ROOT_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&path).expect("must create test root");
    path
}

fn policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        delay: Duration::from_millis(10),
    }
}

#[test]
fn cli_definition_is_consistent() {
    Cli::command().debug_assert();
}

#[test]
fn parses_chunk_download_with_default_config() {
    let cli = Cli::try_parse_from(["updraft", "chunks", "download", "3"]).expect("must parse");
    assert_eq!(cli.config, PathBuf::from("updraft.toml"));
    assert!(matches!(
        cli.command,
        Commands::Chunks {
            command: ChunkCommands::Download { index: 3 }
        }
    ));
}

#[test]
fn config_flag_is_accepted_after_subcommand() {
    let cli = Cli::try_parse_from(["updraft", "status", "--config", "/etc/updraft.toml"])
        .expect("must parse");
    assert_eq!(cli.config, PathBuf::from("/etc/updraft.toml"));
    assert!(matches!(cli.command, Commands::Status));
}

#[test]
fn maintenance_requires_on_or_off() {
    let cli = Cli::try_parse_from(["updraft", "maintenance", "on"]).expect("must parse");
    assert!(matches!(
        cli.command,
        Commands::Maintenance { state: Toggle::On }
    ));

    let err = Cli::try_parse_from(["updraft", "maintenance", "maybe"])
        .expect_err("invalid toggle must fail");
    assert_eq!(err.kind(), ErrorKind::InvalidValue);
}

#[test]
fn migrate_and_run_accept_tenant_flag() {
    let cli = Cli::try_parse_from(["updraft", "migrate", "--tenant"]).expect("must parse");
    assert!(matches!(cli.command, Commands::Migrate { tenant: true }));

    let cli = Cli::try_parse_from(["updraft", "run"]).expect("must parse");
    assert!(matches!(
        cli.command,
        Commands::Run {
            version: None,
            tenant: false
        }
    ));
}

#[test]
fn csv_lists_are_trimmed_and_compacted() {
    assert_eq!(
        parse_csv_list(" .env, ,lang/en.json,"),
        vec![".env".to_string(), "lang/en.json".to_string()]
    );
    assert!(parse_csv_list("").is_empty());
}

#[test]
fn retry_recovers_after_transient_failures_with_linear_backoff() {
    let mut sleeps = Vec::new();
    let mut calls = 0;
    let result = retry_with_backoff(policy(), "download chunk", &mut |wait| sleeps.push(wait), || {
        calls += 1;
        if calls < 3 {
            Err(UpdateError::Network("connection reset".to_string()))
        } else {
            Ok(calls)
        }
    });

    assert_eq!(result.expect("third attempt must succeed"), 3);
    assert_eq!(
        sleeps,
        vec![Duration::from_millis(10), Duration::from_millis(20)]
    );
}

#[test]
fn retry_gives_up_after_max_retries() {
    let mut sleeps = Vec::new();
    let mut calls = 0;
    let result: Result<(), _> =
        retry_with_backoff(policy(), "merge", &mut |wait| sleeps.push(wait), || {
            calls += 1;
            Err(UpdateError::Integrity {
                subject: "chunk 2".to_string(),
                expected: "aa".to_string(),
                actual: "bb".to_string(),
            })
        });

    assert!(matches!(result, Err(UpdateError::Integrity { .. })));
    assert_eq!(calls, 4);
    assert_eq!(sleeps.last(), Some(&Duration::from_millis(30)));
}

#[test]
fn retry_leaves_missing_chunks_to_the_download_step() {
    let mut sleeps = Vec::new();
    let mut calls = 0;
    let result: Result<(), _> =
        retry_with_backoff(policy(), "merge", &mut |wait| sleeps.push(wait), || {
            calls += 1;
            Err(UpdateError::MissingChunks(vec![4]))
        });

    assert!(matches!(result, Err(UpdateError::MissingChunks(ref missing)) if missing == &[4]));
    assert_eq!(calls, 1);
    assert!(sleeps.is_empty());
}

#[test]
fn retry_never_repeats_unrecoverable_errors() {
    let sleeps = RefCell::new(Vec::new());
    let mut calls = 0;
    let result: Result<(), _> = retry_with_backoff(
        policy(),
        "replace",
        &mut |wait| sleeps.borrow_mut().push(wait),
        || {
            calls += 1;
            Err(UpdateError::session_state("replacement batch 4 requested before batch 2"))
        },
    );

    assert!(matches!(result, Err(UpdateError::SessionState(_))));
    assert_eq!(calls, 1);
    assert!(sleeps.borrow().is_empty());
}

#[test]
fn retry_policy_follows_tuning() {
    let policy = RetryPolicy::from_tuning(&UpdateTuning::default());
    assert_eq!(policy.max_retries, 3);
    assert_eq!(policy.delay_for(1), Duration::from_secs(2));
    assert_eq!(policy.delay_for(3), Duration::from_secs(6));
}

#[test]
fn load_config_layers_environment_over_file() {
    let root = test_root();
    let path = root.join("updraft.toml");
    fs::write(
        &path,
        r#"
[server]
base_url = "https://license.example.com"
product_uid = "prod-1"
license_key = "from-file"

[paths]
app_root = "core"

[update]
replacement_batch_size = 25
"#,
    )
    .expect("must write config");

    let env = HashMap::from([
        ("UPDRAFT_LICENSE_KEY", "from-env"),
        ("UPDRAFT_MAX_RETRIES", "5"),
    ]);
    let config = load_config(&path, |key| env.get(key).map(|value| value.to_string()))
        .expect("must load config");

    assert_eq!(config.server.license_key, "from-env");
    assert_eq!(config.update.max_retries, 5);
    assert_eq!(config.update.replacement_batch_size, 25);
    assert_eq!(config.paths.app_root, root.join("core"));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn load_config_without_file_needs_environment() {
    let root = test_root();
    let missing = root.join("absent.toml");

    let err = load_config(&missing, |_| None).expect_err("empty config must be rejected");
    assert!(
        format!("{err:#}").contains("server.base_url must not be empty"),
        "unexpected error: {err:#}"
    );

    let env = HashMap::from([
        ("UPDRAFT_BASE_URL", "https://license.example.com"),
        ("UPDRAFT_PRODUCT_UID", "prod-1"),
        ("UPDRAFT_LICENSE_KEY", "key"),
    ]);
    let err = load_config(&missing, |key| env.get(key).map(|value| value.to_string()))
        .expect_err("app root is still required");
    assert!(format!("{err:#}").contains("paths.app_root"));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn exit_code_marks_recoverable_failures() {
    let network = anyhow::Error::from(UpdateError::Network("timeout".to_string()));
    assert_eq!(exit_code_for(&network), EXIT_RETRYABLE);

    let state = anyhow::Error::from(UpdateError::session_state("no active update session"));
    assert_eq!(exit_code_for(&state), 1);

    assert_eq!(exit_code_for(&anyhow::anyhow!("bad config")), 1);
}

#[test]
fn status_lines_use_badges_only_when_rich() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "updated to 2.0.0"),
        "updated to 2.0.0"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "warn", "update paused"),
        "[WARN] update paused"
    );
}

#[test]
fn error_lines_name_the_error_kind() {
    let err = anyhow::Error::from(UpdateError::Network("timeout".to_string()));
    assert_eq!(
        render_error_line(OutputStyle::Plain, &err),
        "network: network error: timeout"
    );
    assert_eq!(
        render_error_line(OutputStyle::Rich, &anyhow::anyhow!("boom")),
        "[ERROR] error: boom"
    );
}

#[test]
fn stage_summary_only_renders_for_rich_output() {
    let elapsed = Duration::from_millis(1500);
    assert_eq!(
        render_stage_summary(OutputStyle::Plain, Stage::Download, 4, 4, elapsed),
        None
    );

    let download = render_stage_summary(OutputStyle::Rich, Stage::Download, 2, 4, elapsed)
        .expect("rich output renders a summary");
    assert!(download.ends_with(" 2/4 chunks (50%) in 1.5s"), "{download}");

    let replace = render_stage_summary(OutputStyle::Rich, Stage::Replace, 100, 100, elapsed)
        .expect("rich output renders a summary");
    assert!(replace.ends_with(" 100% in 1.5s"), "{replace}");
}

#[test]
fn output_style_follows_stdout_terminal() {
    assert_eq!(resolve_output_style(true), OutputStyle::Rich);
    assert_eq!(resolve_output_style(false), OutputStyle::Plain);
}

#[test]
fn completion_script_names_the_binary() {
    let mut output = Vec::new();
    write_completions_script(CliCompletionShell::Bash, &mut output)
        .expect("must render completions");
    let script = String::from_utf8(output).expect("completion script is utf-8");
    assert!(script.contains("updraft"));
    assert!(script.contains("resume-info"));
}

/// Serves one release split into equal chunks.
struct StaticRelease {
    version: String,
    archive_hash: String,
    chunk_size: usize,
    chunks: Vec<Vec<u8>>,
    fail_once: Mutex<BTreeSet<u32>>,
}

impl StaticRelease {
    fn new(version: &str, archive: &[u8], chunk_count: usize) -> Self {
        let chunk_size = archive.len().div_ceil(chunk_count);
        Self {
            version: version.to_string(),
            archive_hash: sha256_hex(archive),
            chunk_size,
            chunks: archive.chunks(chunk_size).map(<[u8]>::to_vec).collect(),
            fail_once: Mutex::new(BTreeSet::new()),
        }
    }
}

impl RemoteSource for StaticRelease {
    fn check_for_update(&self, current_version: &str) -> UpdateResult<UpdateCheck> {
        Ok(UpdateCheck {
            update_available: is_newer_version(current_version, &self.version),
            current_version: None,
            latest_version: Some(self.version.clone()),
            changelog: None,
        })
    }

    fn chunk_manifest(&self, _version: &str) -> UpdateResult<ChunkManifest> {
        Ok(ChunkManifest {
            total_chunks: self.chunks.len() as u32,
            chunk_size: self.chunk_size as u64,
            total_size: self.chunks.iter().map(|chunk| chunk.len() as u64).sum(),
            archive_hash: Some(self.archive_hash.clone()),
            total_files: None,
        })
    }

    fn fetch_chunk(
        &self,
        _version: &str,
        index: u32,
        sink: &mut dyn Write,
    ) -> UpdateResult<ChunkHeaders> {
        if self.fail_once.lock().expect("lock").remove(&index) {
            return Err(UpdateError::Network(format!("connection reset on chunk {index}")));
        }
        let chunk = self
            .chunks
            .get(index as usize)
            .ok_or_else(|| UpdateError::Network(format!("no chunk {index}")))?;
        sink.write_all(chunk)
            .map_err(|err| UpdateError::Network(err.to_string()))?;
        Ok(ChunkHeaders {
            hash: Some(sha256_hex(chunk)),
            total_chunks: Some(self.chunks.len() as u32),
            chunk_size: Some(self.chunk_size as u64),
        })
    }
}

#[derive(Default)]
struct QuietHost {
    events: Mutex<Vec<String>>,
}

impl QuietHost {
    fn record(&self, event: &str) -> anyhow::Result<()> {
        self.events.lock().expect("events lock").push(event.to_string());
        Ok(())
    }
}

impl HostApplication for QuietHost {
    fn enable_maintenance(&self) -> anyhow::Result<()> {
        self.record("maintenance:on")
    }

    fn disable_maintenance(&self) -> anyhow::Result<()> {
        self.record("maintenance:off")
    }

    fn set_runtime_mode(&self, _mode: RuntimeMode) -> anyhow::Result<()> {
        Ok(())
    }

    fn run_schema_migrations(&self) -> anyhow::Result<()> {
        self.record("migrate")
    }

    fn run_seeders(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn tenant_ids(&self, _offset: usize, _limit: usize) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn migrate_tenant(&self, _tenant: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn clear_cache(&self, _kind: CacheKind) -> anyhow::Result<()> {
        Ok(())
    }

    fn invalidate_compiled(&self, _path: &Path) -> anyhow::Result<()> {
        Ok(())
    }

    fn reset_compiled_cache(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

fn release_zip(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::FileOptions::default();
    for (name, content) in files {
        writer.start_file(*name, options).expect("must start file");
        writer
            .write_all(content.as_bytes())
            .expect("must write file");
    }
    writer.finish().expect("must finish zip").into_inner()
}

#[test]
fn run_installs_a_release_end_to_end() {
    let root = test_root();
    let app_root = root.join("core");
    fs::create_dir_all(&app_root).expect("must create app root");
    fs::write(app_root.join("app.php"), "<?php // 1.0").expect("must write live file");

    let archive = release_zip(&[
        ("update/app.php", "<?php // 2.0"),
        ("update/config/app.php", "<?php return [];"),
        ("update/public/index.php", "<?php // front"),
    ]);
    let release = Arc::new(StaticRelease::new("2.0.0", &archive, 3));
    release.fail_once.lock().expect("lock").insert(1);
    let host = Arc::new(QuietHost::default());

    let mut config = UpdateConfig::default();
    config.paths.app_root = app_root.clone();
    config.paths.state_dir = Some(root.join("state"));
    config.server.current_version = Some("1.0.0".to_string());
    let remote: SharedRemote = release.clone();
    let shared_host: SharedHost = host.clone();
    let mut pipeline = UpdatePipeline::new(config, remote, shared_host);

    let mut sleeps = Vec::new();
    let outcome = run_update(
        &mut pipeline,
        None,
        false,
        policy(),
        TerminalRenderer::with_style(OutputStyle::Plain),
        |wait| sleeps.push(wait),
    )
    .expect("run must succeed");

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(sleeps, vec![Duration::from_millis(10)]);
    assert_eq!(
        fs::read_to_string(app_root.join("app.php")).expect("must read"),
        "<?php // 2.0"
    );
    assert!(app_root.join("config/app.php").is_file());
    assert!(app_root.join("public/index.php").is_file());

    let session = pipeline.store().require().expect("session");
    assert_eq!(session.phase, Phase::Completed);
    assert_eq!(session.version.target, "2.0.0");
    let events = host.events.lock().expect("events lock").clone();
    assert_eq!(events.first().map(String::as_str), Some("maintenance:on"));
    assert!(events.contains(&"maintenance:off".to_string()));
    assert!(events.contains(&"migrate".to_string()));

    let again = run_update(
        &mut pipeline,
        None,
        false,
        policy(),
        TerminalRenderer::with_style(OutputStyle::Plain),
        |_| {},
    )
    .expect("second run must succeed");
    assert_eq!(again, RunOutcome::UpToDate);

    let _ = fs::remove_dir_all(&root);
}
