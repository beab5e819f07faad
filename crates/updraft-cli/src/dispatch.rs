use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use tracing::debug;
use updraft_core::{UpdateConfig, UpdateError};
use updraft_pipeline::{CommandHost, SharedHost, SharedRemote, UpdatePipeline};
use updraft_remote::LicenseServerClient;

use crate::completion::write_completions_script;
use crate::driver::{run_update, RetryPolicy, RunOutcome};
use crate::render::TerminalRenderer;
use crate::{ChunkCommands, Cli, Commands};

/// Exit status for failures a driver may simply retry later.
pub(crate) const EXIT_RETRYABLE: u8 = 75;

pub(crate) fn run_cli(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = cli.command {
        let mut stdout = std::io::stdout();
        return write_completions_script(shell, &mut stdout);
    }

    let config = load_config(&cli.config, |key| std::env::var(key).ok())?;
    let mut pipeline = build_pipeline(config)?;

    match cli.command {
        Commands::Check => print_json(&pipeline.check_for_update()?)?,
        Commands::Initiate { version, tenant } => {
            print_json(&pipeline.initiate(&version, tenant)?)?
        }
        Commands::Status => print_json(&pipeline.status()?)?,
        Commands::ResumeInfo => {
            let info = pipeline.resume_info()?;
            print_json(&json!({ "can_resume": info.is_some(), "resume_info": info }))?
        }
        Commands::Next => print_json(&pipeline.resume()?)?,
        Commands::Cancel => {
            pipeline.cancel()?;
            print_json(&json!({ "cancelled": true }))?
        }
        Commands::Chunks { command } => match command {
            ChunkCommands::Missing => {
                let missing = pipeline.missing_chunks()?;
                print_json(&json!({ "count": missing.len(), "missing_chunks": missing }))?
            }
            ChunkCommands::Download { index } => print_json(&pipeline.download_chunk(index)?)?,
            ChunkCommands::Redownload { index } => {
                print_json(&pipeline.redownload_chunk(index)?)?
            }
            ChunkCommands::Progress => print_json(&pipeline.chunk_progress()?)?,
            ChunkCommands::Merge => print_json(&pipeline.merge()?)?,
            ChunkCommands::Verify { hash } => {
                print_json(&pipeline.verify_archive(hash.as_deref())?)?
            }
        },
        Commands::Extract { batch } => print_json(&pipeline.extract_batch(batch)?)?,
        Commands::ExtractProgress => print_json(&pipeline.extraction_progress()?)?,
        Commands::Replace { batch } => print_json(&pipeline.replace_batch(batch)?)?,
        Commands::ReplaceProgress => print_json(&pipeline.replacement_progress()?)?,
        Commands::SkipFiles { list } => {
            let files = pipeline.set_skip_files(parse_csv_list(&list))?;
            print_json(&json!({ "skip_files": files }))?
        }
        Commands::SkipDirs { list } => {
            let directories = pipeline.set_skip_directories(parse_csv_list(&list))?;
            print_json(&json!({ "skip_directories": directories }))?
        }
        Commands::Maintenance { state } => {
            pipeline.set_maintenance(state.enabled())?;
            print_json(&json!({ "maintenance_mode": state.enabled() }))?
        }
        Commands::Pause { state } => {
            pipeline.set_paused(state.enabled())?;
            print_json(&json!({ "paused": state.enabled() }))?
        }
        Commands::Migrate { tenant } => {
            print_json(&pipeline.run_migration(tenant.then_some(true))?)?
        }
        Commands::Complete => print_json(&pipeline.complete()?)?,
        Commands::Finalize => {
            let session = pipeline.finalize()?;
            print_json(&json!({ "finalized": session.is_some(), "session": session }))?
        }
        Commands::Run { version, tenant } => {
            let policy = RetryPolicy::from_tuning(&pipeline.config().update);
            let renderer = TerminalRenderer::current();
            let outcome = run_update(
                &mut pipeline,
                version.as_deref(),
                tenant,
                policy,
                renderer,
                std::thread::sleep,
            )?;
            if outcome == RunOutcome::Failed {
                anyhow::bail!("update stopped in an unrecoverable state; see `updraft status`");
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Reads `path` when present, then layers environment overrides and validates.
pub(crate) fn load_config<F>(path: &Path, lookup: F) -> Result<UpdateConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = if path.is_file() {
        UpdateConfig::load(path)?
    } else {
        debug!(path = %path.display(), "config file not found; using defaults");
        UpdateConfig::default()
    };
    config.apply_env_overrides(lookup)?;
    config
        .validate()
        .with_context(|| format!("invalid configuration (file: {})", path.display()))?;
    Ok(config)
}

fn build_pipeline(config: UpdateConfig) -> Result<UpdatePipeline> {
    let remote: SharedRemote = Arc::new(LicenseServerClient::from_config(&config)?);
    let host: SharedHost = Arc::new(CommandHost::from_config(
        &config.paths,
        config.host.clone(),
    ));
    Ok(UpdatePipeline::new(config, remote, host))
}

pub(crate) fn parse_csv_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to encode output")?;
    println!("{rendered}");
    Ok(())
}

pub(crate) fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<UpdateError>() {
        Some(update_error) if update_error.is_recoverable() => EXIT_RETRYABLE,
        _ => 1,
    }
}
