use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};
use updraft_core::{Phase, UpdateError, UpdateResult, UpdateTuning};
use updraft_pipeline::{NextStep, UpdatePipeline};

use crate::render::{Stage, TerminalRenderer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub(crate) fn from_tuning(tuning: &UpdateTuning) -> Self {
        Self {
            max_retries: tuning.max_retries,
            delay: Duration::from_millis(tuning.retry_delay_ms),
        }
    }

    /// Wait before retry number `attempt` (1-based); grows linearly.
    pub(crate) fn delay_for(self, attempt: u32) -> Duration {
        self.delay.saturating_mul(attempt)
    }
}

/// Runs `operation`, retrying recoverable failures up to `policy.max_retries` times.
pub(crate) fn retry_with_backoff<T>(
    policy: RetryPolicy,
    what: &str,
    sleep: &mut dyn FnMut(Duration),
    mut operation: impl FnMut() -> UpdateResult<T>,
) -> UpdateResult<T> {
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(err) if is_retryable(&err) && attempt < policy.max_retries => {
                attempt += 1;
                let wait = policy.delay_for(attempt);
                warn!(
                    operation = what,
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    error = %err,
                    "retrying after recoverable failure"
                );
                sleep(wait);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Missing chunks are recoverable, but only by downloading them again.
fn is_retryable(err: &UpdateError) -> bool {
    err.is_recoverable() && !matches!(err, UpdateError::MissingChunks(_))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    Completed,
    UpToDate,
    Paused,
    Failed,
}

/// Drives the session with `resume()` until it completes, pauses or stops.
pub(crate) fn run_update(
    pipeline: &mut UpdatePipeline,
    version: Option<&str>,
    is_tenant: bool,
    policy: RetryPolicy,
    renderer: TerminalRenderer,
    mut sleep: impl FnMut(Duration),
) -> Result<RunOutcome> {
    let sleep: &mut dyn FnMut(Duration) = &mut sleep;

    let status = pipeline.status()?;
    match (&status.session, version) {
        (Some(session), _) if status.can_resume => {
            if let Some(requested) = version {
                if requested.trim() != session.version.target {
                    anyhow::bail!(
                        "an update to {} is already in progress; cancel it before installing {requested}",
                        session.version.target
                    );
                }
            }
            renderer.print_status(
                "info",
                &format!(
                    "resuming update to {} from phase {}",
                    session.version.target, session.phase
                ),
            );
        }
        (_, Some(requested)) => {
            let session = pipeline.initiate(requested, is_tenant)?;
            renderer.print_status(
                "info",
                &format!(
                    "updating {} -> {}",
                    session.version.current, session.version.target
                ),
            );
        }
        (_, None) => {
            let check = pipeline.check_for_update()?;
            let latest = check.latest_version.filter(|_| check.update_available);
            let Some(latest) = latest else {
                renderer.print_status("ok", "already up to date");
                return Ok(RunOutcome::UpToDate);
            };
            let session = pipeline.initiate(&latest, is_tenant)?;
            renderer.print_status(
                "info",
                &format!(
                    "updating {} -> {}",
                    session.version.current, session.version.target
                ),
            );
        }
    }

    let mut merge_misses = 0;
    loop {
        if pipeline.is_paused()? {
            renderer.print_status("warn", "update paused; unpause and run again to continue");
            return Ok(RunOutcome::Paused);
        }

        match pipeline.resume()? {
            NextStep::DownloadChunks { indices } => {
                renderer.print_phase(Stage::Download);
                let total = pipeline.store().require()?.download.total_chunks;
                let mut progress = renderer.start_progress(Stage::Download, u64::from(total));
                progress.advance_to(u64::from(total).saturating_sub(indices.len() as u64));
                for index in indices {
                    if pipeline.is_paused()? {
                        progress.abandon();
                        renderer.print_status("warn", "update paused");
                        return Ok(RunOutcome::Paused);
                    }
                    let result = retry_with_backoff(policy, "download chunk", sleep, || {
                        pipeline.download_chunk(index)
                    });
                    if let Err(err) = result {
                        progress.abandon();
                        return Err(err.into());
                    }
                    progress.advance_to(progress.done() + 1);
                }
                progress.finish();
            }
            NextStep::Merge => {
                let merged = retry_with_backoff(policy, "merge", sleep, || pipeline.merge());
                let outcome = match merged {
                    Ok(outcome) => outcome,
                    Err(UpdateError::MissingChunks(missing))
                        if merge_misses < policy.max_retries =>
                    {
                        merge_misses += 1;
                        warn!(?missing, attempt = merge_misses, "merge found missing chunks");
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                };
                if outcome.hash_matches == Some(false) {
                    renderer.print_status("warn", "merged archive hash differs from the manifest");
                }
                renderer.print_status(
                    "ok",
                    &format!("merged archive ({} entries)", outcome.entry_count),
                );
            }
            NextStep::ExtractBatch { batch } => {
                renderer.print_phase(Stage::Extract);
                let mut progress = renderer.start_progress(Stage::Extract, 100);
                let mut next = Some(batch);
                while let Some(batch) = next {
                    let outcome = match retry_with_backoff(policy, "extract", sleep, || {
                        pipeline.extract_batch(batch)
                    }) {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            progress.abandon();
                            return Err(err.into());
                        }
                    };
                    for failure in &outcome.errors {
                        warn!(entry = %failure.path, "{}", failure.message);
                    }
                    progress.advance_to(u64::from(outcome.percent));
                    next = outcome.next_batch;
                    if next.is_some() && pipeline.is_paused()? {
                        progress.abandon();
                        renderer.print_status("warn", "update paused");
                        return Ok(RunOutcome::Paused);
                    }
                }
                progress.finish();
            }
            NextStep::ReplaceBatch { batch } => {
                renderer.print_phase(Stage::Replace);
                let mut progress = renderer.start_progress(Stage::Replace, 100);
                let mut next = Some(batch);
                let mut dependency_update_required = false;
                while let Some(batch) = next {
                    let outcome = match retry_with_backoff(policy, "replace", sleep, || {
                        pipeline.replace_batch(batch)
                    }) {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            progress.abandon();
                            return Err(err.into());
                        }
                    };
                    for failure in &outcome.errors {
                        warn!(file = %failure.path, "{}", failure.message);
                    }
                    dependency_update_required |= outcome.dependency_update_required;
                    progress.advance_to(u64::from(outcome.percent));
                    next = outcome.next_batch;
                    if next.is_some() && pipeline.is_paused()? {
                        progress.abandon();
                        renderer.print_status("warn", "update paused");
                        return Ok(RunOutcome::Paused);
                    }
                }
                progress.finish();
                if dependency_update_required {
                    renderer.print_status(
                        "warn",
                        "dependency manifest changed; reinstall dependencies after the update",
                    );
                }
            }
            NextStep::Migrate { is_tenant } => {
                let outcome = pipeline.run_migration(Some(is_tenant))?;
                let level = if outcome.failed_tenants.is_empty() {
                    "ok"
                } else {
                    "warn"
                };
                renderer.print_status(level, &outcome.message);
            }
            NextStep::Complete => {
                let session = pipeline.complete()?;
                renderer.print_status(
                    "ok",
                    &format!("updated to {}", session.version.target),
                );
            }
            NextStep::Idle => break,
        }
    }

    let session = pipeline.store().get()?;
    let outcome = match session.map(|session| session.phase) {
        Some(Phase::Completed) => RunOutcome::Completed,
        Some(phase) => {
            warn!(phase = %phase, "update stopped before completion");
            RunOutcome::Failed
        }
        None => RunOutcome::UpToDate,
    };
    info!(?outcome, "update run finished");
    Ok(outcome)
}
