use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};
use updraft_core::{
    percent_of, DependencyAnalysis, EntryFailure, ErrorKind, Phase, ReplacementRules,
    StepStatus, UpdateError, UpdateResult, UpdateTuning,
};

use crate::deps::{DependencyDiffAnalyzer, VendorReplacePolicy};
use crate::fs_utils::{collect_relative_files, copy_file_creating_parents, detect_update_root};
use crate::host::SharedHost;
use crate::layout::InstallTargets;
use crate::routing::{DestinationRouter, SkipRules};
use crate::store::StatusStore;

/// Extra caller predicate; returning `false` vetoes the copy of that path.
pub type ReplaceFilter = Box<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplacementBatch {
    pub batch: u32,
    pub replaced_in_batch: u64,
    pub skipped_in_batch: u64,
    pub replaced_total: u64,
    pub skipped_total: u64,
    pub total_files: u64,
    pub has_more: bool,
    pub percent: u8,
    pub next_batch: Option<u32>,
    /// The batch had already been applied; totals were left untouched.
    pub replayed: bool,
    pub dependency_update_required: bool,
    pub errors: Vec<EntryFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Copy,
    Skip(&'static str),
}

/// Copies staged files over the live installation a batch at a time.
pub struct BatchReplacer {
    store: StatusStore,
    host: SharedHost,
    targets: InstallTargets,
    rules: ReplacementRules,
    enable_backup: bool,
    smart_vendor: bool,
    policy: Option<Box<dyn VendorReplacePolicy + Send + Sync>>,
    filter: Option<ReplaceFilter>,
    staged_root: Option<PathBuf>,
    files: Option<Vec<String>>,
}

impl BatchReplacer {
    pub fn new(
        store: StatusStore,
        host: SharedHost,
        targets: InstallTargets,
        rules: ReplacementRules,
        tuning: &UpdateTuning,
    ) -> Self {
        Self {
            store,
            host,
            targets,
            rules,
            enable_backup: tuning.enable_backup,
            smart_vendor: tuning.smart_vendor_replacement,
            policy: None,
            filter: None,
            staged_root: None,
            files: None,
        }
    }

    /// Replaces the dependency analyzer as the vendor gate.
    pub fn with_policy(mut self, policy: Box<dyn VendorReplacePolicy + Send + Sync>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_filter(mut self, filter: ReplaceFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Forgets the cached staging root and file list.
    pub fn reset(&mut self) {
        self.staged_root = None;
        self.files = None;
    }

    pub fn replace_batch(&mut self, batch: u32, batch_size: usize) -> UpdateResult<ReplacementBatch> {
        if batch_size == 0 {
            return Err(UpdateError::session_state("replacement batch size must be positive"));
        }
        self.store.require()?;
        self.store.set_phase(Phase::Replacement)?;

        match self.replace_entries(batch, batch_size) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!(batch, error = %err, "replacement batch failed");
                let context = BTreeMap::from([("batch".to_string(), batch.to_string())]);
                self.store
                    .record_error(ErrorKind::ReplacementFailed, err.to_string(), context)?;
                Err(err)
            }
        }
    }

    fn replace_entries(&mut self, batch: u32, batch_size: usize) -> UpdateResult<ReplacementBatch> {
        let files = self.ensure_files(batch_size)?;
        let total = files.len();
        let session = self.store.require()?;
        let applied = session.replacement.batches_applied;
        let start = (batch as usize).saturating_mul(batch_size);

        if start >= total {
            // Every batch was applied but the run stopped before it was marked complete.
            let covered = (applied as usize).saturating_mul(batch_size) >= total;
            if covered && session.replacement.status != StepStatus::Completed {
                self.finish(total as u64)?;
            }
            let session = self.store.require()?;
            return Ok(ReplacementBatch {
                batch,
                replaced_in_batch: 0,
                skipped_in_batch: 0,
                replaced_total: session.replacement.replaced_files,
                skipped_total: session.replacement.skipped_files,
                total_files: total as u64,
                has_more: false,
                percent: 100,
                next_batch: None,
                replayed: false,
                dependency_update_required: self.analyzer(session.dependency_analysis.clone())
                    .requires_dependency_update(),
                errors: Vec::new(),
            });
        }

        if batch > applied {
            return Err(UpdateError::session_state(format!(
                "replacement batch {batch} requested before batch {applied}"
            )));
        }
        let replayed = batch < applied;
        let already_completed = session.replacement.status == StepStatus::Completed;

        if batch == 0 && !replayed {
            self.enter_maintenance()?;
        }
        let analyzer = self.prepare_analysis(session.dependency_analysis.clone())?;

        let staged_root = self.staged_root()?;
        let skip_rules = SkipRules::with_defaults(
            &merged(&self.rules.skip_files, &session.skip_files),
            &merged(&self.rules.skip_directories, &session.skip_directories),
        );
        let mut router = DestinationRouter::new(
            self.targets.clone(),
            &staged_root,
            &self.rules.change_log_file,
            &self.rules.vendor_dir,
        );

        let end = (start + batch_size).min(total);
        let mut replaced_in_batch = 0_u64;
        let mut skipped_in_batch = 0_u64;
        let mut errors = Vec::new();
        let mut last_file = None;
        for relative in &files[start..end] {
            last_file = Some(relative.clone());
            match self.decide(relative, &skip_rules, &analyzer) {
                Decision::Skip(reason) => {
                    debug!(file = %relative, reason, "skipping staged file");
                    skipped_in_batch += 1;
                    continue;
                }
                Decision::Copy => {}
            }

            match self.copy_entry(&staged_root, relative, &mut router, !replayed) {
                Ok(true) => replaced_in_batch += 1,
                Ok(false) => skipped_in_batch += 1,
                Err(err) => {
                    warn!(file = %relative, error = %err, "failed to replace file");
                    errors.push(EntryFailure::new(relative, format!("{err:#}")));
                    skipped_in_batch += 1;
                }
            }
        }

        let has_more = end < total;
        let percent = percent_of(end as u64, total as u64);
        let (replaced_total, skipped_total) = self.store.update_replacement(|replacement| {
            if !replayed {
                let room = (total as u64)
                    .saturating_sub(replacement.replaced_files + replacement.skipped_files);
                let replaced = replaced_in_batch.min(room);
                let skipped = skipped_in_batch.min(room - replaced);
                replacement.replaced_files += replaced;
                replacement.skipped_files += skipped;
            }
            if replacement.status != StepStatus::Completed {
                replacement.status = StepStatus::InProgress;
            }
            replacement.current_batch = Some(batch);
            replacement.batches_applied = replacement.batches_applied.max(batch + 1);
            replacement.percent = replacement.percent.max(percent);
            replacement.current_file = last_file.clone();
            (replacement.replaced_files, replacement.skipped_files)
        })?;

        if batch % 5 == 0 || !has_more {
            self.store.append_log(format!(
                "Replaced {replaced_total} files, skipped {skipped_total} of {total} ({percent}%)"
            ))?;
        }
        if !has_more && !already_completed {
            self.finish(total as u64)?;
        }

        Ok(ReplacementBatch {
            batch,
            replaced_in_batch,
            skipped_in_batch,
            replaced_total,
            skipped_total,
            total_files: total as u64,
            has_more,
            percent,
            next_batch: has_more.then_some(batch + 1),
            replayed,
            dependency_update_required: analyzer.requires_dependency_update(),
            errors,
        })
    }

    fn decide(
        &self,
        relative: &str,
        skip_rules: &SkipRules,
        analyzer: &DependencyDiffAnalyzer,
    ) -> Decision {
        if skip_rules.should_skip(relative) {
            return Decision::Skip("skip list");
        }

        if relative.starts_with(&format!("{}/", self.rules.vendor_dir)) {
            if let Some(own) = self.rules.self_package.as_deref() {
                if relative.starts_with(&format!("{}/{own}/", self.rules.vendor_dir)) {
                    return Decision::Skip("self package");
                }
            }
            let replace = match self.policy.as_deref() {
                Some(policy) => policy.should_replace(relative),
                None => analyzer.should_replace(relative),
            };
            if !replace {
                return Decision::Skip("vendor package unchanged");
            }
        }

        if let Some(filter) = &self.filter {
            if !filter(relative) {
                return Decision::Skip("vetoed by filter");
            }
        }
        Decision::Copy
    }

    /// Copies one staged file to its routed destination. `Ok(false)` when it has none.
    fn copy_entry(
        &self,
        staged_root: &Path,
        relative: &str,
        router: &mut DestinationRouter,
        back_up: bool,
    ) -> anyhow::Result<bool> {
        let Some(destination) = router.resolve(relative)? else {
            return Ok(false);
        };
        let source = staged_root.join(relative);

        if back_up {
            self.back_up_original(&destination, relative)?;
        }

        self.invalidate_compiled(&destination);
        copy_file_creating_parents(&source, &destination)?;
        self.invalidate_compiled(&destination);
        Ok(true)
    }

    /// Keeps the first copy of a live file; later calls never overwrite it.
    fn back_up_original(&self, destination: &Path, relative: &str) -> anyhow::Result<()> {
        if !self.enable_backup || !destination.is_file() {
            return Ok(());
        }
        let backup = self.store.layout().backup_dir().join(relative);
        if backup.exists() {
            return Ok(());
        }
        copy_file_creating_parents(destination, &backup)?;
        Ok(())
    }

    fn invalidate_compiled(&self, path: &Path) {
        if let Err(err) = self.host.invalidate_compiled(path) {
            debug!(path = %path.display(), error = %err, "compiled cache invalidation failed");
        }
    }

    fn enter_maintenance(&self) -> UpdateResult<()> {
        if self.store.require()?.maintenance_mode {
            return Ok(());
        }
        match self.host.enable_maintenance() {
            Ok(()) => {
                self.store.update(|session| session.maintenance_mode = true)?;
                self.store.append_log("Maintenance mode enabled")?;
            }
            Err(err) => {
                warn!(error = %err, "could not enable maintenance mode");
                self.store
                    .append_log(format!("Warning: could not enable maintenance mode: {err}"))?;
            }
        }
        Ok(())
    }

    fn finish(&self, total: u64) -> UpdateResult<()> {
        if let Err(err) = self.host.reset_compiled_cache() {
            warn!(error = %err, "compiled cache reset failed");
        }
        if self.store.require()?.maintenance_mode {
            match self.host.disable_maintenance() {
                Ok(()) => {
                    self.store.update(|session| session.maintenance_mode = false)?;
                    self.store.append_log("Maintenance mode disabled")?;
                }
                Err(err) => {
                    warn!(error = %err, "could not disable maintenance mode");
                    self.store.append_log(format!(
                        "Warning: could not disable maintenance mode: {err}"
                    ))?;
                }
            }
        }
        self.store.update_replacement(|replacement| {
            replacement.status = StepStatus::Completed;
            replacement.percent = 100;
        })?;
        self.store
            .append_log(format!("File replacement completed ({total} files)"))?;
        info!(files = total, "replacement finished");
        Ok(())
    }

    fn analyzer(&self, cached: Option<DependencyAnalysis>) -> DependencyDiffAnalyzer {
        let cached = if self.smart_vendor { cached } else { None };
        DependencyDiffAnalyzer::new(&self.targets.app_root, self.rules.clone()).with_analysis(cached)
    }

    /// Computes the dependency analysis once per session and removes dropped packages.
    fn prepare_analysis(
        &mut self,
        cached: Option<DependencyAnalysis>,
    ) -> UpdateResult<DependencyDiffAnalyzer> {
        let mut analyzer = self.analyzer(cached);
        if !self.smart_vendor || analyzer.analysis().is_some() {
            return Ok(analyzer);
        }

        let staged_root = self.staged_root()?;
        let analysis = analyzer.analyze(&staged_root);
        self.store.append_log(analysis.summary())?;
        self.store
            .update(|session| session.dependency_analysis = Some(analysis.clone()))?;

        let removed = analyzer.remove_obsolete_packages()?;
        if removed > 0 {
            self.store
                .append_log(format!("Removed {removed} obsolete vendor package(s)"))?;
        }
        Ok(analyzer)
    }

    fn staged_root(&mut self) -> UpdateResult<PathBuf> {
        if let Some(root) = &self.staged_root {
            return Ok(root.clone());
        }
        let extracted = self.store.layout().extracted_dir();
        if !extracted.is_dir() {
            return Err(UpdateError::session_state(format!(
                "no extracted files at {}",
                extracted.display()
            )));
        }
        let root = detect_update_root(&extracted)?;
        self.staged_root = Some(root.clone());
        Ok(root)
    }

    fn ensure_files(&mut self, batch_size: usize) -> UpdateResult<Vec<String>> {
        if self.files.is_none() {
            let root = self.staged_root()?;
            let files = collect_relative_files(&root)?;
            debug!(files = files.len(), root = %root.display(), "built replacement file list");
            self.files = Some(files);
        }
        let files = self.files.clone().unwrap_or_default();
        let total_batches = files.len().div_ceil(batch_size) as u32;
        self.store.update_replacement(|replacement| {
            replacement.total_files = files.len() as u64;
            replacement.total_batches = total_batches;
        })?;
        Ok(files)
    }

    /// Copies the staged copy of the agent's own vendor package into place.
    ///
    /// Normal batches never touch it, so this runs once the rest of the
    /// installation has been replaced.
    pub fn update_self_package(&mut self) -> UpdateResult<u64> {
        let Some(own) = self.rules.self_package.clone() else {
            return Ok(0);
        };
        let prefix = format!("{}/{own}/", self.rules.vendor_dir);
        let staged_root = match self.staged_root() {
            Ok(root) => root,
            Err(UpdateError::SessionState(_)) => return Ok(0),
            Err(err) => return Err(err),
        };

        let mut copied = 0;
        for relative in collect_relative_files(&staged_root)?
            .into_iter()
            .filter(|relative| relative.starts_with(&prefix))
        {
            let destination = self.targets.app_root.join(&relative);
            self.back_up_original(&destination, &relative)?;
            copy_file_creating_parents(&staged_root.join(&relative), &destination)?;
            copied += 1;
        }
        if copied > 0 {
            self.store
                .append_log(format!("Updated {own} ({copied} files)"))?;
        }
        Ok(copied)
    }
}

fn merged(configured: &[String], session: &[String]) -> Vec<String> {
    configured.iter().chain(session).cloned().collect()
}
