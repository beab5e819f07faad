use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use updraft_core::{
    AnalysisStatus, DependencyAnalysis, LockedChange, LockedChangeKind, ReplacementRules,
    UpdateResult, VersionChange,
};

use crate::fs_utils::detect_update_root;

/// Decides whether a staged vendor file should overwrite the live one.
pub trait VendorReplacePolicy {
    fn should_replace(&self, relative_path: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageChange {
    Added,
    Changed,
    Removed,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyRecord {
    pub package_name: String,
    pub declared_version: Option<String>,
    pub locked_version: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    require: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct LockFile {
    #[serde(default)]
    packages: Vec<LockedPackage>,
}

#[derive(Debug, Deserialize)]
struct LockedPackage {
    name: String,
    #[serde(default)]
    version: String,
}

/// Compares live and staged dependency manifests and gates vendor copies.
#[derive(Debug, Clone)]
pub struct DependencyDiffAnalyzer {
    app_root: PathBuf,
    rules: ReplacementRules,
    analysis: Option<DependencyAnalysis>,
}

impl DependencyDiffAnalyzer {
    pub fn new(app_root: impl Into<PathBuf>, rules: ReplacementRules) -> Self {
        Self {
            app_root: app_root.into(),
            rules,
            analysis: None,
        }
    }

    /// Restores a result computed earlier in the same session.
    pub fn with_analysis(mut self, analysis: Option<DependencyAnalysis>) -> Self {
        self.analysis = analysis;
        self
    }

    pub fn analysis(&self) -> Option<&DependencyAnalysis> {
        self.analysis.as_ref()
    }

    pub fn analyze(&mut self, staged_root: &Path) -> DependencyAnalysis {
        let analysis = match self.compute(staged_root) {
            Ok(analysis) => analysis,
            Err(err) => {
                warn!(error = %err, "dependency analysis failed; treating as no changes");
                DependencyAnalysis::failed(format!("{err:#}"))
            }
        };
        info!("{}", analysis.summary());
        self.analysis = Some(analysis.clone());
        analysis
    }

    fn compute(&self, staged_root: &Path) -> Result<DependencyAnalysis> {
        let staged_root = detect_update_root(staged_root)?;
        let staged_manifest = [
            staged_root
                .join(&self.rules.staged_manifest_dir)
                .join(&self.rules.manifest_file),
            staged_root.join(&self.rules.manifest_file),
        ]
        .into_iter()
        .find(|path| path.is_file());
        let Some(staged_manifest) = staged_manifest else {
            debug!("no staged dependency manifest; skipping vendor comparison");
            return Ok(DependencyAnalysis::no_changes());
        };
        let live_manifest = self.app_root.join(&self.rules.manifest_file);
        if !live_manifest.is_file() {
            debug!("no live dependency manifest; every vendor file will be copied");
            return Ok(DependencyAnalysis::no_changes());
        }

        let live = read_manifest(&live_manifest)?;
        let staged = read_manifest(&staged_manifest)?;

        let mut analysis = DependencyAnalysis {
            status: AnalysisStatus::Analyzed,
            ..DependencyAnalysis::default()
        };
        for (name, version) in &staged.require {
            match live.require.get(name) {
                None => {
                    analysis.added.insert(name.clone(), version.clone());
                }
                Some(old) if old != version => {
                    analysis.changed.insert(
                        name.clone(),
                        VersionChange {
                            old: old.clone(),
                            new: version.clone(),
                        },
                    );
                }
                Some(_) => {}
            }
        }
        for (name, version) in &live.require {
            if !staged.require.contains_key(name) {
                analysis.removed.insert(name.clone(), version.clone());
            }
        }

        let live_lock = self.app_root.join(&self.rules.lock_file);
        let staged_lock = staged_manifest.with_file_name(&self.rules.lock_file);
        if live_lock.is_file() && staged_lock.is_file() {
            let live = read_lock(&live_lock)?;
            let staged = read_lock(&staged_lock)?;
            analysis.locked = diff_locked(&live, &staged);
        }

        Ok(analysis)
    }

    fn analyzed(&self) -> Option<&DependencyAnalysis> {
        self.analysis
            .as_ref()
            .filter(|analysis| analysis.status == AnalysisStatus::Analyzed)
    }

    pub fn classify(&self, package: &str) -> PackageChange {
        let Some(analysis) = self.analyzed() else {
            return PackageChange::Unchanged;
        };
        if analysis.removed.contains_key(package) {
            return PackageChange::Removed;
        }
        if analysis.added.contains_key(package) {
            return PackageChange::Added;
        }
        if analysis.changed.contains_key(package) {
            return PackageChange::Changed;
        }
        match analysis.locked.get(package).map(|change| change.kind) {
            Some(LockedChangeKind::Added) => PackageChange::Added,
            Some(LockedChangeKind::Changed) => PackageChange::Changed,
            Some(LockedChangeKind::Removed) | None => PackageChange::Unchanged,
        }
    }

    pub fn dependency_record(&self, package: &str) -> DependencyRecord {
        let analysis = self.analysis.as_ref();
        let declared_version = analysis.and_then(|analysis| {
            analysis
                .added
                .get(package)
                .cloned()
                .or_else(|| analysis.changed.get(package).map(|change| change.new.clone()))
                .or_else(|| analysis.removed.get(package).cloned())
        });
        let locked_version = analysis
            .and_then(|analysis| analysis.locked.get(package))
            .and_then(|change| change.new_version.clone().or(change.old_version.clone()));
        DependencyRecord {
            package_name: package.to_string(),
            declared_version,
            locked_version,
        }
    }

    /// `org/pkg` for a path like `vendor/org/pkg/src/File.php`.
    pub fn package_for_path(&self, relative_path: &str) -> Option<String> {
        let rest = relative_path.strip_prefix(&format!("{}/", self.rules.vendor_dir))?;
        let mut parts = rest.split('/');
        let org = parts.next().filter(|part| !part.is_empty())?;
        let name = parts.next().filter(|part| !part.is_empty())?;
        parts.next()?;
        Some(format!("{org}/{name}"))
    }

    fn is_generated_vendor_file(&self, relative_path: &str) -> bool {
        let vendor = &self.rules.vendor_dir;
        relative_path == format!("{vendor}/autoload.php")
            || relative_path.starts_with(&format!("{vendor}/composer/"))
    }

    fn live_file_missing(&self, relative_path: &str) -> bool {
        !self.app_root.join(relative_path).exists()
    }

    pub fn affected_vendor_paths(&self) -> Vec<String> {
        let Some(analysis) = self.analyzed() else {
            return Vec::new();
        };
        let locked = analysis
            .locked
            .iter()
            .filter(|(_, change)| change.kind != LockedChangeKind::Removed)
            .map(|(name, _)| name);
        analysis
            .added
            .keys()
            .chain(analysis.changed.keys())
            .chain(locked)
            .map(|name| format!("{}/{name}", self.rules.vendor_dir))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn vendor_paths_to_remove(&self) -> Vec<String> {
        let Some(analysis) = self.analyzed() else {
            return Vec::new();
        };
        analysis
            .removed
            .keys()
            .map(|name| format!("{}/{name}", self.rules.vendor_dir))
            .collect()
    }

    pub fn requires_dependency_update(&self) -> bool {
        self.analyzed().is_some_and(|analysis| {
            !analysis.added.is_empty() || !analysis.removed.is_empty() || !analysis.changed.is_empty()
        })
    }

    /// Deletes live vendor directories of packages the update no longer declares.
    pub fn remove_obsolete_packages(&self) -> UpdateResult<usize> {
        let mut removed = 0;
        for relative in self.vendor_paths_to_remove() {
            let path = self.app_root.join(&relative);
            if !path.is_dir() {
                continue;
            }
            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    info!(package = %relative, "removed obsolete vendor package");
                    removed += 1;
                }
                Err(err) => warn!(package = %relative, error = %err, "failed to remove vendor package"),
            }
        }
        Ok(removed)
    }
}

impl VendorReplacePolicy for DependencyDiffAnalyzer {
    fn should_replace(&self, relative_path: &str) -> bool {
        if !relative_path.starts_with(&format!("{}/", self.rules.vendor_dir)) {
            return true;
        }
        if self.is_generated_vendor_file(relative_path) {
            return true;
        }
        // No usable comparison: copy everything.
        if self.analyzed().is_none() {
            return true;
        }

        let Some(package) = self.package_for_path(relative_path) else {
            return self.live_file_missing(relative_path);
        };
        match self.classify(&package) {
            PackageChange::Removed => false,
            PackageChange::Added | PackageChange::Changed => true,
            PackageChange::Unchanged => self.live_file_missing(relative_path),
        }
    }
}

fn read_manifest(path: &Path) -> Result<ManifestFile> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).map_err(|err| anyhow!("invalid manifest {}: {err}", path.display()))
}

fn read_lock(path: &Path) -> Result<BTreeMap<String, String>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let lock: LockFile = serde_json::from_str(&raw)
        .map_err(|err| anyhow!("invalid lockfile {}: {err}", path.display()))?;
    Ok(lock
        .packages
        .into_iter()
        .map(|package| (package.name, package.version))
        .collect())
}

fn diff_locked(
    live: &BTreeMap<String, String>,
    staged: &BTreeMap<String, String>,
) -> BTreeMap<String, LockedChange> {
    let mut changes = BTreeMap::new();
    for (name, version) in staged {
        match live.get(name) {
            None => {
                changes.insert(
                    name.clone(),
                    LockedChange {
                        kind: LockedChangeKind::Added,
                        old_version: None,
                        new_version: Some(version.clone()),
                    },
                );
            }
            Some(old) if old != version => {
                changes.insert(
                    name.clone(),
                    LockedChange {
                        kind: LockedChangeKind::Changed,
                        old_version: Some(old.clone()),
                        new_version: Some(version.clone()),
                    },
                );
            }
            Some(_) => {}
        }
    }
    for (name, version) in live {
        if !staged.contains_key(name) {
            changes.insert(
                name.clone(),
                LockedChange {
                    kind: LockedChangeKind::Removed,
                    old_version: Some(version.clone()),
                    new_version: None,
                },
            );
        }
    }
    changes
}
