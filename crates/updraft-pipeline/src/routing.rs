use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::layout::InstallTargets;

pub const DEFAULT_SKIP_FILES: [&str; 5] = [
    ".env",
    ".htaccess",
    "dynamic-style.css",
    "dynamic-script.js",
    ".DS_Store",
];

pub const DEFAULT_SKIP_DIRECTORIES: [&str; 7] = [
    "lang",
    "custom-fonts",
    ".git",
    ".idea",
    ".vscode",
    ".fleet",
    "node_modules",
];

/// Operator and built-in rules for staged files that must never be copied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkipRules {
    file_names: BTreeSet<String>,
    exact_paths: BTreeSet<String>,
    directories: BTreeSet<String>,
}

impl SkipRules {
    /// Built-in defaults merged with `extra_files` and `extra_directories`.
    ///
    /// A file entry containing `/` matches that exact relative path only.
    pub fn with_defaults(extra_files: &[String], extra_directories: &[String]) -> Self {
        let mut rules = Self::default();
        for name in DEFAULT_SKIP_FILES {
            rules.add_file(name);
        }
        for name in DEFAULT_SKIP_DIRECTORIES {
            rules.add_directory(name);
        }
        for name in extra_files {
            rules.add_file(name);
        }
        for name in extra_directories {
            rules.add_directory(name);
        }
        rules
    }

    fn add_file(&mut self, entry: &str) {
        let entry = entry.trim().trim_start_matches('/');
        if entry.is_empty() {
            return;
        }
        if entry.contains('/') {
            self.exact_paths.insert(entry.to_string());
        } else {
            self.file_names.insert(entry.to_string());
        }
    }

    fn add_directory(&mut self, entry: &str) {
        let entry = entry.trim().trim_matches('/');
        if !entry.is_empty() {
            self.directories.insert(entry.to_string());
        }
    }

    pub fn should_skip(&self, relative_path: &str) -> bool {
        if self.exact_paths.contains(relative_path) {
            return true;
        }

        let segments: Vec<&str> = relative_path.split('/').collect();
        let Some((file_name, dirs)) = segments.split_last() else {
            return false;
        };
        if self.file_names.contains(*file_name) {
            return true;
        }
        if dirs.iter().any(|dir| *dir == ".git") {
            return true;
        }

        // Multi-segment directory rules match a contiguous run of segments.
        self.directories.iter().any(|rule| {
            let rule_segments: Vec<&str> = rule.split('/').collect();
            dirs.windows(rule_segments.len())
                .any(|window| window == rule_segments.as_slice())
        })
    }
}

/// Which routing rule a staged file falls under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryClass {
    PublicAsset,
    RootFile,
    Custom,
    SiteAsset,
    Module,
    Plugin,
    VendorPackageFile,
    DefaultRoot,
}

pub fn classify_entry(relative_path: &str, vendor_dir: &str) -> EntryClass {
    let first = relative_path.split('/').next().unwrap_or_default();
    let has_rest = relative_path.len() > first.len() + 1;
    if !has_rest {
        return EntryClass::DefaultRoot;
    }
    match first {
        "public" => EntryClass::PublicAsset,
        "__rootFiles" => EntryClass::RootFile,
        "custom" => EntryClass::Custom,
        "assets" => EntryClass::SiteAsset,
        "Modules" => EntryClass::Module,
        "plugins" => EntryClass::Plugin,
        other if other == vendor_dir => EntryClass::VendorPackageFile,
        _ => EntryClass::DefaultRoot,
    }
}

#[derive(Debug, Default, Deserialize)]
struct ChangeLogFile {
    #[serde(default)]
    custom: Vec<CustomFileMapping>,
}

#[derive(Debug, Deserialize)]
struct CustomFileMapping {
    #[serde(default)]
    filename: String,
    #[serde(default)]
    path: String,
}

/// Maps staged relative paths to their live destinations.
#[derive(Debug, Clone)]
pub struct DestinationRouter {
    targets: InstallTargets,
    staged_root: PathBuf,
    change_log_file: String,
    vendor_dir: String,
    custom_destinations: Option<BTreeMap<String, String>>,
}

impl DestinationRouter {
    pub fn new(
        targets: InstallTargets,
        staged_root: impl Into<PathBuf>,
        change_log_file: impl Into<String>,
        vendor_dir: impl Into<String>,
    ) -> Self {
        Self {
            targets,
            staged_root: staged_root.into(),
            change_log_file: change_log_file.into(),
            vendor_dir: vendor_dir.into(),
            custom_destinations: None,
        }
    }

    pub fn classify(&self, relative_path: &str) -> EntryClass {
        classify_entry(relative_path, &self.vendor_dir)
    }

    /// Live destination for `relative_path`, or `None` when it has nowhere to go.
    pub fn resolve(&mut self, relative_path: &str) -> Result<Option<PathBuf>> {
        let relative = safe_relative(relative_path)?;
        let class = self.classify(relative_path);
        let destination = match class {
            EntryClass::PublicAsset => Some(self.targets.public_root.join(strip_first(&relative))),
            EntryClass::RootFile => Some(self.targets.app_root.join(strip_first(&relative))),
            EntryClass::SiteAsset => Some(self.targets.site_root.join(&relative)),
            EntryClass::Custom => self.custom_destination(&relative)?,
            EntryClass::Module
            | EntryClass::Plugin
            | EntryClass::VendorPackageFile
            | EntryClass::DefaultRoot => Some(self.targets.app_root.join(&relative)),
        };
        Ok(destination)
    }

    fn custom_destination(&mut self, relative: &Path) -> Result<Option<PathBuf>> {
        let Some(file_name) = relative.file_name().map(|name| name.to_string_lossy().into_owned())
        else {
            return Ok(None);
        };
        let mappings = self.custom_destinations()?;
        let Some(target_dir) = mappings.get(&file_name).cloned() else {
            warn!(file = %relative.display(), "no change-log mapping for custom file");
            return Ok(None);
        };
        let target_dir = safe_relative(target_dir.trim_matches('/'))
            .with_context(|| format!("unsafe change-log destination for {file_name}"))?;
        Ok(Some(
            self.targets.site_root.join(target_dir).join(&file_name),
        ))
    }

    fn custom_destinations(&mut self) -> Result<&BTreeMap<String, String>> {
        if self.custom_destinations.is_none() {
            let path = self.staged_root.join(&self.change_log_file);
            let mappings = if path.is_file() {
                let raw = fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let change_log: ChangeLogFile = serde_json::from_str(&raw)
                    .map_err(|err| anyhow!("invalid change log {}: {err}", path.display()))?;
                change_log
                    .custom
                    .into_iter()
                    .filter(|mapping| !mapping.filename.is_empty() && !mapping.path.is_empty())
                    .map(|mapping| (mapping.filename, mapping.path))
                    .collect()
            } else {
                warn!(path = %path.display(), "change log not found; custom files will be skipped");
                BTreeMap::new()
            };
            self.custom_destinations = Some(mappings);
        }
        self.custom_destinations
            .as_ref()
            .ok_or_else(|| anyhow!("change log mappings unavailable"))
    }
}

fn strip_first(relative: &Path) -> PathBuf {
    relative.components().skip(1).collect()
}

/// Rejects absolute paths and `..` so a destination cannot escape its root.
fn safe_relative(relative_path: &str) -> Result<PathBuf> {
    let path = Path::new(relative_path);
    if relative_path.is_empty()
        || path
            .components()
            .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir))
    {
        anyhow::bail!("path escapes its destination root: {relative_path}");
    }
    Ok(path
        .components()
        .filter(|component| matches!(component, Component::Normal(_)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(staged: &Path) -> DestinationRouter {
        DestinationRouter::new(
            InstallTargets {
                app_root: PathBuf::from("/srv/site/core"),
                public_root: PathBuf::from("/srv/site/core/public"),
                site_root: PathBuf::from("/srv/site"),
            },
            staged,
            "change-logs.json",
            "vendor",
        )
    }

    #[test]
    fn skip_rules_match_names_paths_and_directory_segments() {
        let rules = SkipRules::with_defaults(
            &["config/app.php".to_string(), "robots.txt".to_string()],
            &["storage".to_string()],
        );
        assert!(rules.should_skip(".env"));
        assert!(rules.should_skip("public/.htaccess"));
        assert!(rules.should_skip("config/app.php"));
        assert!(!rules.should_skip("Modules/config/app.php"));
        assert!(rules.should_skip("public/robots.txt"));
        assert!(rules.should_skip("storage/logs/x.log"));
        assert!(rules.should_skip("Modules/Blog/lang/en.json"));
        assert!(rules.should_skip("plugins/x/.git/HEAD"));
        assert!(!rules.should_skip("app/language.php"));
        assert!(!rules.should_skip("lang"));
    }

    #[test]
    fn routing_table_sends_each_class_to_its_root() {
        let mut router = router(Path::new("/tmp/none"));
        let resolve = |router: &mut DestinationRouter, path: &str| {
            router.resolve(path).expect("must resolve")
        };
        assert_eq!(
            resolve(&mut router, "public/js/app.js"),
            Some(PathBuf::from("/srv/site/core/public/js/app.js"))
        );
        assert_eq!(
            resolve(&mut router, "__rootFiles/index.php"),
            Some(PathBuf::from("/srv/site/core/index.php"))
        );
        assert_eq!(
            resolve(&mut router, "assets/img/logo.png"),
            Some(PathBuf::from("/srv/site/assets/img/logo.png"))
        );
        assert_eq!(
            resolve(&mut router, "Modules/Blog/Routes/web.php"),
            Some(PathBuf::from("/srv/site/core/Modules/Blog/Routes/web.php"))
        );
        assert_eq!(
            resolve(&mut router, "vendor/acme/lib/src/A.php"),
            Some(PathBuf::from("/srv/site/core/vendor/acme/lib/src/A.php"))
        );
        assert_eq!(
            resolve(&mut router, "app/Http/Kernel.php"),
            Some(PathBuf::from("/srv/site/core/app/Http/Kernel.php"))
        );
        assert_eq!(resolve(&mut router, "custom/theme.css"), None);
    }

    #[test]
    fn routing_is_segment_based() {
        assert_eq!(classify_entry("publicity/x.txt", "vendor"), EntryClass::DefaultRoot);
        assert_eq!(classify_entry("public", "vendor"), EntryClass::DefaultRoot);
        assert_eq!(classify_entry("vendor/autoload.php", "vendor"), EntryClass::VendorPackageFile);
        assert_eq!(classify_entry("plugins/a/b.php", "vendor"), EntryClass::Plugin);
    }

    #[test]
    fn router_rejects_escaping_paths() {
        let mut router = router(Path::new("/tmp/none"));
        assert!(router.resolve("../etc/passwd").is_err());
        assert!(router.resolve("public/../../x").is_err());
        assert!(router.resolve("/etc/passwd").is_err());
    }
}
