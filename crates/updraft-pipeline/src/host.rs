use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tracing::debug;
use updraft_core::{HostCommands, PathsConfig};

use crate::fs_utils::write_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    Local,
    Production,
}

impl RuntimeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Production => "production",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    Application,
    Config,
    Route,
    View,
}

impl CacheKind {
    pub const ALL: [CacheKind; 4] = [Self::Application, Self::Config, Self::Route, Self::View];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::Config => "config",
            Self::Route => "route",
            Self::View => "view",
        }
    }
}

/// Side effects the pipeline needs from the application being updated.
pub trait HostApplication: Send + Sync {
    fn enable_maintenance(&self) -> Result<()>;

    fn disable_maintenance(&self) -> Result<()>;

    fn set_runtime_mode(&self, mode: RuntimeMode) -> Result<()>;

    fn run_schema_migrations(&self) -> Result<()>;

    fn run_seeders(&self) -> Result<()>;

    /// One page of tenant identifiers; an empty page ends iteration.
    fn tenant_ids(&self, offset: usize, limit: usize) -> Result<Vec<String>>;

    fn migrate_tenant(&self, tenant: &str) -> Result<()>;

    fn clear_cache(&self, kind: CacheKind) -> Result<()>;

    /// Drops any compiled-code cache entry for one replaced file.
    fn invalidate_compiled(&self, path: &Path) -> Result<()>;

    fn reset_compiled_cache(&self) -> Result<()>;
}

pub type SharedHost = Arc<dyn HostApplication>;

/// Runs the configured shell commands inside the application root.
#[derive(Debug, Clone)]
pub struct CommandHost {
    app_root: PathBuf,
    env_file: PathBuf,
    commands: HostCommands,
}

impl CommandHost {
    pub fn new(app_root: impl Into<PathBuf>, env_file: impl Into<PathBuf>, commands: HostCommands) -> Self {
        Self {
            app_root: app_root.into(),
            env_file: env_file.into(),
            commands,
        }
    }

    pub fn from_config(paths: &PathsConfig, commands: HostCommands) -> Self {
        Self::new(paths.app_root.clone(), paths.env_file(), commands)
    }

    fn build(&self, argv: &[String], substitutions: &[(&str, &str)]) -> Option<Command> {
        let (program, args) = argv.split_first()?;
        let mut command = Command::new(program);
        command.current_dir(&self.app_root);
        for arg in args {
            let mut arg = arg.clone();
            for (placeholder, value) in substitutions {
                arg = arg.replace(placeholder, value);
            }
            command.arg(arg);
        }
        Some(command)
    }

    fn run(&self, argv: &[String], substitutions: &[(&str, &str)], context_message: &str) -> Result<()> {
        let Some(mut command) = self.build(argv, substitutions) else {
            debug!("{context_message}: no command configured");
            return Ok(());
        };
        run_command(&mut command, context_message)
    }
}

impl HostApplication for CommandHost {
    fn enable_maintenance(&self) -> Result<()> {
        self.run(&self.commands.maintenance_on, &[], "failed to enable maintenance mode")
    }

    fn disable_maintenance(&self) -> Result<()> {
        self.run(&self.commands.maintenance_off, &[], "failed to disable maintenance mode")
    }

    fn set_runtime_mode(&self, mode: RuntimeMode) -> Result<()> {
        set_env_value(&self.env_file, &self.commands.runtime_mode_key, mode.as_str())
    }

    fn run_schema_migrations(&self) -> Result<()> {
        self.run(&self.commands.migrate, &[], "schema migration failed")
    }

    fn run_seeders(&self) -> Result<()> {
        self.run(&self.commands.seed, &[], "database seeding failed")
    }

    fn tenant_ids(&self, offset: usize, limit: usize) -> Result<Vec<String>> {
        let Some(mut command) = self.build(&self.commands.tenant_list, &[]) else {
            return Ok(Vec::new());
        };
        let stdout = command_output(&mut command, "failed to list tenants")?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .skip(offset)
            .take(limit)
            .map(str::to_string)
            .collect())
    }

    fn migrate_tenant(&self, tenant: &str) -> Result<()> {
        self.run(
            &self.commands.tenant_migrate,
            &[("{tenant}", tenant)],
            &format!("tenant migration failed for {tenant}"),
        )
    }

    fn clear_cache(&self, kind: CacheKind) -> Result<()> {
        let argv = match kind {
            CacheKind::Application => &self.commands.cache_clear,
            CacheKind::Config => &self.commands.config_clear,
            CacheKind::Route => &self.commands.route_clear,
            CacheKind::View => &self.commands.view_clear,
        };
        self.run(argv, &[], &format!("failed to clear {} cache", kind.as_str()))
    }

    fn invalidate_compiled(&self, path: &Path) -> Result<()> {
        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if !self
            .commands
            .compiled_extensions
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(&extension))
        {
            return Ok(());
        }
        let path = path.display().to_string();
        self.run(
            &self.commands.compiled_invalidate,
            &[("{path}", &path)],
            &format!("failed to invalidate compiled cache for {path}"),
        )
    }

    fn reset_compiled_cache(&self) -> Result<()> {
        self.run(&self.commands.compiled_cache_reset, &[], "failed to reset compiled cache")
    }
}

pub(crate) fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    command_output(command, context_message).map(|_| ())
}

fn command_output(command: &mut Command, context_message: &str) -> Result<String> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}

/// Sets `key=value` in a dotenv file, replacing an existing assignment in place.
pub fn set_env_value(path: &Path, key: &str, value: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Ok(());
    }
    let existing = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };

    let assignment = format!("{key}={value}");
    let prefix = format!("{key}=");
    let mut replaced = false;
    let mut lines: Vec<String> = existing
        .lines()
        .map(|line| {
            if !replaced && line.trim_start().starts_with(&prefix) {
                replaced = true;
                assignment.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        lines.push(assignment);
    }

    let mut content = lines.join("\n");
    content.push('\n');
    write_atomic(path, content.as_bytes())
        .with_context(|| format!("failed to update {} in {}", key, path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_root;

    fn silent_commands() -> HostCommands {
        HostCommands {
            maintenance_on: Vec::new(),
            maintenance_off: Vec::new(),
            migrate: Vec::new(),
            seed: Vec::new(),
            tenant_list: Vec::new(),
            tenant_migrate: Vec::new(),
            cache_clear: Vec::new(),
            config_clear: Vec::new(),
            route_clear: Vec::new(),
            view_clear: Vec::new(),
            compiled_cache_reset: Vec::new(),
            compiled_invalidate: Vec::new(),
            ..HostCommands::default()
        }
    }

    #[test]
    fn set_env_value_replaces_existing_assignment() {
        let root = test_root("host");
        let env = root.join(".env");
        fs::write(&env, "APP_NAME=Shop\nAPP_ENV=production\nAPP_DEBUG=false\n")
            .expect("must write env");

        set_env_value(&env, "APP_ENV", "local").expect("must set value");

        let content = fs::read_to_string(&env).expect("must read env");
        assert_eq!(content, "APP_NAME=Shop\nAPP_ENV=local\nAPP_DEBUG=false\n");
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn set_env_value_appends_when_missing() {
        let root = test_root("host");
        let env = root.join(".env");

        set_env_value(&env, "APP_ENV", "production").expect("must create env");

        assert_eq!(
            fs::read_to_string(&env).expect("must read env"),
            "APP_ENV=production\n"
        );
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn empty_commands_are_no_ops() {
        let root = test_root("host");
        let host = CommandHost::new(&root, root.join(".env"), silent_commands());

        host.enable_maintenance().expect("must skip maintenance");
        host.run_schema_migrations().expect("must skip migrations");
        host.clear_cache(CacheKind::View).expect("must skip cache clear");
        host.invalidate_compiled(&root.join("a.php"))
            .expect("must skip invalidation");
        assert!(host.tenant_ids(0, 50).expect("must list").is_empty());
        let _ = fs::remove_dir_all(&root);
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_reports_context() {
        let root = test_root("host");
        let commands = HostCommands {
            migrate: vec!["false".to_string()],
            ..silent_commands()
        };
        let host = CommandHost::new(&root, root.join(".env"), commands);

        let err = host.run_schema_migrations().expect_err("must fail");
        assert!(err.to_string().contains("schema migration failed"));
        let _ = fs::remove_dir_all(&root);
    }

    #[cfg(unix)]
    #[test]
    fn tenant_ids_are_paged_from_command_output() {
        let root = test_root("host");
        let commands = HostCommands {
            tenant_list: vec![
                "sh".to_string(),
                "-c".to_string(),
                "printf 't1\\nt2\\n\\nt3\\n'".to_string(),
            ],
            ..silent_commands()
        };
        let host = CommandHost::new(&root, root.join(".env"), commands);

        assert_eq!(host.tenant_ids(0, 2).expect("must list"), vec!["t1", "t2"]);
        assert_eq!(host.tenant_ids(2, 2).expect("must list"), vec!["t3"]);
        assert!(host.tenant_ids(4, 2).expect("must list").is_empty());
        let _ = fs::remove_dir_all(&root);
    }
}
