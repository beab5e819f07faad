use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{info, warn};
use updraft_core::{ErrorKind, Phase, StepStatus, UpdateError, UpdateResult};

use crate::host::{CacheKind, HostApplication, RuntimeMode, SharedHost};
use crate::store::StatusStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationOutcome {
    pub success: bool,
    pub message: String,
    pub migrations_run: bool,
    pub seeders_run: bool,
    pub tenants_total: u64,
    pub tenants_migrated: u64,
    pub failed_tenants: Vec<String>,
}

/// Switches the host back to production when dropped, however the run ended.
struct RuntimeModeGuard<'a> {
    host: &'a dyn HostApplication,
}

impl<'a> RuntimeModeGuard<'a> {
    fn new(host: &'a dyn HostApplication) -> Self {
        Self { host }
    }
}

impl Drop for RuntimeModeGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.host.set_runtime_mode(RuntimeMode::Production) {
            warn!(error = %err, "failed to restore production runtime mode");
        }
    }
}

pub struct MigrationRunner {
    store: StatusStore,
    host: SharedHost,
    tenant_chunk_size: usize,
}

impl MigrationRunner {
    pub fn new(store: StatusStore, host: SharedHost, tenant_chunk_size: usize) -> Self {
        Self {
            store,
            host,
            tenant_chunk_size: tenant_chunk_size.max(1),
        }
    }

    /// Runs migrations, seeders and, for multi-tenant hosts, every tenant migration.
    ///
    /// Failures are recorded and returned; nothing is retried.
    pub fn migrate(&self, is_tenant: bool) -> UpdateResult<MigrationOutcome> {
        let session = self.store.require()?;
        if session.replacement.status != StepStatus::Completed {
            return Err(UpdateError::session_state(
                "migrations require file replacement to be completed",
            ));
        }
        self.store.set_phase(Phase::Migration)?;
        self.store.update_migration(|migration| {
            migration.status = StepStatus::InProgress;
        })?;
        self.store.append_log("Running database migrations...")?;

        let mut outcome = MigrationOutcome::default();
        match self.run_steps(is_tenant, &mut outcome) {
            Ok(()) => {
                self.store.update_migration(|migration| {
                    migration.status = StepStatus::Completed;
                })?;
                outcome.success = true;
                outcome.message = if outcome.failed_tenants.is_empty() {
                    "Migrations completed successfully".to_string()
                } else {
                    format!(
                        "Migrations completed; {} tenant(s) failed",
                        outcome.failed_tenants.len()
                    )
                };
                self.store.append_log(outcome.message.clone())?;
                info!(tenants = outcome.tenants_migrated, "migrations finished");
                Ok(outcome)
            }
            Err(err) => {
                let message = format!("{err:#}");
                let context =
                    BTreeMap::from([("is_tenant".to_string(), is_tenant.to_string())]);
                self.store
                    .record_error(ErrorKind::MigrationFailed, message.clone(), context)?;
                self.store.update_migration(|migration| {
                    migration.status = StepStatus::Failed;
                })?;
                Err(UpdateError::Migration(message))
            }
        }
    }

    fn run_steps(&self, is_tenant: bool, outcome: &mut MigrationOutcome) -> anyhow::Result<()> {
        let host = self.host.as_ref();
        let _guard = RuntimeModeGuard::new(host);
        host.set_runtime_mode(RuntimeMode::Local)?;

        host.run_schema_migrations()?;
        outcome.migrations_run = true;
        self.store.update_migration(|migration| migration.migrations_run = true)?;
        self.store.append_log("Schema migrations applied")?;

        host.run_seeders()?;
        outcome.seeders_run = true;
        self.store.update_migration(|migration| migration.seeders_run = true)?;
        self.store.append_log("Database seeders applied")?;

        if is_tenant {
            self.migrate_tenants(host, outcome)?;
        }

        for kind in CacheKind::ALL {
            if let Err(err) = host.clear_cache(kind) {
                warn!(cache = kind.as_str(), error = %err, "cache clear failed");
            }
        }
        self.store.append_log("Application caches cleared")?;
        Ok(())
    }

    fn migrate_tenants(
        &self,
        host: &dyn HostApplication,
        outcome: &mut MigrationOutcome,
    ) -> anyhow::Result<()> {
        let mut offset = 0;
        loop {
            let tenants = host.tenant_ids(offset, self.tenant_chunk_size)?;
            if tenants.is_empty() {
                break;
            }
            for tenant in &tenants {
                outcome.tenants_total += 1;
                match host.migrate_tenant(tenant) {
                    Ok(()) => outcome.tenants_migrated += 1,
                    Err(err) => {
                        warn!(tenant = %tenant, error = %err, "tenant migration failed");
                        outcome.failed_tenants.push(tenant.clone());
                    }
                }
            }

            let (total, migrated, failed) = (
                outcome.tenants_total,
                outcome.tenants_migrated,
                outcome.failed_tenants.len() as u64,
            );
            self.store.update_migration(|migration| {
                migration.tenants_total = total;
                migration.tenants_migrated = migrated;
                migration.tenants_failed = failed;
            })?;
            self.store.append_log(format!(
                "Tenant migrations: {migrated} of {total} succeeded"
            ))?;

            offset += tenants.len();
            if tenants.len() < self.tenant_chunk_size {
                break;
            }
        }
        Ok(())
    }
}
