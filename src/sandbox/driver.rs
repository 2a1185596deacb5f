//! Sandbox driver: lifecycle, execution pipeline, and scoped teardown.
//!
//! The driver owns the registry of sandboxes. Operations on different
//! sandboxes run concurrently; operations on the same sandbox serialize on a
//! per-entry lock, while the registry lock guards only structural mutation
//! (insert/remove). The audit chain orders all appends globally through the
//! log's own head lock.
//!
//! Dropping the driver destroys every still-tracked sandbox and removes its
//! working directory. Drop runs on all exit paths, including unwinding, so a
//! panicking caller cannot leak hypervisor processes or working trees.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::audit::{AuditLog, InvocationEvent};
use crate::config::DriverConfig;
use crate::cost::CostCapRegistry;
use crate::error::{BudgetError, Error, Result, SandboxError};
use crate::sandbox::confinement::ConfinementPlan;
use crate::sandbox::guest::{ExecutionResult, GuestExecutor, GuestRequest};
use crate::sandbox::vm::{BootDescriptor, HypervisorHandle};
use crate::sandbox::{Sandbox, SandboxConfig, SandboxId, SandboxState, acl, policy};

/// Per-execution cost estimate in USD-micros.
///
/// Fixed placeholder pending real metering.
pub const COST_ESTIMATE_USD_MICROS: u64 = 500;

/// Per-execution cost estimate in tokens.
///
/// Fixed placeholder pending real metering.
pub const COST_ESTIMATE_TOKENS: u64 = 250;

/// Capability set shared by all sandbox backends.
///
/// The microVM driver is one implementation; container- or process-based
/// backends can slot in behind the same interface without touching callers.
pub trait SandboxBackend: Send + Sync {
    /// Allocates a confined working area and registers a new sandbox.
    fn create_sandbox(&self, config: SandboxConfig) -> Result<SandboxId>;

    /// Boots the isolation environment for a `Created` sandbox.
    fn start_sandbox(&self, id: SandboxId) -> Result<()>;

    /// Runs a command in a `Running` sandbox.
    fn execute_in_sandbox(
        &self,
        id: SandboxId,
        command: &[String],
        env: HashMap<String, String>,
        cwd: Option<PathBuf>,
    ) -> Result<ExecutionResult>;

    /// Terminates a `Running` sandbox's isolation environment.
    fn stop_sandbox(&self, id: SandboxId) -> Result<()>;

    /// Stops (if needed), tears down, and unregisters a sandbox.
    fn destroy_sandbox(&self, id: SandboxId) -> Result<()>;

    /// Current lifecycle state. Pure read.
    fn get_sandbox_status(&self, id: SandboxId) -> Result<SandboxState>;
}

/// MicroVM-backed sandbox driver.
///
/// # Example
///
/// ```no_run
/// use std::collections::HashMap;
/// use std::sync::Arc;
/// use microvm_sandbox::config::DriverConfig;
/// use microvm_sandbox::sandbox::{MicrovmDriver, SandboxBackend, SandboxConfig, SimulatedExecutor};
///
/// let config = DriverConfig::new(b"secret".to_vec());
/// let driver = MicrovmDriver::new(config, Arc::new(SimulatedExecutor::default())).unwrap();
///
/// let id = driver.create_sandbox(SandboxConfig::new(2, 256)).unwrap();
/// driver.start_sandbox(id).unwrap();
/// let result = driver
///     .execute_in_sandbox(id, &["ls".into(), "/etc".into()], HashMap::new(), None)
///     .unwrap();
/// assert!(result.success());
/// driver.destroy_sandbox(id).unwrap();
/// ```
pub struct MicrovmDriver {
    config: DriverConfig,
    registry: Mutex<HashMap<SandboxId, Arc<Mutex<Sandbox>>>>,
    executor: Arc<dyn GuestExecutor>,
    cost_caps: Option<Arc<dyn CostCapRegistry>>,
    audit: AuditLog,
}

impl MicrovmDriver {
    /// Creates a driver, validating the configuration and opening the audit
    /// log.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if required artifacts are missing, or an
    /// `AuditError` if the audit log cannot be opened.
    #[instrument(skip_all)]
    pub fn new(config: DriverConfig, executor: Arc<dyn GuestExecutor>) -> Result<Self> {
        config.validate()?;

        fs::create_dir_all(&config.base_dir).map_err(|e| {
            crate::error::ConfigError::fs("base directory", &config.base_dir, e)
        })?;

        let audit = AuditLog::open(&config.audit_log_path, config.audit_secret.clone())?;

        debug!(base_dir = %config.base_dir.display(), "Driver initialized");
        Ok(Self {
            config,
            registry: Mutex::new(HashMap::new()),
            executor,
            cost_caps: None,
            audit,
        })
    }

    /// Attaches a cost cap registry. Without one, executions are not billed.
    #[must_use]
    pub fn with_cost_caps(mut self, caps: Arc<dyn CostCapRegistry>) -> Self {
        self.cost_caps = Some(caps);
        self
    }

    /// Returns the audit log.
    #[must_use]
    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Ids of all currently tracked sandboxes.
    #[must_use]
    pub fn list_sandboxes(&self) -> Vec<SandboxId> {
        self.lock_registry().keys().copied().collect()
    }

    /// Number of filesystem ACL violations recorded for a sandbox so far.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::NotFound` for an unknown id.
    pub fn fs_violations(&self, id: SandboxId) -> Result<u64> {
        let entry = self.entry(id)?;
        let count = Self::lock_sandbox(&entry).confinement.fs_violations;
        Ok(count)
    }

    /// Removes working directories left behind by previous driver processes.
    ///
    /// Scans the base directory for UUID-named directories not present in
    /// the registry and deletes them. Returns the number removed.
    #[instrument(skip(self))]
    pub fn cleanup_stale(&self) -> Result<usize> {
        let tracked: Vec<SandboxId> = self.list_sandboxes();
        let mut cleaned = 0;

        for entry in WalkDir::new(&self.config.base_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Ok(id) = Uuid::parse_str(name) else {
                continue;
            };
            if tracked.contains(&id) {
                continue;
            }

            debug!(%id, "Removing stale sandbox directory");
            match fs::remove_dir_all(path) {
                Ok(()) => cleaned += 1,
                Err(e) => warn!(%id, error = %e, "Failed to remove stale directory"),
            }
        }

        debug!(cleaned, "Stale sandbox cleanup complete");
        Ok(cleaned)
    }

    fn lock_registry(&self) -> MutexGuard<'_, HashMap<SandboxId, Arc<Mutex<Sandbox>>>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn entry(&self, id: SandboxId) -> Result<Arc<Mutex<Sandbox>>> {
        self.lock_registry()
            .get(&id)
            .cloned()
            .ok_or_else(|| SandboxError::NotFound { id: id.to_string() }.into())
    }

    fn lock_sandbox(entry: &Arc<Mutex<Sandbox>>) -> MutexGuard<'_, Sandbox> {
        entry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends an invocation record, fail-open.
    ///
    /// A failed audit write is logged for operators but deliberately does
    /// not abort the sandbox operation; availability wins over durability
    /// here and the trade-off must stay explicit.
    fn audit_invocation(
        &self,
        sandbox: &Sandbox,
        command: &[String],
        cost_usd_micros: u64,
        cost_tokens: u64,
        success: bool,
    ) {
        let remaining_budget = sandbox.config.tool_id.as_deref().and_then(|tool_id| {
            self.cost_caps
                .as_ref()
                .and_then(|caps| caps.get_remaining_budget(tool_id))
        });

        let event = InvocationEvent {
            timestamp: Utc::now(),
            tool_id: sandbox.config.tool_id.clone(),
            command: command.to_vec(),
            cost_usd_micros,
            cost_tokens,
            success,
            remaining_budget,
        };

        if let Err(e) = self.audit.append(&event) {
            warn!(sandbox_id = %sandbox.id, error = %e, "Audit append failed; continuing");
        }
    }

    /// Stops the hypervisor and deletes the working directory. Best-effort:
    /// cleanup failures are logged, never propagated.
    fn teardown(sandbox: &mut Sandbox) {
        if let Some(mut handle) = sandbox.process.take() {
            if let Err(e) = handle.stop() {
                warn!(sandbox_id = %sandbox.id, error = %e, "Hypervisor stop failed during teardown");
                sandbox.state = SandboxState::Failed;
            } else if sandbox.state == SandboxState::Running {
                sandbox.state = SandboxState::Stopped;
            }
        }

        if sandbox.working_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&sandbox.working_dir) {
                warn!(sandbox_id = %sandbox.id, error = %e, "Failed to remove working directory");
            }
        }
    }
}

impl SandboxBackend for MicrovmDriver {
    #[instrument(skip(self, config))]
    fn create_sandbox(&self, config: SandboxConfig) -> Result<SandboxId> {
        let id = Uuid::new_v4();
        let working_dir = self.config.base_dir.join(id.to_string());

        fs::create_dir_all(&working_dir)
            .map_err(|e| crate::error::ConfigError::fs("working directory", &working_dir, e))?;

        let confinement = ConfinementPlan::build(&config, &working_dir)?;
        let api_socket_path = working_dir.join("api.sock");

        let sandbox = Sandbox {
            id,
            state: SandboxState::Created,
            config,
            working_dir,
            api_socket_path,
            confinement,
            process: None,
            created_at: Utc::now(),
            started_at: None,
        };

        self.lock_registry()
            .insert(id, Arc::new(Mutex::new(sandbox)));

        debug!(%id, "Sandbox created");
        Ok(id)
    }

    #[instrument(skip(self), fields(%id))]
    fn start_sandbox(&self, id: SandboxId) -> Result<()> {
        let entry = self.entry(id)?;
        let mut sandbox = Self::lock_sandbox(&entry);

        if sandbox.state != SandboxState::Created {
            return Err(SandboxError::InvalidState {
                id: id.to_string(),
                actual: sandbox.state.as_str(),
                required: SandboxState::Created.as_str(),
            }
            .into());
        }

        let descriptor = BootDescriptor::build(&self.config, &sandbox.config, &sandbox.working_dir);
        let boot_config = descriptor.write_to(&sandbox.working_dir)?;

        match HypervisorHandle::spawn(&self.config, id, &sandbox.api_socket_path, &boot_config) {
            Ok(handle) => {
                sandbox.process = Some(handle);
                sandbox.state = SandboxState::Running;
                sandbox.started_at = Some(Utc::now());
                debug!(%id, "Sandbox running");
                Ok(())
            }
            Err(e) => {
                sandbox.state = SandboxState::Failed;
                warn!(%id, error = %e, "Hypervisor spawn failed");
                Err(e.into())
            }
        }
    }

    #[instrument(skip(self, command, env, cwd), fields(%id))]
    fn execute_in_sandbox(
        &self,
        id: SandboxId,
        command: &[String],
        env: HashMap<String, String>,
        cwd: Option<PathBuf>,
    ) -> Result<ExecutionResult> {
        let entry = self.entry(id)?;
        let mut sandbox = Self::lock_sandbox(&entry);

        if sandbox.state != SandboxState::Running {
            return Err(SandboxError::InvalidState {
                id: id.to_string(),
                actual: sandbox.state.as_str(),
                required: SandboxState::Running.as_str(),
            }
            .into());
        }

        // 1. Allowlist gate. Fails before any cost or VM interaction.
        if let Err(e) = policy::check_command(command) {
            self.audit_invocation(&sandbox, command, 0, 0, false);
            return Err(e.into());
        }

        // 2. Cost cap. A rejection is still a privileged decision: audit it.
        if let Some(tool_id) = sandbox.config.tool_id.clone() {
            if let Some(caps) = &self.cost_caps {
                if !caps.check_and_update_cost(
                    &tool_id,
                    COST_ESTIMATE_USD_MICROS,
                    COST_ESTIMATE_TOKENS,
                ) {
                    self.audit_invocation(
                        &sandbox,
                        command,
                        COST_ESTIMATE_USD_MICROS,
                        COST_ESTIMATE_TOKENS,
                        false,
                    );
                    return Err(BudgetError::Exceeded { tool_id }.into());
                }
            }
        }

        // 3. ACL wrap. Denials are counted here; the command still runs.
        let wrapped = acl::wrap_command(&sandbox.confinement, command);
        sandbox.confinement.fs_violations += wrapped.denied_paths.len() as u64;
        if !wrapped.denied_paths.is_empty() {
            trace!(
                denied = wrapped.denied_paths.len(),
                total = sandbox.confinement.fs_violations,
                "Filesystem ACL violations recorded"
            );
        }

        // 4. Guest dispatch.
        let mut merged_env = sandbox.config.env_vars.clone();
        merged_env.extend(env);
        let request = GuestRequest {
            wrapped,
            env: merged_env,
            cwd,
        };

        match self.executor.execute(&request) {
            Ok(result) => {
                // 5. Audit, regardless of the command's own exit code.
                self.audit_invocation(
                    &sandbox,
                    command,
                    COST_ESTIMATE_USD_MICROS,
                    COST_ESTIMATE_TOKENS,
                    result.success(),
                );
                Ok(result)
            }
            Err(e) => {
                self.audit_invocation(
                    &sandbox,
                    command,
                    COST_ESTIMATE_USD_MICROS,
                    COST_ESTIMATE_TOKENS,
                    false,
                );
                Err(e.into())
            }
        }
    }

    #[instrument(skip(self), fields(%id))]
    fn stop_sandbox(&self, id: SandboxId) -> Result<()> {
        let entry = self.entry(id)?;
        let mut sandbox = Self::lock_sandbox(&entry);

        if sandbox.state != SandboxState::Running {
            return Err(SandboxError::InvalidState {
                id: id.to_string(),
                actual: sandbox.state.as_str(),
                required: SandboxState::Running.as_str(),
            }
            .into());
        }

        let mut handle = sandbox.process.take().ok_or_else(|| {
            SandboxError::StopFailed("running sandbox has no process handle".to_string())
        })?;

        match handle.stop() {
            Ok(()) => {
                sandbox.state = SandboxState::Stopped;
                debug!(%id, "Sandbox stopped");
                Ok(())
            }
            Err(e) => {
                sandbox.state = SandboxState::Failed;
                warn!(%id, error = %e, "Sandbox stop failed");
                Err(e.into())
            }
        }
    }

    #[instrument(skip(self), fields(%id))]
    fn destroy_sandbox(&self, id: SandboxId) -> Result<()> {
        let entry = self
            .lock_registry()
            .remove(&id)
            .ok_or_else(|| Error::from(SandboxError::NotFound { id: id.to_string() }))?;

        let mut sandbox = Self::lock_sandbox(&entry);
        Self::teardown(&mut sandbox);

        debug!(%id, "Sandbox destroyed");
        Ok(())
    }

    fn get_sandbox_status(&self, id: SandboxId) -> Result<SandboxState> {
        let entry = self.entry(id)?;
        let state = Self::lock_sandbox(&entry).state;
        Ok(state)
    }
}

impl Drop for MicrovmDriver {
    fn drop(&mut self) {
        let entries: Vec<(SandboxId, Arc<Mutex<Sandbox>>)> =
            self.lock_registry().drain().collect();

        for (id, entry) in entries {
            trace!(%id, "Destroying sandbox on driver teardown");
            let mut sandbox = Self::lock_sandbox(&entry);
            Self::teardown(&mut sandbox);
        }
    }
}

impl std::fmt::Debug for MicrovmDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicrovmDriver")
            .field("base_dir", &self.config.base_dir)
            .field("sandboxes", &self.lock_registry().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::guest::SimulatedExecutor;
    use std::time::Duration;

    fn test_driver(dir: &tempfile::TempDir) -> MicrovmDriver {
        let config = DriverConfig::new(b"test-secret".to_vec())
            .with_hypervisor("/bin/sleep")
            .with_kernel_image("/bin/sh")
            .with_rootfs_image("/bin/sh")
            .with_base_dir(dir.path().join("sandboxes"))
            .with_audit_log(dir.path().join("audit.jsonl"));

        MicrovmDriver::new(
            config,
            Arc::new(SimulatedExecutor::new(Duration::from_millis(1))),
        )
        .expect("driver init")
    }

    #[test]
    fn test_create_registers_created_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(&dir);

        let id = driver.create_sandbox(SandboxConfig::default()).unwrap();
        assert_eq!(
            driver.get_sandbox_status(id).unwrap(),
            SandboxState::Created
        );
        assert!(driver.list_sandboxes().contains(&id));
    }

    #[test]
    fn test_execute_requires_running() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(&dir);
        let id = driver.create_sandbox(SandboxConfig::default()).unwrap();

        let result =
            driver.execute_in_sandbox(id, &["ls".to_string()], HashMap::new(), None);
        assert!(matches!(
            result,
            Err(Error::Sandbox(SandboxError::InvalidState { .. }))
        ));
    }

    #[test]
    fn test_unknown_id_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(&dir);

        let result = driver.get_sandbox_status(Uuid::new_v4());
        assert!(matches!(
            result,
            Err(Error::Sandbox(SandboxError::NotFound { .. }))
        ));
    }

    #[test]
    fn test_drop_removes_working_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let working_dir;
        {
            let driver = test_driver(&dir);
            let id = driver.create_sandbox(SandboxConfig::default()).unwrap();
            working_dir = dir.path().join("sandboxes").join(id.to_string());
            assert!(working_dir.exists());
        }
        assert!(!working_dir.exists());
    }

    #[test]
    fn test_cleanup_stale_skips_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let driver = test_driver(&dir);
        let id = driver.create_sandbox(SandboxConfig::default()).unwrap();

        // A stale directory from a dead process, plus one unrelated entry.
        let stale = dir
            .path()
            .join("sandboxes")
            .join(Uuid::new_v4().to_string());
        fs::create_dir_all(&stale).unwrap();
        fs::create_dir_all(dir.path().join("sandboxes").join("not-a-uuid")).unwrap();

        let cleaned = driver.cleanup_stale().unwrap();
        assert_eq!(cleaned, 1);
        assert!(!stale.exists());
        assert!(driver.get_sandbox_status(id).is_ok());
    }
}
