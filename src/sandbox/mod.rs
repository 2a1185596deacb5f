//! Sandboxed tool execution in per-invocation microVMs.
//!
//! The driver owns a registry of sandboxes and walks each through a small
//! lifecycle state machine:
//!
//! ```text
//! CREATED --start success--> RUNNING --stop success--> STOPPED
//! CREATED --start failure--> FAILED
//! RUNNING --stop failure---> FAILED
//! (any)   --destroy--------> removed from registry
//! ```
//!
//! Between `start` and `stop`, commands are executed through a pipeline of
//! allowlist check, cost-cap check, ACL wrapping, and guest dispatch, with
//! every outcome appended to the audit chain.

pub mod acl;
pub mod confinement;
pub mod driver;
pub mod guest;
pub mod policy;
pub mod vm;

pub use confinement::{ConfinementPlan, OverlayMount, TempMapping};
pub use driver::{MicrovmDriver, SandboxBackend};
pub use guest::{ExecutionResult, GuestExecutor, GuestRequest, ResourceUsage, SimulatedExecutor};

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::sandbox::vm::HypervisorHandle;

/// Unique identifier for a sandbox.
pub type SandboxId = uuid::Uuid;

/// Lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    /// Working area allocated, hypervisor not yet started.
    Created,
    /// Hypervisor process is running.
    Running,
    /// Hypervisor stopped cleanly. Terminal.
    Stopped,
    /// Start or stop failed. Terminal.
    Failed,
}

impl SandboxState {
    /// Short lowercase name, used in errors and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied sandbox configuration, immutable once the sandbox exists.
///
/// # Example
///
/// ```
/// use microvm_sandbox::sandbox::SandboxConfig;
///
/// let config = SandboxConfig::new(2, 256)
///     .with_read_only_path("/etc")
///     .with_temp_path("/tmp/work")
///     .with_tool_id("search");
/// ```
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Number of guest vCPUs.
    pub cpu_count: u32,
    /// Guest memory in MiB.
    pub memory_mb: u32,
    /// Whether the guest gets a network interface.
    pub network_enabled: bool,
    /// Host paths exposed read-only (guest writes captured in an overlay).
    pub read_only_paths: Vec<PathBuf>,
    /// Guest paths backed by private writable host directories.
    pub temp_paths: Vec<PathBuf>,
    /// Environment variables for executed commands.
    pub env_vars: HashMap<String, String>,
    /// Tool the sandbox's executions are billed to, if any.
    pub tool_id: Option<String>,
}

impl SandboxConfig {
    /// Creates a configuration with the given CPU and memory sizing.
    #[must_use]
    pub fn new(cpu_count: u32, memory_mb: u32) -> Self {
        Self {
            cpu_count,
            memory_mb,
            network_enabled: false,
            read_only_paths: Vec::new(),
            temp_paths: Vec::new(),
            env_vars: HashMap::new(),
            tool_id: None,
        }
    }

    /// Enables the guest network interface.
    #[must_use]
    pub fn with_network(mut self) -> Self {
        self.network_enabled = true;
        self
    }

    /// Adds a host path to expose read-only.
    #[must_use]
    pub fn with_read_only_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.read_only_paths.push(path.into());
        self
    }

    /// Adds a guest path backed by a private writable directory.
    #[must_use]
    pub fn with_temp_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.temp_paths.push(path.into());
        self
    }

    /// Adds an environment variable for executed commands.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    /// Sets the tool id for cost accounting.
    #[must_use]
    pub fn with_tool_id(mut self, tool_id: impl Into<String>) -> Self {
        self.tool_id = Some(tool_id.into());
        self
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::new(1, 128)
    }
}

/// One sandbox tracked by the driver.
///
/// Exclusively owned by the driver's registry; callers refer to it by id.
#[derive(Debug)]
pub struct Sandbox {
    /// Unique identifier, generated at creation.
    pub id: SandboxId,
    /// Current lifecycle state.
    pub state: SandboxState,
    /// Caller-supplied configuration.
    pub config: SandboxConfig,
    /// Per-sandbox working directory on the host.
    pub working_dir: PathBuf,
    /// Hypervisor API socket path inside the working directory.
    pub api_socket_path: PathBuf,
    /// Derived filesystem confinement plan.
    pub confinement: ConfinementPlan,
    /// Handle to the hypervisor process while running.
    pub process: Option<HypervisorHandle>,
    /// When the sandbox was created.
    pub created_at: DateTime<Utc>,
    /// When the hypervisor was started, if it has been.
    pub started_at: Option<DateTime<Utc>>,
}
