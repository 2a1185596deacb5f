//! Guest command dispatch.
//!
//! Commands reach the guest over the sandbox's vsock endpoint in production.
//! The wire protocol is out of scope here; `GuestExecutor` is the RPC seam,
//! and `SimulatedExecutor` is a fixed-latency stand-in used by tests and
//! local development.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::SandboxError;
use crate::sandbox::acl::AclWrapped;

/// Resource consumption reported for one execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    /// CPU utilization over the execution, in percent.
    pub cpu_pct: f64,
    /// Peak guest memory in MiB.
    pub memory_mb: u32,
    /// Bytes moved over the guest network interface.
    pub network_bytes: u64,
}

/// Result of one command execution inside the guest.
///
/// Transient: nothing beyond the audit record summary is persisted.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Exit code reported by the wrapped command.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Wall-clock duration of the execution.
    pub duration: Duration,
    /// Guest resource usage.
    pub resource_usage: ResourceUsage,
}

impl ExecutionResult {
    /// Returns `true` if the command exited successfully (exit code 0).
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One dispatch to the guest agent.
#[derive(Debug, Clone)]
pub struct GuestRequest {
    /// ACL-wrapped command.
    pub wrapped: AclWrapped,
    /// Environment for the command.
    pub env: HashMap<String, String>,
    /// Working directory inside the guest.
    pub cwd: Option<PathBuf>,
}

/// Transport-agnostic guest dispatch seam.
///
/// The production implementation speaks to the in-guest agent over the
/// sandbox's vsock socket; alternative backends supply their own transport.
pub trait GuestExecutor: Send + Sync {
    /// Runs the wrapped command in the guest and returns its result.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::ExecutionFailed` if the dispatch itself fails;
    /// a non-zero exit code from the command is a successful dispatch.
    fn execute(&self, request: &GuestRequest) -> Result<ExecutionResult, SandboxError>;
}

/// Fixed-latency simulated guest.
///
/// Runs nothing: it sleeps for the configured latency, reports exit code 0,
/// and emits one "permission denied" stderr line per ACL-denied sub-call, so
/// the denial is observable while the command as a whole still completes.
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    latency: Duration,
}

impl SimulatedExecutor {
    /// Creates a simulator with the given dispatch latency.
    #[must_use]
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self::new(Duration::from_millis(10))
    }
}

impl GuestExecutor for SimulatedExecutor {
    fn execute(&self, request: &GuestRequest) -> Result<ExecutionResult, SandboxError> {
        let start = Instant::now();
        std::thread::sleep(self.latency);

        let command = request.wrapped.command.join(" ");
        trace!(%command, "Simulated guest execution");

        let stderr = request
            .wrapped
            .denied_paths
            .iter()
            .map(|p| format!("{}: permission denied\n", p.display()))
            .collect::<String>();

        Ok(ExecutionResult {
            exit_code: 0,
            stdout: format!("simulated: {command}\n"),
            stderr,
            duration: start.elapsed(),
            resource_usage: ResourceUsage {
                cpu_pct: 1.0,
                memory_mb: 16,
                network_bytes: 0,
            },
        })
    }
}
