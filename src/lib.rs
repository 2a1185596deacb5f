//! MicroVM Sandbox - hardware-isolated tool execution with a tamper-evident
//! audit trail.
//!
//! This crate runs untrusted tool invocations inside per-invocation microVMs
//! driven by a Firecracker-style hypervisor, gated by a command allowlist and
//! per-tool cost caps, with filesystem writes confined by an overlay plan.
//! Every privileged decision is appended to a hash-chained, HMAC-signed audit
//! log that detects tampering, truncation, and record deletion.
//!
//! # Example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use microvm_sandbox::config::DriverConfig;
//! use microvm_sandbox::sandbox::{MicrovmDriver, SandboxBackend, SandboxConfig, SimulatedExecutor};
//!
//! fn main() -> miette::Result<()> {
//!     let config = DriverConfig::new(b"audit-secret".to_vec());
//!     let driver = MicrovmDriver::new(config, Arc::new(SimulatedExecutor::default()))?;
//!
//!     let id = driver.create_sandbox(SandboxConfig::new(2, 256))?;
//!     driver.start_sandbox(id)?;
//!     let result =
//!         driver.execute_in_sandbox(id, &["ls".into(), "/".into()], HashMap::new(), None)?;
//!     println!("{}", result.stdout);
//!     driver.destroy_sandbox(id)?;
//!
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod config;
pub mod cost;
pub mod error;
pub mod sandbox;

// Re-export commonly used types
pub use audit::{AuditLog, AuditRecord, InvocationEvent};
pub use config::DriverConfig;
pub use cost::{CostCapRegistry, MemoryCostCaps, RemainingBudget};
pub use error::{Error, Result};
pub use sandbox::{
    ExecutionResult, MicrovmDriver, SandboxBackend, SandboxConfig, SandboxId, SandboxState,
};
