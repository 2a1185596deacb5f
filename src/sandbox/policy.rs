//! Command allowlist policy.
//!
//! Only a fixed set of command basenames may run inside a sandbox. The check
//! is the first stage of the execution pipeline: it is cheap, consults no
//! budget, and never touches the VM. The list is intentionally a compile-time
//! constant rather than configuration.

use std::path::Path;

use crate::error::PolicyError;

/// Command basenames permitted to run inside a sandbox.
pub const ALLOWED_COMMANDS: &[&str] = &[
    "python", "python3", "node", "npm", "curl", "wget", "ls", "cat", "grep", "head", "tail", "wc",
];

/// Checks the first element of `command` against the allowlist.
///
/// The command may be given as a bare name or an absolute path; only the
/// basename is consulted.
///
/// # Errors
///
/// Returns `PolicyError::EmptyCommand` for an empty argv, or
/// `PolicyError::NotAllowed` if the basename is not on the allowlist.
pub fn check_command(command: &[String]) -> Result<(), PolicyError> {
    let program = command.first().ok_or(PolicyError::EmptyCommand)?;
    if program.is_empty() {
        return Err(PolicyError::EmptyCommand);
    }

    let basename = Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program);

    if ALLOWED_COMMANDS.contains(&basename) {
        Ok(())
    } else {
        Err(PolicyError::NotAllowed {
            command: program.clone(),
        })
    }
}
