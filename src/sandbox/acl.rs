//! Filesystem ACL enforcement for sandboxed commands.
//!
//! Before dispatch, a command is wrapped so that its filesystem-mutating
//! calls (`mkdir`, `touch`, and by extension any recognizable write target)
//! are checked against the sandbox's confinement plan:
//!
//! - targets under a temp mapping are allowed;
//! - targets under a read-only mount are denied;
//! - targets outside the confined sets pass through untouched.
//!
//! A denial applies to that sub-call only. The wrapped command as a whole
//! still runs and reports its own exit code; the denial is surfaced to the
//! guest agent (which fails the individual call) and counted in the
//! sandbox's `fs_violations`. Whether a violation should instead abort the
//! whole command is an open stakeholder question; do not change this
//! behavior silently.

use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::sandbox::confinement::ConfinementPlan;

/// A command with ACL decisions attached, ready for guest dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclWrapped {
    /// The command, unchanged.
    pub command: Vec<String>,
    /// Write targets denied by the plan, one entry per attempted call.
    pub denied_paths: Vec<PathBuf>,
    /// Write targets explicitly allowed by a temp mapping.
    pub allowed_paths: Vec<PathBuf>,
}

/// Wraps `command` against `plan`, classifying its write targets.
pub fn wrap_command(plan: &ConfinementPlan, command: &[String]) -> AclWrapped {
    let mut denied_paths = Vec::new();
    let mut allowed_paths = Vec::new();

    for target in classify_write_targets(command) {
        if plan.is_temp(&target) {
            trace!(path = %target.display(), "Write target allowed by temp mapping");
            allowed_paths.push(target);
        } else if plan.is_read_only(&target) {
            debug!(path = %target.display(), "Write target denied by read-only mount");
            denied_paths.push(target);
        }
        // Targets outside both sets are not confined.
    }

    AclWrapped {
        command: command.to_vec(),
        denied_paths,
        allowed_paths,
    }
}

/// Extracts the filesystem paths a command would mutate, if recognizable.
///
/// This models the guest agent's interception points: direct mutation
/// commands and the output-file options of the allowlisted fetchers.
fn classify_write_targets(command: &[String]) -> Vec<PathBuf> {
    let Some(program) = command.first() else {
        return Vec::new();
    };
    let basename = Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program);
    let args = &command[1..];

    match basename {
        "mkdir" | "touch" | "tee" => args
            .iter()
            .filter(|a| !a.starts_with('-'))
            .map(PathBuf::from)
            .collect(),
        "cp" | "mv" => {
            let operands: Vec<&String> = args.iter().filter(|a| !a.starts_with('-')).collect();
            if operands.len() >= 2 {
                vec![PathBuf::from(operands[operands.len() - 1])]
            } else {
                Vec::new()
            }
        }
        "curl" => option_values(args, &["-o", "--output"]),
        "wget" => option_values(args, &["-O", "--output-document"]),
        _ => Vec::new(),
    }
}

/// Collects the values following any of the given option flags.
fn option_values(args: &[String], flags: &[&str]) -> Vec<PathBuf> {
    let mut targets = Vec::new();
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        if flags.contains(&arg.as_str()) {
            if let Some(value) = iter.peek() {
                targets.push(PathBuf::from(value.as_str()));
                iter.next();
            }
        }
    }
    targets
}
