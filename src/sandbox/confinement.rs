//! Filesystem confinement planning.
//!
//! A `ConfinementPlan` is computed once per sandbox from its configuration:
//!
//! - each `read_only_paths` entry becomes an overlay mount with fresh
//!   `upper/` and `work/` subdirectories under the sandbox working area, so
//!   guest writes are captured without mutating the host source;
//! - each `temp_paths` entry becomes a private host directory mapped to the
//!   guest path.
//!
//! The plan also carries the sandbox's `fs_violations` counter, incremented
//! only by the ACL layer when a write under a read-only target is denied.

use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, instrument, trace};

use crate::error::ConfigError;
use crate::sandbox::SandboxConfig;

/// One overlay composition for a read-only host path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayMount {
    /// Read-only host source.
    pub lower: PathBuf,
    /// Writable upper layer capturing guest changes.
    pub upper: PathBuf,
    /// Overlay work directory (internal, must be empty before mount).
    pub work: PathBuf,
    /// Guest mount point (same as `lower`).
    pub target: PathBuf,
}

/// One private writable directory mapped into the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempMapping {
    /// Private host backing directory.
    pub host_path: PathBuf,
    /// Guest path the directory is mapped to.
    pub guest_path: PathBuf,
}

/// Filesystem confinement derived from a `SandboxConfig`.
#[derive(Debug, Clone, Default)]
pub struct ConfinementPlan {
    /// Overlay mounts, in configuration order.
    pub overlays: Vec<OverlayMount>,
    /// Temp mappings, in configuration order.
    pub temp_mappings: Vec<TempMapping>,
    /// Denied filesystem mutations observed during execution.
    pub fs_violations: u64,
}

impl ConfinementPlan {
    /// Computes the plan and allocates its backing directories under
    /// `working_dir`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::OverlappingPaths` if a path appears in both the
    /// read-only and temp sets, or `ConfigError::Filesystem` if directory
    /// allocation fails.
    #[instrument(skip_all, fields(working_dir = %working_dir.display()))]
    pub fn build(config: &SandboxConfig, working_dir: &Path) -> Result<Self, ConfigError> {
        validate_disjoint(config)?;

        let mut overlays = Vec::with_capacity(config.read_only_paths.len());
        for (index, lower) in config.read_only_paths.iter().enumerate() {
            let base = working_dir.join(format!("overlay-{index}"));
            let upper = base.join("upper");
            let work = base.join("work");

            create_dir(&upper, "overlay upper directory")?;
            create_dir(&work, "overlay work directory")?;
            trace!(lower = %lower.display(), "Overlay allocated");

            overlays.push(OverlayMount {
                lower: lower.clone(),
                upper,
                work,
                target: lower.clone(),
            });
        }

        let mut temp_mappings = Vec::with_capacity(config.temp_paths.len());
        for (index, guest_path) in config.temp_paths.iter().enumerate() {
            let host_path = working_dir.join(format!("temp-{index}"));
            create_dir(&host_path, "temp backing directory")?;
            trace!(guest = %guest_path.display(), "Temp mapping allocated");

            temp_mappings.push(TempMapping {
                host_path,
                guest_path: guest_path.clone(),
            });
        }

        debug!(
            overlays = overlays.len(),
            temp_mappings = temp_mappings.len(),
            "Confinement plan built"
        );
        Ok(Self {
            overlays,
            temp_mappings,
            fs_violations: 0,
        })
    }

    /// Returns true if `path` falls under any read-only mount target.
    #[must_use]
    pub fn is_read_only(&self, path: &Path) -> bool {
        self.overlays.iter().any(|m| path_is_under(path, &m.target))
    }

    /// Returns true if `path` falls under any temp mapping's guest path.
    #[must_use]
    pub fn is_temp(&self, path: &Path) -> bool {
        self.temp_mappings
            .iter()
            .any(|m| path_is_under(path, &m.guest_path))
    }
}

/// Component-wise prefix check; `/etcetera` is not under `/etc`.
fn path_is_under(path: &Path, base: &Path) -> bool {
    let mut path_parts = path.components();
    for base_part in base.components() {
        // Root and normal components must match one-for-one.
        if base_part == Component::CurDir {
            continue;
        }
        match path_parts.next() {
            Some(part) if part == base_part => {}
            _ => return false,
        }
    }
    true
}

fn validate_disjoint(config: &SandboxConfig) -> Result<(), ConfigError> {
    for temp in &config.temp_paths {
        for read_only in &config.read_only_paths {
            if path_is_under(temp, read_only) || path_is_under(read_only, temp) {
                return Err(ConfigError::OverlappingPaths { path: temp.clone() });
            }
        }
    }
    Ok(())
}

fn create_dir(path: &Path, context: &'static str) -> Result<(), ConfigError> {
    fs::create_dir_all(path).map_err(|e| ConfigError::fs(context, path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> tempfile::TempDir {
        tempfile::tempdir().expect("tempdir")
    }

    #[test]
    fn test_plan_allocates_overlay_and_temp_dirs() {
        let dir = scratch();
        let config = SandboxConfig::new(1, 128)
            .with_read_only_path("/etc")
            .with_read_only_path("/usr/share")
            .with_temp_path("/tmp/work");

        let plan = ConfinementPlan::build(&config, dir.path()).unwrap();

        assert_eq!(plan.overlays.len(), 2);
        assert_eq!(plan.temp_mappings.len(), 1);
        assert_eq!(plan.fs_violations, 0);

        for overlay in &plan.overlays {
            assert!(overlay.upper.exists());
            assert!(overlay.work.exists());
            assert_eq!(overlay.target, overlay.lower);
        }
        assert!(plan.temp_mappings[0].host_path.exists());
        assert_eq!(plan.temp_mappings[0].guest_path, PathBuf::from("/tmp/work"));
    }

    #[test]
    fn test_overlapping_paths_rejected() {
        let dir = scratch();
        let config = SandboxConfig::new(1, 128)
            .with_read_only_path("/data")
            .with_temp_path("/data/scratch");

        let result = ConfinementPlan::build(&config, dir.path());
        assert!(matches!(
            result,
            Err(ConfigError::OverlappingPaths { .. })
        ));
    }

    #[test]
    fn test_identical_path_in_both_sets_rejected() {
        let dir = scratch();
        let config = SandboxConfig::new(1, 128)
            .with_read_only_path("/data")
            .with_temp_path("/data");

        assert!(ConfinementPlan::build(&config, dir.path()).is_err());
    }

    #[test]
    fn test_path_classification() {
        let dir = scratch();
        let config = SandboxConfig::new(1, 128)
            .with_read_only_path("/etc")
            .with_temp_path("/tmp/work");
        let plan = ConfinementPlan::build(&config, dir.path()).unwrap();

        assert!(plan.is_read_only(Path::new("/etc/hosts")));
        assert!(plan.is_read_only(Path::new("/etc")));
        assert!(!plan.is_read_only(Path::new("/etcetera/hosts")));
        assert!(!plan.is_read_only(Path::new("/tmp/work/out")));

        assert!(plan.is_temp(Path::new("/tmp/work/out")));
        assert!(plan.is_temp(Path::new("/tmp/work")));
        assert!(!plan.is_temp(Path::new("/tmp/worker")));
        assert!(!plan.is_temp(Path::new("/etc/hosts")));
    }

    #[test]
    fn test_sibling_paths_are_disjoint() {
        let dir = scratch();
        let config = SandboxConfig::new(1, 128)
            .with_read_only_path("/data/ro")
            .with_temp_path("/data/rw");

        assert!(ConfinementPlan::build(&config, dir.path()).is_ok());
    }
}
