//! Driver-level configuration: hypervisor artifacts, working area, audit sink.
//!
//! `DriverConfig` names everything the driver needs from the host before any
//! sandbox exists: the hypervisor binary (and optional privilege-separation
//! helper), the guest kernel and root filesystem images, the base directory
//! for per-sandbox working areas, and the audit log destination plus its
//! HMAC secret. The secret has no default; production deployments must
//! supply it externally.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Default kernel boot arguments for the guest.
pub const DEFAULT_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

/// Configuration for the microVM sandbox driver.
///
/// # Example
///
/// ```
/// use microvm_sandbox::config::DriverConfig;
///
/// let config = DriverConfig::new(b"shared-secret".to_vec())
///     .with_hypervisor("/usr/bin/firecracker")
///     .with_kernel_image("/var/lib/microvm/vmlinux")
///     .with_rootfs_image("/var/lib/microvm/rootfs.ext4")
///     .with_base_dir("/run/microvm-sandboxes")
///     .with_audit_log("/var/log/microvm-audit.jsonl");
/// ```
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Path to the hypervisor binary.
    pub hypervisor_path: PathBuf,

    /// Optional privilege-separation helper (jailer) binary.
    pub jailer_path: Option<PathBuf>,

    /// Guest kernel image.
    pub kernel_image: PathBuf,

    /// Guest root filesystem image.
    pub rootfs_image: PathBuf,

    /// Kernel boot arguments.
    pub boot_args: String,

    /// Base directory under which per-sandbox working directories are created.
    pub base_dir: PathBuf,

    /// Destination file for the append-only audit log.
    pub audit_log_path: PathBuf,

    /// Shared secret for audit HMAC tags. Never defaulted.
    pub audit_secret: Vec<u8>,
}

impl DriverConfig {
    /// Creates a configuration with the given audit secret and default paths.
    #[must_use]
    pub fn new(audit_secret: Vec<u8>) -> Self {
        Self {
            hypervisor_path: PathBuf::from("/usr/bin/firecracker"),
            jailer_path: None,
            kernel_image: PathBuf::from("/var/lib/microvm/vmlinux"),
            rootfs_image: PathBuf::from("/var/lib/microvm/rootfs.ext4"),
            boot_args: DEFAULT_BOOT_ARGS.to_string(),
            base_dir: std::env::temp_dir().join("microvm-sandboxes"),
            audit_log_path: PathBuf::from("/var/log/microvm-audit.jsonl"),
            audit_secret,
        }
    }

    /// Sets the hypervisor binary path.
    #[must_use]
    pub fn with_hypervisor(mut self, path: impl Into<PathBuf>) -> Self {
        self.hypervisor_path = path.into();
        self
    }

    /// Sets the privilege-separation helper binary path.
    #[must_use]
    pub fn with_jailer(mut self, path: impl Into<PathBuf>) -> Self {
        self.jailer_path = Some(path.into());
        self
    }

    /// Sets the guest kernel image path.
    #[must_use]
    pub fn with_kernel_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.kernel_image = path.into();
        self
    }

    /// Sets the guest root filesystem image path.
    #[must_use]
    pub fn with_rootfs_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.rootfs_image = path.into();
        self
    }

    /// Sets the kernel boot arguments.
    #[must_use]
    pub fn with_boot_args(mut self, args: impl Into<String>) -> Self {
        self.boot_args = args.into();
        self
    }

    /// Sets the base directory for sandbox working areas.
    #[must_use]
    pub fn with_base_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_dir = path.into();
        self
    }

    /// Sets the audit log destination.
    #[must_use]
    pub fn with_audit_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.audit_log_path = path.into();
        self
    }

    /// Validates that all configured artifacts exist on disk.
    ///
    /// The base directory and audit log are not required to exist yet; they
    /// are created lazily. Binaries and images must be present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingArtifact` for the first missing path, or
    /// `ConfigError::EmptySecret` if no HMAC secret was supplied.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.audit_secret.is_empty() {
            return Err(ConfigError::EmptySecret);
        }

        require_exists("hypervisor binary", &self.hypervisor_path)?;
        if let Some(jailer) = &self.jailer_path {
            require_exists("jailer binary", jailer)?;
        }
        require_exists("kernel image", &self.kernel_image)?;
        require_exists("rootfs image", &self.rootfs_image)?;

        Ok(())
    }
}

fn require_exists(kind: &'static str, path: &Path) -> Result<(), ConfigError> {
    if path.exists() {
        Ok(())
    } else {
        Err(ConfigError::MissingArtifact {
            kind,
            path: path.to_path_buf(),
        })
    }
}
