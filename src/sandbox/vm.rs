//! Hypervisor boot configuration and process management.
//!
//! The boot descriptor is serialized as JSON into the sandbox working
//! directory and handed to the hypervisor binary together with the API
//! socket path. Stopping is graceful first (SIGTERM with a bounded wait),
//! then forced (SIGKILL).

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::Serialize;
use tracing::{debug, instrument, trace, warn};

use crate::config::DriverConfig;
use crate::error::SandboxError;
use crate::sandbox::{SandboxConfig, SandboxId};

/// Bounded wait for graceful hypervisor shutdown before SIGKILL.
pub const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for the hypervisor to exit.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Guest CID for the vsock device. CIDs 0-2 are reserved.
const GUEST_CID: u32 = 3;

/// File name of the boot descriptor inside the working directory.
pub const BOOT_CONFIG_FILE: &str = "vmconfig.json";

/// Hypervisor boot descriptor, serialized to the working directory.
#[derive(Debug, Clone, Serialize)]
pub struct BootDescriptor {
    #[serde(rename = "boot-source")]
    pub boot_source: BootSource,
    pub drives: Vec<Drive>,
    #[serde(rename = "machine-config")]
    pub machine_config: MachineConfig,
    #[serde(rename = "network-interfaces", skip_serializing_if = "Vec::is_empty")]
    pub network_interfaces: Vec<NetworkInterface>,
    pub vsock: VsockDevice,
}

#[derive(Debug, Clone, Serialize)]
pub struct BootSource {
    pub kernel_image_path: PathBuf,
    pub boot_args: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VsockDevice {
    pub guest_cid: u32,
    pub uds_path: PathBuf,
}

impl BootDescriptor {
    /// Builds the descriptor for one sandbox.
    #[must_use]
    pub fn build(
        driver: &DriverConfig,
        sandbox: &SandboxConfig,
        working_dir: &Path,
    ) -> Self {
        let network_interfaces = if sandbox.network_enabled {
            vec![NetworkInterface {
                iface_id: "eth0".to_string(),
                host_dev_name: "tap0".to_string(),
            }]
        } else {
            Vec::new()
        };

        Self {
            boot_source: BootSource {
                kernel_image_path: driver.kernel_image.clone(),
                boot_args: driver.boot_args.clone(),
            },
            drives: vec![Drive {
                drive_id: "rootfs".to_string(),
                path_on_host: driver.rootfs_image.clone(),
                is_root_device: true,
                is_read_only: true,
            }],
            machine_config: MachineConfig {
                vcpu_count: sandbox.cpu_count,
                mem_size_mib: sandbox.memory_mb,
            },
            network_interfaces,
            vsock: VsockDevice {
                guest_cid: GUEST_CID,
                uds_path: working_dir.join("vsock.sock"),
            },
        }
    }

    /// Serializes the descriptor into the working directory.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Filesystem` if the file cannot be written.
    pub fn write_to(&self, working_dir: &Path) -> Result<PathBuf, SandboxError> {
        let path = working_dir.join(BOOT_CONFIG_FILE);
        let json = serde_json::to_string_pretty(self).map_err(|e| SandboxError::Filesystem {
            context: "failed to serialize boot descriptor".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;

        fs::write(&path, json).map_err(|e| SandboxError::Filesystem {
            context: format!("failed to write boot descriptor: {}", path.display()),
            source: e,
        })?;

        trace!(path = %path.display(), "Boot descriptor written");
        Ok(path)
    }
}

/// A running hypervisor child process.
#[derive(Debug)]
pub struct HypervisorHandle {
    child: Child,
}

impl HypervisorHandle {
    /// Spawns the hypervisor for a sandbox.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::SpawnFailed` if the process cannot be started.
    #[instrument(skip(driver), fields(%id))]
    pub fn spawn(
        driver: &DriverConfig,
        id: SandboxId,
        api_socket: &Path,
        boot_config: &Path,
    ) -> Result<Self, SandboxError> {
        debug!(hypervisor = %driver.hypervisor_path.display(), "Spawning hypervisor");

        let child = Command::new(&driver.hypervisor_path)
            .arg("--api-sock")
            .arg(api_socket)
            .arg("--id")
            .arg(id.to_string())
            .arg("--config-file")
            .arg(boot_config)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SandboxError::SpawnFailed(e.to_string()))?;

        debug!(pid = child.id(), "Hypervisor spawned");
        Ok(Self { child })
    }

    /// Host PID of the hypervisor process.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Stops the hypervisor: SIGTERM, bounded wait, SIGKILL fallback.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::StopFailed` if the process cannot be reaped.
    #[instrument(skip(self), fields(pid = self.pid()))]
    pub fn stop(&mut self) -> Result<(), SandboxError> {
        // Already exited?
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(%status, "Hypervisor already exited");
                return Ok(());
            }
            Ok(None) => {}
            Err(e) => return Err(SandboxError::StopFailed(e.to_string())),
        }

        debug!("Requesting graceful shutdown");
        let pid = Pid::from_raw(self.child.id() as i32);
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            // ESRCH means the process raced us to exit; reap it below.
            trace!(error = %e, "SIGTERM delivery failed");
        }

        let start = Instant::now();
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(%status, elapsed_ms = %start.elapsed().as_millis(), "Hypervisor exited");
                    return Ok(());
                }
                Ok(None) => {
                    if start.elapsed() > GRACEFUL_STOP_TIMEOUT {
                        warn!("Graceful shutdown timed out, sending SIGKILL");
                        self.child
                            .kill()
                            .map_err(|e| SandboxError::StopFailed(e.to_string()))?;
                        self.child
                            .wait()
                            .map_err(|e| SandboxError::StopFailed(e.to_string()))?;
                        return Ok(());
                    }
                    std::thread::sleep(STOP_POLL_INTERVAL);
                }
                Err(e) => return Err(SandboxError::StopFailed(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver_config(base: &Path) -> DriverConfig {
        DriverConfig::new(b"secret".to_vec())
            .with_hypervisor("/bin/sleep")
            .with_kernel_image("/bin/sh")
            .with_rootfs_image("/bin/sh")
            .with_base_dir(base)
    }

    #[test]
    fn test_boot_descriptor_shape() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver_config(dir.path());
        let sandbox = SandboxConfig::new(2, 256).with_network();

        let descriptor = BootDescriptor::build(&driver, &sandbox, dir.path());
        let json = serde_json::to_value(&descriptor).unwrap();

        assert_eq!(json["machine-config"]["vcpu_count"], 2);
        assert_eq!(json["machine-config"]["mem_size_mib"], 256);
        assert_eq!(json["boot-source"]["boot_args"], driver.boot_args);
        assert_eq!(json["drives"][0]["is_root_device"], true);
        assert_eq!(json["drives"][0]["is_read_only"], true);
        assert_eq!(json["network-interfaces"][0]["iface_id"], "eth0");
        assert_eq!(json["vsock"]["guest_cid"], 3);
    }

    #[test]
    fn test_network_interface_omitted_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver_config(dir.path());
        let sandbox = SandboxConfig::new(1, 128);

        let descriptor = BootDescriptor::build(&driver, &sandbox, dir.path());
        let json = serde_json::to_value(&descriptor).unwrap();

        assert!(json.get("network-interfaces").is_none());
    }

    #[test]
    fn test_write_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver_config(dir.path());
        let sandbox = SandboxConfig::default();

        let descriptor = BootDescriptor::build(&driver, &sandbox, dir.path());
        let path = descriptor.write_to(dir.path()).unwrap();

        assert!(path.ends_with(BOOT_CONFIG_FILE));
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("boot-source"));
    }

    #[test]
    fn test_spawn_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        // /bin/sleep rejects the hypervisor flags and exits on its own;
        // stop() must reap it cleanly whether it is live or already gone.
        let driver = driver_config(dir.path()).with_hypervisor("/bin/sleep");
        let sandbox = SandboxConfig::default();
        let descriptor = BootDescriptor::build(&driver, &sandbox, dir.path());
        let config_path = descriptor.write_to(dir.path()).unwrap();

        let mut handle = HypervisorHandle::spawn(
            &driver,
            uuid::Uuid::new_v4(),
            &dir.path().join("api.sock"),
            &config_path,
        )
        .unwrap();

        assert!(handle.pid() > 0);
        handle.stop().unwrap();
        // Stopping twice is harmless: the process has already been reaped.
        handle.stop().unwrap();
    }

    #[test]
    fn test_spawn_missing_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver_config(dir.path()).with_hypervisor("/does/not/exist");

        let result = HypervisorHandle::spawn(
            &driver,
            uuid::Uuid::new_v4(),
            &dir.path().join("api.sock"),
            &dir.path().join("vmconfig.json"),
        );
        assert!(matches!(result, Err(SandboxError::SpawnFailed(_))));
    }
}
