//! LVM volume groups, thick or thin provisioned
//!
//! Volumes are logical volumes named `vm-<vmid>-<label>` and are always raw
//! block devices.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

use super::{AllocationRequest, BackendKind, DiskFormat, StorageBackend, VolumeRef};
use crate::DeployError;
use crate::remote::{DEFAULT_COMMAND_TIMEOUT, RemoteCommand, RemoteShell};

/// LVM or LVM-thin storage pool
#[derive(Debug, Clone)]
pub struct LvmBackend {
    pool: String,
    vg: String,
    /// Thin pool inside `vg`; thick provisioning when absent
    thinpool: Option<String>,
    timeout: Duration,
}

impl LvmBackend {
    pub fn thick(pool: impl Into<String>, vg: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            vg: vg.into(),
            thinpool: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn thin(pool: impl Into<String>, vg: impl Into<String>, thinpool: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            vg: vg.into(),
            thinpool: Some(thinpool.into()),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn lv_name(request: &AllocationRequest) -> String {
        format!("vm-{}-{}", request.vmid, request.label)
    }

    fn lv_path(&self, volume: &VolumeRef) -> String {
        volume.device_path.trim_start_matches("/dev/").to_string()
    }

    fn create_command(&self, lv: &str, kib: u64) -> RemoteCommand {
        let size = format!("{}k", kib);
        let command = match &self.thinpool {
            Some(thinpool) => RemoteCommand::new("lvcreate").args([
                "-aly".to_string(),
                "-V".to_string(),
                size,
                "--name".to_string(),
                lv.to_string(),
                "--thinpool".to_string(),
                format!("{}/{}", self.vg, thinpool),
            ]),
            None => RemoteCommand::new("lvcreate").args([
                "-aly".to_string(),
                "-Wy".to_string(),
                "--yes".to_string(),
                "--size".to_string(),
                size,
                "--name".to_string(),
                lv.to_string(),
                self.vg.clone(),
            ]),
        };
        command.timeout(self.timeout)
    }
}

#[async_trait]
impl StorageBackend for LvmBackend {
    fn kind(&self) -> BackendKind {
        if self.thinpool.is_some() {
            BackendKind::LvmThin
        } else {
            BackendKind::Lvm
        }
    }

    fn pool(&self) -> &str {
        &self.pool
    }

    fn plan(&self, request: &AllocationRequest) -> VolumeRef {
        let lv = Self::lv_name(request);
        VolumeRef {
            kind: self.kind(),
            pool: self.pool.clone(),
            vmid: request.vmid,
            volid: format!("{}:{}", self.pool, lv),
            device_path: format!("/dev/{}/{}", self.vg, lv),
            size: request.size,
            format: DiskFormat::Raw,
        }
    }

    async fn allocate(
        &self,
        shell: &dyn RemoteShell,
        request: &AllocationRequest,
    ) -> Result<VolumeRef, DeployError> {
        if request.format != DiskFormat::Raw {
            debug!("{} storage only holds raw volumes, ignoring {}", self.kind(), request.format);
        }

        let volume = self.plan(request);
        let lv = Self::lv_name(request);
        debug!("Creating logical volume {} in {}", lv, self.vg);

        shell
            .run(&self.create_command(&lv, request.size.kib()))
            .await?
            .check(|r| DeployError::allocation(self.kind(), &self.pool, r.reason()))?;

        info!("Allocated {} at {} ({})", volume.volid, volume.device_path, volume.size);
        Ok(volume)
    }

    async fn exists(&self, shell: &dyn RemoteShell, volume: &VolumeRef) -> Result<bool, DeployError> {
        let result = shell
            .run(
                &RemoteCommand::new("lvs")
                    .args(["--noheadings", &self.lv_path(volume)])
                    .timeout(self.timeout),
            )
            .await?;
        Ok(result.success())
    }

    async fn release(&self, shell: &dyn RemoteShell, volume: &VolumeRef) -> Result<(), DeployError> {
        shell
            .run(
                &RemoteCommand::new("lvremove")
                    .args(["-f", &self.lv_path(volume)])
                    .timeout(self.timeout),
            )
            .await?
            .check(|r| DeployError::Cleanup(format!("failed to remove {}: {}", volume.volid, r.reason())))?;

        info!("Removed {}", volume.volid);
        Ok(())
    }
}
