//! File-backed pools: local directories and NFS shares
//!
//! Volumes are image files under `<path>/images/<vmid>/`, allocated through
//! `pvesm alloc` so the storage layer creates the directory and file.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

use super::{AllocationRequest, BackendKind, StorageBackend, VolumeRef};
use crate::DeployError;
use crate::remote::{DEFAULT_COMMAND_TIMEOUT, RemoteCommand, RemoteShell};

/// Directory or NFS storage pool
#[derive(Debug, Clone)]
pub struct DirectoryBackend {
    pool: String,
    path: String,
    nfs: bool,
    timeout: Duration,
}

impl DirectoryBackend {
    pub fn new(pool: impl Into<String>, path: impl Into<String>, nfs: bool) -> Self {
        Self {
            pool: pool.into(),
            path: path.into().trim_end_matches('/').to_string(),
            nfs,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, program: &str) -> RemoteCommand {
        RemoteCommand::new(program).timeout(self.timeout)
    }

    fn disk_name(request: &AllocationRequest) -> String {
        format!(
            "vm-{}-{}.{}",
            request.vmid, request.label, request.format
        )
    }

    /// An NFS share must be mounted, otherwise the allocation would land
    /// on the host's root filesystem
    async fn ensure_mounted(&self, shell: &dyn RemoteShell) -> Result<(), DeployError> {
        let result = shell
            .run(&self.command("mountpoint").args(["-q", &self.path]))
            .await?;

        if result.success() {
            Ok(())
        } else {
            Err(DeployError::allocation(
                self.kind(),
                &self.pool,
                format!("share is not mounted at {}", self.path),
            ))
        }
    }
}

#[async_trait]
impl StorageBackend for DirectoryBackend {
    fn kind(&self) -> BackendKind {
        if self.nfs {
            BackendKind::Nfs
        } else {
            BackendKind::Directory
        }
    }

    fn pool(&self) -> &str {
        &self.pool
    }

    fn plan(&self, request: &AllocationRequest) -> VolumeRef {
        let disk = Self::disk_name(request);
        VolumeRef {
            kind: self.kind(),
            pool: self.pool.clone(),
            vmid: request.vmid,
            volid: format!("{}:{}/{}", self.pool, request.vmid, disk),
            device_path: format!("{}/images/{}/{}", self.path, request.vmid, disk),
            size: request.size,
            format: request.format,
        }
    }

    async fn allocate(
        &self,
        shell: &dyn RemoteShell,
        request: &AllocationRequest,
    ) -> Result<VolumeRef, DeployError> {
        if self.nfs {
            self.ensure_mounted(shell).await?;
        }

        let volume = self.plan(request);
        debug!("Allocating {} on {} pool {}", volume.volid, self.kind(), self.pool);

        shell
            .run(&self.command("pvesm").args([
                "alloc".to_string(),
                self.pool.clone(),
                request.vmid.to_string(),
                Self::disk_name(request),
                format!("{}K", request.size.kib()),
                "--format".to_string(),
                request.format.to_string(),
            ]))
            .await?
            .check(|r| DeployError::allocation(self.kind(), &self.pool, r.reason()))?;

        info!("Allocated {} ({})", volume.volid, volume.size);
        Ok(volume)
    }

    async fn exists(&self, shell: &dyn RemoteShell, volume: &VolumeRef) -> Result<bool, DeployError> {
        let result = shell
            .run(&self.command("test").args(["-e", &volume.device_path]))
            .await?;
        Ok(result.success())
    }

    async fn release(&self, shell: &dyn RemoteShell, volume: &VolumeRef) -> Result<(), DeployError> {
        shell
            .run(&self.command("pvesm").args(["free", &volume.volid]))
            .await?
            .check(|r| DeployError::Cleanup(format!("failed to free {}: {}", volume.volid, r.reason())))?;

        info!("Freed {}", volume.volid);
        Ok(())
    }
}
