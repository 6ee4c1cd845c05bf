//! Storage backends
//!
//! Every pool kind allocates volumes with its own remote command but
//! exposes the same operations, so the orchestrator never branches on the
//! kind. Backends are built from the pool's configuration, which is looked
//! up once with a side-effect free query.

pub mod directory;
pub mod lvm;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

pub use directory::DirectoryBackend;
pub use lvm::LvmBackend;

use crate::DeployError;
use crate::deployment::ByteSize;
use crate::remote::{RemoteCommand, RemoteShell};

/// Kind of storage pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    Directory,
    Nfs,
    Lvm,
    LvmThin,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Directory => write!(f, "dir"),
            BackendKind::Nfs => write!(f, "nfs"),
            BackendKind::Lvm => write!(f, "lvm"),
            BackendKind::LvmThin => write!(f, "lvmthin"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dir" => Ok(BackendKind::Directory),
            "nfs" => Ok(BackendKind::Nfs),
            "lvm" => Ok(BackendKind::Lvm),
            "lvmthin" => Ok(BackendKind::LvmThin),
            other => Err(DeployError::StorageAllocation {
                kind: other.to_string(),
                pool: String::new(),
                message: "only dir, nfs, lvm and lvmthin storage are supported".into(),
            }),
        }
    }
}

/// On-disk format of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Raw,
    Qcow2,
}

impl DiskFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Qcow2 => "qcow2",
        }
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to allocate
#[derive(Debug, Clone)]
pub struct AllocationRequest {
    pub vmid: u32,
    /// Label embedded in the volume name, e.g. `base-disk`
    pub label: String,
    pub size: ByteSize,
    /// Preferred format; backends may override it
    pub format: DiskFormat,
}

/// An allocated volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRef {
    pub kind: BackendKind,
    pub pool: String,
    pub vmid: u32,
    /// Identifier used in the VM definition, e.g. `local-lvm:vm-100-base-disk`
    pub volid: String,
    /// File or block device the image is written to
    pub device_path: String,
    pub size: ByteSize,
    pub format: DiskFormat,
}

impl fmt::Display for VolumeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "volume {} ({})", self.volid, self.device_path)
    }
}

/// Capability shared by all storage pool kinds
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn pool(&self) -> &str;

    /// Describe the volume `request` would create, without creating it
    fn plan(&self, request: &AllocationRequest) -> VolumeRef;

    /// Create the volume; a rejection means nothing was created
    async fn allocate(
        &self,
        shell: &dyn RemoteShell,
        request: &AllocationRequest,
    ) -> Result<VolumeRef, DeployError>;

    /// Disk source string for the VM definition
    fn path(&self, volume: &VolumeRef) -> String {
        volume.volid.clone()
    }

    /// Whether the volume currently exists; never changes remote state
    async fn exists(&self, shell: &dyn RemoteShell, volume: &VolumeRef) -> Result<bool, DeployError>;

    /// Delete the volume
    async fn release(&self, shell: &dyn RemoteShell, volume: &VolumeRef) -> Result<(), DeployError>;
}

/// Pool definition as reported by `pvesh get /storage/<pool>`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub storage_type: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub vgname: Option<String>,
    #[serde(default)]
    pub thinpool: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

/// Look up `pool` and build the matching backend
///
/// `timeout` applies to the lookup and to every command the backend runs.
pub async fn open_backend(
    shell: &dyn RemoteShell,
    pool: &str,
    timeout: Duration,
) -> Result<Box<dyn StorageBackend>, DeployError> {
    debug!("Looking up storage pool {}", pool);

    let result = shell
        .run(
            &RemoteCommand::new("pvesh")
                .args(["get", &format!("/storage/{}", pool), "--output-format", "json"])
                .timeout(timeout),
        )
        .await?;

    if !result.success() {
        return Err(DeployError::StorageAllocation {
            kind: "unknown".into(),
            pool: pool.to_string(),
            message: format!("storage pool not found: {}", result.reason()),
        });
    }

    let config: StorageConfig = serde_json::from_str(result.stdout.trim())?;
    backend_from_config(pool, &config, timeout)
}

/// Build a backend from an already retrieved pool definition
pub fn backend_from_config(
    pool: &str,
    config: &StorageConfig,
    timeout: Duration,
) -> Result<Box<dyn StorageBackend>, DeployError> {
    let kind: BackendKind = config.storage_type.parse().map_err(|e| match e {
        DeployError::StorageAllocation { kind, message, .. } => DeployError::StorageAllocation {
            kind,
            pool: pool.to_string(),
            message,
        },
        other => other,
    })?;

    if let Some(content) = &config.content {
        if !content.split(',').any(|c| c.trim() == "images") {
            return Err(DeployError::allocation(
                kind,
                pool,
                "pool does not allow disk images",
            ));
        }
    }

    let missing = |field: &str| DeployError::allocation(kind, pool, format!("pool config lacks '{}'", field));

    let backend: Box<dyn StorageBackend> = match kind {
        BackendKind::Directory | BackendKind::Nfs => {
            let path = config.path.clone().ok_or_else(|| missing("path"))?;
            Box::new(DirectoryBackend::new(pool, path, kind == BackendKind::Nfs).with_timeout(timeout))
        }
        BackendKind::Lvm => {
            let vg = config.vgname.clone().ok_or_else(|| missing("vgname"))?;
            Box::new(LvmBackend::thick(pool, vg).with_timeout(timeout))
        }
        BackendKind::LvmThin => {
            let vg = config.vgname.clone().ok_or_else(|| missing("vgname"))?;
            let thinpool = config.thinpool.clone().ok_or_else(|| missing("thinpool"))?;
            Box::new(LvmBackend::thin(pool, vg, thinpool).with_timeout(timeout))
        }
    };

    info!("Storage pool {} is {} storage", pool, kind);
    Ok(backend)
}
