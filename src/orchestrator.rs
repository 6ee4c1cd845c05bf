//! Deployment orchestration
//!
//! Runs the pipeline node check → seed build → base volume → seed volume →
//! VM definition → disk attachment → configuration → start, and undoes what
//! it created when any step fails or the run is cancelled.
//!
//! Every creating remote command is recorded in a ledger *before* it is
//! issued. An outright rejection removes the entry again, since nothing was
//! committed; an interrupted command keeps it, and cleanup inspects the
//! remote side before deleting anything. Staged upload files stay in the
//! ledger until they have been removed.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::deployment::{ByteSize, DeploymentSpec};
use crate::provision::{DiskRole, ProvisionState, VmHandle, VmProvisioner};
use crate::remote::{DEFAULT_COMMAND_TIMEOUT, RemoteShell};
use crate::seed::SeedImageBuilder;
use crate::storage::{AllocationRequest, BackendKind, DiskFormat, StorageBackend, VolumeRef, open_backend};
use crate::upload::{ImageUploader, PreparedUpload};
use crate::{DeployError, ErrorKind};

/// Label of the volume holding the cloud image
pub const BASE_DISK_LABEL: &str = "base-disk";

/// Label of the volume holding the seed image
pub const SEED_DISK_LABEL: &str = "cloudinit-seed";

/// Smallest seed volume allocated
pub const MIN_SEED_VOLUME: ByteSize = ByteSize::mib(4);

/// A remote object created by a deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteResource {
    Volume(VolumeRef),
    Vm { handle: VmHandle, name: String },
    /// Upload staging files on the cluster host
    StagedFiles(Vec<String>),
}

impl fmt::Display for RemoteResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteResource::Volume(volume) => write!(f, "volume {}", volume.volid),
            RemoteResource::Vm { handle, name } => write!(f, "{} ('{}')", handle, name),
            RemoteResource::StagedFiles(paths) => write!(f, "staged files {}", paths.join(" ")),
        }
    }
}

/// Outcome of rolling back a failed deployment
#[derive(Debug)]
pub enum CleanupReport {
    /// The failure happened before anything was created
    NotNeeded,
    Succeeded {
        released: Vec<RemoteResource>,
    },
    Failed {
        released: Vec<RemoteResource>,
        remaining: Vec<RemoteResource>,
        errors: Vec<DeployError>,
    },
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        !matches!(self, CleanupReport::Failed { .. })
    }
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupReport::NotNeeded => write!(f, "no cleanup needed"),
            CleanupReport::Succeeded { .. } => write!(f, "cleanup succeeded"),
            CleanupReport::Failed { remaining, .. } => {
                let list = remaining.iter().map(ToString::to_string).collect::<Vec<_>>();
                write!(f, "cleanup failed, manual intervention required: {}", list.join(", "))
            }
        }
    }
}

/// A failed deployment: the error that stopped it plus the rollback outcome
#[derive(Debug)]
pub struct DeploymentFailure {
    pub error: DeployError,
    pub cleanup: CleanupReport,
}

impl DeploymentFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

impl fmt::Display for DeploymentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cleanup {
            CleanupReport::NotNeeded => write!(f, "{}", self.error),
            cleanup => write!(f, "{}; {}", self.error, cleanup),
        }
    }
}

impl std::error::Error for DeploymentFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// A successful deployment
#[derive(Debug)]
pub struct Deployment {
    pub handle: VmHandle,
    pub state: ProvisionState,
    /// Why the VM was left defined but stopped, when starting it failed
    pub start_error: Option<DeployError>,
    /// Boot volume then seed volume
    pub volumes: Vec<VolumeRef>,
}

#[derive(Default)]
struct Ledger {
    entries: Mutex<Vec<RemoteResource>>,
    backend: OnceLock<Arc<dyn StorageBackend>>,
}

impl Ledger {
    fn record(&self, resource: RemoteResource) {
        debug!("Recording {}", resource);
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(resource);
    }

    fn forget(&self, resource: &RemoteResource) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(index) = entries.iter().rposition(|r| r == resource) {
            entries.remove(index);
        }
    }

    fn take(&self) -> Vec<RemoteResource> {
        std::mem::take(&mut *self.entries.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Sequences a deployment against one cluster host
pub struct DeploymentOrchestrator {
    shell: Arc<dyn RemoteShell>,
    seed_builder: SeedImageBuilder,
    uploader: ImageUploader,
    provisioner: VmProvisioner,
    storage_timeout: Duration,
}

impl DeploymentOrchestrator {
    pub fn new(shell: Arc<dyn RemoteShell>) -> Self {
        Self {
            shell,
            seed_builder: SeedImageBuilder::new(),
            uploader: ImageUploader::new(),
            provisioner: VmProvisioner::new(),
            storage_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_seed_builder(mut self, builder: SeedImageBuilder) -> Self {
        self.seed_builder = builder;
        self
    }

    pub fn with_uploader(mut self, uploader: ImageUploader) -> Self {
        self.uploader = uploader;
        self
    }

    pub fn with_provisioner(mut self, provisioner: VmProvisioner) -> Self {
        self.provisioner = provisioner;
        self
    }

    /// Timeout for storage pool lookups, allocations and releases
    pub fn with_storage_timeout(mut self, timeout: Duration) -> Self {
        self.storage_timeout = timeout;
        self
    }

    /// Deploy `spec`, rolling back on failure
    pub async fn run(&self, spec: &DeploymentSpec) -> Result<Deployment, DeploymentFailure> {
        self.run_until(spec, std::future::pending()).await
    }

    /// Deploy `spec` unless `cancel` resolves first
    ///
    /// Cancellation drops the in-flight step and rolls back exactly like a
    /// failure, with [`DeployError::Cancelled`] as the error.
    pub async fn run_until<F>(&self, spec: &DeploymentSpec, cancel: F) -> Result<Deployment, DeploymentFailure>
    where
        F: Future<Output = ()>,
    {
        let ledger = Ledger::default();

        let outcome = tokio::select! {
            result = self.execute(spec, &ledger) => result,
            _ = cancel => {
                warn!("Deployment of '{}' cancelled", spec.name);
                Err(DeployError::Cancelled)
            }
        };

        match outcome {
            Ok(deployment) => Ok(deployment),
            Err(error) => {
                error!("Deployment of '{}' failed: {}", spec.name, error);
                let cleanup = self.cleanup(&ledger).await;
                Err(DeploymentFailure { error, cleanup })
            }
        }
    }

    async fn execute(&self, spec: &DeploymentSpec, ledger: &Ledger) -> Result<Deployment, DeployError> {
        spec.validate()?;
        let shell = self.shell.as_ref();
        info!("Deploying '{}' to {} on storage {}", spec.name, spec.node, spec.storage);

        self.provisioner.check_node(shell, spec).await?;

        let backend: Arc<dyn StorageBackend> =
            Arc::from(open_backend(shell, &spec.storage, self.storage_timeout).await?);
        let _ = ledger.backend.set(Arc::clone(&backend));

        let vmid = match spec.vmid {
            Some(vmid) => vmid,
            None => self.provisioner.next_vmid(shell).await?,
        };
        self.provisioner.check_name_available(shell, &spec.name).await?;

        let seed = self.seed_builder.build(spec).await?;

        let base_format = match backend.kind() {
            BackendKind::Directory | BackendKind::Nfs => DiskFormat::Qcow2,
            BackendKind::Lvm | BackendKind::LvmThin => DiskFormat::Raw,
        };
        let base_upload = self.uploader.prepare(&spec.base_image).await?;
        let base = self
            .allocate(
                backend.as_ref(),
                ledger,
                AllocationRequest {
                    vmid,
                    label: BASE_DISK_LABEL.to_string(),
                    size: boot_volume_size(spec.disk_size, base_upload.virtual_size()),
                    format: base_format,
                },
            )
            .await?;
        self.upload(ledger, &base_upload, &base).await?;

        let seed_upload = self.uploader.prepare(seed.path()).await?;
        let seed_size = seed_upload.local_size().round_up_mib().max(MIN_SEED_VOLUME);
        let seed_volume = self
            .allocate(
                backend.as_ref(),
                ledger,
                AllocationRequest {
                    vmid,
                    label: SEED_DISK_LABEL.to_string(),
                    size: seed_size,
                    format: DiskFormat::Raw,
                },
            )
            .await?;
        self.upload(ledger, &seed_upload, &seed_volume).await?;
        drop(seed);

        let vm_resource = RemoteResource::Vm {
            handle: VmHandle::new(&spec.node, vmid),
            name: spec.name.clone(),
        };
        ledger.record(vm_resource.clone());
        let mut vm = match self.provisioner.define(shell, spec, vmid).await {
            Ok(vm) => vm,
            Err(e) => {
                if !e.is_interruption() {
                    ledger.forget(&vm_resource);
                }
                return Err(e);
            }
        };

        self.provisioner
            .attach_disk(shell, &mut vm, &backend.path(&base), DiskRole::Boot)
            .await?;
        self.provisioner.resize_boot_disk(shell, &vm, base.size).await?;
        self.provisioner
            .attach_disk(shell, &mut vm, &backend.path(&seed_volume), DiskRole::Seed)
            .await?;
        self.provisioner.configure(shell, &mut vm, spec).await?;
        self.provisioner.confirm(shell, &vm, &spec.name).await?;

        let mut start_error = None;
        if spec.auto_start {
            if let Err(e) = self.provisioner.start(shell, &mut vm).await {
                warn!("{} is defined but did not start: {}", vm.handle(), e);
                start_error = Some(e);
            }
        }

        info!("Deployed '{}' as {} ({})", spec.name, vm.handle(), vm.state());
        Ok(Deployment {
            handle: vm.handle().clone(),
            state: vm.state(),
            start_error,
            volumes: vec![base, seed_volume],
        })
    }

    async fn allocate(
        &self,
        backend: &dyn StorageBackend,
        ledger: &Ledger,
        request: AllocationRequest,
    ) -> Result<VolumeRef, DeployError> {
        let planned = RemoteResource::Volume(backend.plan(&request));
        ledger.record(planned.clone());

        match backend.allocate(self.shell.as_ref(), &request).await {
            Ok(volume) => Ok(volume),
            Err(e) => {
                if !e.is_interruption() {
                    ledger.forget(&planned);
                }
                Err(e)
            }
        }
    }

    /// Transfer a prepared image, keeping its staged files in the ledger
    /// until they are removed
    async fn upload(&self, ledger: &Ledger, prepared: &PreparedUpload, volume: &VolumeRef) -> Result<(), DeployError> {
        let shell = self.shell.as_ref();
        let staged = RemoteResource::StagedFiles(prepared.staged_paths());
        ledger.record(staged.clone());

        let result = self.uploader.transfer(shell, prepared, volume).await;
        match self.uploader.remove_staged(shell, &prepared.staged_paths()).await {
            Ok(()) => ledger.forget(&staged),
            Err(e) => warn!("{}", e),
        }
        result
    }

    /// Release everything in the ledger, newest first
    async fn cleanup(&self, ledger: &Ledger) -> CleanupReport {
        let entries = ledger.take();
        if entries.is_empty() {
            debug!("Nothing was created, no cleanup needed");
            return CleanupReport::NotNeeded;
        }

        info!("Cleaning up {} remote resource(s)", entries.len());
        let shell = self.shell.as_ref();
        let mut released = Vec::new();
        let mut remaining = Vec::new();
        let mut errors = Vec::new();

        for resource in entries.into_iter().rev() {
            let result = match &resource {
                RemoteResource::Vm { handle, name } => {
                    self.provisioner.destroy(shell, handle, name).await.map(|_| ())
                }
                RemoteResource::StagedFiles(paths) => self.uploader.remove_staged(shell, paths).await,
                RemoteResource::Volume(volume) => match ledger.backend.get() {
                    Some(backend) => release_volume(shell, backend.as_ref(), volume).await,
                    None => Err(DeployError::Cleanup(format!(
                        "no storage backend to release {}",
                        volume.volid
                    ))),
                },
            };

            match result {
                Ok(()) => released.push(resource),
                Err(e) => {
                    error!("Failed to clean up {}: {}", resource, e);
                    remaining.push(resource);
                    errors.push(e);
                }
            }
        }

        if errors.is_empty() {
            info!("Cleanup succeeded");
            CleanupReport::Succeeded { released }
        } else {
            CleanupReport::Failed {
                released,
                remaining,
                errors,
            }
        }
    }
}

/// Boot volume size: the requested size, grown to fit the image
fn boot_volume_size(requested: ByteSize, image: Option<ByteSize>) -> ByteSize {
    match image {
        Some(image) if image > requested => {
            let grown = image.round_up_mib();
            warn!(
                "Image needs {} but disk_size is {}, allocating {}",
                image, requested, grown
            );
            grown
        }
        _ => requested,
    }
}

async fn release_volume(
    shell: &dyn RemoteShell,
    backend: &dyn StorageBackend,
    volume: &VolumeRef,
) -> Result<(), DeployError> {
    if !backend.exists(shell, volume).await? {
        debug!("{} is already gone", volume.volid);
        return Ok(());
    }
    backend.release(shell, volume).await
}
