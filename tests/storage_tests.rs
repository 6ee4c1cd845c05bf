//! Storage backends against the provisioner

use proxmox_deploy_rs::deployment::DeploymentSpec;
use proxmox_deploy_rs::provision::{DiskRole, VmProvisioner};
use proxmox_deploy_rs::remote::{DEFAULT_COMMAND_TIMEOUT, RemoteCommandResult};
use proxmox_deploy_rs::remote::mock::MockShell;
use proxmox_deploy_rs::storage::{
    AllocationRequest, BackendKind, DiskFormat, StorageBackend, StorageConfig, backend_from_config,
    open_backend,
};
use proxmox_deploy_rs::{ByteSize, DeployError, ErrorKind, ProvisionState};
use tokio_test::{assert_err, assert_ok};

fn spec() -> DeploymentSpec {
    serde_yaml::from_str(
        r#"
name: web01
node: pve1
storage: local
disk_size: 10G
base_image: /srv/images/ubuntu-16.04.img
"#,
    )
    .unwrap()
}

fn config(storage_type: &str) -> StorageConfig {
    StorageConfig {
        storage_type: storage_type.to_string(),
        path: Some("/mnt/pve/images".to_string()),
        vgname: Some("pve".to_string()),
        thinpool: Some("data".to_string()),
        content: Some("images,iso".to_string()),
    }
}

fn request(format: DiskFormat) -> AllocationRequest {
    AllocationRequest {
        vmid: 100,
        label: "base-disk".to_string(),
        size: ByteSize::gib(10),
        format,
    }
}

#[tokio::test]
async fn test_every_backend_volume_attaches() {
    for (storage_type, kind, format) in [
        ("dir", BackendKind::Directory, DiskFormat::Qcow2),
        ("nfs", BackendKind::Nfs, DiskFormat::Qcow2),
        ("lvm", BackendKind::Lvm, DiskFormat::Raw),
        ("lvmthin", BackendKind::LvmThin, DiskFormat::Raw),
    ] {
        let shell = MockShell::new();
        let backend = backend_from_config("tank", &config(storage_type), DEFAULT_COMMAND_TIMEOUT).unwrap();
        assert_eq!(backend.kind(), kind);

        let request = request(format);
        let planned = backend.plan(&request);
        let volume = assert_ok!(backend.allocate(&shell, &request).await);
        assert_eq!(volume, planned);
        assert!(volume.volid.starts_with("tank:"), "{}", volume.volid);

        let provisioner = VmProvisioner::new();
        let mut vm = provisioner.define(&shell, &spec(), 100).await.unwrap();
        provisioner
            .attach_disk(&shell, &mut vm, &backend.path(&volume), DiskRole::Boot)
            .await
            .unwrap();
        assert_eq!(vm.state(), ProvisionState::BootDiskAttached);
        assert_eq!(shell.count(&format!("--virtio0 {}", volume.volid)), 1);
    }
}

#[tokio::test]
async fn test_seed_before_boot_is_rejected() {
    let shell = MockShell::new();
    let provisioner = VmProvisioner::new();
    let mut vm = provisioner.define(&shell, &spec(), 100).await.unwrap();

    let result = provisioner
        .attach_disk(&shell, &mut vm, "local:100/vm-100-cloudinit-seed.raw", DiskRole::Seed)
        .await;

    assert!(matches!(result, Err(DeployError::Ordering(_))));
    assert_eq!(vm.state(), ProvisionState::Defined);
    assert_eq!(shell.count("--virtio1"), 0);
}

#[tokio::test]
async fn test_open_backend_reads_pool_type() {
    let shell = MockShell::new().on(
        "pvesh get /storage/backup-nfs",
        RemoteCommandResult::ok(r#"{"type":"nfs","path":"/mnt/pve/backup-nfs","content":"images,backup"}"#),
    );

    let backend = open_backend(&shell, "backup-nfs", DEFAULT_COMMAND_TIMEOUT).await.unwrap();
    assert_eq!(backend.kind(), BackendKind::Nfs);
    assert_eq!(backend.pool(), "backup-nfs");
}

#[tokio::test]
async fn test_unknown_pool() {
    let shell = MockShell::new().on(
        "pvesh get /storage/",
        RemoteCommandResult::failed(2, "storage 'fast' does not exist"),
    );

    let err = assert_err!(open_backend(&shell, "fast", DEFAULT_COMMAND_TIMEOUT).await.map(|b| b.kind()));
    assert_eq!(err.kind(), ErrorKind::StorageAllocation);
    assert!(err.to_string().contains("fast"));
}

#[tokio::test]
async fn test_missing_lvm_volume_is_reported_absent() {
    let shell = MockShell::new().on("lvs", RemoteCommandResult::failed(5, "Failed to find logical volume"));
    let backend = backend_from_config("local-lvm", &config("lvmthin"), DEFAULT_COMMAND_TIMEOUT).unwrap();
    let volume = backend.plan(&request(DiskFormat::Raw));

    assert!(!backend.exists(&shell, &volume).await.unwrap());
}
