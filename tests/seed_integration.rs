//! Seed image packaging with stand-in tools

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use proxmox_deploy_rs::deployment::DeploymentSpec;
use proxmox_deploy_rs::seed::{PackagingTool, SeedFormat, SeedImageBuilder};

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn spec(seed_format: &str) -> DeploymentSpec {
    serde_yaml::from_str(&format!(
        r#"
name: web01
node: pve1
storage: local-lvm
disk_size: 10G
base_image: /srv/images/ubuntu-16.04.img
seed_format: {}
cloud_init:
  fqdn: web01.example.com
"#,
        seed_format
    ))
    .unwrap()
}

#[tokio::test]
async fn test_iso_contains_both_files() {
    let tools = TempDir::new().unwrap();
    // lists the staging directory into the output image
    let genisoimage = script(tools.path(), "genisoimage", r#"ls "$7" > "$2""#);

    let builder = SeedImageBuilder::new().with_tool(PackagingTool::Genisoimage(genisoimage));
    let seed = builder.build(&spec("iso9660")).await.unwrap();

    assert_eq!(seed.format(), SeedFormat::Iso9660);
    assert_eq!(seed.path().extension().unwrap(), "iso");
    let listing = tokio::fs::read_to_string(seed.path()).await.unwrap();
    assert_eq!(listing, "meta-data\nuser-data\n");
    assert!(seed.files().user_data.starts_with("#cloud-config"));
}

#[tokio::test]
async fn test_vfat_copies_both_files() {
    let tools = TempDir::new().unwrap();
    let mkfs = script(tools.path(), "mkfs.vfat", r#": > "$4""#);
    let mcopy = script(tools.path(), "mcopy", r#"basename "$4" >> "$3"; basename "$5" >> "$3""#);

    let builder = SeedImageBuilder::new().with_tool(PackagingTool::Vfat { mkfs, mcopy });
    let seed = builder.build(&spec("vfat")).await.unwrap();

    assert_eq!(seed.format(), SeedFormat::Vfat);
    let listing = tokio::fs::read_to_string(seed.path()).await.unwrap();
    assert_eq!(listing, "meta-data\nuser-data\n");
}

#[tokio::test]
async fn test_persist_outlives_seed() {
    let tools = TempDir::new().unwrap();
    let genisoimage = script(tools.path(), "genisoimage", r#"echo seed > "$2""#);
    let out = TempDir::new().unwrap();
    let dest = out.path().join("web01-seed.iso");

    let builder = SeedImageBuilder::new().with_tool(PackagingTool::Genisoimage(genisoimage));
    let seed = builder.build(&spec("iso9660")).await.unwrap();
    let staged = seed.path().to_path_buf();
    seed.persist(&dest).await.unwrap();
    drop(seed);

    assert!(!staged.exists());
    assert_eq!(std::fs::read_to_string(&dest).unwrap(), "seed\n");
}
