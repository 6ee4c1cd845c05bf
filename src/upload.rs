//! Image transfer into allocated volumes
//!
//! A local image is streamed into a staging file on the cluster host,
//! checked, decompressed if needed, and converted into the volume's device
//! path with `qemu-img`. Preparing an upload only touches the local file and
//! fixes the staging paths, so callers can size the volume and track the
//! staged files before anything is sent.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::DeployError;
use crate::deployment::ByteSize;
use crate::remote::{DEFAULT_COMMAND_TIMEOUT, RemoteCommand, RemoteShell};
use crate::storage::{BackendKind, VolumeRef};

/// Image extensions `qemu-img` is asked to convert
pub const IMAGE_EXTENSIONS: &[&str] = &["img", "qcow2", "raw", "iso"];

const QCOW2_MAGIC: &[u8] = b"QFI\xfb";

/// Compression formats unpacked on the cluster host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Xz,
    Bzip2,
}

impl Compression {
    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "gz" => Some(Compression::Gzip),
            "xz" => Some(Compression::Xz),
            "bz2" => Some(Compression::Bzip2),
            _ => None,
        }
    }

    fn program(self) -> &'static str {
        match self {
            Compression::Gzip => "gunzip",
            Compression::Xz => "unxz",
            Compression::Bzip2 => "bunzip2",
        }
    }
}

/// Subset of `qemu-img info --output=json`
#[derive(Debug, Deserialize)]
struct ImageInfo {
    format: String,
    #[serde(rename = "virtual-size")]
    virtual_size: u64,
}

/// A local image with its staging paths chosen, nothing sent yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedUpload {
    local: PathBuf,
    local_size: u64,
    compression: Option<Compression>,
    /// File `dd` writes, carrying the compression suffix if any
    transferred: String,
    /// File `qemu-img` reads
    staged: String,
    virtual_size: Option<ByteSize>,
}

impl PreparedUpload {
    pub fn local(&self) -> &Path {
        &self.local
    }

    pub fn local_size(&self) -> ByteSize {
        ByteSize::from_bytes(self.local_size)
    }

    /// Remote files the transfer may leave behind
    pub fn staged_paths(&self) -> Vec<String> {
        let mut paths = vec![self.transferred.clone()];
        if self.staged != self.transferred {
            paths.push(self.staged.clone());
        }
        paths
    }

    /// Disk size the image needs once written, unless it is compressed
    pub fn virtual_size(&self) -> Option<ByteSize> {
        self.virtual_size
    }
}

/// Uploads local images into allocated volumes
#[derive(Debug, Clone)]
pub struct ImageUploader {
    staging_dir: String,
    verify_checksum: bool,
    timeout: Duration,
}

impl Default for ImageUploader {
    fn default() -> Self {
        Self {
            staging_dir: "/tmp".to_string(),
            verify_checksum: true,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl ImageUploader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remote directory images are staged in before conversion
    pub fn with_staging_dir(mut self, dir: impl Into<String>) -> Self {
        self.staging_dir = dir.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_checksum(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    /// Timeout for each remote step
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, program: &str) -> RemoteCommand {
        RemoteCommand::new(program).timeout(self.timeout)
    }

    /// Upload `local` into `volume`, removing the staged files afterwards
    pub async fn upload(
        &self,
        shell: &dyn RemoteShell,
        local: &Path,
        volume: &VolumeRef,
    ) -> Result<(), DeployError> {
        let prepared = self.prepare(local).await?;
        let result = self.transfer(shell, &prepared, volume).await;

        if let Err(e) = self.remove_staged(shell, &prepared.staged_paths()).await {
            warn!("{}", e);
        }
        result
    }

    /// Read the local image and pick its staging paths
    pub async fn prepare(&self, local: &Path) -> Result<PreparedUpload, DeployError> {
        let unreadable = |e: std::io::Error| DeployError::Transfer(format!("cannot read {}: {}", local.display(), e));

        let file_name = local
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DeployError::Transfer(format!("invalid image path {}", local.display())))?;
        let (compression, image_ext) = split_extensions(file_name)?;

        let local_size = tokio::fs::metadata(local).await.map_err(unreadable)?.len();
        let virtual_size = match compression {
            Some(_) => None,
            None => Some(ByteSize::from_bytes(
                local_virtual_size(local, local_size).await.map_err(unreadable)?,
            )),
        };

        let staged = format!("{}/proxmox-deploy-{}.{}", self.staging_dir, Uuid::new_v4(), image_ext);
        let transferred = match compression {
            Some(c) => format!("{}.{}", staged, extension(c)),
            None => staged.clone(),
        };

        Ok(PreparedUpload {
            local: local.to_path_buf(),
            local_size,
            compression,
            transferred,
            staged,
            virtual_size,
        })
    }

    /// Stream, verify and convert a prepared image into `volume`
    ///
    /// The staged files are left in place; see [`ImageUploader::remove_staged`].
    pub async fn transfer(
        &self,
        shell: &dyn RemoteShell,
        prepared: &PreparedUpload,
        volume: &VolumeRef,
    ) -> Result<(), DeployError> {
        let PreparedUpload {
            local,
            local_size,
            compression,
            transferred,
            staged,
            ..
        } = prepared;

        info!(
            "Uploading {} ({}) to {}",
            local.display(),
            prepared.local_size(),
            volume.volid
        );

        shell
            .run(
                &self
                    .command("dd")
                    .args([format!("of={}", transferred), "bs=1M".to_string(), "status=none".to_string()])
                    .input_file(local),
            )
            .await?
            .check(|r| DeployError::Transfer(format!("writing {} failed: {}", transferred, r.reason())))?;

        self.verify_size(shell, transferred, *local_size).await?;
        if self.verify_checksum {
            self.verify_digest(shell, local, transferred).await?;
        }

        if let Some(compression) = compression {
            debug!("Decompressing {} with {}", transferred, compression.program());
            shell
                .run(&self.command(compression.program()).args(["-f", transferred.as_str()]))
                .await?
                .check(|r| DeployError::Transfer(format!("decompressing {} failed: {}", transferred, r.reason())))?;
        }

        let info = self.inspect(shell, staged).await?;
        if info.virtual_size > volume.size.bytes() {
            return Err(DeployError::Verification(format!(
                "image virtual size {} exceeds {} of {}",
                ByteSize::from_bytes(info.virtual_size),
                volume.size,
                volume.volid
            )));
        }

        let mut convert = self.command("qemu-img").arg("convert");
        if matches!(volume.kind, BackendKind::Lvm | BackendKind::LvmThin) {
            // block device already exists
            convert = convert.arg("-n");
        }
        let convert = convert.args([
            "-f",
            info.format.as_str(),
            "-O",
            volume.format.as_str(),
            staged.as_str(),
            volume.device_path.as_str(),
        ]);

        shell
            .run(&convert)
            .await?
            .check(|r| DeployError::Transfer(format!("writing {} failed: {}", volume.volid, r.reason())))?;

        info!("Uploaded {} into {}", local.display(), volume.volid);
        Ok(())
    }

    async fn verify_size(&self, shell: &dyn RemoteShell, remote: &str, expected: u64) -> Result<(), DeployError> {
        let result = shell
            .run(&self.command("stat").args(["-c", "%s", remote]))
            .await?
            .check(|r| DeployError::Verification(format!("cannot stat {}: {}", remote, r.reason())))?;

        let actual: u64 = result
            .stdout
            .trim()
            .parse()
            .map_err(|_| DeployError::Verification(format!("unexpected stat output '{}'", result.stdout.trim())))?;

        if actual != expected {
            return Err(DeployError::Verification(format!(
                "{} holds {} bytes, expected {}",
                remote, actual, expected
            )));
        }
        Ok(())
    }

    async fn verify_digest(&self, shell: &dyn RemoteShell, local: &Path, remote: &str) -> Result<(), DeployError> {
        let expected = sha256_file(local)
            .await
            .map_err(|e| DeployError::Transfer(format!("cannot read {}: {}", local.display(), e)))?;

        let result = shell
            .run(&self.command("sha256sum").arg(remote))
            .await?
            .check(|r| DeployError::Verification(format!("cannot checksum {}: {}", remote, r.reason())))?;

        let actual = result.stdout.split_whitespace().next().unwrap_or_default();
        if !actual.eq_ignore_ascii_case(&expected) {
            return Err(DeployError::Verification(format!(
                "checksum mismatch for {}: expected {}, got {}",
                remote, expected, actual
            )));
        }
        debug!("Checksum of {} verified", remote);
        Ok(())
    }

    async fn inspect(&self, shell: &dyn RemoteShell, remote: &str) -> Result<ImageInfo, DeployError> {
        let result = shell
            .run(&self.command("qemu-img").args(["info", "--output=json", remote]))
            .await?
            .check(|r| DeployError::Verification(format!("cannot inspect {}: {}", remote, r.reason())))?;

        serde_json::from_str(&result.stdout)
            .map_err(|e| DeployError::Verification(format!("unreadable image info for {}: {}", remote, e)))
    }

    /// Delete staged files; missing files are not an error
    pub async fn remove_staged(&self, shell: &dyn RemoteShell, paths: &[String]) -> Result<(), DeployError> {
        shell
            .run(&self.command("rm").arg("-f").args(paths))
            .await?
            .check(|r| {
                DeployError::Cleanup(format!(
                    "failed to remove staged {}: {}",
                    paths.join(" "),
                    r.reason()
                ))
            })?;
        debug!("Removed staged {}", paths.join(" "));
        Ok(())
    }
}

/// Virtual size of an uncompressed image: the qcow2 header field, or the
/// file length for raw images
async fn local_virtual_size(path: &Path, len: u64) -> std::io::Result<u64> {
    let mut header = Vec::with_capacity(32);
    File::open(path).await?.take(32).read_to_end(&mut header).await?;

    if header.len() == 32 && header.starts_with(QCOW2_MAGIC) {
        let mut size = [0u8; 8];
        size.copy_from_slice(&header[24..32]);
        return Ok(u64::from_be_bytes(size));
    }
    Ok(len)
}

fn extension(compression: Compression) -> &'static str {
    match compression {
        Compression::Gzip => "gz",
        Compression::Xz => "xz",
        Compression::Bzip2 => "bz2",
    }
}

/// Split `name` into an optional compression suffix and the image extension
pub fn split_extensions(name: &str) -> Result<(Option<Compression>, String), DeployError> {
    let path = Path::new(name);
    let ext = |p: &Path| {
        p.extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default()
    };

    let outer = ext(path);
    let (compression, inner) = match Compression::from_extension(&outer) {
        Some(c) => (Some(c), ext(Path::new(path.file_stem().unwrap_or_default()))),
        None => (None, outer),
    };

    if IMAGE_EXTENSIONS.contains(&inner.as_str()) {
        Ok((compression, inner))
    } else {
        Err(DeployError::Verification(format!(
            "unsupported image type '{}', expected one of {} (optionally .gz, .xz or .bz2)",
            name,
            IMAGE_EXTENSIONS.join(", ")
        )))
    }
}

/// SHA-256 of a local file, read in chunks
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}
