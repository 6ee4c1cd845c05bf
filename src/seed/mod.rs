//! Cloud-init seed image construction
//!
//! Renders the NoCloud `meta-data` and `user-data` files for a deployment
//! and packages them into a small read-only filesystem image labelled
//! `cidata`, using whichever packaging tool exists on the local machine.

pub mod context;
pub mod network;
pub mod render;

pub use context::{build_context, instance_id, merge_context};
pub use render::{META_DATA_TEMPLATE, USER_DATA_TEMPLATE, render_seed_file};

use minijinja::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::fs;
use tracing::{debug, info};

use crate::DeployError;
use crate::deployment::DeploymentSpec;

/// Volume label the NoCloud datasource looks for
pub const VOLUME_LABEL: &str = "cidata";

/// File names the NoCloud datasource expects at the image root
pub const META_DATA_FILE: &str = "meta-data";
pub const USER_DATA_FILE: &str = "user-data";

/// Filesystem format of the seed image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedFormat {
    #[default]
    Iso9660,
    Vfat,
}

impl SeedFormat {
    fn file_name(self) -> &'static str {
        match self {
            SeedFormat::Iso9660 => "seed.iso",
            SeedFormat::Vfat => "seed.img",
        }
    }
}

impl fmt::Display for SeedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeedFormat::Iso9660 => write!(f, "iso9660"),
            SeedFormat::Vfat => write!(f, "vfat"),
        }
    }
}

/// The two rendered seed files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedFiles {
    pub meta_data: String,
    pub user_data: String,
}

/// A packaged seed image, deleted when dropped
#[derive(Debug)]
pub struct SeedImage {
    _dir: TempDir,
    path: PathBuf,
    format: SeedFormat,
    files: SeedFiles,
}

impl SeedImage {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> SeedFormat {
        self.format
    }

    pub fn files(&self) -> &SeedFiles {
        &self.files
    }

    /// Copy the image to `dest`, outliving this value
    pub async fn persist(&self, dest: impl AsRef<Path>) -> Result<(), DeployError> {
        fs::copy(&self.path, dest.as_ref()).await?;
        Ok(())
    }
}

/// External program used to package the seed files
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackagingTool {
    /// Linux `genisoimage`
    Genisoimage(PathBuf),
    /// BSD `mkisofs`
    Mkisofs(PathBuf),
    /// `mkfs.vfat` plus `mcopy` from mtools
    Vfat { mkfs: PathBuf, mcopy: PathBuf },
}

impl PackagingTool {
    /// Find a local tool producing `format`
    pub fn detect(format: SeedFormat) -> Result<Self, DeployError> {
        match format {
            SeedFormat::Iso9660 => find_executable("genisoimage")
                .map(Self::Genisoimage)
                .or_else(|| find_executable("mkisofs").map(Self::Mkisofs))
                .ok_or_else(|| {
                    DeployError::packaging(
                        "genisoimage",
                        "genisoimage (Linux) or mkisofs (BSD) is missing, make sure it is installed",
                    )
                }),
            SeedFormat::Vfat => {
                let mkfs = find_executable("mkfs.vfat")
                    .ok_or_else(|| DeployError::packaging("mkfs.vfat", "mkfs.vfat is missing"))?;
                let mcopy = find_executable("mcopy")
                    .ok_or_else(|| DeployError::packaging("mcopy", "mcopy (mtools) is missing"))?;
                Ok(Self::Vfat { mkfs, mcopy })
            }
        }
    }

    pub fn format(&self) -> SeedFormat {
        match self {
            Self::Genisoimage(_) | Self::Mkisofs(_) => SeedFormat::Iso9660,
            Self::Vfat { .. } => SeedFormat::Vfat,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Genisoimage(_) => "genisoimage",
            Self::Mkisofs(_) => "mkisofs",
            Self::Vfat { .. } => "mkfs.vfat",
        }
    }

    /// Package every file in `staging` into `output`
    pub async fn package(&self, staging: &Path, output: &Path) -> Result<(), DeployError> {
        info!("Packaging seed image with {}", self.name());

        match self {
            Self::Genisoimage(program) => {
                let args = [
                    OsStr::new("-output"),
                    output.as_os_str(),
                    OsStr::new("-volid"),
                    OsStr::new(VOLUME_LABEL),
                    OsStr::new("-joliet"),
                    OsStr::new("-rock"),
                    staging.as_os_str(),
                ];
                run_tool("genisoimage", program, &args).await
            }
            Self::Mkisofs(program) => {
                let args = [
                    OsStr::new("-o"),
                    output.as_os_str(),
                    OsStr::new("-V"),
                    OsStr::new(VOLUME_LABEL),
                    OsStr::new("-rock"),
                    staging.as_os_str(),
                ];
                run_tool("mkisofs", program, &args).await
            }
            Self::Vfat { mkfs, mcopy } => {
                // 1 MiB of 1 KiB blocks comfortably holds both text files
                let label = VOLUME_LABEL.to_uppercase();
                let args = [
                    OsStr::new("-n"),
                    OsStr::new(&label),
                    OsStr::new("-C"),
                    output.as_os_str(),
                    OsStr::new("1024"),
                ];
                run_tool("mkfs.vfat", mkfs, &args).await?;

                let meta = staging.join(META_DATA_FILE);
                let user = staging.join(USER_DATA_FILE);
                let args = [
                    OsStr::new("-o"),
                    OsStr::new("-i"),
                    output.as_os_str(),
                    meta.as_os_str(),
                    user.as_os_str(),
                    OsStr::new("::"),
                ];
                run_tool("mcopy", mcopy, &args).await
            }
        }
    }
}

async fn run_tool(name: &str, program: &Path, args: &[&OsStr]) -> Result<(), DeployError> {
    debug!("Running {} {:?}", program.display(), args);

    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| DeployError::packaging(name, format!("failed to execute: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DeployError::packaging(
            name,
            format!(
                "exited with status {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ),
        ));
    }

    Ok(())
}

/// Search `PATH` for an executable
fn find_executable(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Builds seed images for deployments
#[derive(Debug, Clone, Default)]
pub struct SeedImageBuilder {
    tool: Option<PackagingTool>,
    meta_data_template: Option<String>,
    user_data_template: Option<String>,
    vars: HashMap<String, Value>,
}

impl SeedImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific packaging tool instead of searching `PATH`
    pub fn with_tool(mut self, tool: PackagingTool) -> Self {
        self.tool = Some(tool);
        self
    }

    /// Replace the built-in `meta-data` template
    pub fn with_meta_data_template(mut self, template: impl Into<String>) -> Self {
        self.meta_data_template = Some(template.into());
        self
    }

    /// Replace the built-in `user-data` template
    pub fn with_user_data_template(mut self, template: impl Into<String>) -> Self {
        self.user_data_template = Some(template.into());
        self
    }

    /// Add a variable available to custom templates
    pub fn add_var(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.vars.insert(name.into(), value.into());
    }

    /// Render both seed files; identical deployments render identical text
    pub fn render(&self, spec: &DeploymentSpec) -> Result<SeedFiles, DeployError> {
        let mut ctx = build_context(spec)?;
        merge_context(&mut ctx, self.vars.clone());

        let meta_data = render_seed_file(
            META_DATA_FILE,
            self.meta_data_template.as_deref().unwrap_or(META_DATA_TEMPLATE),
            &ctx,
        )?;
        let user_data = render_seed_file(
            USER_DATA_FILE,
            self.user_data_template.as_deref().unwrap_or(USER_DATA_TEMPLATE),
            &ctx,
        )?;

        for (name, text) in [(META_DATA_FILE, &meta_data), (USER_DATA_FILE, &user_data)] {
            serde_yaml::from_str::<serde_yaml::Value>(text).map_err(|e| {
                DeployError::TemplateRender(format!("rendered {} is not valid YAML: {}", name, e))
            })?;
        }

        Ok(SeedFiles {
            meta_data,
            user_data,
        })
    }

    /// Render and package the seed image for `spec`
    pub async fn build(&self, spec: &DeploymentSpec) -> Result<SeedImage, DeployError> {
        let files = self.render(spec)?;

        let tool = match &self.tool {
            Some(tool) => tool.clone(),
            None => PackagingTool::detect(spec.seed_format)?,
        };
        if tool.format() != spec.seed_format {
            return Err(DeployError::packaging(
                tool.name(),
                format!("tool produces {}, deployment asks for {}", tool.format(), spec.seed_format),
            ));
        }

        let dir = tempfile::Builder::new()
            .prefix("cloudinit-seed-")
            .tempdir()?;
        let staging = dir.path().join(VOLUME_LABEL);
        fs::create_dir(&staging).await?;

        info!("Generating cloud-init seed files at {}", staging.display());
        fs::write(staging.join(META_DATA_FILE), &files.meta_data).await?;
        fs::write(staging.join(USER_DATA_FILE), &files.user_data).await?;

        let path = dir.path().join(spec.seed_format.file_name());
        tool.package(&staging, &path).await?;
        info!("Generated cloud-init seed image at {}", path.display());

        Ok(SeedImage {
            _dir: dir,
            path,
            format: spec.seed_format,
            files,
        })
    }
}
