//! Deployment file parsing and types
//!
//! A deployment file is YAML with a `connection` section describing how to
//! reach the cluster host and a `deployment` section describing the VM.

pub mod loader;

pub use loader::{ConfigLoader, Overrides};

use minijinja::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::DeployError;
use crate::deployment::DeploymentSpec;
use crate::provision::VmProvisioner;
use crate::remote::SshOptions;
use crate::seed::SeedImageBuilder;
use crate::upload::ImageUploader;

/// Parsed deployment file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Directory a relative `deployment.base_image` is looked up in
    #[serde(default)]
    pub images_dir: Option<PathBuf>,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub templates: TemplateConfig,

    pub deployment: DeploymentSpec,
}

/// How to reach the cluster host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    /// Seconds to wait for the SSH handshake
    pub connect_timeout: u64,
    /// Seconds a single remote command may run
    pub command_timeout: u64,
    pub connect_retries: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: "root".to_string(),
            port: 22,
            identity_file: None,
            connect_timeout: 10,
            command_timeout: 600,
            connect_retries: 3,
        }
    }
}

/// Image upload settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Remote directory images are staged in
    pub staging_dir: String,
    pub verify_checksum: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            staging_dir: "/tmp".to_string(),
            verify_checksum: true,
        }
    }
}

/// Custom seed templates
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    pub user_data: Option<PathBuf>,
    pub meta_data: Option<PathBuf>,
    /// Extra variables available to the templates
    pub vars: HashMap<String, serde_yaml::Value>,
}

impl DeployConfig {
    /// Parse a deployment file
    pub fn from_yaml(content: &str) -> Result<Self, DeployError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.command_timeout)
    }

    pub fn ssh_options(&self) -> SshOptions {
        let mut options = SshOptions::new(&self.connection.host)
            .with_user(&self.connection.user)
            .with_port(self.connection.port);
        if let Some(identity) = &self.connection.identity_file {
            options = options.with_identity_file(identity);
        }
        options.connect_timeout = Duration::from_secs(self.connection.connect_timeout);
        options.connect_retries = self.connection.connect_retries;
        options
    }

    pub fn uploader(&self) -> ImageUploader {
        ImageUploader::new()
            .with_staging_dir(&self.upload.staging_dir)
            .with_checksum(self.upload.verify_checksum)
            .with_timeout(self.command_timeout())
    }

    pub fn provisioner(&self) -> VmProvisioner {
        VmProvisioner::new().with_timeout(self.command_timeout())
    }

    /// Seed builder with the configured templates and variables
    pub async fn seed_builder(&self) -> Result<SeedImageBuilder, DeployError> {
        let mut builder = SeedImageBuilder::new();

        if let Some(path) = &self.templates.user_data {
            builder = builder.with_user_data_template(read_template(path).await?);
        }
        if let Some(path) = &self.templates.meta_data {
            builder = builder.with_meta_data_template(read_template(path).await?);
        }
        for (name, value) in &self.templates.vars {
            builder.add_var(name, Value::from_serialize(value));
        }

        Ok(builder)
    }
}

async fn read_template(path: &PathBuf) -> Result<String, DeployError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| DeployError::TemplateRender(format!("cannot read template {}: {}", path.display(), e)))
}
