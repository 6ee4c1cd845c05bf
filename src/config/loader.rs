//! Deployment file loader
//!
//! Loads a deployment file, applies command line overrides and resolves
//! relative paths.

use super::DeployConfig;
use crate::DeployError;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Command line values that take precedence over the deployment file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub user: Option<String>,
    pub images_dir: Option<PathBuf>,
    pub name: Option<String>,
    pub auto_start: Option<bool>,
}

impl Overrides {
    fn apply(self, config: &mut DeployConfig) {
        if let Some(host) = self.host {
            debug!("Overriding host with {}", host);
            config.connection.host = host;
        }
        if let Some(user) = self.user {
            config.connection.user = user;
        }
        if let Some(dir) = self.images_dir {
            config.images_dir = Some(dir);
        }
        if let Some(name) = self.name {
            config.deployment.name = name;
        }
        if let Some(start) = self.auto_start {
            config.deployment.auto_start = start;
        }
    }
}

/// Configuration loader builder
pub struct ConfigLoader {
    path: Option<PathBuf>,
    content: Option<String>,
    overrides: Overrides,
    offline: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            path: None,
            content: None,
            overrides: Overrides::default(),
            offline: false,
        }
    }

    /// Read the deployment file at `path`
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Use in-memory YAML instead of a file
    pub fn with_yaml(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Do not require connection settings, for commands that stay local
    pub fn offline(mut self) -> Self {
        self.offline = true;
        self
    }

    /// Load, override, resolve paths and validate
    pub async fn load(self) -> Result<DeployConfig, DeployError> {
        let content = match (&self.content, &self.path) {
            (Some(content), _) => content.clone(),
            (None, Some(path)) => fs::read_to_string(path)
                .await
                .map_err(|e| DeployError::Config(format!("cannot read {}: {}", path.display(), e)))?,
            (None, None) => {
                return Err(DeployError::Config("no deployment file given".into()));
            }
        };

        let mut config = DeployConfig::from_yaml(&content)?;
        self.overrides.apply(&mut config);

        // Relative paths in a file are relative to that file
        let base_dir = self
            .path
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        resolve_paths(&mut config, &base_dir);

        if !self.offline && config.connection.host.trim().is_empty() {
            return Err(DeployError::Config(
                "connection.host is required (or pass --host)".into(),
            ));
        }
        config.deployment.validate()?;

        info!(
            "Loaded deployment '{}' for {}@{}",
            config.deployment.name, config.connection.user, config.connection.host
        );
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() || base.as_os_str().is_empty() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn resolve_paths(config: &mut DeployConfig, base_dir: &Path) {
    let images_dir = config.images_dir.as_deref().map(|dir| resolve(base_dir, dir));

    let image = &config.deployment.base_image;
    config.deployment.base_image = match &images_dir {
        Some(dir) => resolve(dir, image),
        None => resolve(base_dir, image),
    };
    config.images_dir = images_dir;

    if let Some(path) = config.templates.user_data.take() {
        config.templates.user_data = Some(resolve(base_dir, &path));
    }
    if let Some(path) = config.templates.meta_data.take() {
        config.templates.meta_data = Some(resolve(base_dir, &path));
    }
    if let Some(identity) = config.connection.identity_file.take() {
        config.connection.identity_file = Some(resolve(base_dir, &identity));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DEPLOYMENT: &str = r#"
connection:
  host: pve1.example.com
deployment:
  name: web01
  node: pve1
  storage: local-lvm
  disk_size: 10G
  base_image: ubuntu-16.04.img
"#;

    #[tokio::test]
    async fn test_load_from_file_resolves_relative_image() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("web01.yaml");
        fs::write(&path, DEPLOYMENT).await.unwrap();

        let config = ConfigLoader::new().with_path(&path).load().await.unwrap();
        assert_eq!(
            config.deployment.base_image,
            temp.path().join("ubuntu-16.04.img")
        );
    }

    #[tokio::test]
    async fn test_images_dir_override() {
        let overrides = Overrides {
            images_dir: Some(PathBuf::from("/srv/cloud-images")),
            ..Default::default()
        };

        let config = ConfigLoader::new()
            .with_yaml(DEPLOYMENT)
            .with_overrides(overrides)
            .load()
            .await
            .unwrap();
        assert_eq!(
            config.deployment.base_image,
            PathBuf::from("/srv/cloud-images/ubuntu-16.04.img")
        );
    }

    #[tokio::test]
    async fn test_absolute_image_is_kept() {
        let yaml = DEPLOYMENT.replace("ubuntu-16.04.img", "/images/ubuntu-16.04.img");
        let overrides = Overrides {
            images_dir: Some(PathBuf::from("/srv/cloud-images")),
            ..Default::default()
        };

        let config = ConfigLoader::new()
            .with_yaml(yaml)
            .with_overrides(overrides)
            .load()
            .await
            .unwrap();
        assert_eq!(
            config.deployment.base_image,
            PathBuf::from("/images/ubuntu-16.04.img")
        );
    }

    #[tokio::test]
    async fn test_overrides_win() {
        let overrides = Overrides {
            host: Some("10.1.1.1".to_string()),
            user: Some("admin".to_string()),
            name: Some("web02".to_string()),
            auto_start: Some(true),
            ..Default::default()
        };

        let config = ConfigLoader::new()
            .with_yaml(DEPLOYMENT)
            .with_overrides(overrides)
            .load()
            .await
            .unwrap();

        assert_eq!(config.connection.host, "10.1.1.1");
        assert_eq!(config.connection.user, "admin");
        assert_eq!(config.deployment.name, "web02");
        assert!(config.deployment.auto_start);
    }

    #[tokio::test]
    async fn test_missing_host() {
        let yaml = DEPLOYMENT.replace("connection:\n  host: pve1.example.com\n", "");
        let result = ConfigLoader::new().with_yaml(yaml).load().await;
        assert!(matches!(result, Err(DeployError::Config(m)) if m.contains("host")));
    }

    #[tokio::test]
    async fn test_offline_without_host() {
        let yaml = DEPLOYMENT.replace("connection:\n  host: pve1.example.com\n", "");
        let config = ConfigLoader::new().with_yaml(yaml).offline().load().await.unwrap();
        assert_eq!(config.deployment.name, "web01");
    }

    #[tokio::test]
    async fn test_invalid_deployment_rejected() {
        let yaml = DEPLOYMENT.replace("disk_size: 10G", "disk_size: 100M");
        let result = ConfigLoader::new().with_yaml(yaml).load().await;
        assert!(matches!(result, Err(DeployError::Config(m)) if m.contains("disk_size")));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let result = ConfigLoader::new()
            .with_path("/nonexistent/deploy.yaml")
            .load()
            .await;
        assert!(matches!(result, Err(DeployError::Config(_))));
    }
}
