//! Deploy config loader
//!
//! Resolves the config file, applies command line and environment
//! overrides, then validates the result.

use super::DeployConfig;
use crate::DeployError;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

/// Config file picked up from the working directory when none is given
pub const DEFAULT_CONFIG_FILE: &str = "deploy.yaml";

/// Values that win over the config file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub stack: Option<String>,
    pub region: Option<String>,
    pub profile: Option<String>,
}

impl Overrides {
    fn apply(&self, config: &mut DeployConfig) {
        if let Some(stack) = &self.stack {
            config.stack = stack.clone();
        }
        if let Some(region) = &self.region {
            config.region = Some(region.clone());
        }
        if let Some(profile) = &self.profile {
            config.profile = Some(profile.clone());
        }
    }
}

/// Load, override and validate the deploy config
///
/// An explicit `path` must exist. Without one, `deploy.yaml` in the working
/// directory is used when present and the built-in defaults otherwise.
pub async fn load_config(
    path: Option<&Path>,
    overrides: &Overrides,
) -> Result<DeployConfig, DeployError> {
    let mut config = match path {
        Some(path) => {
            if !path.exists() {
                return Err(DeployError::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            load_config_file(path).await?
        }
        None => {
            let default_path = Path::new(DEFAULT_CONFIG_FILE);
            if default_path.exists() {
                load_config_file(default_path).await?
            } else {
                debug!("No {} found, using built-in defaults", DEFAULT_CONFIG_FILE);
                DeployConfig::default()
            }
        }
    };

    overrides.apply(&mut config);
    config.validate()?;

    info!(
        "Loaded config for stack '{}' (region: {})",
        config.stack,
        config.region.as_deref().unwrap_or("aws default")
    );
    Ok(config)
}

async fn load_config_file(path: &Path) -> Result<DeployConfig, DeployError> {
    let content = fs::read_to_string(path).await?;
    let config = DeployConfig::from_yaml(&content).map_err(|e| {
        DeployError::Config(format!("failed to parse {}: {}", path.display(), e))
    })?;
    debug!("Loaded config from {}", path.display());
    Ok(config)
}
