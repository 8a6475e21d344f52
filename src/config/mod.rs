//! Deploy configuration
//!
//! Every field has a default, so the tool provisions the standard runner
//! without any `deploy.yaml` at all. A config file only needs the keys it
//! wants to change.

pub mod loader;
pub mod rules;

pub use loader::{load_config, Overrides};
pub use rules::{Direction, Protocol, Rule, RuleSet};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::DeployError;

/// Main deploy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Stack name, used to scope cloud resource names and tags
    pub stack: String,

    /// AWS region (falls back to the aws CLI's own configuration)
    pub region: Option<String>,

    /// AWS CLI profile
    pub profile: Option<String>,

    pub firewall: FirewallConfig,
    pub credential: CredentialConfig,
    pub instance: InstanceConfig,
    pub package: PackageConfig,
    pub transfer: TransferConfig,
    pub install: InstallConfig,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            stack: "dev".to_string(),
            region: None,
            profile: None,
            firewall: FirewallConfig::default(),
            credential: CredentialConfig::default(),
            instance: InstanceConfig::default(),
            package: PackageConfig::default(),
            transfer: TransferConfig::default(),
            install: InstallConfig::default(),
        }
    }
}

/// Security group settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    pub name: String,
    #[serde(flatten)]
    pub rules: RuleSet,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            name: "ec2-runner-sg".to_string(),
            rules: RuleSet::default(),
        }
    }
}

/// SSH credential settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    pub name: String,
    /// RSA modulus size
    pub bits: u32,
    /// Directory holding the generated key files
    pub key_dir: PathBuf,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            name: "ec2-runner-key".to_string(),
            bits: 4096,
            key_dir: PathBuf::from(".deploy"),
        }
    }
}

/// Compute instance settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub name: String,
    pub image: String,
    pub instance_type: String,
    /// Login user baked into the image
    pub user: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name: "ec2-runner".to_string(),
            image: "ami-0b0dcb5067f052a63".to_string(),
            instance_type: "t2.micro".to_string(),
            user: "ec2-user".to_string(),
        }
    }
}

/// Local packaging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageConfig {
    /// Project tree to archive
    pub source_dir: PathBuf,
    /// Archive path (relative paths resolve against the working directory)
    pub archive: PathBuf,
    /// Path components never added to the archive
    pub excludes: Vec<String>,
    /// Shell command that replaces the built-in archiver (template)
    pub command: Option<String>,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from(".."),
            archive: PathBuf::from("server.tar.gz"),
            excludes: vec![".bundle".to_string(), "infrastructure".to_string()],
            command: None,
        }
    }
}

/// Remote channel settings shared by upload and install
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub remote_path: String,
    /// Passed to OpenSSH as `ConnectionAttempts`
    pub connection_attempts: u32,
    /// Passed to OpenSSH as `ConnectTimeout`
    pub connect_timeout_secs: u64,
    /// Upper bound for a single scp/ssh invocation
    pub command_timeout_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            remote_path: "/home/ec2-user/server.tar.gz".to_string(),
            connection_attempts: 30,
            connect_timeout_secs: 10,
            command_timeout_secs: 600,
        }
    }
}

/// Remote install settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    /// Remote command template
    pub command: String,
    /// Argument handed to install.sh
    pub install_arg: String,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            command: "rm -rf server && mkdir -p server && tar xzf {{ remote_path }} -C server && bash ./server/install.sh {{ install_arg }}".to_string(),
            install_arg: "root".to_string(),
        }
    }
}

impl DeployConfig {
    /// Parse a deploy config from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml)
    }

    /// Cloud-side name for a logical resource, scoped by stack
    pub fn physical_name(&self, logical: &str) -> String {
        format!("{}-{}", self.stack, logical)
    }

    /// Location of the generated private key
    pub fn private_key_path(&self) -> PathBuf {
        self.credential
            .key_dir
            .join(self.physical_name(&self.credential.name))
    }

    /// Check invariants that would otherwise surface halfway through a run
    pub fn validate(&self) -> Result<(), DeployError> {
        if self.stack.is_empty()
            || !self
                .stack
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(DeployError::Config(format!(
                "stack name '{}' must be non-empty and use only [A-Za-z0-9_-]",
                self.stack
            )));
        }

        for (field, value) in [
            ("firewall.name", &self.firewall.name),
            ("credential.name", &self.credential.name),
            ("instance.name", &self.instance.name),
            ("instance.image", &self.instance.image),
            ("instance.instance_type", &self.instance.instance_type),
            ("instance.user", &self.instance.user),
            ("install.command", &self.install.command),
        ] {
            if value.trim().is_empty() {
                return Err(DeployError::Config(format!("{field} must not be empty")));
            }
        }

        if self.credential.bits < 2048 {
            return Err(DeployError::Config(format!(
                "credential.bits must be at least 2048, got {}",
                self.credential.bits
            )));
        }

        if !self.transfer.remote_path.starts_with('/') {
            return Err(DeployError::Config(format!(
                "transfer.remote_path must be absolute, got '{}'",
                self.transfer.remote_path
            )));
        }

        if self.transfer.connection_attempts == 0 {
            return Err(DeployError::Config(
                "transfer.connection_attempts must be at least 1".to_string(),
            ));
        }

        self.firewall.rules.validate()
    }
}
