//! SSH credential resource
//!
//! Key material comes from `ssh-keygen`; only the public half leaves the
//! machine. Once a key file exists it is never regenerated, so an
//! interrupted run picks up the same key on the next attempt.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use super::{Properties, Resource, RunContext};
use crate::DeployError;
use crate::exec::CommandSpec;
use crate::graph::Freshness;

/// Generated RSA key pair registered as an EC2 login key
#[derive(Debug, Clone)]
pub struct Credential {
    pub name: String,
    /// Key pair name in the cloud
    pub key_name: String,
    pub stack: String,
    pub bits: u32,
    /// Private key file; the public key sits next to it with `.pub`
    pub key_path: PathBuf,
}

impl Credential {
    pub fn public_key_path(&self) -> PathBuf {
        let mut path = self.key_path.clone().into_os_string();
        path.push(".pub");
        PathBuf::from(path)
    }

    /// `ssh-keygen` invocation writing the key pair
    pub fn keygen_spec(&self) -> CommandSpec {
        CommandSpec::new(
            "ssh-keygen",
            [
                "-q".to_string(),
                "-t".to_string(),
                "rsa".to_string(),
                "-b".to_string(),
                self.bits.to_string(),
                "-m".to_string(),
                "PEM".to_string(),
                "-N".to_string(),
                String::new(),
                "-C".to_string(),
                self.key_name.clone(),
                "-f".to_string(),
                self.key_path.to_string_lossy().into_owned(),
            ],
        )
    }

    fn key_files_exist(&self) -> bool {
        self.key_path.exists() && self.public_key_path().exists()
    }

    async fn generate(&self, ctx: &RunContext) -> Result<(), DeployError> {
        if let Some(dir) = self.key_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            // Only a directory we create is ours to lock down.
            if !fs::try_exists(dir).await? {
                fs::create_dir_all(dir).await?;
                restrict_permissions(dir, 0o700).await?;
            }
        }

        info!(
            "Generating {}-bit RSA key at {}",
            self.bits,
            self.key_path.display()
        );
        ctx.runner
            .run(&self.keygen_spec())
            .await?
            .check("ssh-keygen")?;
        restrict_permissions(&self.key_path, 0o600).await?;
        Ok(())
    }

    async fn properties(&self, key_pair_id: Option<String>) -> Result<Properties, DeployError> {
        let private_key = fs::read_to_string(&self.key_path).await?;
        let public_key = fs::read_to_string(self.public_key_path()).await?;

        let mut props = Properties::new()
            .with("key_name", self.key_name.clone())
            .with("public_key", public_key.trim().to_string())
            .with("private_key", private_key)
            .with("private_key_path", self.key_path.to_string_lossy().into_owned());
        if let Some(id) = key_pair_id {
            props.insert("key_pair_id", id);
        }
        Ok(props)
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path, mode: u32) -> Result<(), DeployError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path, _mode: u32) -> Result<(), DeployError> {
    Ok(())
}

#[async_trait]
impl Resource for Credential {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "aws:ec2:KeyPair"
    }

    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn freshness(&self) -> Freshness {
        Freshness::Once
    }

    async fn lookup(&self, ctx: &RunContext) -> Result<Option<Properties>, DeployError> {
        let registered = ctx.ec2.find_key_pair(&self.key_name).await?;
        match (registered, self.key_files_exist()) {
            (true, true) => {
                debug!("Reusing key pair {}", self.key_name);
                Ok(Some(self.properties(None).await?))
            }
            (true, false) => Err(DeployError::Cloud(format!(
                "key pair {} is registered but {} is missing; restore the key file or delete the key pair",
                self.key_name,
                self.key_path.display()
            ))),
            (false, _) => Ok(None),
        }
    }

    async fn create(&self, ctx: &RunContext) -> Result<Properties, DeployError> {
        if self.key_files_exist() {
            debug!("Key files already present at {}", self.key_path.display());
        } else {
            self.generate(ctx).await?;
        }

        let key_pair_id = ctx
            .ec2
            .import_key_pair(&self.key_name, &self.stack, &self.public_key_path())
            .await?;
        self.properties(Some(key_pair_id)).await
    }
}
