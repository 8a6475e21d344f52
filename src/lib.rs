//! ec2-runner-deploy library
//!
//! Provisions a single EC2 runner and installs the local server tree on it.
//!
//! # Steps
//!
//! - **ec2-runner-sg**: security group with SSH and DNS inbound, all outbound
//! - **ec2-runner-key**: 4096-bit RSA key registered as an EC2 key pair
//! - **ec2-runner**: the instance itself
//! - **tar-cmd**: gzip tar of the project tree
//! - **upload-server-cmd**: scp of the archive to the instance
//! - **install-server-cmd**: unpack and run `install.sh` over ssh
//!
//! Cloud resources are reused when they already exist; the three command
//! steps run on every `up`.

pub mod config;
pub mod engine;
pub mod exec;
pub mod graph;
pub mod provider;
pub mod resources;
pub mod stack;
pub mod template;

mod error;

pub use error::DeployError;

use std::sync::Arc;
use tracing::info;

use config::DeployConfig;
use engine::{Engine, RunReport, StepReport};
use exec::TokioCommandRunner;
use provider::AwsCli;
use stack::Stack;

/// Engine wired to the real `aws` CLI and OpenSSH tools
pub fn engine_for(config: &DeployConfig) -> Engine {
    let runner = Arc::new(TokioCommandRunner);
    let ec2 = AwsCli::new(runner.clone())
        .with_region(config.region.clone())
        .with_profile(config.profile.clone());
    Engine::new(Arc::new(ec2), runner)
}

/// Bring the runner stack up
pub async fn deploy(config: &DeployConfig) -> Result<RunReport, DeployError> {
    let stack = Stack::declare(config);
    info!("Deploying stack {}", stack.name);
    engine_for(config).up(&stack).await
}

/// Show what `deploy` would do
pub async fn preview(config: &DeployConfig) -> Result<Vec<StepReport>, DeployError> {
    let stack = Stack::declare(config);
    engine_for(config).preview(&stack).await
}
