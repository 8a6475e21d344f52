//! Cloud provider access
//!
//! The EC2 calls the stack needs, behind a trait so the engine can run
//! against the real `aws` CLI or an in-memory fake.

pub mod aws_cli;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use aws_cli::AwsCli;

use async_trait::async_trait;
use std::path::Path;

use crate::DeployError;
use crate::config::{Rule, RuleSet};

/// Tag key carrying the stack name on every created resource
pub const STACK_TAG: &str = "deploy:stack";

/// Parameters for launching the runner instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub name: String,
    pub stack: String,
    pub image: String,
    pub instance_type: String,
    pub key_name: String,
    pub security_group_id: String,
}

/// What the cloud reports about an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub state: String,
    pub public_ip: Option<String>,
    pub image: Option<String>,
    pub instance_type: Option<String>,
}

/// EC2 operations used by the stack
#[async_trait]
pub trait Ec2Api: Send + Sync {
    /// Name of this provider (e.g., "aws-cli", "mock")
    fn name(&self) -> &'static str;

    /// Security group id for a group name, if the group exists
    async fn find_security_group(&self, name: &str) -> Result<Option<String>, DeployError>;

    /// Create a security group carrying exactly `rules`, returning its id
    async fn create_security_group(
        &self,
        name: &str,
        stack: &str,
        rules: &RuleSet,
    ) -> Result<String, DeployError>;

    /// Inbound rules currently granted by a security group
    async fn ingress_rules(&self, group_id: &str) -> Result<Vec<Rule>, DeployError>;

    /// Grant additional inbound rules on an existing group
    async fn authorize_ingress(&self, group_id: &str, rules: &[Rule]) -> Result<(), DeployError>;

    /// Whether a key pair with this name is registered
    async fn find_key_pair(&self, name: &str) -> Result<bool, DeployError>;

    /// Register an OpenSSH public key file as a login key pair
    async fn import_key_pair(
        &self,
        name: &str,
        stack: &str,
        public_key_path: &Path,
    ) -> Result<String, DeployError>;

    /// A live or stopped instance with this name in this stack
    async fn find_instance(
        &self,
        name: &str,
        stack: &str,
    ) -> Result<Option<InstanceInfo>, DeployError>;

    /// Block until the instance is running, then describe it
    async fn wait_running(&self, instance_id: &str) -> Result<InstanceInfo, DeployError>;

    /// Start a stopped (or stopping) instance and wait for it to be running
    async fn start_instance(&self, instance_id: &str) -> Result<InstanceInfo, DeployError>;

    /// Launch one instance and wait for it to be running
    async fn launch_instance(&self, spec: &InstanceSpec) -> Result<InstanceInfo, DeployError>;
}
