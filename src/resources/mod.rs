//! Resource declarations
//!
//! A resource is one step of the stack: it names the steps it depends on,
//! says how fresh it must be, and knows how to create itself (and, for
//! cloud objects, how to find an existing copy). Whatever a step produces
//! is recorded as string properties that later steps read by name.

pub mod firewall;
pub mod instance;
pub mod keypair;
pub mod package;
pub mod remote;

pub use firewall::SecurityGroup;
pub use instance::Instance;
pub use keypair::Credential;
pub use package::Package;
pub use remote::{CopyFile, RemoteCommand};

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::DeployError;
use crate::exec::CommandRunner;
use crate::graph::{Freshness, TriggerToken};
use crate::provider::Ec2Api;

/// Values a step produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// Shared state of one run
pub struct RunContext {
    pub ec2: Arc<dyn Ec2Api>,
    pub runner: Arc<dyn CommandRunner>,
    pub token: TriggerToken,
    results: BTreeMap<String, Properties>,
}

impl RunContext {
    pub fn new(ec2: Arc<dyn Ec2Api>, runner: Arc<dyn CommandRunner>, token: TriggerToken) -> Self {
        Self {
            ec2,
            runner,
            token,
            results: BTreeMap::new(),
        }
    }

    /// Store what a finished step produced
    pub fn record(&mut self, resource: &str, properties: Properties) {
        self.results.insert(resource.to_string(), properties);
    }

    /// A property of an upstream step that must already have run
    pub fn require(&self, resource: &str, key: &str) -> Result<&str, DeployError> {
        self.results
            .get(resource)
            .and_then(|p| p.get(key))
            .ok_or_else(|| DeployError::missing(resource, key))
    }
}

/// One step of the stack
#[async_trait]
pub trait Resource: Send + Sync {
    /// Logical name, unique in the stack
    fn name(&self) -> &str;

    /// Kind shown in previews and logs (e.g., "aws:ec2:Instance")
    fn kind(&self) -> &'static str;

    /// Steps that must finish before this one starts
    fn dependencies(&self) -> Vec<String>;

    fn freshness(&self) -> Freshness;

    /// Find an existing copy of this resource
    ///
    /// Only consulted for [`Freshness::Once`] resources.
    async fn lookup(&self, _ctx: &RunContext) -> Result<Option<Properties>, DeployError> {
        Ok(None)
    }

    /// Bring a found resource back in line with its declaration
    ///
    /// Called after a successful [`Resource::lookup`] during `up`, never
    /// during a preview. Returns the properties to record.
    async fn reconcile(
        &self,
        _ctx: &RunContext,
        found: Properties,
    ) -> Result<Properties, DeployError> {
        Ok(found)
    }

    /// Create the resource (or execute the step)
    async fn create(&self, ctx: &RunContext) -> Result<Properties, DeployError>;
}
