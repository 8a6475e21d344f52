//! Compute instance resource

use async_trait::async_trait;
use tracing::{info, warn};

use super::{Properties, Resource, RunContext};
use crate::DeployError;
use crate::graph::Freshness;
use crate::provider::{InstanceInfo, InstanceSpec};

/// The runner VM
#[derive(Debug, Clone)]
pub struct Instance {
    pub name: String,
    /// `Name` tag in the cloud
    pub instance_name: String,
    pub stack: String,
    pub image: String,
    pub instance_type: String,
    /// Security group step this instance attaches
    pub firewall: String,
    /// Credential step whose key pair this instance trusts
    pub credential: String,
}

impl Instance {
    fn properties(&self, info: &InstanceInfo) -> Result<Properties, DeployError> {
        let public_ip = info.public_ip.clone().ok_or_else(|| {
            DeployError::Cloud(format!(
                "instance {} has no public IP address; the subnet must auto-assign one",
                info.instance_id
            ))
        })?;
        Ok(self.describe(info).with("public_ip", public_ip))
    }

    /// Properties of an instance whatever its state; no address is required
    fn describe(&self, info: &InstanceInfo) -> Properties {
        let mut properties = Properties::new()
            .with("instance_id", info.instance_id.clone())
            .with("state", info.state.clone())
            .with(
                "image",
                info.image.clone().unwrap_or_else(|| self.image.clone()),
            )
            .with(
                "instance_type",
                info.instance_type
                    .clone()
                    .unwrap_or_else(|| self.instance_type.clone()),
            );
        if let Some(ip) = &info.public_ip {
            properties.insert("public_ip", ip.clone());
        }
        properties
    }
}

#[async_trait]
impl Resource for Instance {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "aws:ec2:Instance"
    }

    fn dependencies(&self) -> Vec<String> {
        vec![self.firewall.clone(), self.credential.clone()]
    }

    fn freshness(&self) -> Freshness {
        Freshness::Once
    }

    async fn lookup(&self, ctx: &RunContext) -> Result<Option<Properties>, DeployError> {
        let Some(info) = ctx
            .ec2
            .find_instance(&self.instance_name, &self.stack)
            .await?
        else {
            return Ok(None);
        };

        if info.image.as_deref().is_some_and(|image| image != self.image) {
            warn!(
                "Instance {} runs {} but {} is declared; destroy it to pick up the new image",
                info.instance_id,
                info.image.as_deref().unwrap_or_default(),
                self.image
            );
        }

        Ok(Some(self.describe(&info)))
    }

    /// Start a stopped instance, or wait for a pending one, so later steps
    /// can reach it
    async fn reconcile(
        &self,
        ctx: &RunContext,
        found: Properties,
    ) -> Result<Properties, DeployError> {
        let state = found.get("state").unwrap_or_default();
        if state == "running" && found.get("public_ip").is_some() {
            return Ok(found);
        }

        let instance_id = found
            .get("instance_id")
            .ok_or_else(|| DeployError::missing(&self.name, "instance_id"))?;
        let info = if matches!(state, "stopped" | "stopping") {
            info!("Instance {} is {}; starting it", instance_id, state);
            ctx.ec2.start_instance(instance_id).await?
        } else {
            ctx.ec2.wait_running(instance_id).await?
        };
        self.properties(&info)
    }

    async fn create(&self, ctx: &RunContext) -> Result<Properties, DeployError> {
        let spec = InstanceSpec {
            name: self.instance_name.clone(),
            stack: self.stack.clone(),
            image: self.image.clone(),
            instance_type: self.instance_type.clone(),
            key_name: ctx.require(&self.credential, "key_name")?.to_string(),
            security_group_id: ctx.require(&self.firewall, "group_id")?.to_string(),
        };

        info!(
            "Launching {} instance {} from {}",
            spec.instance_type, spec.name, spec.image
        );
        let info = ctx.ec2.launch_instance(&spec).await?;
        self.properties(&info)
    }
}
