//! EC2 provider backed by the `aws` CLI
//!
//! Every call runs `aws ec2 <subcommand> ... --output json` and decodes the
//! response. Credentials, default region and retries are whatever the CLI
//! is configured with.

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{Ec2Api, InstanceInfo, InstanceSpec, STACK_TAG};
use crate::DeployError;
use crate::config::{Protocol, Rule, RuleSet};
use crate::exec::{CommandRunner, CommandSpec};

/// `aws ec2 wait instance-running` polls for up to 10 minutes itself
const WAIT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeSecurityGroups {
    #[serde(default)]
    security_groups: Vec<SecurityGroup>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SecurityGroup {
    group_id: String,
    #[serde(default)]
    ip_permissions: Vec<IpPermission>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IpPermission {
    ip_protocol: String,
    #[serde(default)]
    from_port: Option<i64>,
    #[serde(default)]
    to_port: Option<i64>,
    #[serde(default)]
    ip_ranges: Vec<IpRange>,
    #[serde(default)]
    ipv6_ranges: Vec<Ipv6Range>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IpRange {
    cidr_ip: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ipv6Range {
    cidr_ipv6: String,
}

impl IpPermission {
    /// Rule form of a described permission; protocols we never declare
    /// (icmp, numbered protocols) are skipped
    fn into_rule(self) -> Option<Rule> {
        let protocol = match self.ip_protocol.as_str() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            "-1" => Protocol::All,
            _ => return None,
        };
        let port = |p: Option<i64>| p.and_then(|p| u16::try_from(p).ok()).unwrap_or(0);
        Some(Rule {
            description: None,
            from_port: port(self.from_port),
            to_port: port(self.to_port),
            protocol,
            cidr_blocks: self.ip_ranges.into_iter().map(|r| r.cidr_ip).collect(),
            ipv6_cidr_blocks: self.ipv6_ranges.into_iter().map(|r| r.cidr_ipv6).collect(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeKeyPairs {
    #[serde(default)]
    key_pairs: Vec<KeyPair>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KeyPair {
    key_name: String,
    #[serde(default)]
    key_pair_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstances {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Instance {
    instance_id: String,
    #[serde(default)]
    public_ip_address: Option<String>,
    #[serde(default)]
    image_id: Option<String>,
    #[serde(default)]
    instance_type: Option<String>,
    #[serde(default)]
    state: Option<InstanceState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceState {
    name: String,
}

impl From<Instance> for InstanceInfo {
    fn from(instance: Instance) -> Self {
        Self {
            instance_id: instance.instance_id,
            state: instance
                .state
                .map(|s| s.name)
                .unwrap_or_else(|| "unknown".to_string()),
            public_ip: instance.public_ip_address,
            image: instance.image_id,
            instance_type: instance.instance_type,
        }
    }
}

/// Tag specification JSON for `--tag-specifications`
fn tag_specifications(resource_type: &str, name: &str, stack: &str) -> String {
    json!([{
        "ResourceType": resource_type,
        "Tags": [
            { "Key": "Name", "Value": name },
            { "Key": STACK_TAG, "Value": stack },
        ],
    }])
    .to_string()
}

/// `IpPermissions` JSON for a list of rules
pub fn ip_permissions(rules: &[Rule]) -> String {
    let permissions: Vec<Value> = rules
        .iter()
        .map(|rule| {
            let ip_ranges: Vec<Value> = rule
                .cidr_blocks
                .iter()
                .map(|cidr| match &rule.description {
                    Some(d) => json!({ "CidrIp": cidr, "Description": d }),
                    None => json!({ "CidrIp": cidr }),
                })
                .collect();
            let ipv6_ranges: Vec<Value> = rule
                .ipv6_cidr_blocks
                .iter()
                .map(|cidr| match &rule.description {
                    Some(d) => json!({ "CidrIpv6": cidr, "Description": d }),
                    None => json!({ "CidrIpv6": cidr }),
                })
                .collect();
            json!({
                "IpProtocol": rule.protocol.as_ec2(),
                "FromPort": rule.from_port,
                "ToPort": rule.to_port,
                "IpRanges": ip_ranges,
                "Ipv6Ranges": ipv6_ranges,
            })
        })
        .collect();
    Value::Array(permissions).to_string()
}

/// EC2 through the `aws` command line tool
pub struct AwsCli {
    runner: Arc<dyn CommandRunner>,
    region: Option<String>,
    profile: Option<String>,
}

impl AwsCli {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            region: None,
            profile: None,
        }
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }

    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.profile = profile;
        self
    }

    /// Full `aws ec2 ...` invocation for `args`
    pub fn command(&self, args: &[&str]) -> CommandSpec {
        let mut full: Vec<String> = vec!["ec2".to_string()];
        full.extend(args.iter().map(|a| a.to_string()));
        full.extend(["--output".to_string(), "json".to_string()]);
        if let Some(region) = &self.region {
            full.extend(["--region".to_string(), region.clone()]);
        }
        if let Some(profile) = &self.profile {
            full.extend(["--profile".to_string(), profile.clone()]);
        }
        CommandSpec::new("aws", full)
    }

    async fn call(&self, spec: CommandSpec) -> Result<String, DeployError> {
        let output = self.runner.run(&spec).await?.check("aws")?;
        Ok(output.stdout)
    }

    async fn call_json<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T, DeployError> {
        let stdout = self.call(self.command(args)).await?;
        Ok(serde_json::from_str(&stdout)?)
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<InstanceInfo, DeployError> {
        let response: DescribeInstances = self
            .call_json(&["describe-instances", "--instance-ids", instance_id])
            .await?;
        response
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .next()
            .map(InstanceInfo::from)
            .ok_or_else(|| DeployError::Cloud(format!("instance {instance_id} not found")))
    }
}

#[async_trait]
impl Ec2Api for AwsCli {
    fn name(&self) -> &'static str {
        "aws-cli"
    }

    async fn find_security_group(&self, name: &str) -> Result<Option<String>, DeployError> {
        let filter = format!("Name=group-name,Values={name}");
        let response: DescribeSecurityGroups = self
            .call_json(&["describe-security-groups", "--filters", &filter])
            .await?;
        Ok(response.security_groups.into_iter().next().map(|g| g.group_id))
    }

    async fn create_security_group(
        &self,
        name: &str,
        stack: &str,
        rules: &RuleSet,
    ) -> Result<String, DeployError> {
        let tags = tag_specifications("security-group", name, stack);
        let created: SecurityGroup = self
            .call_json(&[
                "create-security-group",
                "--group-name",
                name,
                "--description",
                &rules.description,
                "--tag-specifications",
                &tags,
            ])
            .await?;
        let group_id = created.group_id;
        info!("Created security group {} ({})", name, group_id);

        self.authorize_ingress(&group_id, &rules.ingress).await?;

        // New groups come with an allow-all IPv4 egress rule; the declared
        // egress list replaces it.
        let default_egress = json!([{
            "IpProtocol": "-1",
            "IpRanges": [{ "CidrIp": "0.0.0.0/0" }],
        }])
        .to_string();
        self.call(self.command(&[
            "revoke-security-group-egress",
            "--group-id",
            &group_id,
            "--ip-permissions",
            &default_egress,
        ]))
        .await?;

        if !rules.egress.is_empty() {
            let permissions = ip_permissions(&rules.egress);
            self.call(self.command(&[
                "authorize-security-group-egress",
                "--group-id",
                &group_id,
                "--ip-permissions",
                &permissions,
            ]))
            .await?;
        }

        debug!(
            "Applied {} ingress and {} egress rules to {}",
            rules.ingress.len(),
            rules.egress.len(),
            group_id
        );
        Ok(group_id)
    }

    async fn ingress_rules(&self, group_id: &str) -> Result<Vec<Rule>, DeployError> {
        let response: DescribeSecurityGroups = self
            .call_json(&["describe-security-groups", "--group-ids", group_id])
            .await?;
        let group = response
            .security_groups
            .into_iter()
            .next()
            .ok_or_else(|| DeployError::Cloud(format!("security group {group_id} not found")))?;
        Ok(group
            .ip_permissions
            .into_iter()
            .filter_map(IpPermission::into_rule)
            .collect())
    }

    async fn authorize_ingress(&self, group_id: &str, rules: &[Rule]) -> Result<(), DeployError> {
        if rules.is_empty() {
            return Ok(());
        }
        let permissions = ip_permissions(rules);
        self.call(self.command(&[
            "authorize-security-group-ingress",
            "--group-id",
            group_id,
            "--ip-permissions",
            &permissions,
        ]))
        .await?;
        Ok(())
    }

    async fn find_key_pair(&self, name: &str) -> Result<bool, DeployError> {
        // Filtering instead of --key-names: a missing name is an empty list,
        // not an InvalidKeyPair.NotFound error.
        let filter = format!("Name=key-name,Values={name}");
        let response: DescribeKeyPairs = self
            .call_json(&["describe-key-pairs", "--filters", &filter])
            .await?;
        Ok(response.key_pairs.iter().any(|k| k.key_name == name))
    }

    async fn import_key_pair(
        &self,
        name: &str,
        stack: &str,
        public_key_path: &Path,
    ) -> Result<String, DeployError> {
        let material = format!("fileb://{}", public_key_path.display());
        let tags = tag_specifications("key-pair", name, stack);
        let imported: KeyPair = self
            .call_json(&[
                "import-key-pair",
                "--key-name",
                name,
                "--public-key-material",
                &material,
                "--tag-specifications",
                &tags,
            ])
            .await?;
        info!("Imported key pair {}", imported.key_name);
        Ok(imported.key_pair_id.unwrap_or(imported.key_name))
    }

    async fn find_instance(
        &self,
        name: &str,
        stack: &str,
    ) -> Result<Option<InstanceInfo>, DeployError> {
        let name_filter = format!("Name=tag:Name,Values={name}");
        let stack_filter = format!("Name=tag:{STACK_TAG},Values={stack}");
        let response: DescribeInstances = self
            .call_json(&[
                "describe-instances",
                "--filters",
                &name_filter,
                &stack_filter,
                "Name=instance-state-name,Values=pending,running,stopping,stopped",
            ])
            .await?;
        Ok(response
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .next()
            .map(InstanceInfo::from))
    }

    async fn wait_running(&self, instance_id: &str) -> Result<InstanceInfo, DeployError> {
        info!("Waiting for instance {} to be running", instance_id);
        let wait = self
            .command(&["wait", "instance-running", "--instance-ids", instance_id])
            .with_timeout(WAIT_TIMEOUT);
        self.call(wait).await?;
        self.describe_instance(instance_id).await
    }

    async fn start_instance(&self, instance_id: &str) -> Result<InstanceInfo, DeployError> {
        // start-instances rejects an instance that is still stopping
        let stopped = self
            .command(&["wait", "instance-stopped", "--instance-ids", instance_id])
            .with_timeout(WAIT_TIMEOUT);
        self.call(stopped).await?;

        info!("Starting stopped instance {}", instance_id);
        self.call(self.command(&["start-instances", "--instance-ids", instance_id]))
            .await?;
        self.wait_running(instance_id).await
    }

    async fn launch_instance(&self, spec: &InstanceSpec) -> Result<InstanceInfo, DeployError> {
        let tags = tag_specifications("instance", &spec.name, &spec.stack);
        let response: Reservation = self
            .call_json(&[
                "run-instances",
                "--image-id",
                &spec.image,
                "--instance-type",
                &spec.instance_type,
                "--key-name",
                &spec.key_name,
                "--security-group-ids",
                &spec.security_group_id,
                "--count",
                "1",
                "--tag-specifications",
                &tags,
            ])
            .await?;
        let instance_id = response
            .instances
            .into_iter()
            .next()
            .map(|i| i.instance_id)
            .ok_or_else(|| DeployError::Cloud("run-instances returned no instance".to_string()))?;
        info!("Launched instance {}", instance_id);

        self.wait_running(&instance_id).await
    }
}
