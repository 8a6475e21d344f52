//! Network rule set resource

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Properties, Resource, RunContext};
use crate::DeployError;
use crate::config::RuleSet;
use crate::graph::Freshness;

/// Security group carrying the runner's firewall rules
#[derive(Debug, Clone)]
pub struct SecurityGroup {
    pub name: String,
    /// Group name in the cloud
    pub group_name: String,
    pub stack: String,
    pub rules: RuleSet,
}

#[async_trait]
impl Resource for SecurityGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "aws:ec2:SecurityGroup"
    }

    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn freshness(&self) -> Freshness {
        Freshness::Once
    }

    async fn lookup(&self, ctx: &RunContext) -> Result<Option<Properties>, DeployError> {
        let found = ctx.ec2.find_security_group(&self.group_name).await?;
        Ok(found.map(|group_id| {
            debug!("Found security group {} ({})", self.group_name, group_id);
            Properties::new()
                .with("group_id", group_id)
                .with("group_name", self.group_name.clone())
        }))
    }

    /// Grant declared inbound rules a reused group is missing, e.g. after a
    /// run that failed between creating the group and authorizing ingress
    async fn reconcile(
        &self,
        ctx: &RunContext,
        found: Properties,
    ) -> Result<Properties, DeployError> {
        let group_id = found
            .get("group_id")
            .ok_or_else(|| DeployError::missing(&self.name, "group_id"))?;
        let existing = ctx.ec2.ingress_rules(group_id).await?;
        let missing = self.rules.missing_ingress(&existing);
        if !missing.is_empty() {
            warn!(
                "Security group {} lacks {} declared ingress rules; authorizing them",
                self.group_name,
                missing.len()
            );
            ctx.ec2.authorize_ingress(group_id, &missing).await?;
        }
        Ok(found)
    }

    async fn create(&self, ctx: &RunContext) -> Result<Properties, DeployError> {
        self.rules.validate()?;
        info!(
            "Creating security group {} with {} ingress / {} egress rules",
            self.group_name,
            self.rules.ingress.len(),
            self.rules.egress.len()
        );
        let group_id = ctx
            .ec2
            .create_security_group(&self.group_name, &self.stack, &self.rules)
            .await?;
        Ok(Properties::new()
            .with("group_id", group_id)
            .with("group_name", self.group_name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use crate::config::rules::SSH_PORT;
    use crate::exec::mock::ScriptedRunner;
    use crate::graph::TriggerToken;
    use crate::provider::mock::MockEc2;
    use crate::provider::{AwsCli, Ec2Api};
    use std::sync::Arc;

    fn group() -> SecurityGroup {
        SecurityGroup {
            name: "ec2-runner-sg".to_string(),
            group_name: "dev-ec2-runner-sg".to_string(),
            stack: "dev".to_string(),
            rules: RuleSet::default(),
        }
    }

    #[tokio::test]
    async fn test_reconcile_grants_missing_ingress() {
        let ec2 = Arc::new(MockEc2::new());
        let ssh_only = RuleSet {
            ingress: vec![RuleSet::default().ingress[0].clone()],
            ..RuleSet::default()
        };
        ec2.create_security_group("dev-ec2-runner-sg", "dev", &ssh_only)
            .await
            .unwrap();
        let ctx = RunContext::new(ec2.clone(), Arc::new(ScriptedRunner::new()), TriggerToken::fresh());

        let found = group().lookup(&ctx).await.unwrap().unwrap();
        group().reconcile(&ctx, found).await.unwrap();

        let ingress = ec2.group_rules("dev-ec2-runner-sg").unwrap().ingress;
        assert_eq!(ingress.len(), 3);
        assert!(ingress.iter().any(|r| r.covers(53, Protocol::Udp)));
        assert_eq!(ec2.count("authorize_ingress"), 1);
    }

    #[tokio::test]
    async fn test_reconcile_leaves_complete_group_alone() {
        let ec2 = Arc::new(MockEc2::new());
        ec2.create_security_group("dev-ec2-runner-sg", "dev", &RuleSet::default())
            .await
            .unwrap();
        let ctx = RunContext::new(ec2.clone(), Arc::new(ScriptedRunner::new()), TriggerToken::fresh());

        let found = group().lookup(&ctx).await.unwrap().unwrap();
        let recorded = group().reconcile(&ctx, found.clone()).await.unwrap();
        assert_eq!(recorded, found);
        assert_eq!(ec2.count("authorize_ingress"), 0);
    }

    #[tokio::test]
    async fn test_ingress_failure_then_rerun_restores_ssh() {
        // First run: the group is created but granting ingress fails.
        let runner = Arc::new(
            ScriptedRunner::new()
                .respond("aws", Some("create-security-group"), r#"{"GroupId": "sg-1"}"#)
                .fail("aws", Some("authorize-security-group-ingress"), 254, "RequestLimitExceeded"),
        );
        let ctx = RunContext::new(
            Arc::new(AwsCli::new(runner.clone())),
            runner,
            TriggerToken::fresh(),
        );
        assert!(group().create(&ctx).await.is_err());

        // Second run finds the group by name with no inbound permissions.
        let runner = Arc::new(ScriptedRunner::new().respond(
            "aws",
            Some("describe-security-groups"),
            r#"{"SecurityGroups": [{"GroupId": "sg-1", "IpPermissions": []}]}"#,
        ));
        let ctx = RunContext::new(
            Arc::new(AwsCli::new(runner.clone())),
            runner.clone(),
            TriggerToken::fresh(),
        );
        let found = group().lookup(&ctx).await.unwrap().unwrap();
        assert_eq!(found.get("group_id"), Some("sg-1"));
        group().reconcile(&ctx, found).await.unwrap();

        let authorize = runner
            .calls_to("aws")
            .into_iter()
            .find(|c| c.args[1] == "authorize-security-group-ingress")
            .unwrap();
        assert!(authorize.args.windows(2).any(|w| w == ["--group-id", "sg-1"]));
        assert!(authorize.args[5].contains(&format!("\"FromPort\":{SSH_PORT}")));
    }
}
