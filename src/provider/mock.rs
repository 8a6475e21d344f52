//! In-memory EC2 for testing
//!
//! Keeps created groups, key pairs and instances in memory so a second run
//! against the same mock sees what the first run created.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;

use super::{Ec2Api, InstanceInfo, InstanceSpec};
use crate::DeployError;
use crate::config::{Rule, RuleSet};

#[derive(Default)]
struct State {
    groups: BTreeMap<String, (String, RuleSet)>,
    key_pairs: BTreeSet<String>,
    instances: Vec<(String, String, InstanceInfo)>,
    next_id: u32,
    calls: Vec<String>,
}

impl State {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:04}", self.next_id)
    }
}

/// Mock EC2 provider
///
/// # Example
/// ```
/// use ec2_runner_deploy::provider::mock::MockEc2;
///
/// let ec2 = MockEc2::new().with_failure("launch_instance", "InsufficientInstanceCapacity");
/// ```
#[derive(Default)]
pub struct MockEc2 {
    state: Mutex<State>,
    failures: BTreeMap<&'static str, String>,
    public_ip: Option<String>,
}

impl MockEc2 {
    pub fn new() -> Self {
        Self {
            public_ip: Some("203.0.113.10".to_string()),
            ..Default::default()
        }
    }

    /// Make one operation fail with `message`
    pub fn with_failure(mut self, operation: &'static str, message: &str) -> Self {
        self.failures.insert(operation, message.to_string());
        self
    }

    /// Address handed to launched instances (`None` for no public IP)
    pub fn with_public_ip(mut self, ip: Option<&str>) -> Self {
        self.public_ip = ip.map(str::to_string);
        self
    }

    /// Operations called so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// How many times an operation was called
    pub fn count(&self, operation: &str) -> usize {
        self.lock().calls.iter().filter(|c| *c == operation).count()
    }

    /// Rules a created group was given
    pub fn group_rules(&self, name: &str) -> Option<RuleSet> {
        self.lock().groups.get(name).map(|(_, r)| r.clone())
    }

    pub fn instance_count(&self) -> usize {
        self.lock().instances.len()
    }

    /// Put an instance into the stopped state, as the console would
    pub fn stop_instance(&self, instance_id: &str) {
        let mut state = self.lock();
        if let Some(entry) = state
            .instances
            .iter_mut()
            .find(|(_, _, info)| info.instance_id == instance_id)
        {
            entry.2.state = "stopped".to_string();
            entry.2.public_ip = None;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self, operation: &'static str) -> Result<std::sync::MutexGuard<'_, State>, DeployError> {
        let mut state = self.lock();
        state.calls.push(operation.to_string());
        match self.failures.get(operation) {
            Some(message) => Err(DeployError::Cloud(message.clone())),
            None => Ok(state),
        }
    }
}

#[async_trait]
impl Ec2Api for MockEc2 {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn find_security_group(&self, name: &str) -> Result<Option<String>, DeployError> {
        let state = self.enter("find_security_group")?;
        Ok(state.groups.get(name).map(|(id, _)| id.clone()))
    }

    async fn create_security_group(
        &self,
        name: &str,
        _stack: &str,
        rules: &RuleSet,
    ) -> Result<String, DeployError> {
        let mut state = self.enter("create_security_group")?;
        if state.groups.contains_key(name) {
            return Err(DeployError::Cloud(format!(
                "InvalidGroup.Duplicate: {name}"
            )));
        }
        let id = state.id("sg");
        state.groups.insert(name.to_string(), (id.clone(), rules.clone()));
        Ok(id)
    }

    async fn ingress_rules(&self, group_id: &str) -> Result<Vec<Rule>, DeployError> {
        let state = self.enter("ingress_rules")?;
        state
            .groups
            .values()
            .find(|(id, _)| id == group_id)
            .map(|(_, rules)| rules.ingress.clone())
            .ok_or_else(|| DeployError::Cloud(format!("InvalidGroup.NotFound: {group_id}")))
    }

    async fn authorize_ingress(&self, group_id: &str, rules: &[Rule]) -> Result<(), DeployError> {
        let mut state = self.enter("authorize_ingress")?;
        let (_, granted) = state
            .groups
            .values_mut()
            .find(|(id, _)| id == group_id)
            .ok_or_else(|| DeployError::Cloud(format!("InvalidGroup.NotFound: {group_id}")))?;
        granted.ingress.extend_from_slice(rules);
        Ok(())
    }

    async fn find_key_pair(&self, name: &str) -> Result<bool, DeployError> {
        let state = self.enter("find_key_pair")?;
        Ok(state.key_pairs.contains(name))
    }

    async fn import_key_pair(
        &self,
        name: &str,
        _stack: &str,
        public_key_path: &Path,
    ) -> Result<String, DeployError> {
        let mut state = self.enter("import_key_pair")?;
        if !public_key_path.exists() {
            return Err(DeployError::Cloud(format!(
                "public key {} not found",
                public_key_path.display()
            )));
        }
        if !state.key_pairs.insert(name.to_string()) {
            return Err(DeployError::Cloud(format!(
                "InvalidKeyPair.Duplicate: {name}"
            )));
        }
        Ok(state.id("key"))
    }

    async fn find_instance(
        &self,
        name: &str,
        stack: &str,
    ) -> Result<Option<InstanceInfo>, DeployError> {
        let state = self.enter("find_instance")?;
        Ok(state
            .instances
            .iter()
            .find(|(n, s, _)| n == name && s == stack)
            .map(|(_, _, info)| info.clone()))
    }

    async fn wait_running(&self, instance_id: &str) -> Result<InstanceInfo, DeployError> {
        let mut state = self.enter("wait_running")?;
        let public_ip = self.public_ip.clone();
        let entry = state
            .instances
            .iter_mut()
            .find(|(_, _, info)| info.instance_id == instance_id)
            .ok_or_else(|| DeployError::Cloud(format!("instance {instance_id} not found")))?;
        entry.2.state = "running".to_string();
        entry.2.public_ip = public_ip;
        Ok(entry.2.clone())
    }

    async fn start_instance(&self, instance_id: &str) -> Result<InstanceInfo, DeployError> {
        let mut state = self.enter("start_instance")?;
        let public_ip = self.public_ip.clone();
        let entry = state
            .instances
            .iter_mut()
            .find(|(_, _, info)| info.instance_id == instance_id)
            .ok_or_else(|| DeployError::Cloud(format!("instance {instance_id} not found")))?;
        entry.2.state = "running".to_string();
        entry.2.public_ip = public_ip;
        Ok(entry.2.clone())
    }

    async fn launch_instance(&self, spec: &InstanceSpec) -> Result<InstanceInfo, DeployError> {
        let mut state = self.enter("launch_instance")?;
        if !state.key_pairs.contains(&spec.key_name) {
            return Err(DeployError::Cloud(format!(
                "InvalidKeyPair.NotFound: {}",
                spec.key_name
            )));
        }
        if !state.groups.values().any(|(id, _)| *id == spec.security_group_id) {
            return Err(DeployError::Cloud(format!(
                "InvalidGroup.NotFound: {}",
                spec.security_group_id
            )));
        }
        let info = InstanceInfo {
            instance_id: state.id("i"),
            state: "running".to_string(),
            public_ip: self.public_ip.clone(),
            image: Some(spec.image.clone()),
            instance_type: Some(spec.instance_type.clone()),
        };
        state
            .instances
            .push((spec.name.clone(), spec.stack.clone(), info.clone()));
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_created_group_is_found_again() {
        let ec2 = MockEc2::new();
        let id = ec2
            .create_security_group("g", "dev", &RuleSet::default())
            .await
            .unwrap();
        assert_eq!(ec2.find_security_group("g").await.unwrap(), Some(id));
        assert!(ec2.group_rules("g").unwrap().has_ssh_ingress());
    }

    #[tokio::test]
    async fn test_authorize_ingress_extends_group() {
        let ec2 = MockEc2::new();
        let bare = RuleSet {
            ingress: Vec::new(),
            ..RuleSet::default()
        };
        let id = ec2.create_security_group("g", "dev", &bare).await.unwrap();
        assert!(ec2.ingress_rules(&id).await.unwrap().is_empty());

        ec2.authorize_ingress(&id, &RuleSet::default().ingress)
            .await
            .unwrap();
        assert_eq!(ec2.ingress_rules(&id).await.unwrap().len(), 3);
        assert!(ec2.ingress_rules("sg-missing").await.is_err());
    }

    #[tokio::test]
    async fn test_launch_requires_key_and_group() {
        let ec2 = MockEc2::new();
        let spec = InstanceSpec {
            name: "vm".to_string(),
            stack: "dev".to_string(),
            image: "ami-1".to_string(),
            instance_type: "t2.micro".to_string(),
            key_name: "missing".to_string(),
            security_group_id: "sg-x".to_string(),
        };
        assert!(ec2.launch_instance(&spec).await.is_err());
        assert_eq!(ec2.instance_count(), 0);
    }

    #[tokio::test]
    async fn test_configured_failure() {
        let ec2 = MockEc2::new().with_failure("find_key_pair", "throttled");
        let err = ec2.find_key_pair("k").await.unwrap_err();
        assert!(err.to_string().contains("throttled"));
        assert_eq!(ec2.count("find_key_pair"), 1);
    }
}
