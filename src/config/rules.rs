//! Firewall rule set
//!
//! Describes the inbound and outbound rules attached to the runner's
//! security group. The defaults open SSH and DNS inbound and everything
//! outbound.

use serde::{Deserialize, Serialize};

use crate::DeployError;

/// Port the transfer and install steps connect to
pub const SSH_PORT: u16 = 22;

/// Traffic direction of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ingress,
    Egress,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ingress => write!(f, "ingress"),
            Self::Egress => write!(f, "egress"),
        }
    }
}

/// IP protocol of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    /// Every protocol (`-1` in the EC2 API)
    #[serde(alias = "-1")]
    All,
}

impl Protocol {
    /// Protocol identifier as the EC2 API spells it
    pub fn as_ec2(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::All => "-1",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
            Self::All => write!(f, "all"),
        }
    }
}

/// A single firewall rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub description: Option<String>,
    pub from_port: u16,
    pub to_port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub cidr_blocks: Vec<String>,
    #[serde(default)]
    pub ipv6_cidr_blocks: Vec<String>,
}

impl Rule {
    /// Rule open to any IPv4 source for a single port
    pub fn open_port(description: &str, port: u16, protocol: Protocol) -> Self {
        Self {
            description: Some(description.to_string()),
            from_port: port,
            to_port: port,
            protocol,
            cidr_blocks: vec!["0.0.0.0/0".to_string()],
            ipv6_cidr_blocks: Vec::new(),
        }
    }

    /// Whether this rule admits `port` over `protocol`
    pub fn covers(&self, port: u16, protocol: Protocol) -> bool {
        match self.protocol {
            Protocol::All => true,
            p if p == protocol => self.from_port <= port && port <= self.to_port,
            _ => false,
        }
    }

    /// Whether the rule names at least one peer address range
    pub fn has_peer(&self) -> bool {
        !self.cidr_blocks.is_empty() || !self.ipv6_cidr_blocks.is_empty()
    }

    fn same_permission(&self, other: &Rule) -> bool {
        self.protocol == other.protocol
            && (self.protocol == Protocol::All
                || (self.from_port == other.from_port && self.to_port == other.to_port))
    }

    /// The part of this rule that `existing` does not grant yet
    ///
    /// Returns the rule narrowed to its missing address ranges, or `None`
    /// when every range is already present.
    pub fn missing_from(&self, existing: &[Rule]) -> Option<Rule> {
        let peers = existing
            .iter()
            .filter(|e| self.same_permission(e))
            .collect::<Vec<_>>();
        let cidr_blocks: Vec<String> = self
            .cidr_blocks
            .iter()
            .filter(|c| !peers.iter().any(|e| e.cidr_blocks.contains(*c)))
            .cloned()
            .collect();
        let ipv6_cidr_blocks: Vec<String> = self
            .ipv6_cidr_blocks
            .iter()
            .filter(|c| !peers.iter().any(|e| e.ipv6_cidr_blocks.contains(*c)))
            .cloned()
            .collect();

        if cidr_blocks.is_empty() && ipv6_cidr_blocks.is_empty() {
            return None;
        }
        Some(Rule {
            cidr_blocks,
            ipv6_cidr_blocks,
            ..self.clone()
        })
    }
}

/// Ordered inbound and outbound rules of a security group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSet {
    pub description: String,
    pub ingress: Vec<Rule>,
    pub egress: Vec<Rule>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            description: "SSH and DNS".to_string(),
            ingress: vec![
                Rule::open_port("SSH", SSH_PORT, Protocol::Tcp),
                Rule::open_port("DNS UDP", 53, Protocol::Udp),
                Rule::open_port("DNS TCP", 53, Protocol::Tcp),
            ],
            egress: vec![Rule {
                description: None,
                from_port: 0,
                to_port: 0,
                protocol: Protocol::All,
                cidr_blocks: vec!["0.0.0.0/0".to_string()],
                ipv6_cidr_blocks: vec!["::/0".to_string()],
            }],
        }
    }
}

impl RuleSet {
    /// All rules with their direction, ingress first
    pub fn iter(&self) -> impl Iterator<Item = (Direction, &Rule)> {
        self.ingress
            .iter()
            .map(|r| (Direction::Ingress, r))
            .chain(self.egress.iter().map(|r| (Direction::Egress, r)))
    }

    /// Declared inbound rules not granted by `existing`
    pub fn missing_ingress(&self, existing: &[Rule]) -> Vec<Rule> {
        self.ingress
            .iter()
            .filter_map(|r| r.missing_from(existing))
            .collect()
    }

    /// Whether some inbound rule lets SSH in from somewhere
    pub fn has_ssh_ingress(&self) -> bool {
        self.ingress
            .iter()
            .any(|r| r.has_peer() && r.covers(SSH_PORT, Protocol::Tcp))
    }

    /// Check the rule set before anything is provisioned
    pub fn validate(&self) -> Result<(), DeployError> {
        for (direction, rule) in self.iter() {
            if rule.protocol != Protocol::All && rule.from_port > rule.to_port {
                return Err(DeployError::RuleSet(format!(
                    "{} rule has from_port {} above to_port {}",
                    direction, rule.from_port, rule.to_port
                )));
            }
            if !rule.has_peer() {
                return Err(DeployError::RuleSet(format!(
                    "{} rule {}-{}/{} has no address ranges",
                    direction, rule.from_port, rule.to_port, rule.protocol
                )));
            }
        }

        if !self.has_ssh_ingress() {
            return Err(DeployError::RuleSet(format!(
                "no inbound rule admits tcp/{SSH_PORT}; the transfer and install steps could not connect"
            )));
        }

        Ok(())
    }
}
