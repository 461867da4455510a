//! Security rule model and additive firewall reconciliation.
//!
//! The reconciler only ever appends rules. Rules it did not create, and rules
//! that are no longer desired, are left exactly as the backend reports them.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{Classify, ComputeBackend, SecurityGroup, SecurityGroupSpec};
use crate::error::{DriverError, PreconditionError};
use crate::poller::{WaitContext, settle};

/// Source range applied to every rule the reconciler adds.
pub const ANY_SOURCE: &str = "0.0.0.0/0";

/// Transport protocol of a rule.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
    /// ICMP.
    Icmp,
}

impl Protocol {
    /// Lowercase protocol name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = PortSpecError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "icmp" => Ok(Self::Icmp),
            other => Err(PortSpecError::Protocol(other.to_owned())),
        }
    }
}

/// Inbound access rule: `(protocol, port, source range)`.
#[derive(
    Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct SecurityRule {
    /// Transport protocol.
    pub protocol: Protocol,
    /// Destination port.
    pub port: u16,
    /// CIDR the rule admits traffic from.
    pub source_range: String,
}

impl SecurityRule {
    /// Rule admitting `port/protocol` from anywhere.
    #[must_use]
    pub fn open(protocol: Protocol, port: u16) -> Self {
        Self {
            protocol,
            port,
            source_range: ANY_SOURCE.to_owned(),
        }
    }

    /// Whether this rule already opens the port `other` asks for.
    ///
    /// Source ranges are not compared: an existing narrower rule on the same
    /// port counts as opened and is never widened.
    #[must_use]
    pub fn covers(&self, other: &Self) -> bool {
        self.protocol == other.protocol && self.port == other.port
    }
}

impl fmt::Display for SecurityRule {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}/{}", self.port, self.protocol)
    }
}

/// Errors raised when parsing `port[/protocol]` specifications.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PortSpecError {
    /// The port string was blank.
    #[error("empty port specification")]
    Empty,
    /// The port was not a number between 1 and 65535.
    #[error("invalid port in {0:?}")]
    Port(String),
    /// The protocol was not tcp, udp or icmp.
    #[error("unsupported protocol {0:?}; expected tcp, udp or icmp")]
    Protocol(String),
}

/// Parses `port[/protocol]`, defaulting the protocol to TCP.
///
/// # Errors
///
/// Returns [`PortSpecError`] for blank input, unparsable ports and unknown
/// protocols.
pub fn parse_port_spec(spec: &str) -> Result<SecurityRule, PortSpecError> {
    let trimmed = spec.trim();
    if trimmed.is_empty() {
        return Err(PortSpecError::Empty);
    }
    let (raw_port, protocol) = match trimmed.split_once('/') {
        Some((head, tail)) => (head, tail.parse()?),
        None => (trimmed, Protocol::Tcp),
    };
    let port = raw_port
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|value| *value != 0)
        .ok_or_else(|| PortSpecError::Port(trimmed.to_owned()))?;
    Ok(SecurityRule::open(protocol, port))
}

/// How the reconciler treats the security group.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FirewallMode {
    /// Create the group if needed and append missing rules.
    #[default]
    Managed,
    /// Report missing rules without mutating anything.
    ReadOnly,
    /// Do not touch the firewall at all.
    Skip,
}

/// Desired firewall state for one host.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FirewallIntent {
    /// Security group name.
    pub group: String,
    /// Network the group belongs to: a resource path or a name to resolve.
    pub network: Option<String>,
    /// Instance tag the group targets.
    pub target_tag: String,
    /// Rules that must be open.
    pub rules: Vec<SecurityRule>,
    /// Reconciliation mode.
    pub mode: FirewallMode,
}

/// Builds the desired rule set: the control port, the cluster port when
/// enabled, then every user-supplied rule. Duplicates are dropped.
#[must_use]
pub fn desired_rules(
    control_port: u16,
    cluster_port: Option<u16>,
    open_ports: &[SecurityRule],
) -> Vec<SecurityRule> {
    let mut rules = BTreeSet::new();
    rules.insert(SecurityRule::open(Protocol::Tcp, control_port));
    if let Some(port) = cluster_port {
        rules.insert(SecurityRule::open(Protocol::Tcp, port));
    }
    rules.extend(open_ports.iter().cloned());
    rules.into_iter().collect()
}

/// Returns the desired rules that no actual rule covers, grouped by
/// protocol and ordered by port within each group.
#[must_use]
pub fn missing_rules(actual: &[SecurityRule], desired: &[SecurityRule]) -> Vec<SecurityRule> {
    let missing: BTreeSet<SecurityRule> = desired
        .iter()
        .filter(|wanted| !actual.iter().any(|rule| rule.covers(wanted)))
        .cloned()
        .collect();
    missing.into_iter().collect()
}

/// Whether `network` already names a resource path rather than a bare name.
#[must_use]
pub fn is_resource_path(network: &str) -> bool {
    network.contains("/networks/") || network.contains("/private-networks/")
}

/// Resolves a configured network to its canonical resource path.
///
/// # Errors
///
/// Returns [`PreconditionError::NoUsableNetwork`] when the backend does not
/// know the network, or [`DriverError::Backend`] for other lookup failures.
pub async fn resolve_network_target<B>(
    backend: &B,
    network: &str,
) -> Result<String, DriverError<B::Error>>
where
    B: ComputeBackend + ?Sized,
{
    if is_resource_path(network) {
        return Ok(network.to_owned());
    }
    match backend.resolve_network(network).await {
        Ok(path) => Ok(path),
        Err(err) if err.is_not_found() => Err(PreconditionError::NoUsableNetwork {
            network: network.to_owned(),
        }
        .into()),
        Err(err) => Err(DriverError::Backend(err)),
    }
}

/// Outcome of one reconciliation pass.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReconcileReport {
    /// Identifier of the security group, when one exists.
    pub group_id: Option<String>,
    /// Rules appended during this pass.
    pub added: Vec<SecurityRule>,
    /// Rules still missing after this pass (read-only mode only).
    pub missing: Vec<SecurityRule>,
}

/// Converges the backend's security group towards `intent.rules`.
///
/// At most one rule-creation call is issued, and none when nothing is
/// missing. A missing group is created and awaited first.
///
/// # Errors
///
/// Returns [`DriverError`] when a lookup, creation or wait fails.
pub async fn reconcile<B>(
    backend: &B,
    intent: &FirewallIntent,
    context: &WaitContext<'_>,
) -> Result<ReconcileReport, DriverError<B::Error>>
where
    B: ComputeBackend + ?Sized,
{
    if intent.mode == FirewallMode::Skip {
        info!(group = %intent.group, "skipping firewall reconciliation");
        return Ok(ReconcileReport::default());
    }

    let existing = backend
        .security_group(&intent.group)
        .await
        .map_err(DriverError::Backend)?;
    let group = match existing {
        Some(group) => group,
        None if intent.mode == FirewallMode::ReadOnly => {
            warn!(group = %intent.group, "security group is absent and read-only mode forbids creating it");
            return Ok(ReconcileReport {
                group_id: None,
                added: Vec::new(),
                missing: intent.rules.clone(),
            });
        }
        None => create_group(backend, intent, context).await?,
    };

    let missing = missing_rules(&group.rules, &intent.rules);
    if missing.is_empty() {
        debug!(group = %group.name, "security group already satisfies desired rules");
        return Ok(ReconcileReport {
            group_id: Some(group.id),
            ..ReconcileReport::default()
        });
    }

    if intent.mode == FirewallMode::ReadOnly {
        warn!(
            group = %group.name,
            missing = %render(&missing),
            "security group is missing rules; read-only mode leaves them to the group owner"
        );
        return Ok(ReconcileReport {
            group_id: Some(group.id),
            added: Vec::new(),
            missing,
        });
    }

    info!(group = %group.name, rules = %render(&missing), "opening ports");
    let operation = backend
        .add_security_rules(&group.id, &missing)
        .await
        .map_err(DriverError::Backend)?;
    settle(backend, context, &operation)
        .await
        .map_err(|err| DriverError::from_poll("add security rules", err))?;

    Ok(ReconcileReport {
        group_id: Some(group.id),
        added: missing,
        missing: Vec::new(),
    })
}

async fn create_group<B>(
    backend: &B,
    intent: &FirewallIntent,
    context: &WaitContext<'_>,
) -> Result<SecurityGroup, DriverError<B::Error>>
where
    B: ComputeBackend + ?Sized,
{
    let network = match intent.network.as_deref() {
        Some(network) => Some(resolve_network_target(backend, network).await?),
        None => None,
    };
    let spec = SecurityGroupSpec {
        name: intent.group.clone(),
        network,
        target_tag: intent.target_tag.clone(),
    };
    let created = backend
        .create_security_group(&spec)
        .await
        .map_err(DriverError::Backend)?;
    info!(group = %created.name, id = %created.id, "created security group");

    context
        .readiness
        .until(context.cancel, || backend.security_group(&intent.group))
        .await
        .map_err(|err| DriverError::from_poll("create security group", err))
}

fn render(rules: &[SecurityRule]) -> String {
    rules
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
