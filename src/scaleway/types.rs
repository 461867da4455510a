//! Wire types for the Scaleway Instances, IAM and VPC APIs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::backend::{InstanceSnapshot, OperationStatus, Tag, VolumeSnapshot};
use crate::security::{ANY_SOURCE, Protocol, SecurityRule};

/// Prefix of the instance tag Scaleway turns into an authorised SSH key.
pub(super) const AUTHORIZED_KEY_TAG: &str = "AUTHORIZED_KEY=";

#[derive(Clone, Debug, Deserialize)]
pub(super) struct Address {
    pub address: String,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct VolumeRef {
    pub id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct Server {
    pub id: String,
    pub name: String,
    pub state: String,
    #[serde(default)]
    pub public_ip: Option<Address>,
    #[serde(default)]
    pub public_ips: Option<Vec<Address>>,
    #[serde(default)]
    pub private_ip: Option<String>,
    #[serde(default)]
    pub volumes: Option<BTreeMap<String, VolumeRef>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

impl From<Server> for InstanceSnapshot {
    fn from(server: Server) -> Self {
        let public_ip = server
            .public_ip
            .map(|ip| ip.address)
            .or_else(|| {
                server
                    .public_ips
                    .unwrap_or_default()
                    .into_iter()
                    .next()
                    .map(|ip| ip.address)
            })
            .filter(|address| !address.is_empty());
        let volume_id = server
            .volumes
            .unwrap_or_default()
            .remove("0")
            .map(|volume| volume.id);
        Self {
            id: server.id,
            name: server.name,
            status: server.state,
            public_ip,
            private_ip: server.private_ip.filter(|address| !address.is_empty()),
            volume_id,
            tags: server.tags.unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
pub(super) struct ServerResponse {
    pub server: Server,
}

#[derive(Deserialize)]
pub(super) struct ServersResponse {
    #[serde(default)]
    pub servers: Vec<Server>,
}

/// Boot volume entry of a creation request.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub(super) enum ServerVolume {
    New {
        name: String,
        size: u64,
        volume_type: String,
    },
    Existing {
        id: String,
    },
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub(super) struct CreateServerRequest {
    pub name: String,
    pub commercial_type: String,
    pub image: String,
    pub project: String,
    pub volumes: BTreeMap<String, ServerVolume>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub dynamic_ip_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_group: Option<String>,
}

#[derive(Serialize)]
pub(super) struct UpdateTagsRequest<'a> {
    pub tags: &'a [String],
}

#[derive(Serialize)]
pub(super) struct ActionRequest<'a> {
    pub action: &'a str,
}

#[derive(Serialize)]
pub(super) struct PrivateNicRequest<'a> {
    pub private_network_id: &'a str,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct Task {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl Task {
    pub(super) fn operation_status(&self) -> OperationStatus {
        match self.status.as_str() {
            "success" => OperationStatus::Done,
            "failure" => OperationStatus::Failed(
                self.description
                    .clone()
                    .filter(|text| !text.is_empty())
                    .unwrap_or_else(|| format!("task {} failed", self.id)),
            ),
            _ => OperationStatus::Pending,
        }
    }
}

#[derive(Deserialize)]
pub(super) struct TaskResponse {
    pub task: Task,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct Volume {
    pub id: String,
    pub name: String,
}

impl From<Volume> for VolumeSnapshot {
    fn from(volume: Volume) -> Self {
        Self {
            id: volume.id,
            name: volume.name,
        }
    }
}

#[derive(Deserialize)]
pub(super) struct VolumesResponse {
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct SecurityGroupEntry {
    pub id: String,
    pub name: String,
}

#[derive(Deserialize)]
pub(super) struct SecurityGroupsResponse {
    #[serde(default)]
    pub security_groups: Vec<SecurityGroupEntry>,
}

#[derive(Deserialize)]
pub(super) struct SecurityGroupResponse {
    pub security_group: SecurityGroupEntry,
}

#[derive(Serialize)]
pub(super) struct CreateSecurityGroupRequest<'a> {
    pub name: &'a str,
    pub project: &'a str,
    pub description: String,
    pub stateful: bool,
    pub inbound_default_policy: &'a str,
    pub outbound_default_policy: &'a str,
}

/// Security group rule as reported and accepted by the API.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub(super) struct Rule {
    pub protocol: String,
    pub direction: String,
    pub action: String,
    pub ip_range: String,
    #[serde(default)]
    pub dest_port_from: Option<u16>,
    #[serde(default)]
    pub dest_port_to: Option<u16>,
}

impl Rule {
    pub(super) fn inbound(rule: &SecurityRule) -> Self {
        Self {
            protocol: rule.protocol.as_str().to_ascii_uppercase(),
            direction: String::from("inbound"),
            action: String::from("accept"),
            ip_range: rule.source_range.clone(),
            dest_port_from: Some(rule.port),
            dest_port_to: None,
        }
    }

    /// Converts an accepting inbound rule; everything else is ignored.
    ///
    /// Port ranges expand to one rule per port so that coverage checks see
    /// each opened port.
    pub(super) fn into_security_rules(self) -> Vec<SecurityRule> {
        if self.direction != "inbound" || self.action != "accept" {
            return Vec::new();
        }
        let Ok(protocol) = self.protocol.parse::<Protocol>() else {
            return Vec::new();
        };
        let Some(from) = self.dest_port_from else {
            return Vec::new();
        };
        let to = self.dest_port_to.filter(|to| *to >= from).unwrap_or(from);
        let source_range = if self.ip_range.is_empty() {
            ANY_SOURCE.to_owned()
        } else {
            self.ip_range
        };
        (from..=to)
            .map(|port| SecurityRule {
                protocol,
                port,
                source_range: source_range.clone(),
            })
            .collect()
    }
}

#[derive(Deserialize)]
pub(super) struct RulesResponse {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct SshKey {
    pub id: String,
    pub name: String,
}

#[derive(Deserialize)]
pub(super) struct SshKeysResponse {
    #[serde(default)]
    pub ssh_keys: Vec<SshKey>,
}

#[derive(Serialize)]
pub(super) struct CreateSshKeyRequest<'a> {
    pub name: &'a str,
    pub public_key: &'a str,
    pub project_id: &'a str,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct PrivateNetwork {
    pub id: String,
    pub name: String,
}

#[derive(Deserialize)]
pub(super) struct PrivateNetworksResponse {
    #[serde(default)]
    pub private_networks: Vec<PrivateNetwork>,
}

/// Flattens key/value tags into the `key=value` strings Scaleway stores.
pub(super) fn tag_strings(tags: &[Tag]) -> impl Iterator<Item = String> + '_ {
    tags.iter().map(|tag| {
        if tag.value.is_empty() {
            tag.key.clone()
        } else {
            format!("{}={}", tag.key, tag.value)
        }
    })
}

/// Tag that authorises `public_key` on the next boot.
///
/// Scaleway tags cannot hold spaces, so they are replaced by underscores.
pub(super) fn authorized_key_tag(public_key: &str) -> String {
    format!("{AUTHORIZED_KEY_TAG}{}", public_key.trim().replace(' ', "_"))
}

/// Appends `extra` to `current`, skipping tags already present.
pub(super) fn merge_tags(current: &[String], extra: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut merged = current.to_vec();
    for tag in extra {
        if !merged.contains(&tag) {
            merged.push(tag);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn rule(protocol: &str, from: Option<u16>, to: Option<u16>) -> Rule {
        Rule {
            protocol: protocol.to_owned(),
            direction: String::from("inbound"),
            action: String::from("accept"),
            ip_range: String::from("0.0.0.0/0"),
            dest_port_from: from,
            dest_port_to: to,
        }
    }

    #[test]
    fn servers_become_snapshots() {
        let json = r#"{
            "id": "srv-1",
            "name": "web-1",
            "state": "stopped in place",
            "public_ip": null,
            "public_ips": [{"address": "51.15.0.9"}],
            "private_ip": "",
            "volumes": {"0": {"id": "vol-1"}},
            "tags": ["hostwright"]
        }"#;
        let server: Server =
            serde_json::from_str(json).unwrap_or_else(|err| panic!("decode server: {err}"));

        let snapshot = InstanceSnapshot::from(server);

        assert_eq!(snapshot.public_ip.as_deref(), Some("51.15.0.9"));
        assert_eq!(snapshot.private_ip, None);
        assert_eq!(snapshot.volume_id.as_deref(), Some("vol-1"));
        assert_eq!(snapshot.status, "stopped in place");
        assert_eq!(snapshot.tags, vec![String::from("hostwright")]);
    }

    #[rstest]
    #[case("pending", OperationStatus::Pending)]
    #[case("started", OperationStatus::Pending)]
    #[case("success", OperationStatus::Done)]
    #[case("failure", OperationStatus::Failed(String::from("quota exceeded")))]
    fn task_statuses_map_to_operations(#[case] status: &str, #[case] expected: OperationStatus) {
        let task = Task {
            id: String::from("task-1"),
            status: status.to_owned(),
            description: Some(String::from("quota exceeded")),
        };

        assert_eq!(task.operation_status(), expected);
    }

    #[test]
    fn port_ranges_expand_into_single_port_rules() {
        let rules = rule("TCP", Some(2376), Some(2377)).into_security_rules();

        assert_eq!(
            rules,
            vec![
                SecurityRule::open(Protocol::Tcp, 2376),
                SecurityRule::open(Protocol::Tcp, 2377),
            ]
        );
    }

    #[rstest]
    #[case(rule("ANY", Some(22), None))]
    #[case(rule("TCP", None, None))]
    #[case(Rule { direction: String::from("outbound"), ..rule("TCP", Some(22), None) })]
    #[case(Rule { action: String::from("drop"), ..rule("TCP", Some(22), None) })]
    fn non_accepting_or_portless_rules_are_ignored(#[case] ignored: Rule) {
        assert!(ignored.into_security_rules().is_empty());
    }

    #[test]
    fn inbound_rules_use_uppercase_protocols() {
        let json = serde_json::to_value(Rule::inbound(&SecurityRule::open(Protocol::Udp, 4789)))
            .unwrap_or_else(|err| panic!("encode rule: {err}"));

        assert_eq!(json["protocol"], "UDP");
        assert_eq!(json["dest_port_from"], 4789);
        assert_eq!(json["direction"], "inbound");
    }

    #[test]
    fn creation_requests_describe_retained_volumes_by_id() {
        let request = CreateServerRequest {
            name: String::from("web-1"),
            commercial_type: String::from("DEV1-S"),
            image: String::from("img-1"),
            project: String::from("proj"),
            volumes: BTreeMap::from([(
                String::from("0"),
                ServerVolume::Existing {
                    id: String::from("vol-1"),
                },
            )]),
            tags: Vec::new(),
            dynamic_ip_required: true,
            security_group: None,
        };

        let json =
            serde_json::to_value(&request).unwrap_or_else(|err| panic!("encode request: {err}"));

        assert_eq!(json["volumes"]["0"], serde_json::json!({"id": "vol-1"}));
        assert!(json.get("tags").is_none());
        assert!(json.get("security_group").is_none());
    }

    #[test]
    fn key_tags_replace_spaces_and_merging_skips_duplicates() {
        let tag = authorized_key_tag("ssh-ed25519 AAAA me@host\n");
        assert_eq!(tag, "AUTHORIZED_KEY=ssh-ed25519_AAAA_me@host");

        let merged = merge_tags(
            &[String::from("hostwright")],
            [String::from("hostwright"), String::from("env=prod")],
        );
        assert_eq!(merged, vec![String::from("hostwright"), String::from("env=prod")]);
    }

    #[test]
    fn empty_tag_values_keep_the_bare_key() {
        let tags = [Tag::new("env", "prod"), Tag::new("canary", "")];

        assert_eq!(
            tag_strings(&tags).collect::<Vec<_>>(),
            vec![String::from("env=prod"), String::from("canary")]
        );
    }
}
