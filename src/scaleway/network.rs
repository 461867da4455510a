//! Security groups and private networks.

use tracing::{debug, info};

use super::types::{
    CreateSecurityGroupRequest, PrivateNetworksResponse, Rule, RulesResponse,
    SecurityGroupResponse, SecurityGroupsResponse,
};
use super::{ScalewayBackend, ScalewayBackendError};
use crate::backend::{Operation, SecurityGroup, SecurityGroupSpec};
use crate::security::SecurityRule;

const RULES_PAGE_SIZE: &str = "100";

impl ScalewayBackend {
    pub(super) async fn find_security_group(
        &self,
        name: &str,
    ) -> Result<Option<SecurityGroup>, ScalewayBackendError> {
        let found: SecurityGroupsResponse = self
            .list(
                &self.instance_url("security_groups"),
                &[("name", name), ("project", self.project.as_str())],
            )
            .await?;
        let Some(group) = found
            .security_groups
            .into_iter()
            .find(|group| group.name == name)
        else {
            return Ok(None);
        };

        let listed: RulesResponse = self
            .list(
                &self.instance_url(&format!("security_groups/{}/rules", group.id)),
                &[("per_page", RULES_PAGE_SIZE)],
            )
            .await?;
        let rules = listed
            .rules
            .into_iter()
            .flat_map(Rule::into_security_rules)
            .collect();
        Ok(Some(SecurityGroup {
            id: group.id,
            name: group.name,
            rules,
        }))
    }

    /// Creates a stateful group. Scaleway groups are zonal, so the network
    /// of `spec` plays no part.
    pub(super) async fn post_security_group(
        &self,
        spec: &SecurityGroupSpec,
    ) -> Result<SecurityGroup, ScalewayBackendError> {
        let request = CreateSecurityGroupRequest {
            name: &spec.name,
            project: &self.project,
            description: format!("hostwright hosts tagged {}", spec.target_tag),
            stateful: true,
            inbound_default_policy: "accept",
            outbound_default_policy: "accept",
        };
        let created: SecurityGroupResponse = self
            .post(&self.instance_url("security_groups"), &request)
            .await?;
        info!(group = %created.security_group.name, group_id = %created.security_group.id, "security group created");
        Ok(SecurityGroup {
            id: created.security_group.id,
            name: created.security_group.name,
            rules: Vec::new(),
        })
    }

    /// Appends one API rule per requested rule.
    pub(super) async fn post_security_rules(
        &self,
        group_id: &str,
        rules: &[SecurityRule],
    ) -> Result<Operation, ScalewayBackendError> {
        let url = self.instance_url(&format!("security_groups/{group_id}/rules"));
        for rule in rules {
            let _created: serde_json::Value = self.post(&url, &Rule::inbound(rule)).await?;
            debug!(group_id, rule = %rule, "security rule added");
        }
        Ok(Operation::completed(group_id))
    }

    /// Resolves a private network name to `regions/<region>/private-networks/<id>`.
    pub(super) async fn private_network_path(
        &self,
        name: &str,
    ) -> Result<String, ScalewayBackendError> {
        let found: PrivateNetworksResponse = self
            .list(
                &self.vpc_url("private-networks"),
                &[("name", name), ("project_id", self.project.as_str())],
            )
            .await?;
        found
            .private_networks
            .into_iter()
            .find(|network| network.name == name)
            .map(|network| format!("regions/{}/private-networks/{}", self.region, network.id))
            .ok_or_else(|| ScalewayBackendError::NotFound {
                resource: "private network",
                name: name.to_owned(),
            })
    }
}
