//! Server creation, power actions, tasks and tags.

use std::collections::BTreeMap;

use tracing::{debug, info};

use super::types::{
    ActionRequest, CreateServerRequest, PrivateNicRequest, Server, ServerResponse, ServerVolume,
    ServersResponse, TaskResponse, UpdateTagsRequest, Volume, VolumesResponse, merge_tags,
    tag_strings,
};
use super::{ScalewayBackend, ScalewayBackendError};
use crate::backend::{
    Classify, InstanceRef, InstanceSpec, Operation, OperationStatus, VolumeSpec,
};
use crate::state::{CanonicalState, normalize_status};

const BYTES_PER_GB: u64 = 1_000_000_000;

/// Root volume slot in a server's volume map.
const ROOT_VOLUME: &str = "0";

impl ScalewayBackend {
    pub(super) async fn find_server(
        &self,
        instance: &InstanceRef,
    ) -> Result<Option<Server>, ScalewayBackendError> {
        match instance {
            InstanceRef::Id(id) => {
                match self
                    .get::<ServerResponse>(&self.instance_url(&format!("servers/{id}")))
                    .await
                {
                    Ok(found) => Ok(Some(found.server)),
                    Err(err) if err.is_not_found() => Ok(None),
                    Err(err) => Err(err),
                }
            }
            InstanceRef::Name(name) => {
                let found: ServersResponse = self
                    .list(
                        &self.instance_url("servers"),
                        &[("name", name.as_str()), ("project", self.project.as_str())],
                    )
                    .await?;
                // The API matches names by prefix.
                Ok(found.servers.into_iter().find(|server| server.name == *name))
            }
        }
    }

    pub(super) async fn find_volume(
        &self,
        name: &str,
    ) -> Result<Option<Volume>, ScalewayBackendError> {
        let found: VolumesResponse = self
            .list(
                &self.instance_url("volumes"),
                &[("name", name), ("project", self.project.as_str())],
            )
            .await?;
        Ok(found.volumes.into_iter().find(|volume| volume.name == name))
    }

    /// Creates the server, uploads its user data, attaches its private
    /// network and powers it on. The returned operation tracks the power-on
    /// task.
    pub(super) async fn create_server(
        &self,
        spec: &InstanceSpec,
    ) -> Result<Operation, ScalewayBackendError> {
        let image = self.resolve_image(&spec.image).await?;
        let request = creation_request(spec, image, &self.project);
        let created: ServerResponse = self
            .post(&self.instance_url("servers"), &request)
            .await?;
        let server_id = created.server.id;
        info!(server_id = %server_id, name = %spec.name, "server created");

        for (key, value) in &spec.metadata {
            self.patch_text(
                &self.instance_url(&format!("servers/{server_id}/user_data/{key}")),
                value,
            )
            .await?;
            debug!(server_id = %server_id, key = %key, "user data uploaded");
        }

        if let Some(network_id) = spec.network.as_deref().and_then(private_network_id) {
            let _nic: serde_json::Value = self
                .post(
                    &self.instance_url(&format!("servers/{server_id}/private_nics")),
                    &PrivateNicRequest {
                        private_network_id: network_id,
                    },
                )
                .await?;
            debug!(server_id = %server_id, network_id, "private network attached");
        }

        self.server_action(&server_id, "poweron").await
    }

    pub(super) async fn server_action(
        &self,
        id: &str,
        action: &str,
    ) -> Result<Operation, ScalewayBackendError> {
        let response: TaskResponse = self
            .post(
                &self.instance_url(&format!("servers/{id}/action")),
                &ActionRequest { action },
            )
            .await?;
        debug!(server_id = id, action, task_id = %response.task.id, "action submitted");
        Ok(Operation::pending(response.task.id, id))
    }

    /// Deletes a stopped server directly, which keeps its volumes. Any other
    /// server is terminated, which also releases its local volumes.
    pub(super) async fn delete_server(&self, id: &str) -> Result<Operation, ScalewayBackendError> {
        let server = self
            .find_server(&InstanceRef::Id(id.to_owned()))
            .await?
            .ok_or_else(|| ScalewayBackendError::NotFound {
                resource: "server",
                name: id.to_owned(),
            })?;
        if normalize_status(&server.state) == CanonicalState::Stopped {
            self.delete(&self.instance_url(&format!("servers/{id}")))
                .await?;
            return Ok(Operation::completed(id));
        }
        self.server_action(id, "terminate").await
    }

    pub(super) async fn task_status(
        &self,
        operation: &Operation,
    ) -> Result<OperationStatus, ScalewayBackendError> {
        if operation.id.is_empty() {
            return Ok(operation.status.clone());
        }
        let response: TaskResponse = self
            .get(&self.instance_url(&format!("tasks/{}", operation.id)))
            .await?;
        Ok(response.task.operation_status())
    }

    /// Adds `extra` to the server's tags. Scaleway replaces the whole list on
    /// update, so the current tags are read first.
    pub(super) async fn append_tags(
        &self,
        id: &str,
        extra: impl IntoIterator<Item = String> + Send,
    ) -> Result<(), ScalewayBackendError> {
        let additions: Vec<String> = extra.into_iter().collect();
        let server = self
            .find_server(&InstanceRef::Id(id.to_owned()))
            .await?
            .ok_or_else(|| ScalewayBackendError::NotFound {
                resource: "server",
                name: id.to_owned(),
            })?;
        let current = server.tags.unwrap_or_default();
        let merged = merge_tags(&current, additions);
        if merged.len() == current.len() {
            return Ok(());
        }
        self.patch(
            &self.instance_url(&format!("servers/{id}")),
            &UpdateTagsRequest { tags: &merged },
        )
        .await
    }
}

fn creation_request(spec: &InstanceSpec, image: String, project: &str) -> CreateServerRequest {
    let volume = match &spec.volume {
        VolumeSpec::Create {
            name,
            size_gb,
            volume_type,
        } => ServerVolume::New {
            name: name.clone(),
            size: u64::from(*size_gb).saturating_mul(BYTES_PER_GB),
            volume_type: volume_type.clone(),
        },
        VolumeSpec::Existing { id } => ServerVolume::Existing { id: id.clone() },
    };
    // Scaleway has no labels; they travel as `key=value` tags.
    let labels = spec
        .labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"));
    let tags = merge_tags(
        &spec.network_tags,
        tag_strings(&spec.tags).chain(labels),
    );
    CreateServerRequest {
        name: spec.name.clone(),
        commercial_type: spec.machine_type.clone(),
        image,
        project: project.to_owned(),
        volumes: BTreeMap::from([(ROOT_VOLUME.to_owned(), volume)]),
        tags,
        dynamic_ip_required: spec.public_address,
        security_group: spec.security_group_id.clone(),
    }
}

/// Extracts the identifier from `regions/<region>/private-networks/<id>`.
fn private_network_id(path: &str) -> Option<&str> {
    path.rsplit_once("/private-networks/")
        .map(|(_, id)| id)
        .filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Tag;
    use rstest::rstest;

    fn spec(volume: VolumeSpec) -> InstanceSpec {
        InstanceSpec {
            name: String::from("web-1"),
            zone: String::from("fr-par-1"),
            machine_type: String::from("DEV1-S"),
            image: String::from("ubuntu_noble"),
            network: None,
            security_group_id: Some(String::from("sg-1")),
            volume,
            tags: vec![Tag::new("env", "prod")],
            network_tags: vec![String::from("hostwright")],
            labels: BTreeMap::from([(String::from("team"), String::from("infra"))]),
            metadata: BTreeMap::new(),
            key_pair: None,
            preemptible: false,
            public_address: true,
        }
    }

    #[test]
    fn creation_requests_size_new_volumes_in_bytes() {
        let request = creation_request(
            &spec(VolumeSpec::Create {
                name: String::from("web-1-disk"),
                size_gb: 20,
                volume_type: String::from("l_ssd"),
            }),
            String::from("img-1"),
            "proj",
        );

        assert_eq!(
            request.volumes.get(ROOT_VOLUME),
            Some(&ServerVolume::New {
                name: String::from("web-1-disk"),
                size: 20_000_000_000,
                volume_type: String::from("l_ssd"),
            })
        );
        assert_eq!(
            request.tags,
            vec![
                String::from("hostwright"),
                String::from("env=prod"),
                String::from("team=infra"),
            ]
        );
        assert_eq!(request.security_group.as_deref(), Some("sg-1"));
        assert!(request.dynamic_ip_required);
    }

    #[rstest]
    #[case("regions/fr-par/private-networks/pn-1", Some("pn-1"))]
    #[case("regions/fr-par/private-networks/", None)]
    #[case("projects/p/global/networks/default", None)]
    fn extracts_private_network_ids(#[case] path: &str, #[case] expected: Option<&str>) {
        assert_eq!(private_network_id(path), expected);
    }
}
