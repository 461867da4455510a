//! Scaleway binding of the backend contract.
//!
//! Instances, volumes and security groups live in the zonal Instances API,
//! SSH keys in IAM and private networks in the regional VPC API. Tasks
//! returned by server actions are surfaced as pending operations; everything
//! else completes synchronously.

mod error;
mod http;
mod iam;
mod image;
mod network;
mod servers;
mod types;

use std::time::Duration;

use scaleway_rs::ScalewayApi;

use crate::backend::{
    BackendFuture, ComputeBackend, InstanceRef, InstanceSnapshot, InstanceSpec, Operation,
    OperationStatus, SecurityGroup, SecurityGroupSpec, Tag, VolumeSnapshot,
};
use crate::config::{HostConfig, ScalewayCredentials};
use crate::region;
use crate::security::SecurityRule;

pub use error::ScalewayBackendError;

/// Public API root used when no endpoint override is configured.
pub const SCALEWAY_API_BASE: &str = "https://api.scaleway.com";
/// Image architecture requested from the catalogue.
pub const DEFAULT_ARCHITECTURE: &str = "x86_64";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_TAGS_PER_CALL: usize = 25;

/// Backend that drives hosts through the Scaleway APIs.
#[derive(Clone)]
pub struct ScalewayBackend {
    api: ScalewayApi,
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
    project: String,
    zone: String,
    region: String,
    architecture: String,
}

impl ScalewayBackend {
    /// Builds a backend for the zone and project of `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayBackendError::Config`] when the credentials are
    /// incomplete or the HTTP client cannot be built.
    pub fn new(
        config: &HostConfig,
        credentials: &ScalewayCredentials,
    ) -> Result<Self, ScalewayBackendError> {
        credentials.validate()?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(config.insecure_transport)
            .build()
            .map_err(|err| ScalewayBackendError::Config(err.to_string()))?;
        let base_url = config
            .endpoint
            .as_deref()
            .unwrap_or(SCALEWAY_API_BASE)
            .trim_end_matches('/')
            .to_owned();
        Ok(Self {
            api: ScalewayApi::new(&credentials.secret_key),
            http,
            base_url,
            secret_key: credentials.secret_key.clone(),
            project: config.project.clone(),
            region: region::region_of(&config.zone).to_owned(),
            zone: config.zone.clone(),
            architecture: DEFAULT_ARCHITECTURE.to_owned(),
        })
    }

    /// API root requests are sent to.
    #[must_use]
    pub const fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Zone the backend operates in.
    #[must_use]
    pub const fn zone(&self) -> &str {
        self.zone.as_str()
    }
}

impl ComputeBackend for ScalewayBackend {
    type Error = ScalewayBackendError;

    fn name(&self) -> &'static str {
        "scaleway"
    }

    fn verify_project(&self) -> BackendFuture<'_, (), Self::Error> {
        Box::pin(self.check_project())
    }

    fn instance<'a>(
        &'a self,
        instance: &'a InstanceRef,
    ) -> BackendFuture<'a, Option<InstanceSnapshot>, Self::Error> {
        Box::pin(async move {
            Ok(self
                .find_server(instance)
                .await?
                .map(InstanceSnapshot::from))
        })
    }

    fn volume<'a>(
        &'a self,
        name: &'a str,
    ) -> BackendFuture<'a, Option<VolumeSnapshot>, Self::Error> {
        Box::pin(async move { Ok(self.find_volume(name).await?.map(VolumeSnapshot::from)) })
    }

    fn create_instance<'a>(
        &'a self,
        spec: &'a InstanceSpec,
    ) -> BackendFuture<'a, Operation, Self::Error> {
        Box::pin(self.create_server(spec))
    }

    fn operation<'a>(
        &'a self,
        operation: &'a Operation,
    ) -> BackendFuture<'a, OperationStatus, Self::Error> {
        Box::pin(self.task_status(operation))
    }

    fn start_instance<'a>(&'a self, id: &'a str) -> BackendFuture<'a, Operation, Self::Error> {
        Box::pin(self.server_action(id, "poweron"))
    }

    fn stop_instance<'a>(&'a self, id: &'a str) -> BackendFuture<'a, Operation, Self::Error> {
        Box::pin(self.server_action(id, "poweroff"))
    }

    fn force_stop_instance<'a>(
        &'a self,
        id: &'a str,
    ) -> BackendFuture<'a, Operation, Self::Error> {
        // The Instances API has no hard power-cut; poweroff is the closest.
        Box::pin(self.server_action(id, "poweroff"))
    }

    fn reboot_instance<'a>(&'a self, id: &'a str) -> BackendFuture<'a, Operation, Self::Error> {
        Box::pin(self.server_action(id, "reboot"))
    }

    fn supports_reboot(&self) -> bool {
        true
    }

    fn terminate_instance<'a>(&'a self, id: &'a str) -> BackendFuture<'a, Operation, Self::Error> {
        Box::pin(self.delete_server(id))
    }

    fn delete_volume<'a>(&'a self, id: &'a str) -> BackendFuture<'a, Operation, Self::Error> {
        Box::pin(async move {
            self.delete(&self.instance_url(&format!("volumes/{id}")))
                .await?;
            Ok(Operation::completed(id))
        })
    }

    fn resolve_network<'a>(&'a self, name: &'a str) -> BackendFuture<'a, String, Self::Error> {
        Box::pin(self.private_network_path(name))
    }

    fn security_group<'a>(
        &'a self,
        name: &'a str,
    ) -> BackendFuture<'a, Option<SecurityGroup>, Self::Error> {
        Box::pin(self.find_security_group(name))
    }

    fn create_security_group<'a>(
        &'a self,
        spec: &'a SecurityGroupSpec,
    ) -> BackendFuture<'a, SecurityGroup, Self::Error> {
        Box::pin(self.post_security_group(spec))
    }

    fn add_security_rules<'a>(
        &'a self,
        group_id: &'a str,
        rules: &'a [SecurityRule],
    ) -> BackendFuture<'a, Operation, Self::Error> {
        Box::pin(self.post_security_rules(group_id, rules))
    }

    fn key_pair<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Option<String>, Self::Error> {
        Box::pin(async move { Ok(self.find_ssh_key(name).await?.map(|key| key.id)) })
    }

    fn import_key_pair<'a>(
        &'a self,
        name: &'a str,
        public_key: &'a str,
    ) -> BackendFuture<'a, String, Self::Error> {
        Box::pin(self.post_ssh_key(name, public_key))
    }

    fn delete_key_pair<'a>(&'a self, id: &'a str) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move { self.delete(&self.iam_url(&format!("ssh-keys/{id}"))).await })
    }

    fn inject_ssh_key<'a>(
        &'a self,
        id: &'a str,
        _user: &'a str,
        public_key: &'a str,
    ) -> BackendFuture<'a, Operation, Self::Error> {
        Box::pin(async move {
            self.append_tags(id, [types::authorized_key_tag(public_key)])
                .await?;
            Ok(Operation::completed(id))
        })
    }

    fn add_network_tags<'a>(
        &'a self,
        id: &'a str,
        tags: &'a [String],
    ) -> BackendFuture<'a, Operation, Self::Error> {
        Box::pin(async move {
            self.append_tags(id, tags.iter().cloned()).await?;
            Ok(Operation::completed(id))
        })
    }

    fn set_tags<'a>(&'a self, id: &'a str, tags: &'a [Tag]) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(self.append_tags(id, types::tag_strings(tags)))
    }

    fn max_tags_per_call(&self) -> usize {
        MAX_TAGS_PER_CALL
    }

    fn supports_creation_tags(&self, _spec: &InstanceSpec) -> bool {
        true
    }
}
