//! `PreCreateCheck` and `Create`, including compensating teardown.

use std::slice;

use tracing::{debug, info, warn};

use super::remove::VolumeDisposal;
use super::{HostDriver, address_of};
use crate::backend::{
    ComputeBackend, InstanceRef, InstanceSpec, Tag, VolumeSnapshot, VolumeSpec,
};
use crate::config::ConfigError;
use crate::error::{DriverError, PreconditionError};
use crate::keypair::{self, KeyGenerator};
use crate::poller::{WaitContext, settle};
use crate::security::{self, resolve_network_target};
use crate::state::{CanonicalState, normalize_status};

impl<B, K> HostDriver<B, K>
where
    B: ComputeBackend + Send + Sync,
    K: KeyGenerator + Send + Sync,
{
    pub(super) async fn check_preconditions(&self) -> Result<(), DriverError<B::Error>> {
        let host = &self.config.name;
        self.backend.verify_project().await.map_err(|err| {
            DriverError::from(PreconditionError::ProjectUnavailable {
                project: self.config.project.clone(),
                detail: err.to_string(),
            })
        })?;

        let existing = self.lookup_instance().await?;
        match (self.config.reuse_existing, existing) {
            (false, Some(_)) => {
                return Err(PreconditionError::InstanceExists { host: host.clone() }.into());
            }
            (true, None) => {
                return Err(PreconditionError::InstanceMissing { host: host.clone() }.into());
            }
            _ => {}
        }

        keypair::check_preconditions(&self.backend, &self.config).await?;

        if let Some(network) = self.config.network.as_deref() {
            let path = resolve_network_target(&self.backend, network).await?;
            debug!(host = %host, network = %path, "network resolved");
        }
        info!(host = %host, backend = self.backend.name(), "pre-create checks passed");
        Ok(())
    }

    pub(super) async fn create_host(&mut self) -> Result<(), DriverError<B::Error>> {
        if self.config.backoff.is_none() {
            return Err(ConfigError::MissingBackoffPolicy.into());
        }

        let retained = if self.config.reuse_existing {
            None
        } else {
            self.retained_volume().await?
        };
        let disposal = if retained.is_some() {
            VolumeDisposal::Keep
        } else {
            VolumeDisposal::Delete
        };

        let key_pair = keypair::provision(&self.backend, &self.keys, &self.config).await?;
        self.state.key_pair = Some(key_pair);

        if self.config.reuse_existing {
            return self.adopt_instance().await;
        }

        match self.provision_instance(retained).await {
            Ok(()) => {
                info!(
                    host = %self.config.name,
                    instance_id = self.state.instance_id.as_deref().unwrap_or_default(),
                    "host created"
                );
                Ok(())
            }
            Err(err) => {
                warn!(host = %self.config.name, error = %err, "create failed; tearing down");
                if let Err(teardown) = self.teardown(disposal).await {
                    warn!(
                        host = %self.config.name,
                        error = %teardown,
                        "compensating teardown incomplete"
                    );
                }
                Err(err)
            }
        }
    }

    /// Looks up a boot volume left behind by an earlier instance of this host.
    pub(super) async fn retained_volume(
        &self,
    ) -> Result<Option<VolumeSnapshot>, DriverError<B::Error>> {
        self.backend
            .volume(&self.config.volume_name())
            .await
            .map_err(DriverError::Backend)
    }

    /// Runs creation steps two onwards: firewall, request, submission and
    /// readiness waits. `retained` becomes the boot disk when present; `Start`
    /// uses this to re-create an instance from its kept volume.
    pub(super) async fn provision_instance(
        &mut self,
        retained: Option<VolumeSnapshot>,
    ) -> Result<(), DriverError<B::Error>> {
        let context = WaitContext {
            policy: self.config.backoff.as_ref(),
            readiness: self.readiness,
            cancel: &self.cancel,
        };

        let report = security::reconcile(&self.backend, &self.config.firewall, &context).await?;
        let mut spec = self.instance_spec(report.group_id, retained).await?;
        let deferred = if self.backend.supports_creation_tags(&spec) {
            Vec::new()
        } else {
            std::mem::take(&mut spec.tags)
        };

        info!(
            host = %spec.name,
            machine_type = %spec.machine_type,
            image = %spec.image,
            "creating instance"
        );
        let operation = self
            .backend
            .create_instance(&spec)
            .await
            .map_err(DriverError::Backend)?;
        self.state.instance_id = Some(operation.target.clone());

        settle(&self.backend, &context, &operation)
            .await
            .map_err(|err| DriverError::from_poll("create instance", err))?;

        let reference = InstanceRef::Id(operation.target.clone());
        let address = wait_for_address(&self.backend, &context, &reference, self.config.use_internal_ip)
            .await?;
        debug!(host = %spec.name, address = %address, "address assigned");

        apply_tags(&self.backend, &operation.target, &deferred).await?;
        wait_for_running(&self.backend, &context, &reference).await?;
        self.state.ip = Some(address);
        Ok(())
    }

    async fn instance_spec(
        &self,
        security_group_id: Option<String>,
        retained: Option<VolumeSnapshot>,
    ) -> Result<InstanceSpec, DriverError<B::Error>> {
        let config = &self.config;
        let network = match config.network.as_deref() {
            Some(network) => Some(resolve_network_target(&self.backend, network).await?),
            None => None,
        };
        let volume = match retained {
            Some(existing) => {
                info!(host = %config.name, volume_id = %existing.id, "attaching retained volume");
                VolumeSpec::Existing { id: existing.id }
            }
            None => VolumeSpec::Create {
                name: config.volume_name(),
                size_gb: config.disk.size_gb,
                volume_type: config.disk.volume_type.clone(),
            },
        };
        let key_pair = self
            .state
            .key_pair
            .as_ref()
            .filter(|key| key.backend_id.is_some())
            .map(|key| key.name.clone());

        Ok(InstanceSpec {
            name: config.name.clone(),
            zone: config.zone.clone(),
            machine_type: config.machine_type.clone(),
            image: config.image.clone(),
            network,
            security_group_id,
            volume,
            tags: config.tags.clone(),
            network_tags: vec![config.firewall.target_tag.clone()],
            labels: config.labels.clone(),
            metadata: config.metadata.clone(),
            key_pair,
            preemptible: config.preemptible,
            public_address: true,
        })
    }

    /// Reuse mode: bring an existing instance in line with the
    /// configuration without creating anything.
    async fn adopt_instance(&mut self) -> Result<(), DriverError<B::Error>> {
        let instance = self
            .lookup_instance()
            .await?
            .ok_or_else(|| PreconditionError::InstanceMissing {
                host: self.config.name.clone(),
            })?;
        self.state.instance_id = Some(instance.id.clone());

        let context = self.wait_context();
        security::reconcile(&self.backend, &self.config.firewall, &context).await?;

        let target_tag = &self.config.firewall.target_tag;
        if !instance.tags.contains(target_tag) {
            let operation = self
                .backend
                .add_network_tags(&instance.id, slice::from_ref(target_tag))
                .await
                .map_err(DriverError::Backend)?;
            settle(&self.backend, &context, &operation)
                .await
                .map_err(|err| DriverError::from_poll("tag instance", err))?;
        }

        let public_key = self
            .state
            .key_pair
            .as_ref()
            .and_then(|key| key.public_key.as_deref());
        if let Some(public_key) = public_key {
            let operation = self
                .backend
                .inject_ssh_key(&instance.id, &self.config.ssh.user, public_key)
                .await
                .map_err(DriverError::Backend)?;
            settle(&self.backend, &context, &operation)
                .await
                .map_err(|err| DriverError::from_poll("inject ssh key", err))?;
        }
        info!(host = %self.config.name, instance_id = %instance.id, "adopted existing instance");
        Ok(())
    }
}

async fn wait_for_address<B>(
    backend: &B,
    context: &WaitContext<'_>,
    reference: &InstanceRef,
    use_internal_ip: bool,
) -> Result<String, DriverError<B::Error>>
where
    B: ComputeBackend + ?Sized,
{
    context
        .readiness
        .until(context.cancel, || async move {
            backend
                .instance(reference)
                .await
                .map(|found| found.and_then(|instance| address_of(&instance, use_internal_ip)))
        })
        .await
        .map_err(|err| DriverError::from_poll("wait for address", err))
}

async fn wait_for_running<B>(
    backend: &B,
    context: &WaitContext<'_>,
    reference: &InstanceRef,
) -> Result<(), DriverError<B::Error>>
where
    B: ComputeBackend + ?Sized,
{
    context
        .readiness
        .until(context.cancel, || async move {
            backend.instance(reference).await.map(|found| {
                found
                    .filter(|instance| normalize_status(&instance.status) == CanonicalState::Running)
                    .map(|_| ())
            })
        })
        .await
        .map_err(|err| DriverError::from_poll("wait for running", err))
}

/// Applies tags the creation request could not carry, in batches no larger
/// than the backend accepts per call.
async fn apply_tags<B>(backend: &B, instance_id: &str, tags: &[Tag]) -> Result<(), DriverError<B::Error>>
where
    B: ComputeBackend + ?Sized,
{
    let batch_size = backend.max_tags_per_call().max(1);
    for batch in tags.chunks(batch_size) {
        debug!(instance_id, count = batch.len(), "applying tags");
        backend
            .set_tags(instance_id, batch)
            .await
            .map_err(DriverError::Backend)?;
    }
    Ok(())
}
