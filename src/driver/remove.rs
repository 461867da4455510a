//! Best-effort teardown: instance, then volume, then system-created key.

use tracing::{info, warn};

use super::HostDriver;
use crate::backend::{Classify, ComputeBackend, Operation};
use crate::error::{DriverError, Resource, TeardownFailure, TeardownFailures};
use crate::keypair::KeyGenerator;
use crate::poller::settle;
use crate::state::{CanonicalState, normalize_status};

/// What a teardown does with the host's boot volume.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum VolumeDisposal {
    /// Delete the volume with the instance.
    Delete,
    /// The volume existed before this `Create`: stop the instance so that
    /// deleting it detaches the volume, then leave the volume in place.
    Keep,
}

impl<B, K> HostDriver<B, K>
where
    B: ComputeBackend + Send + Sync,
    K: KeyGenerator + Send + Sync,
{
    /// Removes every resource the host owns.
    ///
    /// Already-absent resources count as removed. Every step runs even when
    /// an earlier one failed; the failures are returned together.
    pub(super) async fn remove_host(&mut self) -> Result<(), DriverError<B::Error>> {
        self.teardown(VolumeDisposal::Delete).await
    }

    /// Teardown shared by `Remove` and create compensation.
    pub(super) async fn teardown(
        &mut self,
        disposal: VolumeDisposal,
    ) -> Result<(), DriverError<B::Error>> {
        let mut failures = Vec::new();

        let volume_id = match self.remove_instance(disposal).await {
            Ok(volume_id) => {
                self.state.instance_id = None;
                volume_id
            }
            Err((id, error)) => {
                failures.push(TeardownFailure {
                    resource: Resource::Instance,
                    id,
                    error,
                });
                None
            }
        };
        self.state.ip = None;

        match disposal {
            VolumeDisposal::Delete => {
                if let Err((id, error)) = self.remove_volume(volume_id).await {
                    failures.push(TeardownFailure {
                        resource: Resource::Volume,
                        id,
                        error,
                    });
                }
            }
            VolumeDisposal::Keep => {
                info!(volume = %self.config.volume_name(), "keeping pre-existing volume");
            }
        }

        match self.remove_key_pair().await {
            Ok(()) => self.state.key_pair = None,
            Err((id, error)) => failures.push(TeardownFailure {
                resource: Resource::KeyPair,
                id,
                error,
            }),
        }

        if failures.is_empty() {
            info!(host = %self.config.name, "host removed");
            Ok(())
        } else {
            Err(DriverError::PartialFailure(TeardownFailures { failures }))
        }
    }

    /// Deletes the instance and returns the identifier of its boot volume.
    async fn remove_instance(
        &self,
        disposal: VolumeDisposal,
    ) -> Result<Option<String>, (String, DriverError<B::Error>)> {
        let fallback_id = self.instance_ref().as_str().to_owned();
        let Some(instance) = self
            .lookup_instance()
            .await
            .map_err(|err| (fallback_id.clone(), err))?
        else {
            warn!(host = %self.config.name, "instance already absent");
            return Ok(None);
        };

        if disposal == VolumeDisposal::Keep
            && normalize_status(&instance.status) != CanonicalState::Stopped
        {
            let stopped = self.backend.stop_instance(&instance.id).await;
            self.finish("stop instance", stopped)
                .await
                .map_err(|err| (instance.id.clone(), err))?;
        }

        let result = self.backend.terminate_instance(&instance.id).await;
        self.finish("delete instance", result)
            .await
            .map_err(|err| (instance.id.clone(), err))?;
        info!(host = %self.config.name, instance_id = %instance.id, "instance deleted");
        Ok(instance.volume_id)
    }

    async fn remove_volume(
        &self,
        known_id: Option<String>,
    ) -> Result<(), (String, DriverError<B::Error>)> {
        let volume_name = self.config.volume_name();
        let volume_id = match known_id {
            Some(id) => id,
            None => {
                let found = self
                    .backend
                    .volume(&volume_name)
                    .await
                    .or_else(|err| if err.is_not_found() { Ok(None) } else { Err(err) })
                    .map_err(|err| (volume_name.clone(), DriverError::Backend(err)))?;
                let Some(volume) = found else {
                    warn!(volume = %volume_name, "volume already absent");
                    return Ok(());
                };
                volume.id
            }
        };

        let result = self.backend.delete_volume(&volume_id).await;
        self.finish("delete volume", result)
            .await
            .map_err(|err| (volume_id.clone(), err))?;
        info!(volume_id = %volume_id, "volume deleted");
        Ok(())
    }

    async fn remove_key_pair(&self) -> Result<(), (String, DriverError<B::Error>)> {
        let Some(key_id) = self
            .state
            .key_pair
            .as_ref()
            .and_then(|key| key.owned_backend_id())
        else {
            return Ok(());
        };

        match self.backend.delete_key_pair(key_id).await {
            Ok(()) => {
                info!(key_id, "key pair deleted");
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                warn!(key_id, "key pair already absent");
                Ok(())
            }
            Err(err) => Err((key_id.to_owned(), DriverError::Backend(err))),
        }
    }

    /// Waits for a delete request, treating "not found" as already deleted.
    async fn finish(
        &self,
        step: &'static str,
        requested: Result<Operation, B::Error>,
    ) -> Result<(), DriverError<B::Error>> {
        let operation = match requested {
            Ok(operation) => operation,
            Err(err) if err.is_not_found() => {
                warn!(step, "resource already absent");
                return Ok(());
            }
            Err(err) => return Err(DriverError::Backend(err)),
        };
        settle(&self.backend, &self.wait_context(), &operation)
            .await
            .map_err(|err| DriverError::from_poll(step, err))
    }
}
