//! Power transitions: start, stop, restart and kill.

use tracing::info;

use super::HostDriver;
use crate::backend::{ComputeBackend, InstanceSnapshot, Operation};
use crate::error::{DriverError, PreconditionError};
use crate::keypair::KeyGenerator;
use crate::poller::settle;

/// Power transition requested from the backend.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PowerAction {
    Start,
    Stop,
    Reboot,
    ForceStop,
}

impl PowerAction {
    const fn step(self) -> &'static str {
        match self {
            Self::Start => "start instance",
            Self::Stop => "stop instance",
            Self::Reboot => "restart instance",
            Self::ForceStop => "kill instance",
        }
    }
}

impl<B, K> HostDriver<B, K>
where
    B: ComputeBackend + Send + Sync,
    K: KeyGenerator + Send + Sync,
{
    pub(super) async fn start_host(&mut self) -> Result<(), DriverError<B::Error>> {
        if let Some(instance) = self.lookup_instance().await? {
            return self.power(&instance, PowerAction::Start).await;
        }

        let retained = self.retained_volume().await?;
        if retained.is_none() {
            return Err(PreconditionError::InstanceMissing {
                host: self.config.name.clone(),
            }
            .into());
        }
        info!(host = %self.config.name, "re-creating instance from retained volume");
        self.provision_instance(retained).await
    }

    pub(super) async fn stop_host(&mut self) -> Result<(), DriverError<B::Error>> {
        let instance = self.require_instance().await?;
        self.power(&instance, PowerAction::Stop).await
    }

    pub(super) async fn restart_host(&mut self) -> Result<(), DriverError<B::Error>> {
        let instance = self.require_instance().await?;
        if self.backend.supports_reboot() {
            return self.power(&instance, PowerAction::Reboot).await;
        }
        self.power(&instance, PowerAction::Stop).await?;
        self.power(&instance, PowerAction::Start).await
    }

    pub(super) async fn kill_host(&mut self) -> Result<(), DriverError<B::Error>> {
        let instance = self.require_instance().await?;
        self.power(&instance, PowerAction::ForceStop).await
    }

    async fn require_instance(&mut self) -> Result<InstanceSnapshot, DriverError<B::Error>> {
        let instance = self
            .lookup_instance()
            .await?
            .ok_or_else(|| PreconditionError::InstanceMissing {
                host: self.config.name.clone(),
            })?;
        self.state.instance_id = Some(instance.id.clone());
        Ok(instance)
    }

    async fn power(
        &mut self,
        instance: &InstanceSnapshot,
        action: PowerAction,
    ) -> Result<(), DriverError<B::Error>> {
        info!(host = %self.config.name, instance_id = %instance.id, action = action.step(), "power transition");
        let operation = self
            .request(&instance.id, action)
            .await
            .map_err(DriverError::Backend)?;
        settle(&self.backend, &self.wait_context(), &operation)
            .await
            .map_err(|err| DriverError::from_poll(action.step(), err))?;
        if action != PowerAction::Start {
            self.state.ip = None;
        }
        Ok(())
    }

    async fn request(&self, id: &str, action: PowerAction) -> Result<Operation, B::Error> {
        match action {
            PowerAction::Start => self.backend.start_instance(id).await,
            PowerAction::Stop => self.backend.stop_instance(id).await,
            PowerAction::Reboot => self.backend.reboot_instance(id).await,
            PowerAction::ForceStop => self.backend.force_stop_instance(id).await,
        }
    }
}
