//! Lifecycle orchestration for a single host.
//!
//! [`Driver`] is the contract an external host manager consumes.
//! [`HostDriver`] implements it on top of any [`ComputeBackend`], composing
//! the key provisioner, the security reconciler and the operation poller.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::backend::{Classify, ComputeBackend, InstanceRef, InstanceSnapshot};
use crate::config::{ConfigError, HostConfig, HostOptions};
use crate::error::DriverError;
use crate::keypair::{KeyGenerator, KeyPair, SshKeygen};
use crate::poller::{ReadinessWait, WaitContext};
use crate::state::CanonicalState;
use crate::store::HostRecord;

mod create;
mod power;
mod query;
mod remove;

/// Future returned by [`Driver`] operations.
pub type DriverFuture<'a, T, E> =
    Pin<Box<dyn Future<Output = Result<T, DriverError<E>>> + Send + 'a>>;

/// Lifecycle contract for one host.
///
/// Mutating operations take `&mut self` because they update the resolved
/// instance identifier, key provenance and cached address.
pub trait Driver {
    /// Error type of the underlying backend.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Short name of the backend serving this host.
    fn driver_name(&self) -> &'static str;

    /// Replaces the configuration with one built from `options`, keeping the
    /// host name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the options are invalid; the previous
    /// configuration is kept in that case.
    fn set_config(&mut self, options: &HostOptions) -> Result<(), ConfigError>;

    /// Validates credentials, instance existence and dependencies without
    /// mutating anything.
    fn pre_create_check(&self) -> DriverFuture<'_, (), Self::Error>;

    /// Creates the host, or adopts the existing instance in reuse mode.
    fn create(&mut self) -> DriverFuture<'_, (), Self::Error>;

    /// Powers the host on, re-creating the instance from a retained volume
    /// when only the volume is left.
    fn start(&mut self) -> DriverFuture<'_, (), Self::Error>;

    /// Gracefully powers the host off.
    fn stop(&mut self) -> DriverFuture<'_, (), Self::Error>;

    /// Reboots the host, falling back to stop then start.
    fn restart(&mut self) -> DriverFuture<'_, (), Self::Error>;

    /// Forcefully powers the host off.
    fn kill(&mut self) -> DriverFuture<'_, (), Self::Error>;

    /// Tears down the instance, its volume and any system-created key.
    fn remove(&mut self) -> DriverFuture<'_, (), Self::Error>;

    /// Reports the canonical lifecycle state.
    fn state(&self) -> DriverFuture<'_, CanonicalState, Self::Error>;

    /// Reports the host address, caching the first non-empty answer.
    fn ip(&mut self) -> DriverFuture<'_, String, Self::Error>;

    /// Reports the control daemon URL.
    fn url(&mut self) -> DriverFuture<'_, String, Self::Error>;

    /// Reports the host name to use for SSH.
    fn ssh_hostname(&mut self) -> DriverFuture<'_, String, Self::Error>;

    /// SSH login user.
    fn ssh_username(&self) -> &str;

    /// SSH port.
    fn ssh_port(&self) -> u16;
}

/// Resources resolved while driving a host.
///
/// Persisted next to the [`HostConfig`] so a later invocation can act on the
/// same resources.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct HostState {
    /// Backend identifier of the instance, once known.
    pub instance_id: Option<String>,
    /// Key pair trusted by the instance, with its provenance.
    pub key_pair: Option<KeyPair>,
    /// Address cached by the first successful `ip` call.
    ///
    /// Address changes made outside the driver after caching are not
    /// observed until the cache is cleared by a stop, kill or remove.
    pub ip: Option<String>,
}

/// [`Driver`] implementation over a [`ComputeBackend`].
#[derive(Debug)]
pub struct HostDriver<B, K = SshKeygen> {
    backend: B,
    keys: K,
    config: HostConfig,
    state: HostState,
    cancel: CancellationToken,
    readiness: ReadinessWait,
}

impl<B, K> HostDriver<B, K> {
    /// Creates a driver for a host that has not been provisioned yet.
    #[must_use]
    pub fn new(backend: B, keys: K, config: HostConfig) -> Self {
        Self {
            backend,
            keys,
            config,
            state: HostState::default(),
            cancel: CancellationToken::new(),
            readiness: ReadinessWait::default(),
        }
    }

    /// Re-hydrates a driver from a persisted record.
    #[must_use]
    pub fn from_record(backend: B, keys: K, record: HostRecord) -> Self {
        Self {
            state: record.state,
            ..Self::new(backend, keys, record.config)
        }
    }

    /// Uses `cancel` to interrupt every wait.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Overrides the bounded wait used for lagging resources.
    ///
    /// This is primarily used by tests to keep timeout scenarios fast.
    #[must_use]
    pub const fn with_readiness(mut self, readiness: ReadinessWait) -> Self {
        self.readiness = readiness;
        self
    }

    /// Snapshot suitable for persisting and later re-hydration.
    #[must_use]
    pub fn record(&self) -> HostRecord {
        HostRecord {
            config: self.config.clone(),
            state: self.state.clone(),
        }
    }

    /// Validated configuration.
    #[must_use]
    pub const fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Resources resolved so far.
    #[must_use]
    pub const fn host_state(&self) -> &HostState {
        &self.state
    }

    /// Token that interrupts every wait of this driver.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Backend the driver talks to.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    fn wait_context(&self) -> WaitContext<'_> {
        WaitContext {
            policy: self.config.backoff.as_ref(),
            readiness: self.readiness,
            cancel: &self.cancel,
        }
    }

    fn instance_ref(&self) -> InstanceRef {
        self.state.instance_id.as_ref().map_or_else(
            || InstanceRef::Name(self.config.name.clone()),
            |id| InstanceRef::Id(id.clone()),
        )
    }
}

impl<B, K> HostDriver<B, K>
where
    B: ComputeBackend + Send + Sync,
    K: KeyGenerator + Send + Sync,
{
    /// Fetches the host's instance, treating "not found" as absence.
    async fn lookup_instance(&self) -> Result<Option<InstanceSnapshot>, DriverError<B::Error>> {
        let reference = self.instance_ref();
        match self.backend.instance(&reference).await {
            Ok(found) => Ok(found),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(DriverError::Backend(err)),
        }
    }

    fn address_of(&self, instance: &InstanceSnapshot) -> Option<String> {
        address_of(instance, self.config.use_internal_ip)
    }
}

fn address_of(instance: &InstanceSnapshot, use_internal_ip: bool) -> Option<String> {
    let address = if use_internal_ip {
        instance.private_ip.as_deref()
    } else {
        instance.public_ip.as_deref()
    };
    address
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

impl<B, K> Driver for HostDriver<B, K>
where
    B: ComputeBackend + Send + Sync,
    K: KeyGenerator + Send + Sync,
{
    type Error = B::Error;

    fn driver_name(&self) -> &'static str {
        self.backend.name()
    }

    fn set_config(&mut self, options: &HostOptions) -> Result<(), ConfigError> {
        self.config = HostConfig::from_options(&self.config.name, options)?;
        Ok(())
    }

    fn pre_create_check(&self) -> DriverFuture<'_, (), Self::Error> {
        Box::pin(self.check_preconditions())
    }

    fn create(&mut self) -> DriverFuture<'_, (), Self::Error> {
        Box::pin(self.create_host())
    }

    fn start(&mut self) -> DriverFuture<'_, (), Self::Error> {
        Box::pin(self.start_host())
    }

    fn stop(&mut self) -> DriverFuture<'_, (), Self::Error> {
        Box::pin(self.stop_host())
    }

    fn restart(&mut self) -> DriverFuture<'_, (), Self::Error> {
        Box::pin(self.restart_host())
    }

    fn kill(&mut self) -> DriverFuture<'_, (), Self::Error> {
        Box::pin(self.kill_host())
    }

    fn remove(&mut self) -> DriverFuture<'_, (), Self::Error> {
        Box::pin(self.remove_host())
    }

    fn state(&self) -> DriverFuture<'_, CanonicalState, Self::Error> {
        Box::pin(self.current_state())
    }

    fn ip(&mut self) -> DriverFuture<'_, String, Self::Error> {
        Box::pin(self.resolve_ip())
    }

    fn url(&mut self) -> DriverFuture<'_, String, Self::Error> {
        Box::pin(self.control_url())
    }

    fn ssh_hostname(&mut self) -> DriverFuture<'_, String, Self::Error> {
        Box::pin(self.resolve_ip())
    }

    fn ssh_username(&self) -> &str {
        &self.config.ssh.user
    }

    fn ssh_port(&self) -> u16 {
        self.config.ssh.port
    }
}
