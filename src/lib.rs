//! Provider-agnostic lifecycle driver for a single cloud VM host.
//!
//! A [`HostDriver`] turns a validated [`HostConfig`] into a running
//! instance and back: it creates or adopts the instance, provisions SSH
//! access, keeps a firewall group converged without ever narrowing it,
//! normalises provider states and tears everything down on request. All
//! provider traffic goes through the [`ComputeBackend`] trait; the crate
//! ships a Scaleway binding in [`scaleway`].

pub mod backend;
pub mod backoff;
pub mod command;
pub mod config;
pub mod driver;
pub mod error;
pub mod fs;
pub mod keypair;
pub mod poller;
pub mod region;
pub mod scaleway;
pub mod security;
pub mod state;
pub mod store;
pub mod test_support;

pub use backend::{BackendErrorKind, Classify, ComputeBackend, Operation, OperationStatus};
pub use backoff::{BackoffPolicy, BackoffPolicyError};
pub use config::{ConfigError, HostConfig, HostOptions, ScalewayCredentials};
pub use driver::{Driver, DriverFuture, HostDriver, HostState};
pub use error::{DriverError, PreconditionError, TeardownFailure, TeardownFailures};
pub use keypair::{KeyGenerator, KeyPair, KeyProvenance, SshKeygen};
pub use scaleway::{ScalewayBackend, ScalewayBackendError};
pub use security::{FirewallIntent, FirewallMode, Protocol, SecurityRule};
pub use state::{CanonicalState, normalize_status};
pub use store::{HostRecord, HostStore, StoreError};
