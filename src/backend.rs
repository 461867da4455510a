//! Backend adapter contract for provisioning a single compute host.
//!
//! Every cloud provider binding implements [`ComputeBackend`]. The driver
//! only ever talks to this trait, so provider vocabularies stay behind the
//! adapter and errors cross the boundary with a structured
//! [`BackendErrorKind`] attached.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::security::SecurityRule;

/// Future returned by backend operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Coarse classification of a backend failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BackendErrorKind {
    /// The addressed resource does not exist.
    NotFound,
    /// A resource with the same identity already exists.
    AlreadyExists,
    /// Credentials were rejected or lack permission.
    Unauthorized,
    /// The provider rejected the request as malformed.
    InvalidRequest,
    /// A failure that may succeed on retry (throttling, 5xx).
    Transient,
    /// Anything else.
    Other,
}

/// Exposes the [`BackendErrorKind`] of a backend error.
pub trait Classify {
    /// Returns the classification of this error.
    fn kind(&self) -> BackendErrorKind;

    /// Convenience check for [`BackendErrorKind::NotFound`].
    fn is_not_found(&self) -> bool {
        self.kind() == BackendErrorKind::NotFound
    }
}

/// Completion status of an asynchronous backend request.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum OperationStatus {
    /// The provider is still working on the request.
    Pending,
    /// The request finished without error.
    Done,
    /// The request finished with an embedded provider failure.
    Failed(String),
}

impl OperationStatus {
    /// Returns `true` for [`OperationStatus::Done`] and
    /// [`OperationStatus::Failed`].
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Handle to an asynchronous backend request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Operation {
    /// Provider identifier of the request (task or operation name).
    pub id: String,
    /// Identifier of the resource the request acts on.
    pub target: String,
    /// Status observed when the handle was produced.
    pub status: OperationStatus,
}

impl Operation {
    /// Handle for a request the provider is still processing.
    #[must_use]
    pub fn pending(id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target: target.into(),
            status: OperationStatus::Pending,
        }
    }

    /// Handle for a request that completed synchronously.
    #[must_use]
    pub fn completed(target: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            target: target.into(),
            status: OperationStatus::Done,
        }
    }
}

/// How the driver addresses an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InstanceRef {
    /// Backend-assigned identifier, known once the instance was created.
    Id(String),
    /// Host name, used before an identifier is known.
    Name(String),
}

impl InstanceRef {
    /// Returns the identifier or name carried by the reference.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Id(value) | Self::Name(value) => value,
        }
    }
}

/// Point-in-time view of an instance as reported by the backend.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceSnapshot {
    /// Backend-assigned identifier.
    pub id: String,
    /// Host name.
    pub name: String,
    /// Provider-native status string, normalised by [`crate::state`].
    pub status: String,
    /// Public address, if one is attached.
    pub public_ip: Option<String>,
    /// Private address, if one is attached.
    pub private_ip: Option<String>,
    /// Identifier of the attached boot volume, if any.
    pub volume_id: Option<String>,
    /// Tags currently set on the instance.
    pub tags: Vec<String>,
}

/// Point-in-time view of a persistent volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeSnapshot {
    /// Backend-assigned identifier.
    pub id: String,
    /// Volume name.
    pub name: String,
}

/// Firewall group with the rules it currently holds.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SecurityGroup {
    /// Backend-assigned identifier.
    pub id: String,
    /// Group name.
    pub name: String,
    /// Rules observed on the group.
    pub rules: Vec<SecurityRule>,
}

/// Parameters for creating a firewall group.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SecurityGroupSpec {
    /// Group name.
    pub name: String,
    /// Canonical network path the group applies to, when the provider
    /// scopes groups by network.
    pub network: Option<String>,
    /// Instance tag the group targets.
    pub target_tag: String,
}

/// Boot volume specification for a new instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VolumeSpec {
    /// Initialise a fresh volume from the instance image.
    Create {
        /// Volume name.
        name: String,
        /// Size in gigabytes.
        size_gb: u32,
        /// Provider volume type.
        volume_type: String,
    },
    /// Attach a volume retained from an earlier instance.
    Existing {
        /// Identifier of the retained volume.
        id: String,
    },
}

/// Key/value tag applied to provider resources.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Tag {
    /// Tag key.
    pub key: String,
    /// Tag value; may be empty.
    pub value: String,
}

impl Tag {
    /// Creates a new tag.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Fully resolved instance-creation request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceSpec {
    /// Host name.
    pub name: String,
    /// Availability zone.
    pub zone: String,
    /// Machine size or commercial type.
    pub machine_type: String,
    /// Image reference.
    pub image: String,
    /// Canonical network path, or `None` for the provider default.
    pub network: Option<String>,
    /// Security group the instance joins, if the firewall is managed.
    pub security_group_id: Option<String>,
    /// Boot volume.
    pub volume: VolumeSpec,
    /// Tags requested at creation. Empty when tagging is deferred.
    pub tags: Vec<Tag>,
    /// Provider-neutral string tags (for example the firewall target tag).
    pub network_tags: Vec<String>,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Metadata entries, including user data under `cloud-init`.
    pub metadata: BTreeMap<String, String>,
    /// Backend key pair the instance should trust, if any.
    pub key_pair: Option<String>,
    /// Request preemptible capacity.
    pub preemptible: bool,
    /// Attach a public address.
    pub public_address: bool,
}

/// Primitive operations a provider binding exposes to the driver.
///
/// Lookups return `Ok(None)` when the resource is absent. Mutations that the
/// provider completes asynchronously return a pending [`Operation`] which the
/// driver resolves through [`ComputeBackend::operation`].
pub trait ComputeBackend {
    /// Provider specific error type returned by the backend.
    type Error: std::error::Error + Classify + Send + Sync + 'static;

    /// Short provider name used in logs.
    fn name(&self) -> &'static str;

    /// Checks that credentials are valid and the project is reachable.
    fn verify_project(&self) -> BackendFuture<'_, (), Self::Error>;

    /// Fetches an instance.
    fn instance<'a>(
        &'a self,
        instance: &'a InstanceRef,
    ) -> BackendFuture<'a, Option<InstanceSnapshot>, Self::Error>;

    /// Fetches a volume by name.
    fn volume<'a>(&'a self, name: &'a str)
    -> BackendFuture<'a, Option<VolumeSnapshot>, Self::Error>;

    /// Submits an instance-creation request. The returned operation targets
    /// the new instance identifier.
    fn create_instance<'a>(
        &'a self,
        spec: &'a InstanceSpec,
    ) -> BackendFuture<'a, Operation, Self::Error>;

    /// Refreshes the status of an asynchronous operation.
    fn operation<'a>(
        &'a self,
        operation: &'a Operation,
    ) -> BackendFuture<'a, OperationStatus, Self::Error>;

    /// Powers an instance on.
    fn start_instance<'a>(&'a self, id: &'a str) -> BackendFuture<'a, Operation, Self::Error>;

    /// Gracefully powers an instance off.
    fn stop_instance<'a>(&'a self, id: &'a str) -> BackendFuture<'a, Operation, Self::Error>;

    /// Forcefully powers an instance off.
    fn force_stop_instance<'a>(&'a self, id: &'a str)
    -> BackendFuture<'a, Operation, Self::Error>;

    /// Reboots an instance in place. Only called when
    /// [`ComputeBackend::supports_reboot`] returns `true`.
    fn reboot_instance<'a>(&'a self, id: &'a str) -> BackendFuture<'a, Operation, Self::Error>;

    /// Whether the provider exposes an atomic reboot primitive.
    fn supports_reboot(&self) -> bool;

    /// Deletes an instance. Its boot volume is left in place unless the
    /// provider couples their lifetimes.
    fn terminate_instance<'a>(&'a self, id: &'a str) -> BackendFuture<'a, Operation, Self::Error>;

    /// Deletes a volume.
    fn delete_volume<'a>(&'a self, id: &'a str) -> BackendFuture<'a, Operation, Self::Error>;

    /// Resolves a network name to its canonical resource path.
    fn resolve_network<'a>(&'a self, name: &'a str) -> BackendFuture<'a, String, Self::Error>;

    /// Fetches a security group by name.
    fn security_group<'a>(
        &'a self,
        name: &'a str,
    ) -> BackendFuture<'a, Option<SecurityGroup>, Self::Error>;

    /// Creates an empty security group.
    fn create_security_group<'a>(
        &'a self,
        spec: &'a SecurityGroupSpec,
    ) -> BackendFuture<'a, SecurityGroup, Self::Error>;

    /// Appends rules to a security group. Existing rules are untouched.
    fn add_security_rules<'a>(
        &'a self,
        group_id: &'a str,
        rules: &'a [SecurityRule],
    ) -> BackendFuture<'a, Operation, Self::Error>;

    /// Looks up a backend key pair by name, returning its identifier.
    fn key_pair<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Option<String>, Self::Error>;

    /// Imports a public key under `name`, returning the backend identifier.
    fn import_key_pair<'a>(
        &'a self,
        name: &'a str,
        public_key: &'a str,
    ) -> BackendFuture<'a, String, Self::Error>;

    /// Deletes a backend key pair.
    fn delete_key_pair<'a>(&'a self, id: &'a str) -> BackendFuture<'a, (), Self::Error>;

    /// Authorises `public_key` for `user` on an existing instance.
    fn inject_ssh_key<'a>(
        &'a self,
        id: &'a str,
        user: &'a str,
        public_key: &'a str,
    ) -> BackendFuture<'a, Operation, Self::Error>;

    /// Adds provider-neutral string tags to an existing instance, keeping
    /// the tags it already carries.
    fn add_network_tags<'a>(
        &'a self,
        id: &'a str,
        tags: &'a [String],
    ) -> BackendFuture<'a, Operation, Self::Error>;

    /// Applies key/value tags to an existing instance.
    fn set_tags<'a>(&'a self, id: &'a str, tags: &'a [Tag]) -> BackendFuture<'a, (), Self::Error>;

    /// Maximum number of tags accepted by one [`ComputeBackend::set_tags`]
    /// call.
    fn max_tags_per_call(&self) -> usize {
        10
    }

    /// Whether tags can be attached atomically at creation for this spec.
    fn supports_creation_tags(&self, spec: &InstanceSpec) -> bool;
}
