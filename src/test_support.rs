//! Test support utilities shared across unit and integration tests.
//!
//! [`FakeCloud`] is an in-memory [`ComputeBackend`] with scripted operation
//! latency, per-call failure injection and a call log, so lifecycle
//! properties can be asserted without a provider account.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::future::ready;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::Utf8Path;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::backend::{
    BackendErrorKind, BackendFuture, Classify, ComputeBackend, InstanceRef, InstanceSnapshot,
    InstanceSpec, Operation, OperationStatus, SecurityGroup, SecurityGroupSpec, Tag,
    VolumeSnapshot, VolumeSpec,
};
use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::config::HostOptions;
use crate::keypair::{KeyError, KeyGenerator};
use crate::security::SecurityRule;

/// Error returned by [`FakeCloud`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{message}")]
pub struct FakeError {
    /// Classification reported through [`Classify`].
    pub kind: BackendErrorKind,
    /// Human-readable message.
    pub message: String,
}

impl FakeError {
    /// Builds an error of the given kind.
    #[must_use]
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl Classify for FakeError {
    fn kind(&self) -> BackendErrorKind {
        self.kind
    }
}

/// Primitive calls recorded by [`FakeCloud`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum FakeCall {
    /// `verify_project`.
    VerifyProject,
    /// `instance`.
    GetInstance,
    /// `volume`.
    GetVolume,
    /// `create_instance`.
    CreateInstance,
    /// `operation`.
    PollOperation,
    /// `start_instance`.
    StartInstance,
    /// `stop_instance`.
    StopInstance,
    /// `force_stop_instance`.
    ForceStopInstance,
    /// `reboot_instance`.
    RebootInstance,
    /// `terminate_instance`.
    TerminateInstance,
    /// `delete_volume`.
    DeleteVolume,
    /// `resolve_network`.
    ResolveNetwork,
    /// `security_group`.
    GetSecurityGroup,
    /// `create_security_group`.
    CreateSecurityGroup,
    /// `add_security_rules`.
    AddSecurityRules,
    /// `key_pair`.
    GetKeyPair,
    /// `import_key_pair`.
    ImportKeyPair,
    /// `delete_key_pair`.
    DeleteKeyPair,
    /// `inject_ssh_key`.
    InjectSshKey,
    /// `add_network_tags`.
    AddNetworkTags,
    /// `set_tags`.
    SetTags,
}

impl FakeCall {
    /// Whether the call changes backend state.
    #[must_use]
    pub const fn is_mutation(self) -> bool {
        !matches!(
            self,
            Self::VerifyProject
                | Self::GetInstance
                | Self::GetVolume
                | Self::PollOperation
                | Self::ResolveNetwork
                | Self::GetSecurityGroup
                | Self::GetKeyPair
        )
    }
}

#[derive(Clone, Debug)]
struct PendingOperation {
    remaining_polls: u32,
    outcome: OperationStatus,
}

#[derive(Debug)]
struct State {
    next_id: u64,
    instances: BTreeMap<String, InstanceSnapshot>,
    volumes: BTreeMap<String, VolumeSnapshot>,
    groups: BTreeMap<String, SecurityGroup>,
    networks: BTreeMap<String, String>,
    key_pairs: BTreeMap<String, String>,
    injected_keys: Vec<(String, String, String)>,
    tag_batches: Vec<Vec<Tag>>,
    created_specs: Vec<InstanceSpec>,
    operations: BTreeMap<String, PendingOperation>,
    calls: Vec<FakeCall>,
    failures: BTreeMap<FakeCall, FakeError>,
    operation_failures: BTreeMap<FakeCall, String>,
    pending_polls: u32,
    address_lag: u32,
    group_visibility_lag: u32,
    reboot_supported: bool,
    creation_tags: bool,
    max_tags_per_call: usize,
}

impl Default for State {
    fn default() -> Self {
        Self {
            next_id: 1,
            instances: BTreeMap::new(),
            volumes: BTreeMap::new(),
            groups: BTreeMap::new(),
            networks: BTreeMap::new(),
            key_pairs: BTreeMap::new(),
            injected_keys: Vec::new(),
            tag_batches: Vec::new(),
            created_specs: Vec::new(),
            operations: BTreeMap::new(),
            calls: Vec::new(),
            failures: BTreeMap::new(),
            operation_failures: BTreeMap::new(),
            pending_polls: 0,
            address_lag: 0,
            group_visibility_lag: 0,
            reboot_supported: true,
            creation_tags: true,
            max_tags_per_call: 10,
        }
    }
}

impl State {
    fn allocate(&mut self, prefix: &str) -> String {
        let id = format!("{prefix}-{}", self.next_id);
        self.next_id += 1;
        id
    }

    fn record(&mut self, call: FakeCall) -> Result<(), FakeError> {
        self.calls.push(call);
        self.failures.get(&call).cloned().map_or(Ok(()), Err)
    }

    fn operation(&mut self, call: FakeCall, target: &str) -> Operation {
        let outcome = self
            .operation_failures
            .get(&call)
            .cloned()
            .map_or(OperationStatus::Done, OperationStatus::Failed);
        let id = self.allocate("op");
        self.operations.insert(
            id.clone(),
            PendingOperation {
                remaining_polls: self.pending_polls,
                outcome,
            },
        );
        Operation::pending(id, target)
    }

    fn instance_mut(&mut self, id: &str) -> Result<&mut InstanceSnapshot, FakeError> {
        self.instances
            .get_mut(id)
            .ok_or_else(|| FakeError::new(BackendErrorKind::NotFound, format!("instance {id}")))
    }

    fn set_status(&mut self, call: FakeCall, id: &str, status: &str) -> Result<Operation, FakeError> {
        self.record(call)?;
        self.instance_mut(id)?.status = status.to_owned();
        Ok(self.operation(call, id))
    }

    fn create_instance(&mut self, spec: &InstanceSpec) -> Result<Operation, FakeError> {
        self.record(FakeCall::CreateInstance)?;
        if self.instances.values().any(|instance| instance.name == spec.name) {
            return Err(FakeError::new(
                BackendErrorKind::AlreadyExists,
                format!("instance {} already exists", spec.name),
            ));
        }
        let volume_id = match &spec.volume {
            VolumeSpec::Create { name, .. } => {
                let id = self.allocate("vol");
                self.volumes.insert(
                    id.clone(),
                    VolumeSnapshot {
                        id: id.clone(),
                        name: name.clone(),
                    },
                );
                id
            }
            VolumeSpec::Existing { id } => id.clone(),
        };
        let id = self.allocate("srv");
        let ordinal = self.next_id;
        let mut tags = spec.network_tags.clone();
        tags.extend(spec.tags.iter().map(|tag| format!("{}={}", tag.key, tag.value)));
        self.instances.insert(
            id.clone(),
            InstanceSnapshot {
                id: id.clone(),
                name: spec.name.clone(),
                status: String::from("running"),
                public_ip: spec
                    .public_address
                    .then(|| format!("198.51.100.{ordinal}")),
                private_ip: Some(format!("10.0.0.{ordinal}")),
                volume_id: Some(volume_id),
                tags,
            },
        );
        self.created_specs.push(spec.clone());
        Ok(self.operation(FakeCall::CreateInstance, &id))
    }

    fn lookup_instance(&mut self, reference: &InstanceRef) -> Result<Option<InstanceSnapshot>, FakeError> {
        self.record(FakeCall::GetInstance)?;
        let found = match reference {
            InstanceRef::Id(id) => self.instances.get(id).cloned(),
            InstanceRef::Name(name) => self
                .instances
                .values()
                .find(|instance| &instance.name == name)
                .cloned(),
        };
        Ok(found.map(|mut instance| {
            if self.address_lag > 0 {
                self.address_lag -= 1;
                instance.public_ip = None;
                instance.private_ip = None;
            }
            instance
        }))
    }

    fn poll(&mut self, operation: &Operation) -> Result<OperationStatus, FakeError> {
        self.record(FakeCall::PollOperation)?;
        let pending = self.operations.get_mut(&operation.id).ok_or_else(|| {
            FakeError::new(
                BackendErrorKind::NotFound,
                format!("operation {}", operation.id),
            )
        })?;
        if pending.remaining_polls > 0 {
            pending.remaining_polls -= 1;
            return Ok(OperationStatus::Pending);
        }
        Ok(pending.outcome.clone())
    }

    fn terminate(&mut self, id: &str) -> Result<Operation, FakeError> {
        self.record(FakeCall::TerminateInstance)?;
        self.instances
            .remove(id)
            .ok_or_else(|| FakeError::new(BackendErrorKind::NotFound, format!("instance {id}")))?;
        Ok(self.operation(FakeCall::TerminateInstance, id))
    }

    fn delete_volume(&mut self, id: &str) -> Result<Operation, FakeError> {
        self.record(FakeCall::DeleteVolume)?;
        self.volumes
            .remove(id)
            .ok_or_else(|| FakeError::new(BackendErrorKind::NotFound, format!("volume {id}")))?;
        Ok(self.operation(FakeCall::DeleteVolume, id))
    }

    fn security_group(&mut self, name: &str) -> Result<Option<SecurityGroup>, FakeError> {
        self.record(FakeCall::GetSecurityGroup)?;
        if self.group_visibility_lag > 0 && self.groups.contains_key(name) {
            self.group_visibility_lag -= 1;
            return Ok(None);
        }
        Ok(self.groups.get(name).cloned())
    }

    fn create_group(&mut self, spec: &SecurityGroupSpec) -> Result<SecurityGroup, FakeError> {
        self.record(FakeCall::CreateSecurityGroup)?;
        let group = SecurityGroup {
            id: self.allocate("sg"),
            name: spec.name.clone(),
            rules: Vec::new(),
        };
        self.groups.insert(spec.name.clone(), group.clone());
        Ok(group)
    }

    fn add_rules(&mut self, group_id: &str, rules: &[SecurityRule]) -> Result<Operation, FakeError> {
        self.record(FakeCall::AddSecurityRules)?;
        let group = self
            .groups
            .values_mut()
            .find(|group| group.id == group_id)
            .ok_or_else(|| {
                FakeError::new(BackendErrorKind::NotFound, format!("group {group_id}"))
            })?;
        group.rules.extend(rules.iter().cloned());
        Ok(self.operation(FakeCall::AddSecurityRules, group_id))
    }

    fn import_key(&mut self, name: &str) -> Result<String, FakeError> {
        self.record(FakeCall::ImportKeyPair)?;
        if self.key_pairs.contains_key(name) {
            return Err(FakeError::new(
                BackendErrorKind::AlreadyExists,
                format!("key pair {name}"),
            ));
        }
        let id = self.allocate("key");
        self.key_pairs.insert(name.to_owned(), id.clone());
        Ok(id)
    }

    fn delete_key(&mut self, id: &str) -> Result<(), FakeError> {
        self.record(FakeCall::DeleteKeyPair)?;
        let name = self
            .key_pairs
            .iter()
            .find(|(_, key_id)| key_id.as_str() == id)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| FakeError::new(BackendErrorKind::NotFound, format!("key pair {id}")))?;
        self.key_pairs.remove(&name);
        Ok(())
    }

    fn inject_key(&mut self, id: &str, user: &str, public_key: &str) -> Result<Operation, FakeError> {
        self.record(FakeCall::InjectSshKey)?;
        self.instance_mut(id)?;
        self.injected_keys
            .push((id.to_owned(), user.to_owned(), public_key.to_owned()));
        Ok(self.operation(FakeCall::InjectSshKey, id))
    }

    fn add_network_tags(&mut self, id: &str, tags: &[String]) -> Result<Operation, FakeError> {
        self.record(FakeCall::AddNetworkTags)?;
        let instance = self.instance_mut(id)?;
        for tag in tags {
            if !instance.tags.contains(tag) {
                instance.tags.push(tag.clone());
            }
        }
        Ok(self.operation(FakeCall::AddNetworkTags, id))
    }

    fn set_tags(&mut self, id: &str, tags: &[Tag]) -> Result<(), FakeError> {
        self.record(FakeCall::SetTags)?;
        if tags.len() > self.max_tags_per_call {
            return Err(FakeError::new(
                BackendErrorKind::InvalidRequest,
                format!("{} tags exceed the per-call limit", tags.len()),
            ));
        }
        let instance = self.instance_mut(id)?;
        instance
            .tags
            .extend(tags.iter().map(|tag| format!("{}={}", tag.key, tag.value)));
        self.tag_batches.push(tags.to_vec());
        Ok(())
    }
}

/// In-memory [`ComputeBackend`] for tests.
///
/// Clones share state, so a test can keep a handle while the driver owns
/// another.
#[derive(Clone, Debug, Default)]
pub struct FakeCloud {
    state: Arc<Mutex<State>>,
}

fn done<'a, T: Send + 'a>(result: Result<T, FakeError>) -> BackendFuture<'a, T, FakeError> {
    Box::pin(ready(result))
}

impl FakeCloud {
    /// Creates an empty cloud.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seeds an instance with the given provider status and returns its id.
    #[must_use]
    pub fn with_instance(&self, name: &str, status: &str) -> String {
        let mut state = self.state();
        let id = state.allocate("srv");
        state.instances.insert(
            id.clone(),
            InstanceSnapshot {
                id: id.clone(),
                name: name.to_owned(),
                status: status.to_owned(),
                public_ip: Some(String::from("203.0.113.10")),
                private_ip: Some(String::from("10.0.0.10")),
                volume_id: None,
                tags: Vec::new(),
            },
        );
        id
    }

    /// Seeds a volume and returns its id.
    #[must_use]
    pub fn with_volume(&self, name: &str) -> String {
        let mut state = self.state();
        let id = state.allocate("vol");
        state.volumes.insert(
            id.clone(),
            VolumeSnapshot {
                id: id.clone(),
                name: name.to_owned(),
            },
        );
        id
    }

    /// Seeds a security group holding `rules`.
    pub fn with_security_group(&self, name: &str, rules: Vec<SecurityRule>) {
        let mut state = self.state();
        let id = state.allocate("sg");
        state.groups.insert(
            name.to_owned(),
            SecurityGroup {
                id,
                name: name.to_owned(),
                rules,
            },
        );
    }

    /// Seeds a named network resolving to `path`.
    pub fn with_network(&self, name: &str, path: &str) {
        self.state()
            .networks
            .insert(name.to_owned(), path.to_owned());
    }

    /// Seeds a key pair and returns its id.
    #[must_use]
    pub fn with_key_pair(&self, name: &str) -> String {
        let mut state = self.state();
        let id = state.allocate("key");
        state.key_pairs.insert(name.to_owned(), id.clone());
        id
    }

    /// Makes every call of `call` fail with `error` until cleared.
    pub fn fail(&self, call: FakeCall, error: FakeError) {
        self.state().failures.insert(call, error);
    }

    /// Removes an injected failure.
    pub fn clear_failure(&self, call: FakeCall) {
        self.state().failures.remove(&call);
    }

    /// Makes operations issued by `call` complete with an embedded failure.
    pub fn fail_operation(&self, call: FakeCall, detail: &str) {
        self.state()
            .operation_failures
            .insert(call, detail.to_owned());
    }

    /// Number of `Pending` answers each new operation gives before settling.
    pub fn set_pending_polls(&self, polls: u32) {
        self.state().pending_polls = polls;
    }

    /// Number of instance lookups that report no address.
    pub fn set_address_lag(&self, lookups: u32) {
        self.state().address_lag = lookups;
    }

    /// Number of lookups for which an existing group stays invisible.
    pub fn set_group_visibility_lag(&self, lookups: u32) {
        self.state().group_visibility_lag = lookups;
    }

    /// Toggles the atomic reboot primitive.
    pub fn set_reboot_supported(&self, supported: bool) {
        self.state().reboot_supported = supported;
    }

    /// Toggles tagging at creation time.
    pub fn set_creation_tags(&self, supported: bool) {
        self.state().creation_tags = supported;
    }

    /// Sets the per-call tag limit.
    pub fn set_max_tags_per_call(&self, limit: usize) {
        self.state().max_tags_per_call = limit;
    }

    /// Overrides the provider status of an instance.
    pub fn set_instance_status(&self, id: &str, status: &str) {
        if let Some(instance) = self.state().instances.get_mut(id) {
            status.clone_into(&mut instance.status);
        }
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<FakeCall> {
        self.state().calls.clone()
    }

    /// Number of times `call` was made.
    #[must_use]
    pub fn count(&self, call: FakeCall) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|recorded| **recorded == call)
            .count()
    }

    /// Calls that change backend state, in order.
    #[must_use]
    pub fn mutations(&self) -> Vec<FakeCall> {
        self.state()
            .calls
            .iter()
            .copied()
            .filter(|call| call.is_mutation())
            .collect()
    }

    /// Forgets the call log.
    pub fn reset_calls(&self) {
        self.state().calls.clear();
    }

    /// Snapshot of the instance named `name`.
    #[must_use]
    pub fn instance_named(&self, name: &str) -> Option<InstanceSnapshot> {
        self.state()
            .instances
            .values()
            .find(|instance| instance.name == name)
            .cloned()
    }

    /// Names of all volumes.
    #[must_use]
    pub fn volume_names(&self) -> BTreeSet<String> {
        self.state()
            .volumes
            .values()
            .map(|volume| volume.name.clone())
            .collect()
    }

    /// Names of all key pairs.
    #[must_use]
    pub fn key_pair_names(&self) -> BTreeSet<String> {
        self.state().key_pairs.keys().cloned().collect()
    }

    /// Rules currently held by the group named `name`.
    #[must_use]
    pub fn group_rules(&self, name: &str) -> Vec<SecurityRule> {
        self.state()
            .groups
            .get(name)
            .map(|group| group.rules.clone())
            .unwrap_or_default()
    }

    /// Keys injected into instances as `(instance id, user, public key)`.
    #[must_use]
    pub fn injected_keys(&self) -> Vec<(String, String, String)> {
        self.state().injected_keys.clone()
    }

    /// Tag batches applied after creation.
    #[must_use]
    pub fn tag_batches(&self) -> Vec<Vec<Tag>> {
        self.state().tag_batches.clone()
    }

    /// Creation requests received so far.
    #[must_use]
    pub fn created_specs(&self) -> Vec<InstanceSpec> {
        self.state().created_specs.clone()
    }
}

impl ComputeBackend for FakeCloud {
    type Error = FakeError;

    fn name(&self) -> &'static str {
        "fake"
    }

    fn verify_project(&self) -> BackendFuture<'_, (), Self::Error> {
        done(self.state().record(FakeCall::VerifyProject))
    }

    fn instance<'a>(
        &'a self,
        instance: &'a InstanceRef,
    ) -> BackendFuture<'a, Option<InstanceSnapshot>, Self::Error> {
        done(self.state().lookup_instance(instance))
    }

    fn volume<'a>(
        &'a self,
        name: &'a str,
    ) -> BackendFuture<'a, Option<VolumeSnapshot>, Self::Error> {
        let mut state = self.state();
        let result = state.record(FakeCall::GetVolume).map(|()| {
            state
                .volumes
                .values()
                .find(|volume| volume.name == name)
                .cloned()
        });
        done(result)
    }

    fn create_instance<'a>(
        &'a self,
        spec: &'a InstanceSpec,
    ) -> BackendFuture<'a, Operation, Self::Error> {
        done(self.state().create_instance(spec))
    }

    fn operation<'a>(
        &'a self,
        operation: &'a Operation,
    ) -> BackendFuture<'a, OperationStatus, Self::Error> {
        done(self.state().poll(operation))
    }

    fn start_instance<'a>(&'a self, id: &'a str) -> BackendFuture<'a, Operation, Self::Error> {
        done(self.state().set_status(FakeCall::StartInstance, id, "running"))
    }

    fn stop_instance<'a>(&'a self, id: &'a str) -> BackendFuture<'a, Operation, Self::Error> {
        done(self.state().set_status(FakeCall::StopInstance, id, "stopped"))
    }

    fn force_stop_instance<'a>(
        &'a self,
        id: &'a str,
    ) -> BackendFuture<'a, Operation, Self::Error> {
        done(
            self.state()
                .set_status(FakeCall::ForceStopInstance, id, "stopped"),
        )
    }

    fn reboot_instance<'a>(&'a self, id: &'a str) -> BackendFuture<'a, Operation, Self::Error> {
        done(self.state().set_status(FakeCall::RebootInstance, id, "running"))
    }

    fn supports_reboot(&self) -> bool {
        self.state().reboot_supported
    }

    fn terminate_instance<'a>(&'a self, id: &'a str) -> BackendFuture<'a, Operation, Self::Error> {
        done(self.state().terminate(id))
    }

    fn delete_volume<'a>(&'a self, id: &'a str) -> BackendFuture<'a, Operation, Self::Error> {
        done(self.state().delete_volume(id))
    }

    fn resolve_network<'a>(&'a self, name: &'a str) -> BackendFuture<'a, String, Self::Error> {
        let mut state = self.state();
        let result = state.record(FakeCall::ResolveNetwork).and_then(|()| {
            state.networks.get(name).cloned().ok_or_else(|| {
                FakeError::new(BackendErrorKind::NotFound, format!("network {name}"))
            })
        });
        done(result)
    }

    fn security_group<'a>(
        &'a self,
        name: &'a str,
    ) -> BackendFuture<'a, Option<SecurityGroup>, Self::Error> {
        done(self.state().security_group(name))
    }

    fn create_security_group<'a>(
        &'a self,
        spec: &'a SecurityGroupSpec,
    ) -> BackendFuture<'a, SecurityGroup, Self::Error> {
        done(self.state().create_group(spec))
    }

    fn add_security_rules<'a>(
        &'a self,
        group_id: &'a str,
        rules: &'a [SecurityRule],
    ) -> BackendFuture<'a, Operation, Self::Error> {
        done(self.state().add_rules(group_id, rules))
    }

    fn key_pair<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Option<String>, Self::Error> {
        let mut state = self.state();
        let result = state
            .record(FakeCall::GetKeyPair)
            .map(|()| state.key_pairs.get(name).cloned());
        done(result)
    }

    fn import_key_pair<'a>(
        &'a self,
        name: &'a str,
        _public_key: &'a str,
    ) -> BackendFuture<'a, String, Self::Error> {
        done(self.state().import_key(name))
    }

    fn delete_key_pair<'a>(&'a self, id: &'a str) -> BackendFuture<'a, (), Self::Error> {
        done(self.state().delete_key(id))
    }

    fn inject_ssh_key<'a>(
        &'a self,
        id: &'a str,
        user: &'a str,
        public_key: &'a str,
    ) -> BackendFuture<'a, Operation, Self::Error> {
        done(self.state().inject_key(id, user, public_key))
    }

    fn add_network_tags<'a>(
        &'a self,
        id: &'a str,
        tags: &'a [String],
    ) -> BackendFuture<'a, Operation, Self::Error> {
        done(self.state().add_network_tags(id, tags))
    }

    fn set_tags<'a>(&'a self, id: &'a str, tags: &'a [Tag]) -> BackendFuture<'a, (), Self::Error> {
        done(self.state().set_tags(id, tags))
    }

    fn max_tags_per_call(&self) -> usize {
        self.state().max_tags_per_call
    }

    fn supports_creation_tags(&self, _spec: &InstanceSpec) -> bool {
        self.state().creation_tags
    }
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(CommandOutput {
                code,
                stdout: stdout.into(),
                stderr: stderr.into(),
            });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CommandInvocation {
                program: program.to_owned(),
                args: args.to_vec(),
            });
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| CommandError {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Key generator returning a fixed public key without touching the disk.
#[derive(Clone, Debug)]
pub struct StaticKeyGenerator {
    public_key: String,
    generated: Arc<Mutex<Vec<String>>>,
}

impl StaticKeyGenerator {
    /// Generator that always yields `public_key`.
    #[must_use]
    pub fn new(public_key: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            generated: Arc::default(),
        }
    }

    /// Public key returned by every generation.
    #[must_use]
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Private key paths requested so far.
    #[must_use]
    pub fn generated(&self) -> Vec<String> {
        self.generated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for StaticKeyGenerator {
    fn default() -> Self {
        Self::new("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAITEST hostwright")
    }
}

impl KeyGenerator for StaticKeyGenerator {
    fn generate(&self, private_key_path: &Utf8Path, _comment: &str) -> Result<String, KeyError> {
        self.generated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(private_key_path.to_string());
        Ok(self.public_key.clone())
    }
}

/// Host options holding the documented defaults plus a test project.
#[must_use]
pub fn host_options() -> HostOptions {
    HostOptions {
        provider: String::from("scaleway"),
        zone: String::from("fr-par-1"),
        machine_type: String::from("DEV1-S"),
        image: None,
        disk_size_gb: 20,
        disk_type: String::from("l_ssd"),
        network: None,
        security_group: String::from("hostwright"),
        skip_firewall: false,
        security_group_read_only: false,
        open_ports: Vec::new(),
        cluster_mode: false,
        cluster_port: 3376,
        control_port: 2376,
        tags: Vec::new(),
        labels: Vec::new(),
        metadata: Vec::new(),
        metadata_from_file: Vec::new(),
        user_data_file: None,
        credential_file: None,
        project: Some(String::from("11111111-2222-3333-4444-555555555555")),
        reuse_existing: false,
        preemptible: false,
        use_internal_ip: false,
        ssh_user: String::from("root"),
        ssh_port: 22,
        ssh_key_path: None,
        ssh_public_key: None,
        key_pair_name: None,
        endpoint: None,
        insecure_transport: false,
        store_dir: String::from(".hostwright"),
        backoff_initial_interval_secs: 1,
        backoff_randomization_factor: String::from("0.5"),
        backoff_multiplier: String::from("2.0"),
        backoff_max_interval_secs: 30,
        backoff_max_elapsed_secs: 300,
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in self.previous.iter().rev() {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
