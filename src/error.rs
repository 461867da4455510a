//! Error taxonomy surfaced by the lifecycle driver.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::keypair::KeyError;
use crate::poller::PollError;

/// Errors raised by [`crate::driver::HostDriver`] operations.
///
/// `E` is the backend's error type, kept intact so callers can still inspect
/// the provider detail and its [`crate::backend::Classify`] kind.
#[derive(Debug, Error)]
pub enum DriverError<E>
where
    E: std::error::Error + 'static,
{
    /// Malformed or mutually exclusive options. Raised before any backend
    /// call.
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    /// Existence or dependency mismatch detected before mutation.
    #[error(transparent)]
    Precondition(#[from] PreconditionError),
    /// Provider API failure.
    #[error("backend request failed: {0}")]
    Backend(#[source] E),
    /// The operation poller exhausted its backoff budget.
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        /// Step that was being awaited.
        operation: &'static str,
        /// Time spent waiting.
        elapsed: Duration,
    },
    /// The caller cancelled the wait.
    #[error("{operation} was cancelled")]
    Cancelled {
        /// Step that was being awaited.
        operation: &'static str,
    },
    /// A backend operation completed with an embedded failure.
    #[error("{operation} failed: {detail}")]
    OperationFailed {
        /// Step that failed.
        operation: &'static str,
        /// Provider failure detail.
        detail: String,
    },
    /// Key material could not be produced or read.
    #[error(transparent)]
    Key(#[from] KeyError),
    /// One or more teardown steps failed.
    #[error(transparent)]
    PartialFailure(TeardownFailures<E>),
}

impl<E> DriverError<E>
where
    E: std::error::Error + 'static,
{
    /// Maps a poller failure onto the driver taxonomy, naming the step that
    /// was awaited.
    #[must_use]
    pub fn from_poll(operation: &'static str, err: PollError<E>) -> Self {
        match err {
            PollError::MissingPolicy => Self::Configuration(ConfigError::MissingBackoffPolicy),
            PollError::Timeout { elapsed } => Self::Timeout { operation, elapsed },
            PollError::Cancelled => Self::Cancelled { operation },
            PollError::Failed(detail) => Self::OperationFailed { operation, detail },
            PollError::Backend(source) => Self::Backend(source),
        }
    }
}

/// Existence, reuse and dependency mismatches.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PreconditionError {
    /// Credentials or project could not be verified.
    #[error("project {project} is not usable: {detail}")]
    ProjectUnavailable {
        /// Project identifier.
        project: String,
        /// Provider detail.
        detail: String,
    },
    /// A new instance was requested but one already exists.
    #[error("instance {host} already exists")]
    InstanceExists {
        /// Host name.
        host: String,
    },
    /// The instance is required but does not exist.
    #[error("instance {host} does not exist")]
    InstanceMissing {
        /// Host name.
        host: String,
    },
    /// The configured network could not be resolved.
    #[error("no usable network named {network}")]
    NoUsableNetwork {
        /// Network name as configured.
        network: String,
    },
    /// The caller named a key pair the backend does not know.
    #[error("key pair {name} does not exist")]
    KeyPairMissing {
        /// Key pair name.
        name: String,
    },
    /// A system key named after the host is already registered.
    #[error("key pair {name} already exists")]
    KeyPairExists {
        /// Key pair name.
        name: String,
    },
    /// The host has no address to report.
    #[error("host {host} has no address; is it running?")]
    HostNotRunning {
        /// Host name.
        host: String,
    },
}

/// Resource kinds torn down by `Remove`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Resource {
    /// The compute instance.
    Instance,
    /// The boot volume.
    Volume,
    /// The system-created key pair.
    KeyPair,
}

impl fmt::Display for Resource {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(match self {
            Self::Instance => "instance",
            Self::Volume => "volume",
            Self::KeyPair => "key pair",
        })
    }
}

/// One failed teardown step.
#[derive(Debug)]
pub struct TeardownFailure<E>
where
    E: std::error::Error + 'static,
{
    /// Kind of resource that could not be removed.
    pub resource: Resource,
    /// Identifier or name of that resource.
    pub id: String,
    /// Failure raised while removing it.
    pub error: DriverError<E>,
}

/// Every teardown step that failed during one `Remove`, in execution order.
#[derive(Debug)]
pub struct TeardownFailures<E>
where
    E: std::error::Error + 'static,
{
    /// Collected failures; never empty when surfaced as an error.
    pub failures: Vec<TeardownFailure<E>>,
}

impl<E> fmt::Display for TeardownFailures<E>
where
    E: std::error::Error + 'static,
{
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "teardown incomplete")?;
        for (index, failure) in self.failures.iter().enumerate() {
            let separator = if index == 0 { ": " } else { "; " };
            write!(
                formatter,
                "{separator}{} {}: {}",
                failure.resource, failure.id, failure.error
            )?;
        }
        Ok(())
    }
}

impl<E> std::error::Error for TeardownFailures<E> where E: std::error::Error + 'static {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn teardown_failures_list_every_step() {
        let failures = TeardownFailures::<Boom> {
            failures: vec![
                TeardownFailure {
                    resource: Resource::Instance,
                    id: String::from("srv-1"),
                    error: DriverError::Backend(Boom),
                },
                TeardownFailure {
                    resource: Resource::KeyPair,
                    id: String::from("key-1"),
                    error: DriverError::Cancelled {
                        operation: "delete key pair",
                    },
                },
            ],
        };

        assert_eq!(
            failures.to_string(),
            "teardown incomplete: instance srv-1: backend request failed: boom; \
             key pair key-1: delete key pair was cancelled"
        );
    }

    #[test]
    fn missing_policy_maps_to_configuration_error() {
        let err = DriverError::<Boom>::from_poll("create instance", PollError::MissingPolicy);
        assert!(matches!(
            err,
            DriverError::Configuration(ConfigError::MissingBackoffPolicy)
        ));
    }
}
