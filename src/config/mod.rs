//! Host configuration: layered loading via `ortho-config` and the single
//! validating constructor that turns raw options into a [`HostConfig`].

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::Tag;
use crate::backoff::{BackoffPolicy, BackoffPolicyError};
use crate::fs;
use crate::region;
use crate::security::{FirewallIntent, FirewallMode, PortSpecError, desired_rules, parse_port_spec};

mod lenient;

/// Provider served by the bundled adapter.
pub const SCALEWAY_PROVIDER: &str = "scaleway";
/// Instance tag the managed security group targets.
pub const FIREWALL_TARGET_TAG: &str = "hostwright";
/// Metadata key carrying the user-data payload.
pub const USER_DATA_KEY: &str = "cloud-init";
/// File name of generated private keys inside the per-host store directory.
pub const GENERATED_KEY_NAME: &str = "id_ed25519";

const CONFIG_FILE: &str = "hostwright.toml";

/// Raw host options layered from defaults, configuration files and
/// `HOSTWRIGHT_*` environment variables.
///
/// List-valued options accept a comma-separated string or an array; the
/// environment layer may deliver either.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "HOSTWRIGHT",
    discovery(
        app_name = "hostwright",
        env_var = "HOSTWRIGHT_CONFIG_PATH",
        config_file_name = "hostwright.toml",
        dotfile_name = ".hostwright.toml",
        project_file_name = "hostwright.toml"
    )
)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "user-facing toggles are naturally expressed as booleans"
)]
pub struct HostOptions {
    /// Cloud provider; only `scaleway` ships with the crate.
    #[ortho_config(default = SCALEWAY_PROVIDER.to_owned())]
    pub provider: String,
    /// Availability zone.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub zone: String,
    /// Machine size (commercial type).
    #[ortho_config(default = "DEV1-S".to_owned())]
    pub machine_type: String,
    /// Image label; defaults per zone.
    pub image: Option<String>,
    /// Boot volume size in gigabytes.
    #[ortho_config(default = 20)]
    pub disk_size_gb: u32,
    /// Boot volume type.
    #[ortho_config(default = "l_ssd".to_owned())]
    pub disk_type: String,
    /// Network name or resource path.
    pub network: Option<String>,
    /// Security group managed for the host.
    #[ortho_config(default = "hostwright".to_owned())]
    pub security_group: String,
    /// Leave the firewall untouched.
    #[ortho_config(default = false)]
    pub skip_firewall: bool,
    /// Report missing rules without creating them.
    #[ortho_config(default = false)]
    pub security_group_read_only: bool,
    /// Extra ports to open, as `port[/proto]` items.
    #[ortho_config(merge_strategy = "replace")]
    #[serde(default, deserialize_with = "lenient::list")]
    pub open_ports: Vec<String>,
    /// Open the cluster port as well.
    #[ortho_config(default = false)]
    pub cluster_mode: bool,
    /// Cluster manager port.
    #[ortho_config(default = 3376)]
    pub cluster_port: u16,
    /// Control daemon port, reported by `GetURL`.
    #[ortho_config(default = 2376)]
    pub control_port: u16,
    /// Tags as `key:value` items.
    #[ortho_config(merge_strategy = "replace")]
    #[serde(default, deserialize_with = "lenient::list")]
    pub tags: Vec<String>,
    /// Labels as `key:value` items.
    #[ortho_config(merge_strategy = "replace")]
    #[serde(default, deserialize_with = "lenient::list")]
    pub labels: Vec<String>,
    /// Metadata as `key=value` items.
    #[ortho_config(merge_strategy = "replace")]
    #[serde(default, deserialize_with = "lenient::list")]
    pub metadata: Vec<String>,
    /// Metadata as `key=path` items; values are file contents.
    #[ortho_config(merge_strategy = "replace")]
    #[serde(default, deserialize_with = "lenient::list")]
    pub metadata_from_file: Vec<String>,
    /// File whose contents become the user-data payload.
    pub user_data_file: Option<String>,
    /// TOML file holding provider credentials.
    pub credential_file: Option<String>,
    /// Project the host is billed to.
    pub project: Option<String>,
    /// Adopt an existing instance instead of creating one.
    #[ortho_config(default = false)]
    pub reuse_existing: bool,
    /// Request preemptible capacity.
    #[ortho_config(default = false)]
    pub preemptible: bool,
    /// Report the private address instead of the public one.
    #[ortho_config(default = false)]
    pub use_internal_ip: bool,
    /// SSH login user.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// SSH port.
    #[ortho_config(default = 22, cli_short = 'q')]
    pub ssh_port: u16,
    /// Private key to use instead of generating one.
    pub ssh_key_path: Option<String>,
    /// Inline public key to authorise.
    pub ssh_public_key: Option<String>,
    /// Existing backend key pair to use; requires `ssh_key_path`.
    pub key_pair_name: Option<String>,
    /// API endpoint override.
    pub endpoint: Option<String>,
    /// Accept invalid TLS certificates from the endpoint override.
    #[ortho_config(default = false)]
    pub insecure_transport: bool,
    /// Directory holding host records and generated keys.
    #[ortho_config(default = ".hostwright".to_owned(), cli_short = 'w')]
    pub store_dir: String,
    /// First backoff interval in seconds.
    #[ortho_config(default = 1)]
    pub backoff_initial_interval_secs: u64,
    /// Backoff jitter fraction, as a decimal string.
    #[ortho_config(default = "0.5".to_owned())]
    #[serde(deserialize_with = "lenient::text")]
    pub backoff_randomization_factor: String,
    /// Backoff growth factor, as a decimal string.
    #[ortho_config(default = "2.0".to_owned())]
    #[serde(deserialize_with = "lenient::text")]
    pub backoff_multiplier: String,
    /// Largest backoff interval in seconds.
    #[ortho_config(default = 30)]
    pub backoff_max_interval_secs: u64,
    /// Total backoff budget in seconds.
    #[ortho_config(default = 300)]
    pub backoff_max_elapsed_secs: u64,
}

impl HostOptions {
    /// Loads options without attempting to parse CLI arguments. Values merge
    /// defaults, configuration files and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("hostwright")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Fills a blank `project` from `fallback`, normally the credentials'
    /// `default_project_id`. An explicit project always wins.
    #[must_use]
    pub fn with_default_project(mut self, fallback: Option<&str>) -> Self {
        if non_blank(self.project.as_deref()).is_none() {
            self.project = non_blank(fallback);
        }
        self
    }

    /// Credential file named by the options, if any.
    #[must_use]
    pub fn credential_path(&self) -> Option<Utf8PathBuf> {
        non_blank(self.credential_file.as_deref()).map(Utf8PathBuf::from)
    }
}

/// SSH access settings.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SshSettings {
    /// Login user.
    pub user: String,
    /// Port.
    pub port: u16,
    /// Private key supplied by the caller.
    pub key_path: Option<Utf8PathBuf>,
    /// Inline public key supplied by the caller.
    pub public_key: Option<String>,
    /// Existing backend key pair.
    pub key_pair_name: Option<String>,
}

/// Boot volume settings.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DiskSettings {
    /// Size in gigabytes.
    pub size_gb: u32,
    /// Provider volume type.
    pub volume_type: String,
}

/// Validated provisioning intent for one host.
///
/// Built once by [`HostConfig::from_options`]; the driver never mutates it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Host name; also the instance name.
    pub name: String,
    /// Provider identity.
    pub provider: String,
    /// Project identifier.
    pub project: String,
    /// Availability zone.
    pub zone: String,
    /// Machine size.
    pub machine_type: String,
    /// Image label.
    pub image: String,
    /// Boot volume settings.
    pub disk: DiskSettings,
    /// Network name or resource path.
    pub network: Option<String>,
    /// Desired firewall state.
    pub firewall: FirewallIntent,
    /// Tags applied to the instance.
    pub tags: Vec<Tag>,
    /// Labels applied to the instance.
    pub labels: BTreeMap<String, String>,
    /// Metadata entries, user data included.
    pub metadata: BTreeMap<String, String>,
    /// Credential file reference.
    pub credential_file: Option<Utf8PathBuf>,
    /// Adopt an existing instance instead of creating one.
    pub reuse_existing: bool,
    /// Request preemptible capacity.
    pub preemptible: bool,
    /// Report the private address.
    pub use_internal_ip: bool,
    /// SSH access settings.
    pub ssh: SshSettings,
    /// Control daemon port.
    pub control_port: u16,
    /// API endpoint override.
    pub endpoint: Option<String>,
    /// Accept invalid TLS certificates from the endpoint override.
    pub insecure_transport: bool,
    /// Directory holding host records and generated keys.
    pub store_dir: Utf8PathBuf,
    /// Operation polling policy. `None` is rejected when a wait is needed.
    pub backoff: Option<BackoffPolicy>,
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// A value could not be interpreted.
    #[error("invalid {field}: {message}")]
    Invalid {
        /// Option name.
        field: &'static str,
        /// What was wrong.
        message: String,
    },
    /// Raised when TLS verification is disabled without an endpoint
    /// override.
    #[error("insecure_transport requires an endpoint override")]
    InsecureWithoutEndpoint,
    /// Raised when a key pair is named without its private key.
    #[error("key_pair_name requires ssh_key_path")]
    KeyPairWithoutKeyPath,
    /// Raised for providers the crate has no adapter for.
    #[error("unsupported provider {0}")]
    UnknownProvider(String),
    /// Raised when the provider cannot allocate preemptible capacity.
    #[error("provider {0} does not offer preemptible instances")]
    PreemptibleUnsupported(String),
    /// Raised for zones outside the region table without an endpoint
    /// override.
    #[error("unknown zone {0}")]
    UnknownZone(String),
    /// Raised when the backoff parameters are inconsistent.
    #[error(transparent)]
    Backoff(#[from] BackoffPolicyError),
    /// Raised when an open-port specification is malformed.
    #[error(transparent)]
    Port(#[from] PortSpecError),
    /// Raised when a referenced file cannot be read.
    #[error("failed to read {path}: {message}")]
    File {
        /// Path that could not be read.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when an operation needs to wait but no policy is configured.
    #[error("operation backoff policy is not configured")]
    MissingBackoffPolicy,
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to {CONFIG_FILE}",
            metadata.description, metadata.env_var, metadata.toml_key
        )));
    }
    Ok(())
}

impl HostConfig {
    /// Validates `options` and builds the configuration for host `name`.
    ///
    /// Files referenced by `metadata_from_file` and `user_data_file` are read
    /// here so that later steps never touch the filesystem for them.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for the first invalid or inconsistent option.
    pub fn from_options(name: &str, options: &HostOptions) -> Result<Self, ConfigError> {
        validate_host_name(name)?;
        let project = options.project.clone().unwrap_or_default();
        require_field(
            &project,
            &FieldMetadata {
                description: "project",
                env_var: "HOSTWRIGHT_PROJECT (or SCW_DEFAULT_PROJECT_ID)",
                toml_key: "project",
            },
        )?;
        require_field(
            &options.zone,
            &FieldMetadata {
                description: "availability zone",
                env_var: "HOSTWRIGHT_ZONE",
                toml_key: "zone",
            },
        )?;
        require_field(
            &options.machine_type,
            &FieldMetadata {
                description: "machine type",
                env_var: "HOSTWRIGHT_MACHINE_TYPE",
                toml_key: "machine_type",
            },
        )?;
        require_field(
            &options.ssh_user,
            &FieldMetadata {
                description: "SSH user",
                env_var: "HOSTWRIGHT_SSH_USER",
                toml_key: "ssh_user",
            },
        )?;

        let endpoint = non_blank(options.endpoint.as_deref());
        if options.insecure_transport && endpoint.is_none() {
            return Err(ConfigError::InsecureWithoutEndpoint);
        }
        let key_path = non_blank(options.ssh_key_path.as_deref()).map(Utf8PathBuf::from);
        let key_pair_name = non_blank(options.key_pair_name.as_deref());
        if key_pair_name.is_some() && key_path.is_none() {
            return Err(ConfigError::KeyPairWithoutKeyPath);
        }
        let provider = options.provider.trim().to_ascii_lowercase();
        if provider != SCALEWAY_PROVIDER {
            return Err(ConfigError::UnknownProvider(provider));
        }
        if options.preemptible {
            return Err(ConfigError::PreemptibleUnsupported(provider));
        }
        let zone = options.zone.trim().to_owned();
        if endpoint.is_none() && region::lookup(&zone).is_none() {
            return Err(ConfigError::UnknownZone(zone));
        }
        if options.disk_size_gb == 0 {
            return Err(ConfigError::Invalid {
                field: "disk_size_gb",
                message: String::from("must be greater than zero"),
            });
        }

        let open_ports = split_list(&options.open_ports)
            .map(parse_port_spec)
            .collect::<Result<Vec<_>, _>>()?;
        let firewall = FirewallIntent {
            group: options.security_group.trim().to_owned(),
            network: non_blank(options.network.as_deref()),
            target_tag: FIREWALL_TARGET_TAG.to_owned(),
            rules: desired_rules(
                options.control_port,
                options.cluster_mode.then_some(options.cluster_port),
                &open_ports,
            ),
            mode: firewall_mode(options),
        };
        if firewall.mode != FirewallMode::Skip && firewall.group.is_empty() {
            return Err(ConfigError::Invalid {
                field: "security_group",
                message: String::from("must not be empty unless the firewall is skipped"),
            });
        }

        let image = non_blank(options.image.as_deref())
            .unwrap_or_else(|| region::default_image(&zone).to_owned());

        Ok(Self {
            name: name.to_owned(),
            provider,
            project: project.trim().to_owned(),
            image,
            zone,
            machine_type: options.machine_type.trim().to_owned(),
            disk: DiskSettings {
                size_gb: options.disk_size_gb,
                volume_type: options.disk_type.trim().to_owned(),
            },
            network: firewall.network.clone(),
            firewall,
            tags: parse_tags(&options.tags),
            labels: parse_labels(&options.labels)?,
            metadata: parse_metadata(options)?,
            credential_file: options.credential_path(),
            reuse_existing: options.reuse_existing,
            preemptible: options.preemptible,
            use_internal_ip: options.use_internal_ip,
            ssh: SshSettings {
                user: options.ssh_user.trim().to_owned(),
                port: options.ssh_port,
                key_path,
                public_key: non_blank(options.ssh_public_key.as_deref()),
                key_pair_name,
            },
            control_port: options.control_port,
            endpoint,
            insecure_transport: options.insecure_transport,
            store_dir: Utf8PathBuf::from(options.store_dir.trim()),
            backoff: Some(parse_backoff(options)?),
        })
    }

    /// Name of the boot volume owned by this host.
    #[must_use]
    pub fn volume_name(&self) -> String {
        format!("{}-disk", self.name)
    }

    /// Location of the private key generated for this host.
    #[must_use]
    pub fn generated_key_path(&self) -> Utf8PathBuf {
        self.store_dir.join(&self.name).join(GENERATED_KEY_NAME)
    }
}

fn validate_host_name(name: &str) -> Result<(), ConfigError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field: "host name",
            message: format!(
                "{name:?} must be 1-63 lowercase letters, digits or inner hyphens"
            ),
        })
    }
}

fn firewall_mode(options: &HostOptions) -> FirewallMode {
    if options.skip_firewall {
        FirewallMode::Skip
    } else if options.security_group_read_only {
        FirewallMode::ReadOnly
    } else {
        FirewallMode::Managed
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

fn split_list(items: &[String]) -> impl Iterator<Item = &str> {
    items
        .iter()
        .flat_map(|item| item.split(','))
        .map(str::trim)
        .filter(|item| !item.is_empty())
}

fn parse_tags(value: &[String]) -> Vec<Tag> {
    split_list(value)
        .map(|item| match item.split_once(':') {
            Some((key, tag_value)) => Tag::new(key.trim(), tag_value.trim()),
            None => Tag::new(item, ""),
        })
        .collect()
}

fn parse_labels(value: &[String]) -> Result<BTreeMap<String, String>, ConfigError> {
    split_list(value)
        .map(|item| {
            item.split_once(':')
                .map(|(key, label)| (key.trim().to_owned(), label.trim().to_owned()))
                .filter(|(key, _)| !key.is_empty())
                .ok_or_else(|| ConfigError::Invalid {
                    field: "labels",
                    message: format!("{item:?} is not a key:value pair"),
                })
        })
        .collect()
}

fn parse_metadata(options: &HostOptions) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut metadata = BTreeMap::new();
    for item in split_list(&options.metadata) {
        let (key, value) = split_pair(item, "metadata")?;
        if !value.is_empty() {
            metadata.insert(key.to_owned(), value.to_owned());
        }
    }
    for item in split_list(&options.metadata_from_file) {
        let (key, path) = split_pair(item, "metadata_from_file")?;
        let contents = read_file(Utf8Path::new(path))?;
        if !contents.is_empty() {
            metadata.insert(key.to_owned(), contents);
        }
    }
    if let Some(path) = non_blank(options.user_data_file.as_deref()) {
        let contents = read_file(Utf8Path::new(&path))?;
        metadata.insert(USER_DATA_KEY.to_owned(), contents);
    }
    Ok(metadata)
}

fn split_pair<'a>(item: &'a str, field: &'static str) -> Result<(&'a str, &'a str), ConfigError> {
    item.split_once('=')
        .map(|(key, value)| (key.trim(), value.trim()))
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| ConfigError::Invalid {
            field,
            message: format!("{item:?} is not a key=value pair"),
        })
}

fn read_file(path: &Utf8Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|err| ConfigError::File {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn parse_backoff(options: &HostOptions) -> Result<BackoffPolicy, ConfigError> {
    let randomization_factor = parse_decimal(
        &options.backoff_randomization_factor,
        "backoff_randomization_factor",
    )?;
    let multiplier = parse_decimal(&options.backoff_multiplier, "backoff_multiplier")?;
    let policy = BackoffPolicy {
        initial_interval: Duration::from_secs(options.backoff_initial_interval_secs),
        randomization_factor,
        multiplier,
        max_interval: Duration::from_secs(options.backoff_max_interval_secs),
        max_elapsed_time: Duration::from_secs(options.backoff_max_elapsed_secs),
    };
    policy.validate()?;
    Ok(policy)
}

fn parse_decimal(raw: &str, field: &'static str) -> Result<f64, ConfigError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| ConfigError::Invalid {
            field,
            message: format!("{raw:?} is not a number"),
        })
}

/// Scaleway API credentials, loaded from `SCW_*` environment variables and
/// configuration files, or from an explicit credential file.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "SCW")]
pub struct ScalewayCredentials {
    /// Access key assigned to the Scaleway application.
    pub access_key: Option<String>,
    /// Secret key used for authentication. This value is required.
    pub secret_key: String,
    /// Organisation identifier used by some Scaleway endpoints.
    pub default_organization_id: Option<String>,
    /// Project identifier used when the host options do not name one.
    pub default_project_id: Option<String>,
}

impl ScalewayCredentials {
    /// Loads credentials from `credential_file` when given, otherwise from
    /// the layered `SCW_*` sources.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the sources cannot be merged or parsed,
    /// or when the secret key is empty.
    pub fn load(credential_file: Option<&Utf8Path>) -> Result<Self, ConfigError> {
        let credentials = match credential_file {
            Some(path) => {
                let contents = read_file(path)?;
                ortho_config::toml::from_str::<Self>(&contents).map_err(|err| {
                    ConfigError::Parse(format!("{path}: {err}"))
                })?
            }
            None => Self::load_from_iter([OsString::from("hostwright")])
                .map_err(|err| ConfigError::Parse(err.to_string()))?,
        };
        credentials.validate()?;
        Ok(credentials)
    }

    /// Checks that the secret key is present.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the environment variable
    /// and file key to set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.secret_key,
            &FieldMetadata {
                description: "Scaleway API secret key",
                env_var: "SCW_SECRET_KEY",
                toml_key: "secret_key",
            },
        )
    }
}
