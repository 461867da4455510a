//! Layered option and credential loading from the environment.

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use hostwright::test_support::EnvGuard;
use hostwright::{ConfigError, FirewallMode, HostConfig, HostOptions, ScalewayCredentials};
use tempfile::TempDir;

fn temp_root(tmp: &TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()))
}

#[tokio::test(flavor = "current_thread")]
async fn environment_overrides_defaults() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let home = temp_root(&tmp);
    let _guard = EnvGuard::set_vars(&[
        ("HOME", home.as_str()),
        ("HOSTWRIGHT_PROJECT", "11111111-2222-3333-4444-555555555555"),
        ("HOSTWRIGHT_ZONE", "nl-ams-1"),
        ("HOSTWRIGHT_SSH_USER", "ubuntu"),
        ("HOSTWRIGHT_OPEN_PORTS", "8080,53/udp"),
        ("HOSTWRIGHT_SECURITY_GROUP_READ_ONLY", "true"),
    ])
    .await;

    let options =
        HostOptions::load_without_cli_args().unwrap_or_else(|err| panic!("load options: {err}"));
    let config =
        HostConfig::from_options("web-1", &options).unwrap_or_else(|err| panic!("config: {err}"));

    assert_eq!(config.zone, "nl-ams-1");
    assert_eq!(config.machine_type, "DEV1-S");
    assert_eq!(config.ssh.user, "ubuntu");
    assert_eq!(config.firewall.mode, FirewallMode::ReadOnly);
    let rendered: Vec<String> = config
        .firewall
        .rules
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(rendered, ["2376/tcp", "8080/tcp", "53/udp"]);
}

#[tokio::test(flavor = "current_thread")]
async fn defaults_load_without_any_sources() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let home = temp_root(&tmp);
    let _guard = EnvGuard::set_vars(&[("HOME", home.as_str())]).await;

    let options =
        HostOptions::load_without_cli_args().unwrap_or_else(|err| panic!("load options: {err}"));

    assert_eq!(options.ssh_port, 22);
    assert_eq!(options.store_dir, ".hostwright");
    assert!(options.open_ports.is_empty());
    assert_eq!(options.backoff_multiplier, "2.0");
}

#[tokio::test(flavor = "current_thread")]
async fn numeric_environment_values_fill_text_and_list_options() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let home = temp_root(&tmp);
    let _guard = EnvGuard::set_vars(&[
        ("HOME", home.as_str()),
        ("HOSTWRIGHT_PROJECT", "11111111-2222-3333-4444-555555555555"),
        ("HOSTWRIGHT_OPEN_PORTS", "8080"),
        ("HOSTWRIGHT_TAGS", "team:infra,ephemeral"),
        ("HOSTWRIGHT_BACKOFF_MULTIPLIER", "3"),
        ("HOSTWRIGHT_BACKOFF_RANDOMIZATION_FACTOR", "0.25"),
    ])
    .await;

    let options =
        HostOptions::load_without_cli_args().unwrap_or_else(|err| panic!("load options: {err}"));
    let config =
        HostConfig::from_options("web-1", &options).unwrap_or_else(|err| panic!("config: {err}"));

    let rendered: Vec<String> = config
        .firewall
        .rules
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(rendered, ["2376/tcp", "8080/tcp"]);
    assert_eq!(config.tags.len(), 2);
    let backoff = config
        .backoff
        .unwrap_or_else(|| panic!("backoff policy should be configured"));
    assert_eq!(backoff.multiplier.to_string(), "3");
    assert_eq!(backoff.randomization_factor.to_string(), "0.25");
}

#[tokio::test(flavor = "current_thread")]
async fn config_file_lists_may_be_arrays() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = temp_root(&tmp);
    Dir::open_ambient_dir(&root, ambient_authority())
        .unwrap_or_else(|err| panic!("open temp dir: {err}"))
        .write(
            "hostwright.toml",
            "project = \"proj-1\"\nopen_ports = [8080, \"53/udp\"]\nlabels = \"env:staging\"\n",
        )
        .unwrap_or_else(|err| panic!("write config: {err}"));
    let config_path = root.join("hostwright.toml");
    let _guard = EnvGuard::set_vars(&[
        ("HOME", root.as_str()),
        ("HOSTWRIGHT_CONFIG_PATH", config_path.as_str()),
    ])
    .await;

    let options =
        HostOptions::load_without_cli_args().unwrap_or_else(|err| panic!("load options: {err}"));

    assert_eq!(options.open_ports, ["8080", "53/udp"]);
    assert_eq!(options.labels, ["env:staging"]);
}

#[tokio::test(flavor = "current_thread")]
async fn explicit_config_file_is_layered_under_the_environment() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = temp_root(&tmp);
    Dir::open_ambient_dir(&root, ambient_authority())
        .unwrap_or_else(|err| panic!("open temp dir: {err}"))
        .write(
            "hostwright.toml",
            "machine_type = \"GP1-XS\"\nzone = \"fr-par-2\"\n",
        )
        .unwrap_or_else(|err| panic!("write config: {err}"));
    let config_path = root.join("hostwright.toml");
    let _guard = EnvGuard::set_vars(&[
        ("HOME", root.as_str()),
        ("HOSTWRIGHT_CONFIG_PATH", config_path.as_str()),
        ("HOSTWRIGHT_ZONE", "pl-waw-1"),
    ])
    .await;

    let options =
        HostOptions::load_without_cli_args().unwrap_or_else(|err| panic!("load options: {err}"));

    assert_eq!(options.machine_type, "GP1-XS");
    assert_eq!(options.zone, "pl-waw-1");
}

#[tokio::test(flavor = "current_thread")]
async fn credentials_come_from_scw_variables() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let home = temp_root(&tmp);
    let _guard = EnvGuard::set_vars(&[
        ("HOME", home.as_str()),
        ("SCW_SECRET_KEY", "SCWSECRETKEYEXAMPLE"),
        ("SCW_DEFAULT_PROJECT_ID", "proj-1"),
    ])
    .await;

    let credentials =
        ScalewayCredentials::load(None).unwrap_or_else(|err| panic!("load credentials: {err}"));

    assert_eq!(credentials.secret_key, "SCWSECRETKEYEXAMPLE");
    assert_eq!(credentials.default_project_id.as_deref(), Some("proj-1"));
}

#[tokio::test(flavor = "current_thread")]
async fn blank_secret_is_an_actionable_error() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let home = temp_root(&tmp);
    let _guard = EnvGuard::set_vars(&[("HOME", home.as_str()), ("SCW_SECRET_KEY", "   ")]).await;

    let err = ScalewayCredentials::load(None)
        .err()
        .unwrap_or_else(|| panic!("blank secret should be rejected"));

    assert!(matches!(err, ConfigError::MissingField(_)), "{err}");
    assert!(err.to_string().contains("SCW_SECRET_KEY"), "{err}");
}
