//! Binary entry point for the hostwright CLI.

mod cli;

use std::error::Error as _;
use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use hostwright::command::ProcessCommandRunner;
use hostwright::{
    ConfigError, Driver, DriverError, HostConfig, HostDriver, HostOptions, HostState, HostStore,
    ScalewayBackend, ScalewayBackendError, ScalewayCredentials, SshKeygen, StoreError,
};

use cli::{Cli, HostArgs};

/// Environment variable holding the log filter.
const LOG_ENV: &str = "HOSTWRIGHT_LOG";
const DEFAULT_LOG_FILTER: &str = "info";

type ScalewayDriver = HostDriver<ScalewayBackend, SshKeygen>;

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Backend(#[from] ScalewayBackendError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("host {0} already has a record; remove it first")]
    AlreadyRecorded(String),
    #[error(transparent)]
    Driver(#[from] DriverError<ScalewayBackendError>),
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(lines) => {
            let mut stdout = io::stdout();
            for line in lines {
                writeln!(stdout, "{line}").ok();
            }
            0
        }
        Err(err) => {
            write_error(io::stderr(), &err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

async fn dispatch(cli: Cli) -> Result<Vec<String>, CliError> {
    if let Cli::Create(args) = &cli {
        return create(&args.host).await;
    }

    let host = host_args(&cli).host.clone();
    let options = HostOptions::load_without_cli_args()?;
    let store = HostStore::new(options.store_dir.trim());
    let record = store.load(&host)?;
    let backend = build_backend(&record.config)?;
    let mut driver = HostDriver::from_record(backend, keygen(), record);
    cancel_on_interrupt(driver.cancellation().clone());

    let result = run(&cli, &mut driver).await;
    if matches!(cli, Cli::Remove(_)) && result.is_ok() {
        store.delete(&host)?;
    } else {
        store.save(&driver.record())?;
    }
    result
}

async fn create(host: &str) -> Result<Vec<String>, CliError> {
    let loaded = HostOptions::load_without_cli_args()?;
    let credentials = ScalewayCredentials::load(loaded.credential_path().as_deref())?;
    let options = loaded.with_default_project(credentials.default_project_id.as_deref());
    let config = HostConfig::from_options(host, &options)?;
    let store = HostStore::new(config.store_dir.clone());
    if store.contains(host)? {
        return Err(CliError::AlreadyRecorded(host.to_owned()));
    }

    let backend = ScalewayBackend::new(&config, &credentials)?;
    let mut driver = HostDriver::new(backend, keygen(), config);
    cancel_on_interrupt(driver.cancellation().clone());

    driver.pre_create_check().await?;
    if let Err(err) = driver.create().await {
        keep_record_of_leftovers(&store, &driver);
        return Err(err.into());
    }
    let path = store.save(&driver.record())?;
    let address = driver.host_state().ip.clone().unwrap_or_default();
    Ok(vec![format!("created {host} at {address} (record {path})")])
}

async fn run(cli: &Cli, driver: &mut ScalewayDriver) -> Result<Vec<String>, CliError> {
    let host = driver.config().name.clone();
    let lines = match cli {
        Cli::Create(_) => Vec::new(),
        Cli::Start(_) => {
            driver.start().await?;
            vec![format!("started {host}")]
        }
        Cli::Stop(_) => {
            driver.stop().await?;
            vec![format!("stopped {host}")]
        }
        Cli::Restart(_) => {
            driver.restart().await?;
            vec![format!("restarted {host}")]
        }
        Cli::Kill(_) => {
            driver.kill().await?;
            vec![format!("killed {host}")]
        }
        Cli::Remove(_) => {
            driver.remove().await?;
            vec![format!("removed {host}")]
        }
        Cli::State(_) => vec![driver.state().await?.to_string()],
        Cli::Ip(_) => vec![driver.ip().await?],
        Cli::Url(_) => vec![driver.url().await?],
        Cli::SshInfo(_) => {
            let hostname = driver.ssh_hostname().await?;
            let mut lines = vec![
                format!("hostname: {hostname}"),
                format!("user: {}", driver.ssh_username()),
                format!("port: {}", driver.ssh_port()),
            ];
            if let Some(path) = driver
                .host_state()
                .key_pair
                .as_ref()
                .and_then(|key| key.private_key_path.as_ref())
            {
                lines.push(format!("identity: {path}"));
            }
            lines
        }
    };
    Ok(lines)
}

const fn host_args(cli: &Cli) -> &HostArgs {
    match cli {
        Cli::Create(args)
        | Cli::Start(args)
        | Cli::Stop(args)
        | Cli::Restart(args)
        | Cli::Kill(args)
        | Cli::Remove(args)
        | Cli::State(args)
        | Cli::Ip(args)
        | Cli::Url(args)
        | Cli::SshInfo(args) => args,
    }
}

/// Saves the record of a failed create whose compensation left resources
/// behind, so that `remove` can finish the job.
fn keep_record_of_leftovers<B, K>(store: &HostStore, driver: &HostDriver<B, K>) {
    let host = &driver.config().name;
    if !has_leftovers(driver.host_state()) {
        return;
    }
    match store.save(&driver.record()) {
        Ok(path) => warn!(
            host = %host,
            record = %path,
            "create left resources behind; run remove to clean up"
        ),
        Err(err) => warn!(host = %host, error = %err, "failed to record resources left by create"),
    }
}

const fn has_leftovers(state: &HostState) -> bool {
    state.instance_id.is_some() || state.key_pair.is_some()
}

fn build_backend(config: &HostConfig) -> Result<ScalewayBackend, CliError> {
    let credentials = ScalewayCredentials::load(config.credential_file.as_deref())?;
    Ok(ScalewayBackend::new(config, &credentials)?)
}

const fn keygen() -> SshKeygen {
    SshKeygen::new(ProcessCommandRunner)
}

fn cancel_on_interrupt(cancel: CancellationToken) {
    let _watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            cancel.cancel();
        }
    });
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "error: {err}").ok();
    let mut source = err.source();
    while let Some(cause) = source {
        writeln!(target, "  caused by: {cause}").ok();
        source = cause.source();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use camino::Utf8PathBuf;
    use hostwright::backend::BackendErrorKind;
    use hostwright::poller::ReadinessWait;
    use hostwright::test_support::{FakeCall, FakeCloud, FakeError, StaticKeyGenerator, host_options};
    use hostwright::PreconditionError;
    use rstest::rstest;
    use tempfile::TempDir;

    fn store_in(tmp: &TempDir) -> HostStore {
        let root = Utf8PathBuf::from_path_buf(tmp.path().join("hosts"))
            .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
        HostStore::new(root)
    }

    async fn failed_create(cloud: &FakeCloud) -> HostDriver<FakeCloud, StaticKeyGenerator> {
        let config = HostConfig::from_options("web-1", &host_options())
            .unwrap_or_else(|err| panic!("config: {err}"));
        cloud.set_address_lag(u32::MAX);
        let mut driver = HostDriver::new(cloud.clone(), StaticKeyGenerator::default(), config)
            .with_readiness(ReadinessWait {
                attempts: 2,
                interval: Duration::from_secs(1),
            });
        assert!(driver.create().await.is_err(), "create should time out");
        driver
    }

    #[tokio::test(start_paused = true)]
    async fn incomplete_compensation_keeps_the_record() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let store = store_in(&tmp);
        let cloud = FakeCloud::new();
        cloud.fail(
            FakeCall::TerminateInstance,
            FakeError::new(BackendErrorKind::Transient, "api down"),
        );
        let driver = failed_create(&cloud).await;

        keep_record_of_leftovers(&store, &driver);

        let record = store
            .load("web-1")
            .unwrap_or_else(|err| panic!("record should be kept: {err}"));
        assert!(record.state.instance_id.is_some());
        assert!(cloud.instance_named("web-1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn clean_compensation_leaves_no_record() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let store = store_in(&tmp);
        let cloud = FakeCloud::new();
        let driver = failed_create(&cloud).await;

        keep_record_of_leftovers(&store, &driver);

        assert!(!has_leftovers(driver.host_state()));
        assert!(!store.contains("web-1").unwrap_or(true));
    }

    #[rstest]
    #[case(&["hostwright", "create", "web-1"])]
    #[case(&["hostwright", "ssh-info", "web-1"])]
    #[case(&["hostwright", "remove", "web-1"])]
    fn every_subcommand_takes_the_host(#[case] argv: &[&str]) {
        let cli = Cli::try_parse_from(argv).unwrap_or_else(|err| panic!("parse: {err}"));

        assert_eq!(host_args(&cli).host, "web-1");
    }

    #[test]
    fn subcommands_require_a_host() {
        assert!(Cli::try_parse_from(["hostwright", "stop"]).is_err());
    }

    #[test]
    fn errors_are_written_with_their_message() {
        let mut buf = Vec::new();
        let err = CliError::Driver(DriverError::Precondition(PreconditionError::HostNotRunning {
            host: String::from("web-1"),
        }));

        write_error(&mut buf, &err);

        let rendered = String::from_utf8(buf).unwrap_or_else(|utf8_err| panic!("utf8: {utf8_err}"));
        assert!(rendered.starts_with("error: "), "rendered: {rendered}");
        assert!(rendered.contains("web-1"), "rendered: {rendered}");
    }

    #[test]
    fn recorded_hosts_are_not_created_twice() {
        let mut buf = Vec::new();

        write_error(&mut buf, &CliError::AlreadyRecorded(String::from("web-1")));

        let rendered = String::from_utf8(buf).unwrap_or_else(|utf8_err| panic!("utf8: {utf8_err}"));
        assert_eq!(
            rendered,
            "error: host web-1 already has a record; remove it first\n"
        );
    }
}
