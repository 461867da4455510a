//! Command-line interface definitions for the `hostwright` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser};

/// Top-level CLI for the `hostwright` binary.
#[derive(Debug, Parser)]
#[command(
    name = "hostwright",
    about = "Create, power-cycle, inspect and remove a single cloud VM host",
    long_about = "Create, power-cycle, inspect and remove a single cloud VM host.\n\n\
                  Host options come from hostwright.toml and HOSTWRIGHT_* environment \
                  variables; credentials from SCW_* variables or credential_file. \
                  Set HOSTWRIGHT_LOG to adjust log verbosity.",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Check preconditions, create the host and record it.
    #[command(name = "create")]
    Create(HostArgs),
    /// Power the host on, re-creating it from a retained volume if needed.
    #[command(name = "start")]
    Start(HostArgs),
    /// Gracefully power the host off.
    #[command(name = "stop")]
    Stop(HostArgs),
    /// Reboot the host.
    #[command(name = "restart")]
    Restart(HostArgs),
    /// Forcefully power the host off.
    #[command(name = "kill")]
    Kill(HostArgs),
    /// Delete the instance, its volume and any generated key pair.
    #[command(name = "remove")]
    Remove(HostArgs),
    /// Print the lifecycle state.
    #[command(name = "state")]
    State(HostArgs),
    /// Print the host address.
    #[command(name = "ip")]
    Ip(HostArgs),
    /// Print the control daemon URL.
    #[command(name = "url")]
    Url(HostArgs),
    /// Print SSH connection details.
    #[command(name = "ssh-info")]
    SshInfo(HostArgs),
}

/// Arguments shared by every subcommand.
#[derive(Debug, Args)]
pub(crate) struct HostArgs {
    /// Host name: lowercase letters, digits and inner hyphens.
    #[arg(value_name = "HOST")]
    pub(crate) host: String,
}
