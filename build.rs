//! Renders manual pages for `hostwright` and each of its subcommands into
//! `OUT_DIR`, where packaging picks them up.

use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = io::stdout();
    for watched in ["build.rs", "src/cli/mod.rs"] {
        writeln!(stdout, "cargo:rerun-if-changed={watched}")?;
    }

    let out_dir = env::var_os("OUT_DIR")
        .map(PathBuf::from)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "OUT_DIR was not set"))?;

    let command = cli::Cli::command();
    render(&out_dir, "hostwright", command.clone())?;
    for sub in command.get_subcommands() {
        let page = format!("hostwright-{}", sub.get_name());
        render(&out_dir, &page, sub.clone())?;
    }
    Ok(())
}

fn render(out_dir: &Path, page: &str, command: clap::Command) -> io::Result<()> {
    let mut buffer = Vec::new();
    Man::new(command).render(&mut buffer)?;
    fs::write(out_dir.join(format!("{page}.1")), buffer)
}
