use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

fn main() -> ExitCode {
    if let Err(err) = try_main() {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn try_main() -> anyhow::Result<()> {
    dexie_offline::logging::init().context("init logging")?;

    let cli = dexie_offline::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        dexie_offline::cli::Command::Manifest(args) => {
            dexie_offline::manifest::run(args).context("manifest")?;
        }
        dexie_offline::cli::Command::Sections(args) => {
            let out = dexie_offline::manifest::dump_sections(args).context("sections")?;
            println!("{out}");
        }
    }

    Ok(())
}
