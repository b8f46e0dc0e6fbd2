mod build_image;
mod debug;

use anyhow::Result;
use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;

use self::build_image::BuildImage;
use self::debug::Debug;

const DEFAULT_LEVEL_FILTER: LevelFilter = LevelFilter::Info;

/// Builds a reproducible OCI application image and embeds the in-container
/// supervisor needed to run it.
#[derive(Debug, Parser)]
#[clap(about, long_about = None, version)]
pub(crate) struct Args {
    /// Set the logging level. One of [off|error|warn|info|debug|trace].
    /// Defaults to info. Leave unset and use RUST_LOG instead if you prefer.
    /// See https://github.com/rust-cli/env_logger/
    #[clap(long = "log-level")]
    pub(crate) log_level: Option<LevelFilter>,

    #[clap(subcommand)]
    pub(crate) subcommand: Subcommand,
}

#[derive(Debug, Parser)]
pub(crate) enum Subcommand {
    /// Build an OCI application image from a compile result.
    BuildImage(BuildImage),

    /// Commands for checking and troubleshooting this tool's internals.
    #[clap(subcommand)]
    Debug(Debug),
}

pub(super) async fn run(args: Args) -> Result<()> {
    match args.subcommand {
        Subcommand::BuildImage(cmd) => cmd.run().await,
        Subcommand::Debug(cmd) => cmd.run().await,
    }
}

/// Use `level` if present, or else use `RUST_LOG` if present, or else use a
/// per-crate default.
pub(super) fn init_logger(level: Option<LevelFilter>) {
    match (std::env::var(env_logger::DEFAULT_FILTER_ENV).ok(), level) {
        (Some(_), None) => {
            Builder::from_default_env().init();
        }
        _ => {
            Builder::new()
                .filter(
                    Some(env!("CARGO_CRATE_NAME")),
                    level.unwrap_or(DEFAULT_LEVEL_FILTER),
                )
                .init();
        }
    }
}
