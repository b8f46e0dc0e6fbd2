use crate::cmd::{init_logger, Args};
use anyhow::Result;
use clap::Parser;

mod assemble;
mod cmd;
mod common;
mod model;
mod oci;
mod paths;
mod proc_id;
mod spec_builder;
mod tarfs;

/// `anyhow` prints a nicely formatted error message with `Debug`, so we can
/// return a result straight from `main`.
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.log_level);
    cmd::run(args).await
}
