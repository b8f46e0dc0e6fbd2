use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use crate::common::fs;
use crate::model::{CompileResult, DescribeConfig};
use crate::proc_id::RandomProcIdGenerator;
use crate::spec_builder;

/// Commands that expose internals for troubleshooting, the way `twoliter
/// debug check-tools` exposes tool installation for inspection.
#[derive(Debug, Clone, Parser)]
pub(crate) enum Debug {
    /// Print the computed `ImageSpec` as JSON. Pure; has no side effects.
    Describe(Describe),

    /// List tar entries in the order they appear, for verifying the tar
    /// filesystem builder's determinism.
    InspectLayer(InspectLayer),
}

impl Debug {
    pub(crate) async fn run(&self) -> Result<()> {
        match self {
            Debug::Describe(cmd) => cmd.run().await,
            Debug::InspectLayer(cmd) => cmd.run().await,
        }
    }
}

#[derive(Debug, Clone, Parser)]
pub(crate) struct Describe {
    #[clap(long)]
    compile_result: PathBuf,
}

impl Describe {
    pub(crate) async fn run(&self) -> Result<()> {
        let bytes = fs::read(&self.compile_result).await?;
        let compile_result: CompileResult =
            serde_json::from_slice(&bytes).context("parse compile result JSON")?;

        let describe_config = DescribeConfig {
            compile_result,
            docker_base_image: None,
            working_dir: None,
            bundle_source: None,
            build_info: Default::default(),
        };

        let spec = spec_builder::describe(&describe_config, &RandomProcIdGenerator)
            .context("describe image spec")?;
        println!("{}", serde_json::to_string_pretty(&spec)?);
        Ok(())
    }
}

#[derive(Debug, Clone, Parser)]
pub(crate) struct InspectLayer {
    tar_path: PathBuf,
}

impl InspectLayer {
    pub(crate) async fn run(&self) -> Result<()> {
        let file = File::open(&self.tar_path)
            .with_context(|| format!("open {}", self.tar_path.display()))?;
        let mut archive = tar::Archive::new(file);
        for (index, entry) in archive.entries()?.enumerate() {
            let entry = entry?;
            let header = entry.header();
            println!(
                "{index:>4}  {:o}  {:>10}  {}",
                header.mode().unwrap_or(0),
                header.size().unwrap_or(0),
                entry.path()?.display(),
            );
        }
        Ok(())
    }
}
