use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::{Context, Result};
use clap::Parser;

use crate::assemble::{self, BuildConfig};
use crate::common::fs;
use crate::model::{canonical, BundleSource, CompileResult, DescribeConfig};
use crate::paths::{HostPath, ImagePath};
use crate::proc_id::RandomProcIdGenerator;
use crate::spec_builder;

/// Path to the supervisor binary embedded into this `packager` binary via
/// the Cargo artifact dependency declared in `Cargo.toml`, the same
/// mechanism `twoliter` uses to embed `buildsys`/`pubsys`/`tuftool`.
fn embedded_supervisor_binary() -> HostPath {
    HostPath::new(env!("CARGO_BIN_FILE_SUPERVISOR_supervisor"))
}

/// A canonical, well-known root CA bundle to embed when `--add-ca-certs`
/// is passed without its own URL. Applications that make outbound TLS
/// calls from a `scratch`-based image need this, since `scratch` ships no
/// trust store of its own.
const DEFAULT_CA_BUNDLE_URL: &str = "https://curl.se/ca/cacert.pem";

/// Runs the full pipeline: describe, build the layer, assemble the image.
#[derive(Debug, Clone, Parser)]
pub(crate) struct BuildImage {
    /// Path to a JSON-encoded `CompileResult`.
    #[clap(long)]
    compile_result: PathBuf,

    /// Directory to write the OCI image layout into.
    #[clap(long)]
    out: PathBuf,

    /// Use this image reference as the base instead of the compile
    /// result's declared base image.
    #[clap(long)]
    base_image_override: Option<String>,

    /// Override the working directory baked into the image.
    #[clap(long)]
    working_dir: Option<String>,

    /// Path to a JSON-encoded `BundleSource` describing application
    /// source to copy into the image alongside the compiled artifacts.
    #[clap(long)]
    bundle_source: Option<PathBuf>,

    /// Embed a root CA certificate bundle, fetched from this URL (or a
    /// built-in default if no URL is given).
    #[clap(long, num_args = 0..=1, default_missing_value = "")]
    add_ca_certs: Option<String>,
}

impl BuildImage {
    pub(crate) async fn run(&self) -> Result<()> {
        let compile_result_bytes = fs::read(&self.compile_result).await?;
        let compile_result: CompileResult = serde_json::from_slice(&compile_result_bytes)
            .context("parse compile result JSON")?;

        let bundle_source = match &self.bundle_source {
            Some(path) => {
                let bytes = fs::read(path).await?;
                let bundle: BundleSource =
                    serde_json::from_slice(&bytes).context("parse bundle source JSON")?;
                Some(bundle)
            }
            None => None,
        };

        let describe_config = DescribeConfig {
            compile_result,
            docker_base_image: None,
            working_dir: self.working_dir.clone().map(ImagePath::new),
            bundle_source,
            build_info: Default::default(),
        };

        let mut spec = spec_builder::describe(&describe_config, &RandomProcIdGenerator)
            .context("describe image spec")?;

        let supervisor_bin = ImagePath::new(canonical::SUPERVISOR_BIN);
        let sentinel = HostPath::new(canonical::SUPERVISOR_BINARY_SENTINEL);
        if let Some(host_path) = spec.copy_data.get_mut(&supervisor_bin) {
            if *host_path == sentinel {
                *host_path = embedded_supervisor_binary();
            }
        }

        fs::create_dir_all(&self.out).await?;

        let build_config = BuildConfig {
            base_image_override: self.base_image_override.clone(),
            build_time: SystemTime::now(),
            out_dir: self.out.clone(),
            add_ca_certs_url: self.add_ca_certs.as_ref().map(|url| {
                if url.is_empty() {
                    DEFAULT_CA_BUNDLE_URL.to_string()
                } else {
                    url.clone()
                }
            }),
        };

        assemble::build_image(&spec, &build_config)
            .await
            .context("build image")
    }
}
