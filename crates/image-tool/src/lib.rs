//! Wraps external container image tooling (`docker`, or `crane`/`gcrane`/`krane`)
//! for the one network-touching step the image assembler needs: resolving and
//! pulling a base image by reference for a given `(OS, Arch)` platform.
//!
//! Pushing, registry authentication, and multi-platform manifest publishing are
//! out of scope for this core and are not wrapped here.
use std::{env, path::Path};

use async_trait::async_trait;
use snafu::ResultExt;
use which::which;

use cli::CommandLine;
use crane::CraneCLI;
use docker::DockerCLI;

mod cli;
mod crane;
mod docker;

/// Target platform for a base image pull, e.g. `linux/amd64`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    fn as_arg(&self) -> String {
        format!("{}/{}", self.os, self.arch)
    }
}

#[derive(Debug)]
pub struct ImageTool {
    image_tool_impl: Box<dyn ImageToolImpl>,
}

impl ImageTool {
    fn from_tool_name(tool_name: &str) -> Result<Self> {
        let image_tool_impl: Box<dyn ImageToolImpl> = match tool_name {
            "docker" => Box::new(DockerCLI {
                cli: CommandLine {
                    path: which("docker").context(error::NotFoundSnafu { name: "docker" })?,
                },
            }),
            tool @ ("crane" | "gcrane" | "krane") => Box::new(CraneCLI {
                cli: CommandLine {
                    path: which(tool).context(error::NotFoundSnafu { name: tool })?,
                },
            }),
            _ => return error::UnsupportedSnafu { name: tool_name }.fail(),
        };

        Ok(Self { image_tool_impl })
    }

    fn from_unix_search_path() -> Result<Self> {
        let crane = which("krane").or(which("gcrane")).or(which("crane"));
        let image_tool_impl: Box<dyn ImageToolImpl> = if let Ok(path) = crane {
            Box::new(CraneCLI {
                cli: CommandLine { path },
            })
        } else {
            Box::new(DockerCLI {
                cli: CommandLine {
                    path: which("docker").context(error::NoneFoundSnafu)?,
                },
            })
        };

        Ok(Self { image_tool_impl })
    }

    /// Selects the container tool to use by environment variable override,
    /// falling back to auto-detection on the unix search path.
    ///
    /// `PACKAGER_IMAGE_TOOL=docker|crane|gcrane|krane` forces a choice.
    pub fn from_environment() -> Result<Self> {
        if let Ok(name) = env::var("PACKAGER_IMAGE_TOOL") {
            Self::from_tool_name(&name)
        } else {
            Self::from_unix_search_path()
        }
    }

    pub fn new(image_tool_impl: Box<dyn ImageToolImpl>) -> Self {
        Self { image_tool_impl }
    }

    /// Pulls the base image for `uri` at `platform` to an OCI layout rooted at `path`.
    pub async fn pull_base_image(&self, path: &Path, uri: &str, platform: &Platform) -> Result<()> {
        self.image_tool_impl
            .pull_base_image(path, uri, platform)
            .await
    }
}

#[async_trait]
pub trait ImageToolImpl: std::fmt::Debug + Send + Sync + 'static {
    async fn pull_base_image(&self, path: &Path, uri: &str, platform: &Platform) -> Result<()>;
}

pub type Result<T> = std::result::Result<T, error::Error>;

pub mod error {
    use std::path::PathBuf;

    use snafu::Snafu;

    #[derive(Snafu, Debug)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Failed to execute image tool, {message}: {source}"))]
        CommandFailed {
            message: String,
            source: std::io::Error,
        },

        #[snafu(display("Failed to parse `docker image inspect` output: {source}"))]
        InspectParse { source: serde_json::Error },

        #[snafu(display("Failed to write synthesized OCI layout at {}: {source}", path.display()))]
        InspectWrite {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display(
            "Unable to find any supported container image tool, please install docker or crane: {}",
            source
        ))]
        NoneFound { source: which::Error },

        #[snafu(display(
            "Unable to find a container image tool by name '{}' in current environment",
            name
        ))]
        NotFound { name: String, source: which::Error },

        #[snafu(display("Failed to run operation with image tool: {message}\n command: {} {}", program.display(), args.join(" ")))]
        OperationFailed {
            message: String,
            program: PathBuf,
            args: Vec<String>,
        },

        #[snafu(display("Unsupported container image tool '{}'", name))]
        Unsupported { name: String },
    }
}
