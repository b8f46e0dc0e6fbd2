use std::path::Path;

use async_trait::async_trait;

use crate::cli::CommandLine;
use crate::{ImageToolImpl, Platform, Result};

#[derive(Debug)]
pub struct CraneCLI {
    pub(crate) cli: CommandLine,
}

#[async_trait]
impl ImageToolImpl for CraneCLI {
    async fn pull_base_image(&self, path: &Path, uri: &str, platform: &Platform) -> Result<()> {
        let archive_path = path.to_string_lossy();
        self.cli
            .spawn(
                &[
                    "pull",
                    "--format",
                    "oci",
                    "--platform",
                    &platform.as_arg(),
                    uri,
                    archive_path.as_ref(),
                ],
                format!("failed to pull image archive from {uri}"),
            )
            .await?;
        Ok(())
    }
}
