//! Small shared helpers used by the CLI layer.
use anyhow::{Context, Result};

pub(crate) mod fs {
    use super::*;
    use std::path::Path;

    pub(crate) async fn create_dir_all(path: impl AsRef<Path>) -> Result<()> {
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("create directory {}", path.as_ref().display()))
    }

    pub(crate) async fn read(path: impl AsRef<Path>) -> Result<Vec<u8>> {
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("read {}", path.as_ref().display()))
    }
}
