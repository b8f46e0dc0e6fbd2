use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::ResultExt;

use crate::cli::CommandLine;
use crate::{error, ImageToolImpl, Platform, Result};

#[derive(Debug)]
pub struct DockerCLI {
    pub(crate) cli: CommandLine,
}

#[async_trait]
impl ImageToolImpl for DockerCLI {
    /// Docker has no `--format oci` for `save`, so a pulled image can't be
    /// untarred straight into an OCI layout the way `crane pull --format
    /// oci` produces one. Instead, read the image's config out of `docker
    /// image inspect` and synthesize a minimal single-manifest OCI layout
    /// from it at `path`, matching the shape `assemble::pull_and_read_base_config`
    /// expects regardless of which tool resolved the base image.
    async fn pull_base_image(&self, path: &Path, uri: &str, platform: &Platform) -> Result<()> {
        self.cli
            .spawn(
                &["pull", "--platform", &platform.as_arg(), uri],
                format!("failed to pull image to local docker from {uri}"),
            )
            .await?;

        let inspect_bytes = self
            .cli
            .output(
                &["image", "inspect", "--format", "{{json .}}", uri],
                format!("failed to inspect image {uri}"),
            )
            .await?;
        let inspect: DockerInspect =
            serde_json::from_slice(&inspect_bytes).context(error::InspectParseSnafu)?;

        write_oci_layout(path, &inspect)
    }
}

#[derive(Debug, Deserialize)]
struct DockerInspect {
    #[serde(rename = "Architecture")]
    architecture: String,
    #[serde(rename = "Os")]
    os: String,
    #[serde(rename = "Config", default)]
    config: DockerInspectConfig,
    #[serde(rename = "RootFS")]
    root_fs: DockerInspectRootFs,
}

#[derive(Debug, Default, Deserialize)]
struct DockerInspectConfig {
    #[serde(rename = "Env", default)]
    env: Vec<String>,
    #[serde(rename = "Entrypoint", default)]
    entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", default)]
    cmd: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", default)]
    working_dir: Option<String>,
    #[serde(rename = "Labels", default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct DockerInspectRootFs {
    #[serde(rename = "Type")]
    fs_type: String,
    #[serde(rename = "Layers", default)]
    layers: Vec<String>,
}

/// Mirrors the subset of `packager::oci`'s field names this module needs to
/// round-trip through `packager::assemble::pull_and_read_base_config`. Kept
/// local rather than shared, the way each crate here owns only the plain
/// structs it reads or writes.
#[derive(Debug, Serialize)]
struct OciDescriptor {
    #[serde(rename = "mediaType")]
    media_type: String,
    digest: String,
    size: u64,
}

#[derive(Debug, Serialize)]
struct OciIndex {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    #[serde(rename = "mediaType")]
    media_type: String,
    manifests: Vec<OciDescriptor>,
}

#[derive(Debug, Serialize)]
struct OciManifest {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    #[serde(rename = "mediaType")]
    media_type: String,
    config: OciDescriptor,
    layers: Vec<OciDescriptor>,
}

#[derive(Debug, Serialize)]
struct OciImageConfig {
    architecture: String,
    os: String,
    config: OciContainerConfig,
    rootfs: OciRootFs,
}

#[derive(Debug, Serialize)]
struct OciContainerConfig {
    #[serde(rename = "Env")]
    env: Vec<String>,
    #[serde(rename = "Entrypoint", skip_serializing_if = "Option::is_none")]
    entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", skip_serializing_if = "Option::is_none")]
    cmd: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", skip_serializing_if = "Option::is_none")]
    working_dir: Option<String>,
    #[serde(rename = "Labels")]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct OciRootFs {
    #[serde(rename = "type")]
    fs_type: String,
    diff_ids: Vec<String>,
}

const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

fn write_oci_layout(path: &Path, inspect: &DockerInspect) -> Result<()> {
    let blobs_dir = path.join("blobs").join("sha256");
    fs::create_dir_all(&blobs_dir)
        .context(error::InspectWriteSnafu { path: path.to_path_buf() })?;

    let config = OciImageConfig {
        architecture: inspect.architecture.clone(),
        os: inspect.os.clone(),
        config: OciContainerConfig {
            env: inspect.config.env.clone(),
            entrypoint: inspect.config.entrypoint.clone(),
            cmd: inspect.config.cmd.clone(),
            working_dir: inspect.config.working_dir.clone(),
            labels: inspect.config.labels.clone(),
        },
        rootfs: OciRootFs {
            fs_type: inspect.root_fs.fs_type.clone(),
            diff_ids: inspect.root_fs.layers.clone(),
        },
    };
    let config_bytes = serde_json::to_vec(&config).context(error::InspectParseSnafu)?;
    let config_digest = digest_of(&config_bytes);
    write_blob(&blobs_dir, &config_digest, &config_bytes, path)?;

    let manifest = OciManifest {
        schema_version: 2,
        media_type: OCI_MANIFEST_MEDIA_TYPE.to_string(),
        config: OciDescriptor {
            media_type: OCI_CONFIG_MEDIA_TYPE.to_string(),
            digest: config_digest,
            size: config_bytes.len() as u64,
        },
        layers: Vec::new(),
    };
    let manifest_bytes = serde_json::to_vec(&manifest).context(error::InspectParseSnafu)?;
    let manifest_digest = digest_of(&manifest_bytes);
    write_blob(&blobs_dir, &manifest_digest, &manifest_bytes, path)?;

    let index = OciIndex {
        schema_version: 2,
        media_type: OCI_INDEX_MEDIA_TYPE.to_string(),
        manifests: vec![OciDescriptor {
            media_type: OCI_MANIFEST_MEDIA_TYPE.to_string(),
            digest: manifest_digest,
            size: manifest_bytes.len() as u64,
        }],
    };
    let index_bytes = serde_json::to_vec(&index).context(error::InspectParseSnafu)?;
    fs::write(path.join("index.json"), index_bytes)
        .context(error::InspectWriteSnafu { path: path.to_path_buf() })?;
    fs::write(path.join("oci-layout"), br#"{"imageLayoutVersion":"1.0.0"}"#)
        .context(error::InspectWriteSnafu { path: path.to_path_buf() })?;

    Ok(())
}

fn digest_of(bytes: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(bytes))
}

fn write_blob(blobs_dir: &Path, digest: &str, bytes: &[u8], path: &Path) -> Result<()> {
    let hex = digest.trim_start_matches("sha256:");
    fs::write(blobs_dir.join(hex), bytes)
        .context(error::InspectWriteSnafu { path: path.to_path_buf() })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn inspect_json_maps_env_entrypoint_and_rootfs_layers() {
        let raw = br#"{
            "Architecture": "amd64",
            "Os": "linux",
            "Config": {
                "Env": ["PATH=/usr/bin"],
                "Entrypoint": ["/bin/sh"],
                "Cmd": null,
                "WorkingDir": "/app",
                "Labels": {"org.example": "1"}
            },
            "RootFS": {
                "Type": "layers",
                "Layers": ["sha256:aaaa", "sha256:bbbb"]
            }
        }"#;
        let inspect: DockerInspect = serde_json::from_slice(raw).unwrap();
        assert_eq!(inspect.architecture, "amd64");
        assert_eq!(inspect.config.env, vec!["PATH=/usr/bin".to_string()]);
        assert_eq!(inspect.config.cmd, None);
        assert_eq!(inspect.root_fs.layers.len(), 2);
    }

    #[test]
    fn write_oci_layout_produces_index_and_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let inspect = DockerInspect {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            config: DockerInspectConfig {
                env: vec!["FOO=bar".to_string()],
                entrypoint: Some(vec!["/app/run".to_string()]),
                cmd: None,
                working_dir: Some("/".to_string()),
                labels: BTreeMap::new(),
            },
            root_fs: DockerInspectRootFs {
                fs_type: "layers".to_string(),
                layers: vec!["sha256:deadbeef".to_string()],
            },
        };

        write_oci_layout(dir.path(), &inspect).unwrap();

        let index_bytes = fs::read(dir.path().join("index.json")).unwrap();
        let index: serde_json::Value = serde_json::from_slice(&index_bytes).unwrap();
        let manifest_digest = index["manifests"][0]["digest"].as_str().unwrap().to_string();
        let manifest_hex = manifest_digest.trim_start_matches("sha256:");
        let manifest_bytes = fs::read(dir.path().join("blobs").join("sha256").join(manifest_hex)).unwrap();
        let manifest: serde_json::Value = serde_json::from_slice(&manifest_bytes).unwrap();
        let config_digest = manifest["config"]["digest"].as_str().unwrap().to_string();
        let config_hex = config_digest.trim_start_matches("sha256:");
        let config_bytes = fs::read(dir.path().join("blobs").join("sha256").join(config_hex)).unwrap();
        let config: serde_json::Value = serde_json::from_slice(&config_bytes).unwrap();

        assert_eq!(config["rootfs"]["diff_ids"][0], "sha256:deadbeef");
        assert_eq!(config["config"]["Env"][0], "FOO=bar");
    }
}
