//! The OCI image assembler (§4.3): resolves a base image, builds the
//! reproducible layer described by an `ImageSpec`, composes the two, and
//! writes the result as an OCI image layout directory.
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tracing::{info, instrument};

use crate::model::ImageSpec;
use crate::oci::{
    ContainerConfig, Descriptor, History, ImageConfig, Index, Manifest, OciLayout, Platform,
    RootFs, MEDIA_TYPE_CONFIG, MEDIA_TYPE_INDEX, MEDIA_TYPE_LAYER_GZIP, MEDIA_TYPE_MANIFEST,
};
use crate::paths::ImagePath;
use crate::tarfs::{self, TarFsOptions};
use image_tool::{ImageTool, Platform as ToolPlatform};

/// The fixed author string stamped on every layer this assembler produces,
/// so two builds of the same spec are byte-identical in their history too.
const BUILD_AUTHOR: &str = "packager";
/// eStargz-equivalent compression level: favors build speed over ratio,
/// since the image is rebuilt on every compile.
const LAYER_COMPRESSION_LEVEL: u32 = 5;

#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub base_image_override: Option<String>,
    pub build_time: SystemTime,
    pub out_dir: PathBuf,
    pub add_ca_certs_url: Option<String>,
}

#[instrument(skip(spec, cfg))]
pub async fn build_image(spec: &ImageSpec, cfg: &BuildConfig) -> Result<()> {
    fs::create_dir_all(cfg.out_dir.join("blobs/sha256"))
        .context("create OCI layout blob directory")?;

    let base_config = resolve_base_image(spec, cfg).await?;

    let ca_certs = match &cfg.add_ca_certs_url {
        Some(url) => {
            let bytes = fetch_ca_bundle(url).await?;
            Some((bytes, ImagePath::new("/etc/ssl/certs/ca-certificates.crt")))
        }
        None => None,
    };

    let tar_options = TarFsOptions { ca_certs };
    let opener =
        tarfs::build_tar(spec, cfg.build_time, &tar_options).context("build image layer")?;

    let (layer_descriptor, diff_id) =
        write_compressed_layer(&opener, &cfg.out_dir).context("write compressed layer blob")?;

    let created = format_time(cfg.build_time);

    let mut config = base_config;
    config.architecture = spec.arch.clone();
    config.os = spec.os.clone();
    config.created = Some(created.clone());
    config.author = Some(BUILD_AUTHOR.to_string());
    config.rootfs.fs_type = "layers".to_string();
    config.rootfs.diff_ids.push(diff_id);
    config.history.push(History {
        created: Some(created),
        author: Some(BUILD_AUTHOR.to_string()),
        created_by: Some("packager build-image".to_string()),
        empty_layer: Some(false),
    });
    config.config = ContainerConfig {
        env: overlay_env(&config.config.env, &spec.env),
        entrypoint: Some(spec.entrypoint.clone()),
        cmd: None,
        working_dir: Some(spec.working_dir.as_str().to_string()),
        labels: config.config.labels,
    };

    let config_bytes = serde_json::to_vec(&config).context("serialize image config")?;
    let config_descriptor = write_blob(&cfg.out_dir, MEDIA_TYPE_CONFIG, &config_bytes, None)
        .context("write image config blob")?;

    let manifest = Manifest {
        schema_version: 2,
        media_type: MEDIA_TYPE_MANIFEST.to_string(),
        config: config_descriptor,
        layers: vec![layer_descriptor],
    };
    let manifest_bytes = serde_json::to_vec(&manifest).context("serialize image manifest")?;
    let manifest_descriptor = write_blob(
        &cfg.out_dir,
        MEDIA_TYPE_MANIFEST,
        &manifest_bytes,
        Some(Platform {
            architecture: spec.arch.clone(),
            os: spec.os.clone(),
        }),
    )
    .context("write image manifest blob")?;

    let index = Index {
        schema_version: 2,
        media_type: MEDIA_TYPE_INDEX.to_string(),
        manifests: vec![manifest_descriptor],
    };
    fs::write(
        cfg.out_dir.join("index.json"),
        serde_json::to_vec_pretty(&index).context("serialize OCI index")?,
    )
    .context("write index.json")?;
    fs::write(
        cfg.out_dir.join("oci-layout"),
        serde_json::to_vec_pretty(&OciLayout::default())?,
    )
    .context("write oci-layout")?;

    info!(out_dir = %cfg.out_dir.display(), "wrote OCI image layout");
    Ok(())
}

async fn resolve_base_image(spec: &ImageSpec, cfg: &BuildConfig) -> Result<ImageConfig> {
    if let Some(reference) = &cfg.base_image_override {
        return pull_and_read_base_config(reference, spec).await;
    }

    if spec.docker_base_image.is_empty() || spec.docker_base_image == "scratch" {
        return Ok(ImageConfig {
            rootfs: RootFs {
                fs_type: "layers".to_string(),
                diff_ids: vec![],
            },
            ..Default::default()
        });
    }

    pull_and_read_base_config(&spec.docker_base_image, spec).await
}

async fn pull_and_read_base_config(reference: &str, spec: &ImageSpec) -> Result<ImageConfig> {
    let tool = ImageTool::from_environment().map_err(|e| anyhow::anyhow!("{e}"))?;
    let temp_dir = tempfile::tempdir().context("create temp dir for base image pull")?;
    tool.pull_base_image(
        temp_dir.path(),
        reference,
        &ToolPlatform::new(&spec.os, &spec.arch),
    )
    .await
    .map_err(|e| anyhow::anyhow!("{e}"))
    .with_context(|| format!("pull base image {reference}"))?;

    let index_bytes = fs::read(temp_dir.path().join("index.json"))
        .context("read base image index.json")?;
    let index: Index = serde_json::from_slice(&index_bytes).context("parse base image index")?;
    let manifest_descriptor = index
        .manifests
        .first()
        .context("base image index has no manifests")?;
    let manifest_bytes = read_blob(temp_dir.path(), &manifest_descriptor.digest)
        .context("read base image manifest blob")?;
    let manifest: Manifest =
        serde_json::from_slice(&manifest_bytes).context("parse base image manifest")?;
    let config_bytes = read_blob(temp_dir.path(), &manifest.config.digest)
        .context("read base image config blob")?;
    serde_json::from_slice(&config_bytes).context("parse base image config")
}

fn read_blob(layout_root: &Path, digest: &str) -> Result<Vec<u8>> {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    fs::read(layout_root.join("blobs/sha256").join(hex)).map_err(Into::into)
}

fn write_blob(
    out_dir: &Path,
    media_type: &str,
    bytes: &[u8],
    platform: Option<Platform>,
) -> Result<Descriptor> {
    let digest = format!("sha256:{:x}", Sha256::digest(bytes));
    let hex = digest.strip_prefix("sha256:").unwrap();
    fs::write(out_dir.join("blobs/sha256").join(hex), bytes)?;
    Ok(Descriptor {
        media_type: media_type.to_string(),
        digest,
        size: bytes.len() as u64,
        platform,
    })
}

fn write_compressed_layer(opener: &tarfs::TarOpener, out_dir: &Path) -> Result<(Descriptor, String)> {
    let mut tar_bytes = Vec::new();
    opener.open()?.read_to_end(&mut tar_bytes)?;

    let diff_id = format!("sha256:{:x}", Sha256::digest(&tar_bytes));

    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(LAYER_COMPRESSION_LEVEL));
    encoder.write_all(&tar_bytes)?;
    let compressed = encoder.finish().context("gzip-compress layer")?;

    let descriptor = write_blob(out_dir, MEDIA_TYPE_LAYER_GZIP, &compressed, None)?;
    Ok((descriptor, diff_id))
}

/// Overlays `overlay` onto `base` by `KEY=value` key; later writers
/// (the spec's own env) win. The result is sorted for determinism.
fn overlay_env(base: &[String], overlay: &[String]) -> Vec<String> {
    let mut map = std::collections::BTreeMap::new();
    for entry in base.iter().chain(overlay.iter()) {
        if let Some((key, _)) = entry.split_once('=') {
            map.insert(key.to_string(), entry.clone());
        }
    }
    map.into_values().collect()
}

fn format_time(time: SystemTime) -> String {
    let datetime: DateTime<Utc> = time.into();
    datetime.to_rfc3339()
}

async fn fetch_ca_bundle(url: &str) -> Result<Vec<u8>> {
    let response = reqwest::get(url)
        .await
        .with_context(|| format!("fetch CA bundle from {url}"))?;
    let bytes = response
        .bytes()
        .await
        .with_context(|| format!("read CA bundle body from {url}"))?;
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn env_overlay_prefers_spec_value() {
        let base = vec!["A=base".to_string(), "B=base".to_string()];
        let overlay = vec!["B=new".to_string(), "C=new".to_string()];
        assert_eq!(
            overlay_env(&base, &overlay),
            vec![
                "A=base".to_string(),
                "B=new".to_string(),
                "C=new".to_string(),
            ]
        );
    }
}
