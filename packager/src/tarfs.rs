//! The deterministic tar filesystem builder (§4.2): serializes an
//! `ImageSpec` into a reproducible tar stream. Two invocations with
//! identical inputs and the same `build_time` must produce byte-identical
//! tar bytes, so entries are always visited in a fixed order and every
//! header carries the same fixed timestamp.
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use filetime::FileTime;
use serde::Serialize;
use tar::{Builder, EntryType, Header};
use tempfile::NamedTempFile;
use tracing::{debug, instrument};

use crate::model::ImageSpec;
use crate::paths::{ImagePath, RelPath};

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

/// A capability object over a finished tar file on disk. The file may be
/// opened and read more than once; its lifetime is owned by the caller,
/// who is responsible for the `NamedTempFile` being dropped (and thus
/// deleted) when they are done with it.
pub struct TarOpener {
    file: NamedTempFile,
}

impl TarOpener {
    pub fn open(&self) -> Result<File> {
        File::open(self.file.path()).context("reopen built tar layer")
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TarFsOptions {
    /// Pre-fetched root CA bundle bytes to write at the paired image path.
    /// Fetching happens one layer up, in the (async) assembler, since this
    /// builder is a synchronous, pure-filesystem transformation and has no
    /// business owning an HTTP client or a runtime.
    pub ca_certs: Option<(Vec<u8>, ImagePath)>,
}

#[instrument(skip(spec, options))]
pub fn build_tar(
    spec: &ImageSpec,
    build_time: SystemTime,
    options: &TarFsOptions,
) -> Result<TarOpener> {
    let temp_file = NamedTempFile::new().context("create temp file for tar layer")?;
    let mut builder = Builder::new(temp_file.reopen().context("reopen temp file for writing")?);
    builder.mode(tar::HeaderMode::Deterministic);

    let mut seen_dirs: BTreeSet<ImagePath> = BTreeSet::new();

    for (dest, host_src) in &spec.copy_data {
        mkdir_all(&mut builder, &mut seen_dirs, dest, build_time)?;
        let src_path = host_src.as_path();
        let metadata = fs::symlink_metadata(src_path)
            .with_context(|| format!("stat copy source {}", src_path.display()))?;
        if metadata.is_dir() {
            copy_dir_recursive(
                &mut builder,
                &mut seen_dirs,
                src_path,
                dest,
                &spec.copy_data,
                build_time,
            )?;
        } else {
            append_file(&mut builder, src_path, dest, build_time)?;
        }
    }

    for (dest, bytes) in &spec.write_files {
        mkdir_all(&mut builder, &mut seen_dirs, dest, build_time)?;
        append_bytes(&mut builder, dest, bytes, FILE_MODE, build_time)?;
    }

    if let Some(supervisor) = &spec.supervisor {
        mkdir_all(&mut builder, &mut seen_dirs, &supervisor.config_path, build_time)?;
        let config_bytes = supervisor
            .config
            .to_json()
            .context("serialize supervisor config")?;
        append_bytes(
            &mut builder,
            &supervisor.config_path,
            &config_bytes,
            FILE_MODE,
            build_time,
        )?;
    }

    if let Some(bundle) = &spec.bundle_source {
        append_bundle(&mut builder, &mut seen_dirs, bundle, build_time)?;
    }

    if let Some((bytes, dest)) = &options.ca_certs {
        mkdir_all(&mut builder, &mut seen_dirs, dest, build_time)?;
        append_bytes(&mut builder, dest, bytes, FILE_MODE, build_time)?;
    }

    mkdir_all(&mut builder, &mut seen_dirs, &spec.build_info_path, build_time)?;
    let build_info_json = canonical_json(&spec.build_info)?;
    append_bytes(
        &mut builder,
        &spec.build_info_path,
        &build_info_json,
        FILE_MODE,
        build_time,
    )?;

    builder.finish().context("finalize tar layer")?;

    Ok(TarOpener { file: temp_file })
}

fn mkdir_all(
    builder: &mut Builder<File>,
    seen_dirs: &mut BTreeSet<ImagePath>,
    path: &ImagePath,
    build_time: SystemTime,
) -> Result<()> {
    for ancestor in path.ancestors() {
        if seen_dirs.insert(ancestor.clone()) {
            append_dir_header(builder, &ancestor, build_time)?;
        }
    }
    Ok(())
}

fn append_dir_header(
    builder: &mut Builder<File>,
    path: &ImagePath,
    build_time: SystemTime,
) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Directory);
    header.set_mode(DIR_MODE);
    header.set_size(0);
    set_times(&mut header, build_time);
    header.set_cksum();
    let mut entry_path = path.as_str().trim_start_matches('/').to_string();
    entry_path.push('/');
    builder
        .append_data(&mut header, entry_path, std::io::empty())
        .with_context(|| format!("write directory entry {path}"))
}

fn append_file(
    builder: &mut Builder<File>,
    src_path: &Path,
    dest: &ImagePath,
    build_time: SystemTime,
) -> Result<()> {
    let metadata =
        fs::metadata(src_path).with_context(|| format!("stat {}", src_path.display()))?;
    let mode = metadata.permissions().mode() & 0o7777;
    let mut file =
        File::open(src_path).with_context(|| format!("open {}", src_path.display()))?;
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(mode);
    header.set_size(metadata.len());
    set_times(&mut header, build_time);
    header.set_cksum();
    builder
        .append_data(&mut header, dest.as_str().trim_start_matches('/'), &mut file)
        .with_context(|| format!("write file entry {dest}"))
}

fn append_bytes(
    builder: &mut Builder<File>,
    dest: &ImagePath,
    bytes: &[u8],
    mode: u32,
    build_time: SystemTime,
) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(mode);
    header.set_size(bytes.len() as u64);
    set_times(&mut header, build_time);
    header.set_cksum();
    builder
        .append_data(&mut header, dest.as_str().trim_start_matches('/'), bytes)
        .with_context(|| format!("write in-memory entry {dest}"))
}

fn set_times(header: &mut Header, build_time: SystemTime) {
    let ft = FileTime::from_system_time(build_time);
    let secs = ft.unix_seconds() as u64;
    header.set_mtime(secs);
}

/// Walks `src_root` (already known to be a directory) and copies its
/// contents under `dest_root`, in lexical order, rewriting symlinks per the
/// three-tier rule and dropping any that escape the image.
#[allow(clippy::too_many_arguments)]
fn copy_dir_recursive(
    builder: &mut Builder<File>,
    seen_dirs: &mut BTreeSet<ImagePath>,
    src_root: &Path,
    dest_root: &ImagePath,
    all_sources: &std::collections::BTreeMap<ImagePath, crate::paths::HostPath>,
    build_time: SystemTime,
) -> Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(src_root)
        .with_context(|| format!("read dir {}", src_root.display()))?
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("read dir entries of {}", src_root.display()))?
        .into_iter()
        .map(|e| e.path())
        .collect();
    entries.sort();

    for entry_path in entries {
        let name = entry_path.file_name().unwrap().to_string_lossy().to_string();
        let dest = dest_root.join(&name);
        let metadata = fs::symlink_metadata(&entry_path)
            .with_context(|| format!("stat {}", entry_path.display()))?;

        if metadata.file_type().is_symlink() {
            match rewrite_symlink_target(&entry_path, src_root, dest_root, all_sources)? {
                Some(target) => {
                    mkdir_all(builder, seen_dirs, &dest, build_time)?;
                    append_symlink(builder, &dest, &target, build_time)?;
                }
                None => {
                    debug!(path = %entry_path.display(), "dropping escaping symlink");
                }
            }
        } else if metadata.is_dir() {
            mkdir_all(builder, seen_dirs, &dest.join("."), build_time)?;
            copy_dir_recursive(builder, seen_dirs, &entry_path, &dest, all_sources, build_time)?;
        } else {
            mkdir_all(builder, seen_dirs, &dest, build_time)?;
            append_file(builder, &entry_path, &dest, build_time)?;
        }
    }

    Ok(())
}

fn append_symlink(
    builder: &mut Builder<File>,
    dest: &ImagePath,
    target: &ImagePath,
    build_time: SystemTime,
) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Symlink);
    header.set_mode(0o777);
    header.set_size(0);
    set_times(&mut header, build_time);
    header
        .set_link_name(target.as_str())
        .with_context(|| format!("set symlink target {target}"))?;
    header.set_cksum();
    builder
        .append_data(&mut header, dest.as_str().trim_start_matches('/'), std::io::empty())
        .with_context(|| format!("write symlink entry {dest}"))
}

/// Resolves a symlink's target against the three-tier rule in §4.2:
/// 1. If it resolves inside the current source root, rewrite to the
///    equivalent destination path.
/// 2. Otherwise, if it resolves inside any other `CopyData` source, rewrite
///    to that source's destination subpath.
/// 3. Otherwise the link escapes the image: return `None`.
fn rewrite_symlink_target(
    link_path: &Path,
    src_root: &Path,
    dest_root: &ImagePath,
    all_sources: &std::collections::BTreeMap<ImagePath, crate::paths::HostPath>,
) -> Result<Option<ImagePath>> {
    let raw_target = fs::read_link(link_path)
        .with_context(|| format!("read symlink {}", link_path.display()))?;
    let resolved = if raw_target.is_absolute() {
        raw_target.clone()
    } else {
        link_path
            .parent()
            .unwrap_or(Path::new("/"))
            .join(&raw_target)
    };
    let resolved = normalize_lexically(&resolved);

    if let Ok(rel) = resolved.strip_prefix(normalize_lexically(src_root)) {
        return Ok(Some(append_rel(dest_root, rel)));
    }

    for (other_dest, other_src) in all_sources {
        let other_src_norm = normalize_lexically(other_src.as_path());
        if let Ok(rel) = resolved.strip_prefix(&other_src_norm) {
            return Ok(Some(append_rel(other_dest, rel)));
        }
    }

    Ok(None)
}

fn append_rel(base: &ImagePath, rel: &Path) -> ImagePath {
    let mut out = base.clone();
    for component in rel.components() {
        if let std::path::Component::Normal(s) = component {
            out = out.join(&s.to_string_lossy());
        }
    }
    out
}

/// Lexically normalizes `.`/`..` components without touching the
/// filesystem (the symlink may point somewhere that doesn't exist yet).
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn append_bundle(
    builder: &mut Builder<File>,
    seen_dirs: &mut BTreeSet<ImagePath>,
    bundle: &crate::model::BundleSource,
    build_time: SystemTime,
) -> Result<()> {
    let root = bundle.source.as_path();
    append_bundle_dir(builder, seen_dirs, root, root, &bundle.dest, bundle, build_time)
}

#[allow(clippy::too_many_arguments)]
fn append_bundle_dir(
    builder: &mut Builder<File>,
    seen_dirs: &mut BTreeSet<ImagePath>,
    root: &Path,
    current: &Path,
    dest_root: &ImagePath,
    bundle: &crate::model::BundleSource,
    build_time: SystemTime,
) -> Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(current)
        .with_context(|| format!("read bundle dir {}", current.display()))?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.path())
        .collect();
    entries.sort();

    for entry_path in entries {
        let rel = entry_path.strip_prefix(root).unwrap();
        let rel_path = RelPath::new(rel.to_string_lossy().to_string());

        if bundle.exclude_source.iter().any(|ex| ex == &rel_path || ex.contains(&rel_path)) {
            continue;
        }
        if !bundle.include_source.is_empty()
            && !bundle
                .include_source
                .iter()
                .any(|inc| inc == &rel_path || inc.contains(&rel_path))
        {
            let metadata = fs::symlink_metadata(&entry_path)?;
            if !metadata.is_dir() {
                continue;
            }
        }

        let dest = append_rel(dest_root, rel);
        let metadata = fs::symlink_metadata(&entry_path)
            .with_context(|| format!("stat {}", entry_path.display()))?;

        if metadata.is_dir() {
            mkdir_all(builder, seen_dirs, &dest.join("."), build_time)?;
            append_bundle_dir(builder, seen_dirs, root, &entry_path, dest_root, bundle, build_time)?;
        } else if metadata.file_type().is_symlink() {
            debug!(path = %entry_path.display(), "skipping symlink in bundled source");
        } else {
            mkdir_all(builder, seen_dirs, &dest, build_time)?;
            append_file(builder, &entry_path, &dest, build_time)?;
        }
    }

    Ok(())
}

fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(
        &mut buf,
        olpc_cjson::CanonicalFormatter::new(),
    );
    value.serialize(&mut ser).context("canonicalize JSON")?;
    Ok(buf)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::BuildInfo;
    use std::collections::BTreeMap;
    use std::io::Read;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn empty_spec() -> ImageSpec {
        ImageSpec {
            os: "linux".into(),
            arch: "amd64".into(),
            entrypoint: vec!["/bin/x".into()],
            env: vec![],
            working_dir: ImagePath::new("/"),
            copy_data: BTreeMap::new(),
            write_files: BTreeMap::new(),
            bundle_source: None,
            supervisor: None,
            bundled_services: vec![],
            bundled_gateways: vec![],
            docker_base_image: "scratch".into(),
            stargz_prioritized_files: vec![],
            feature_flags: BTreeMap::new(),
            build_info: BuildInfo {
                revision: "abc123".into(),
                uncommitted: false,
            },
            build_info_path: ImagePath::new("/encore/build-info.json"),
        }
    }

    fn entries_of(opener: &TarOpener) -> Vec<String> {
        let mut archive = tar::Archive::new(opener.open().unwrap());
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                e.path().unwrap().to_string_lossy().to_string()
            })
            .collect()
    }

    #[test]
    fn directory_closure_holds() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("entrypoint"), b"bin").unwrap();

        let mut spec = empty_spec();
        spec.copy_data.insert(
            ImagePath::new("/artifacts/0/build"),
            crate::paths::HostPath::new(dir.path()),
        );

        let opener = build_tar(&spec, SystemTime::UNIX_EPOCH, &TarFsOptions::default()).unwrap();
        let entries = entries_of(&opener);

        let file_index = entries
            .iter()
            .position(|e| e == "artifacts/0/build/entrypoint")
            .expect("file entry present");
        for prefix in ["artifacts/", "artifacts/0/", "artifacts/0/build/"] {
            let dir_index = entries
                .iter()
                .position(|e| e == prefix)
                .unwrap_or_else(|| panic!("missing directory entry {prefix}"));
            assert!(dir_index < file_index, "{prefix} must precede the file it contains");
        }
    }

    #[test]
    fn determinism_of_tar_output() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a"), b"hello").unwrap();

        let mut spec = empty_spec();
        spec.copy_data.insert(
            ImagePath::new("/x"),
            crate::paths::HostPath::new(dir.path()),
        );

        let one = build_tar(&spec, SystemTime::UNIX_EPOCH, &TarFsOptions::default()).unwrap();
        let two = build_tar(&spec, SystemTime::UNIX_EPOCH, &TarFsOptions::default()).unwrap();

        let mut one_bytes = Vec::new();
        one.open().unwrap().read_to_end(&mut one_bytes).unwrap();
        let mut two_bytes = Vec::new();
        two.open().unwrap().read_to_end(&mut two_bytes).unwrap();

        assert_eq!(one_bytes, two_bytes);
    }

    #[test]
    fn escaping_symlink_is_dropped() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("inside")).unwrap();
        symlink("/etc/passwd", dir.path().join("inside").join("link")).unwrap();

        let mut spec = empty_spec();
        spec.copy_data.insert(
            ImagePath::new("/x"),
            crate::paths::HostPath::new(dir.path()),
        );

        let opener = build_tar(&spec, SystemTime::UNIX_EPOCH, &TarFsOptions::default()).unwrap();
        let entries = entries_of(&opener);
        assert!(!entries.iter().any(|e| e.ends_with("inside/link")));
    }

    #[test]
    fn supervisor_config_is_written_at_its_config_path() {
        use crate::model::SupervisorSpec;
        use supervisor_config::{Proc, SupervisorConfig};

        let mut spec = empty_spec();
        spec.supervisor = Some(SupervisorSpec {
            mount_path: ImagePath::new("/encore/bin/supervisor"),
            config_path: ImagePath::new("/encore/supervisor.config.json"),
            config: SupervisorConfig {
                procs: vec![Proc {
                    id: "proc_0".into(),
                    command: vec!["/artifacts/0/build/entrypoint".into()],
                    env: vec![],
                    services: vec!["foo".into()],
                    gateways: vec![],
                }],
                noop_gateways: Default::default(),
            },
        });

        let opener = build_tar(&spec, SystemTime::UNIX_EPOCH, &TarFsOptions::default()).unwrap();
        let mut archive = tar::Archive::new(opener.open().unwrap());
        let entry = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap())
            .find(|e| e.path().unwrap().to_string_lossy() == "encore/supervisor.config.json")
            .expect("supervisor config entry present");
        let mut contents = Vec::new();
        let mut entry = entry;
        entry.read_to_end(&mut contents).unwrap();
        let decoded: SupervisorConfig = serde_json::from_slice(&contents).unwrap();
        assert_eq!(decoded.procs[0].id, "proc_0");
    }

    #[test]
    fn in_source_symlink_is_rewritten() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("real"), b"data").unwrap();
        symlink("../real", dir.path().join("inside_link_target_missing")).unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        symlink("../real", dir.path().join("sub").join("link")).unwrap();

        let mut spec = empty_spec();
        spec.copy_data.insert(
            ImagePath::new("/x"),
            crate::paths::HostPath::new(dir.path()),
        );

        let opener = build_tar(&spec, SystemTime::UNIX_EPOCH, &TarFsOptions::default()).unwrap();
        let mut archive = tar::Archive::new(opener.open().unwrap());
        let link_entry = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap())
            .find(|e| e.path().unwrap().to_string_lossy() == "x/sub/link")
            .expect("rewritten symlink entry present");
        assert_eq!(
            link_entry.link_name().unwrap().unwrap().to_string_lossy(),
            "x/real"
        );
    }
}
