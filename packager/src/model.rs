//! Data model shared by the spec builder (§4.1), the tar filesystem builder
//! (§4.2), and the OCI image assembler (§4.3): the inputs a compiler hands
//! off (`CompileResult`), the intermediate `ImageSpec` those inputs are
//! turned into, and the bits of application metadata the builder needs to
//! synthesize noop gateways.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::paths::{HostPath, ImagePath, RelPath};

/// A single executable invocation: command + env (both may still contain
/// the unsubstituted `${ARTIFACT_DIR}` placeholder), the services and
/// gateways it hosts, and files worth prioritizing for streaming pull.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entrypoint {
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub gateways: Vec<String>,
    #[serde(default)]
    pub prioritized_files: Vec<String>,
    /// True if this entrypoint should receive the newer runtime-config wire
    /// format (only meaningful for `JsOutput`).
    #[serde(default)]
    pub uses_new_runtime_config: bool,
}

/// One build output, tagged by kind. Each output carries a host-side
/// artifact directory and one or more entrypoints; a JS output additionally
/// carries the data needed to embed the JS runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildOutput {
    Native(NativeOutput),
    Js(JsOutput),
}

impl BuildOutput {
    pub fn artifact_dir(&self) -> &HostPath {
        match self {
            BuildOutput::Native(o) => &o.artifact_dir,
            BuildOutput::Js(o) => &o.artifact_dir,
        }
    }

    pub fn entrypoints(&self) -> &[Entrypoint] {
        match self {
            BuildOutput::Native(o) => &o.entrypoints,
            BuildOutput::Js(o) => &o.entrypoints,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeOutput {
    pub artifact_dir: HostPath,
    pub entrypoints: Vec<Entrypoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsOutput {
    pub artifact_dir: HostPath,
    pub entrypoints: Vec<Entrypoint>,
    /// Absent when no `node_modules` directory could be located for the
    /// app (a zero-dependency app, or one relying solely on bundled code).
    pub node_modules_dir: Option<HostPath>,
    pub package_json: HostPath,
    /// Path to a prebuilt native runtime addon, if the caller wants a
    /// specific one embedded rather than the whole runtimes/js directory.
    pub native_runtime_override: Option<HostPath>,
    /// Root of the `js` runtime directory to embed wholesale when
    /// `native_runtime_override` is absent.
    pub js_runtimes_dir: Option<HostPath>,
    /// The `encore.dev` framework library package, copied alongside
    /// `native_runtime_override` when that (narrower) embedding path is
    /// taken instead of the whole runtimes directory. Unused when
    /// `js_runtimes_dir` is embedded wholesale, since that tree already
    /// carries its own copy.
    pub framework_lib_dir: Option<HostPath>,
}

/// Application metadata needed to synthesize noop gateways: every gateway
/// name the application declares, regardless of whether a proc hosts it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Meta {
    pub gateways: Vec<GatewayMeta>,
    /// Opaque, protobuf-encoded in the original system; carried through
    /// unexamined here and written verbatim to `/encore/meta`.
    #[serde(default)]
    pub encoded: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayMeta {
    pub name: String,
    #[serde(default)]
    pub routes: Vec<String>,
}

/// The compiler's output handed to the image builder: a target platform,
/// the build outputs to package, and application metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileResult {
    pub os: String,
    pub arch: String,
    pub outputs: Vec<BuildOutput>,
    #[serde(default)]
    pub meta: Meta,
    /// Force the supervised multi-proc layout even for a single output with
    /// a single entrypoint (the "process per service" policy).
    #[serde(default)]
    pub process_per_service: bool,
}

/// Source to bundle into the image verbatim, filtered by include/exclude.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleSource {
    pub source: HostPath,
    pub dest: ImagePath,
    #[serde(default)]
    pub exclude_source: Vec<RelPath>,
    pub app_root_relpath: RelPath,
    #[serde(default)]
    pub include_source: Vec<RelPath>,
}

/// Inputs to `Describe` beyond the compile result itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescribeConfig {
    pub compile_result: CompileResult,
    pub docker_base_image: Option<String>,
    pub working_dir: Option<ImagePath>,
    pub bundle_source: Option<BundleSource>,
    pub build_info: BuildInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BuildInfo {
    pub revision: String,
    pub uncommitted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FeatureFlag {
    NewRuntimeConfig,
}

/// The intermediate artifact produced by the spec builder (§4.1) and
/// consumed by the tar filesystem builder (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSpec {
    pub os: String,
    pub arch: String,
    pub entrypoint: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: ImagePath,
    pub copy_data: BTreeMap<ImagePath, HostPath>,
    pub write_files: BTreeMap<ImagePath, Vec<u8>>,
    pub bundle_source: Option<BundleSource>,
    pub supervisor: Option<SupervisorSpec>,
    pub bundled_services: Vec<String>,
    pub bundled_gateways: Vec<String>,
    pub docker_base_image: String,
    pub stargz_prioritized_files: Vec<ImagePath>,
    pub feature_flags: BTreeMap<FeatureFlag, bool>,
    pub build_info: BuildInfo,
    pub build_info_path: ImagePath,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSpec {
    pub mount_path: ImagePath,
    pub config_path: ImagePath,
    pub config: supervisor_config::SupervisorConfig,
}

/// Canonical well-known image paths, the one place these constants live.
pub mod canonical {
    pub const SUPERVISOR_BIN: &str = "/encore/bin/supervisor";
    pub const SUPERVISOR_CONFIG: &str = "/encore/supervisor.config.json";
    pub const BUILD_INFO: &str = "/encore/build-info.json";
    pub const META: &str = "/encore/meta";
    pub const JS_RUNTIME_NODE: &str = "/encore/runtimes/js/encore-runtime.node";
    pub const JS_RUNTIME_DEV: &str = "/encore/runtimes/js/encore.dev";
    pub const JS_RUNTIMES_DIR: &str = "/encore/runtimes/js";
    pub const ARTIFACTS_PREFIX: &str = "/artifacts";

    /// Placeholder `HostPath` the spec builder writes into `CopyData` for
    /// the supervisor binary. The builder itself has no access to the
    /// embedded artifact (it would break the "pure function" contract of
    /// §4.1), so the CLI driving layer resolves this sentinel to the
    /// actual `env!("CARGO_BIN_FILE_SUPERVISOR_supervisor")` path before
    /// handing the spec to the tar filesystem builder.
    pub const SUPERVISOR_BINARY_SENTINEL: &str = "__embedded_supervisor_binary__";
}
