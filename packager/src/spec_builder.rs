//! The image specification builder (§4.1): a pure transformation from a
//! `DescribeConfig` into an `ImageSpec`. Given the same inputs and a fixed
//! proc-ID generator, two invocations must produce byte-identical output,
//! so nothing here may read the clock, the environment, or any other
//! ambient state.
use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Context, Result};
use tracing::instrument;

use crate::model::{
    canonical, BuildInfo, BuildOutput, CompileResult, DescribeConfig, Entrypoint, FeatureFlag,
    ImageSpec, JsOutput, Meta, SupervisorSpec,
};
use crate::paths::{HostPath, ImagePath};
use crate::proc_id::ProcIdGenerator;
use supervisor_config::{NoopGatewayDescription, Proc, SupervisorConfig};

/// Runs the full §4.1 algorithm. `proc_ids` is injected so tests can pass a
/// `SequentialProcIdGenerator` and get reproducible `Proc.id` values.
#[instrument(skip(cfg, proc_ids))]
pub fn describe(cfg: &DescribeConfig, proc_ids: &dyn ProcIdGenerator) -> Result<ImageSpec> {
    let compile_result = &cfg.compile_result;

    let mut copy_data: BTreeMap<ImagePath, HostPath> = BTreeMap::new();
    let mut write_files: BTreeMap<ImagePath, Vec<u8>> = BTreeMap::new();
    let mut artifact_bases: BTreeMap<HostPath, ImagePath> = BTreeMap::new();
    let mut next_artifact_index = 0usize;

    // Step 1: allocate artifact directories, memoized by host artifact dir
    // so repeated outputs referencing the same host directory share it.
    for output in &compile_result.outputs {
        allocate_artifact_dir(
            output,
            &cfg.bundle_source,
            &mut artifact_bases,
            &mut next_artifact_index,
            &mut copy_data,
        )?;
    }

    // Step 2: single-proc vs. supervised.
    let total_entrypoints: usize = compile_result.outputs.iter().map(|o| o.entrypoints().len()).sum();
    let supervised = compile_result.process_per_service
        || compile_result.outputs.len() > 1
        || total_entrypoints > 1;

    let mut entrypoint_cmd: Vec<String> = Vec::new();
    let mut env: Vec<String> = Vec::new();
    let mut procs: Vec<Proc> = Vec::new();
    let mut claimed_gateways: BTreeSet<String> = BTreeSet::new();
    let mut all_services: BTreeSet<String> = BTreeSet::new();
    let mut prioritized: Vec<ImagePath> = Vec::new();
    let mut seen_prioritized: BTreeSet<ImagePath> = BTreeSet::new();

    // The supervisor binary, when present, is always the first thing pulled
    // off the wire, so it leads StargzPrioritizedFiles ahead of anything the
    // entrypoints themselves prioritize.
    if supervised {
        push_prioritized(
            &mut prioritized,
            &mut seen_prioritized,
            ImagePath::new(canonical::SUPERVISOR_BIN),
        );
    }

    for output in &compile_result.outputs {
        let base = artifact_bases
            .get(output.artifact_dir())
            .ok_or_else(|| anyhow!("internal invariant violated: no artifact base allocated for {}", output.artifact_dir()))?
            .clone();
        let build_subdir = base.join("build");

        if let BuildOutput::Js(js) = output {
            stage_js_app_files(js, &base, &mut copy_data, &mut prioritized, &mut seen_prioritized);
        }

        for entrypoint in output.entrypoints() {
            for svc in &entrypoint.services {
                all_services.insert(svc.clone());
            }
            for gw in &entrypoint.gateways {
                claimed_gateways.insert(gw.clone());
            }

            let expanded_cmd: Vec<String> = entrypoint
                .cmd
                .iter()
                .map(|s| ImagePath::substitute_artifact_dir(s, &build_subdir))
                .collect();
            let expanded_env: Vec<String> = entrypoint
                .env
                .iter()
                .map(|s| ImagePath::substitute_artifact_dir(s, &build_subdir))
                .collect();

            for prio in &entrypoint.prioritized_files {
                let path = ImagePath::new(ImagePath::substitute_artifact_dir(prio, &build_subdir));
                push_prioritized(&mut prioritized, &mut seen_prioritized, path);
            }

            if supervised {
                let mut services = entrypoint.services.clone();
                services.sort();
                services.dedup();
                let mut gateways = entrypoint.gateways.clone();
                gateways.sort();
                gateways.dedup();

                procs.push(Proc {
                    id: proc_ids.next_id(),
                    command: expanded_cmd,
                    env: expanded_env,
                    services,
                    gateways,
                });
            } else {
                entrypoint_cmd = expanded_cmd;
                env = expanded_env;
            }
        }
    }

    // Step 3: synthesize noop gateways for anything in application metadata
    // not claimed by any proc.
    let noop_gateways = synthesize_noop_gateways(&compile_result.meta, &claimed_gateways);

    // Step 4: bundled services/gateways, sorted and deduplicated.
    let bundled_services: Vec<String> = all_services.into_iter().collect();
    let mut bundled_gateways: BTreeSet<String> = claimed_gateways;
    bundled_gateways.extend(noop_gateways.keys().cloned());
    let bundled_gateways: Vec<String> = bundled_gateways.into_iter().collect();

    let supervisor = if supervised {
        entrypoint_cmd = vec![
            canonical::SUPERVISOR_BIN.to_string(),
            "-c".to_string(),
            canonical::SUPERVISOR_CONFIG.to_string(),
        ];
        env = Vec::new();
        // The supervisor binary itself is staged by the caller (packager's
        // CLI layer, which has access to the embedded artifact); the spec
        // builder only reserves the destination path in CopyData so the
        // caller's copy and this spec agree on where it lands.
        copy_data.insert(
            ImagePath::new(canonical::SUPERVISOR_BIN),
            HostPath::new(canonical::SUPERVISOR_BINARY_SENTINEL),
        );

        Some(SupervisorSpec {
            mount_path: ImagePath::new(canonical::SUPERVISOR_BIN),
            config_path: ImagePath::new(canonical::SUPERVISOR_CONFIG),
            config: SupervisorConfig {
                procs,
                noop_gateways,
            },
        })
    } else {
        None
    };

    // Step 6: JS runtime embedding.
    let mut feature_flags: BTreeMap<FeatureFlag, bool> = BTreeMap::new();
    for output in &compile_result.outputs {
        if let BuildOutput::Js(js) = output {
            embed_js_runtime(js, &mut copy_data, &mut env, &mut prioritized, &mut seen_prioritized)?;
            // Step 7: the compiler marks each entrypoint that needs the newer
            // runtime-config wire format; surface that as a spec-wide flag.
            if output
                .entrypoints()
                .iter()
                .any(|e| e.uses_new_runtime_config)
            {
                feature_flags.insert(FeatureFlag::NewRuntimeConfig, true);
            }
        }
    }

    // Step 8: finalize.
    let docker_base_image = cfg
        .docker_base_image
        .clone()
        .unwrap_or_else(|| "scratch".to_string());
    let working_dir = cfg
        .working_dir
        .clone()
        .unwrap_or_else(|| ImagePath::new("/"));

    let meta_bytes = marshal_meta(&compile_result.meta).context("marshal application metadata")?;
    write_files.insert(ImagePath::new(canonical::META), meta_bytes);

    if entrypoint_cmd.is_empty() {
        return Err(anyhow!("internal invariant violated: empty entrypoint"));
    }

    Ok(ImageSpec {
        os: compile_result.os.clone(),
        arch: compile_result.arch.clone(),
        entrypoint: entrypoint_cmd,
        env,
        working_dir,
        copy_data,
        write_files,
        bundle_source: cfg.bundle_source.clone(),
        supervisor,
        bundled_services,
        bundled_gateways,
        docker_base_image,
        stargz_prioritized_files: prioritized,
        feature_flags,
        build_info: cfg.build_info.clone(),
        build_info_path: ImagePath::new(canonical::BUILD_INFO),
    })
}

fn allocate_artifact_dir(
    output: &BuildOutput,
    bundle_source: &Option<crate::model::BundleSource>,
    artifact_bases: &mut BTreeMap<HostPath, ImagePath>,
    next_index: &mut usize,
    copy_data: &mut BTreeMap<ImagePath, HostPath>,
) -> Result<()> {
    let host_dir = output.artifact_dir().clone();
    if artifact_bases.contains_key(&host_dir) {
        return Ok(());
    }

    let base = if let (BuildOutput::Js(_), Some(bundle)) = (output, bundle_source) {
        bundle
            .dest
            .join(bundle.app_root_relpath.as_str())
            .join(".encore")
    } else {
        loop {
            let candidate = ImagePath::new(format!("{}/{}", canonical::ARTIFACTS_PREFIX, next_index));
            *next_index += 1;
            let build_key = candidate.join("build");
            if !copy_data.contains_key(&build_key) {
                break candidate;
            }
        }
    };

    copy_data.insert(base.join("build"), host_dir.clone());
    artifact_bases.insert(host_dir, base);
    Ok(())
}

fn push_prioritized(
    prioritized: &mut Vec<ImagePath>,
    seen: &mut BTreeSet<ImagePath>,
    path: ImagePath,
) {
    if seen.insert(path.clone()) {
        prioritized.push(path);
    }
}

fn synthesize_noop_gateways(
    meta: &Meta,
    claimed: &BTreeSet<String>,
) -> BTreeMap<String, NoopGatewayDescription> {
    meta.gateways
        .iter()
        .filter(|g| !claimed.contains(&g.name))
        .map(|g| {
            (
                g.name.clone(),
                NoopGatewayDescription {
                    name: g.name.clone(),
                    routes: g.routes.clone(),
                },
            )
        })
        .collect()
}

/// Stages the JS output's own `node_modules` and `package.json` next to its
/// build artifacts (`<base>/node_modules`, `<base>/package.json`), mirroring
/// the on-disk layout `tsparser::builder::compile` hands off (artifact dir,
/// `node_modules`, and `package.json` as three sibling paths of one JS
/// build output). `package.json` is prioritized for streaming pull alongside
/// the runtime native addon (§4.1 step 5's "package.json/runtime-native
/// file"), since Node needs it before it can resolve anything else.
fn stage_js_app_files(
    js: &JsOutput,
    base: &ImagePath,
    copy_data: &mut BTreeMap<ImagePath, HostPath>,
    prioritized: &mut Vec<ImagePath>,
    seen_prioritized: &mut BTreeSet<ImagePath>,
) {
    if let Some(node_modules) = &js.node_modules_dir {
        copy_data.insert(base.join("node_modules"), node_modules.clone());
    }
    let package_json_dest = base.join("package.json");
    copy_data.insert(package_json_dest.clone(), js.package_json.clone());
    push_prioritized(prioritized, seen_prioritized, package_json_dest);
}

fn embed_js_runtime(
    js: &JsOutput,
    copy_data: &mut BTreeMap<ImagePath, HostPath>,
    env: &mut Vec<String>,
    prioritized: &mut Vec<ImagePath>,
    seen_prioritized: &mut BTreeSet<ImagePath>,
) -> Result<()> {
    if let Some(native) = &js.native_runtime_override {
        copy_data.insert(ImagePath::new(canonical::JS_RUNTIME_NODE), native.clone());
        if let Some(framework_lib) = &js.framework_lib_dir {
            copy_data.insert(ImagePath::new(canonical::JS_RUNTIME_DEV), framework_lib.clone());
        }
        push_prioritized(
            prioritized,
            seen_prioritized,
            ImagePath::new(canonical::JS_RUNTIME_NODE),
        );
    } else if let Some(runtimes_dir) = &js.js_runtimes_dir {
        copy_data.insert(
            ImagePath::new(canonical::JS_RUNTIMES_DIR),
            runtimes_dir.clone(),
        );
        push_prioritized(
            prioritized,
            seen_prioritized,
            ImagePath::new(canonical::JS_RUNTIME_NODE),
        );
    } else {
        return Err(anyhow!(
            "JS output declared with neither a native runtime override nor a runtimes directory"
        ));
    }

    env.push(format!("ENCORE_RUNTIME_LIB={}", canonical::JS_RUNTIME_NODE));
    Ok(())
}

fn marshal_meta(meta: &Meta) -> Result<Vec<u8>> {
    Ok(meta.encoded.clone())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{CompileResult, NativeOutput};
    use crate::proc_id::SequentialProcIdGenerator;

    fn native_entrypoint(cmd: &str, services: &[&str], gateways: &[&str]) -> Entrypoint {
        Entrypoint {
            cmd: vec![cmd.to_string()],
            env: vec![],
            services: services.iter().map(|s| s.to_string()).collect(),
            gateways: gateways.iter().map(|s| s.to_string()).collect(),
            prioritized_files: vec![cmd.to_string()],
            uses_new_runtime_config: false,
        }
    }

    fn base_compile_result(outputs: Vec<BuildOutput>) -> CompileResult {
        CompileResult {
            os: "linux".into(),
            arch: "amd64".into(),
            outputs,
            meta: Meta::default(),
            process_per_service: false,
        }
    }

    #[test]
    fn single_native_output_one_service() {
        let output = BuildOutput::Native(NativeOutput {
            artifact_dir: HostPath::new("/host/artifacts"),
            entrypoints: vec![native_entrypoint(
                "${ARTIFACT_DIR}/entrypoint",
                &["foo", "bar"],
                &[],
            )],
        });
        let cfg = DescribeConfig {
            compile_result: base_compile_result(vec![output]),
            docker_base_image: None,
            working_dir: None,
            bundle_source: None,
            build_info: BuildInfo::default(),
        };

        let spec = describe(&cfg, &SequentialProcIdGenerator::default()).unwrap();

        assert_eq!(spec.entrypoint, vec!["/artifacts/0/build/entrypoint"]);
        assert!(spec.env.is_empty());
        assert_eq!(spec.working_dir.as_str(), "/");
        assert_eq!(
            spec.copy_data.get(&ImagePath::new("/artifacts/0/build")),
            Some(&HostPath::new("/host/artifacts"))
        );
        assert_eq!(spec.bundled_services, vec!["bar", "foo"]);
        assert!(spec.supervisor.is_none());
        assert_eq!(spec.docker_base_image, "scratch");
        assert_eq!(
            spec.stargz_prioritized_files,
            vec![ImagePath::new("/artifacts/0/build/entrypoint")]
        );
        assert!(spec.write_files.contains_key(&ImagePath::new("/encore/meta")));
    }

    #[test]
    fn single_native_output_two_entrypoints_is_supervised() {
        let output = BuildOutput::Native(NativeOutput {
            artifact_dir: HostPath::new("/host/artifacts"),
            entrypoints: vec![
                native_entrypoint("${ARTIFACT_DIR}/entrypoint", &["foo"], &[]),
                native_entrypoint("${ARTIFACT_DIR}/other-entrypoint", &["bar"], &[]),
            ],
        });
        let cfg = DescribeConfig {
            compile_result: base_compile_result(vec![output]),
            docker_base_image: None,
            working_dir: None,
            bundle_source: None,
            build_info: BuildInfo::default(),
        };

        let spec = describe(&cfg, &SequentialProcIdGenerator::default()).unwrap();

        assert_eq!(
            spec.entrypoint,
            vec![
                "/encore/bin/supervisor".to_string(),
                "-c".to_string(),
                "/encore/supervisor.config.json".to_string(),
            ]
        );
        let supervisor = spec.supervisor.expect("supervisor spec present");
        let commands: Vec<String> = supervisor
            .config
            .procs
            .iter()
            .map(|p| p.command[0].clone())
            .collect();
        assert_eq!(
            commands,
            vec![
                "/artifacts/0/build/entrypoint".to_string(),
                "/artifacts/0/build/other-entrypoint".to_string(),
            ]
        );
        assert_eq!(
            spec.stargz_prioritized_files[0],
            ImagePath::new("/encore/bin/supervisor")
        );
        assert_eq!(
            spec.stargz_prioritized_files[1..],
            [
                ImagePath::new("/artifacts/0/build/entrypoint"),
                ImagePath::new("/artifacts/0/build/other-entrypoint"),
            ]
        );
    }

    #[test]
    fn determinism_with_fixed_proc_id_generator() {
        let output = BuildOutput::Native(NativeOutput {
            artifact_dir: HostPath::new("/host/artifacts"),
            entrypoints: vec![
                native_entrypoint("${ARTIFACT_DIR}/a", &[], &[]),
                native_entrypoint("${ARTIFACT_DIR}/b", &[], &[]),
            ],
        });
        let cfg = DescribeConfig {
            compile_result: base_compile_result(vec![output]),
            docker_base_image: None,
            working_dir: None,
            bundle_source: None,
            build_info: BuildInfo::default(),
        };

        let spec_a = describe(&cfg, &SequentialProcIdGenerator::default()).unwrap();
        let spec_b = describe(&cfg, &SequentialProcIdGenerator::default()).unwrap();

        assert_eq!(
            serde_json::to_string(&spec_a).unwrap(),
            serde_json::to_string(&spec_b).unwrap()
        );
    }

    #[test]
    fn gateway_coverage_synthesizes_noop_gateway() {
        let output = BuildOutput::Native(NativeOutput {
            artifact_dir: HostPath::new("/host/artifacts"),
            entrypoints: vec![native_entrypoint("${ARTIFACT_DIR}/a", &[], &["hosted"])],
        });
        let mut cr = base_compile_result(vec![output]);
        cr.meta.gateways = vec![
            crate::model::GatewayMeta {
                name: "hosted".into(),
                routes: vec![],
            },
            crate::model::GatewayMeta {
                name: "orphan".into(),
                routes: vec!["/orphan".into()],
            },
        ];
        let cfg = DescribeConfig {
            compile_result: cr,
            docker_base_image: None,
            working_dir: None,
            bundle_source: None,
            build_info: BuildInfo::default(),
        };

        let spec = describe(&cfg, &SequentialProcIdGenerator::default()).unwrap();
        assert!(spec.bundled_gateways.contains(&"orphan".to_string()));
        assert!(spec.bundled_gateways.contains(&"hosted".to_string()));
    }

    #[test]
    fn js_output_with_source_bundle_places_artifacts_under_bundle() {
        use crate::model::BundleSource;
        use crate::paths::RelPath;

        let mut entrypoint = native_entrypoint("${ARTIFACT_DIR}/main.js", &["svc"], &[]);
        entrypoint.uses_new_runtime_config = true;
        let output = BuildOutput::Js(JsOutput {
            artifact_dir: HostPath::new("/host/artifacts"),
            entrypoints: vec![entrypoint],
            node_modules_dir: Some(HostPath::new("/host/node_modules")),
            package_json: HostPath::new("/host/package.json"),
            native_runtime_override: None,
            js_runtimes_dir: Some(HostPath::new("/host/runtimes/js")),
            framework_lib_dir: None,
        });
        let cfg = DescribeConfig {
            compile_result: base_compile_result(vec![output]),
            docker_base_image: None,
            working_dir: None,
            bundle_source: Some(BundleSource {
                source: HostPath::new("/host/app"),
                dest: ImagePath::new("/image"),
                exclude_source: vec![],
                app_root_relpath: RelPath::new("."),
                include_source: vec![],
            }),
            build_info: BuildInfo::default(),
        };

        let spec = describe(&cfg, &SequentialProcIdGenerator::default()).unwrap();

        assert_eq!(spec.entrypoint, vec!["/image/.encore/build/main.js"]);
        assert_eq!(
            spec.copy_data.get(&ImagePath::new("/image/.encore/build")),
            Some(&HostPath::new("/host/artifacts"))
        );
        assert_eq!(
            spec.copy_data.get(&ImagePath::new("/image/.encore/node_modules")),
            Some(&HostPath::new("/host/node_modules"))
        );
        assert_eq!(
            spec.copy_data.get(&ImagePath::new("/image/.encore/package.json")),
            Some(&HostPath::new("/host/package.json"))
        );
        assert!(spec
            .stargz_prioritized_files
            .contains(&ImagePath::new("/image/.encore/package.json")));
        assert!(spec.env.contains(&format!(
            "ENCORE_RUNTIME_LIB={}",
            canonical::JS_RUNTIME_NODE
        )));
        assert_eq!(
            spec.copy_data.get(&ImagePath::new(canonical::JS_RUNTIMES_DIR)),
            Some(&HostPath::new("/host/runtimes/js"))
        );
        assert_eq!(
            spec.feature_flags.get(&FeatureFlag::NewRuntimeConfig),
            Some(&true)
        );
    }

    #[test]
    fn js_output_with_native_runtime_override_embeds_framework_lib() {
        let output = BuildOutput::Js(JsOutput {
            artifact_dir: HostPath::new("/host/artifacts"),
            entrypoints: vec![native_entrypoint("${ARTIFACT_DIR}/main.js", &["svc"], &[])],
            node_modules_dir: None,
            package_json: HostPath::new("/host/package.json"),
            native_runtime_override: Some(HostPath::new("/host/encore-runtime.node")),
            js_runtimes_dir: None,
            framework_lib_dir: Some(HostPath::new("/host/encore.dev")),
        });
        let cfg = DescribeConfig {
            compile_result: base_compile_result(vec![output]),
            docker_base_image: None,
            working_dir: None,
            bundle_source: None,
            build_info: BuildInfo::default(),
        };

        let spec = describe(&cfg, &SequentialProcIdGenerator::default()).unwrap();

        assert_eq!(
            spec.copy_data.get(&ImagePath::new(canonical::JS_RUNTIME_NODE)),
            Some(&HostPath::new("/host/encore-runtime.node"))
        );
        assert_eq!(
            spec.copy_data.get(&ImagePath::new(canonical::JS_RUNTIME_DEV)),
            Some(&HostPath::new("/host/encore.dev"))
        );
        assert!(spec
            .stargz_prioritized_files
            .contains(&ImagePath::new(canonical::JS_RUNTIME_NODE)));
    }
}
