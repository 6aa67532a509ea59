//! Classifies a demultiplexed context and produces a daemon-buildable
//! [`ResolvedTask`] (§4.5).
//!
//! This is the second of the three staged types
//! ([`crate::task_set::BuildTask`] → `ResolvedTask` →
//! [`crate::build_driver::LocalImage`]): rather than a single task
//! record that gains fields as a stream of resolver events arrives, a
//! [`BuildTask`] is resolved once, synchronously, into a `ResolvedTask`
//! that downstream code can consume without a completion latch.

use std::collections::HashMap;

use stacked_errors::{Result, StackableErr};

use crate::{
    error::MultibuildError,
    tar_demux::{DemuxedPack, ALTERNATE_DOCKERFILE_PATH},
    task_set::{BuildTask, TaskKind},
};

pub const EXPLICIT_DOCKERFILE_PATH: &str = "Explicit Dockerfile path";
pub const ARCH_SPECIFIC_DOCKERFILE: &str = "Architecture-specific Dockerfile";
pub const DOCKERFILE_TEMPLATE: &str = "Dockerfile.template";
pub const STANDARD_DOCKERFILE: &str = "Standard Dockerfile";

/// A task after resolution: its Dockerfile content, the classification
/// that produced it, the final context tar, and the derived daemon
/// platform string.
#[derive(Debug, Clone)]
pub struct ResolvedTask {
    pub service_name: String,
    pub context_pack: DemuxedPack,
    pub dockerfile: String,
    pub dockerfile_path: String,
    pub project_type: String,
    pub docker_platform: Option<String>,
    pub args: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub tag: Option<String>,
}

/// Resolution parameters supplied by the caller: target architecture,
/// device type, and extra template substitution variables (§10
/// `RunConfig`).
#[derive(Debug, Clone, Default)]
pub struct ResolverContext {
    pub arch: Option<String>,
    pub device_type: Option<String>,
    pub extra_vars: HashMap<String, String>,
}

pub struct Resolver;

impl Resolver {
    /// Resolves one non-external task. `pack` must be the finished
    /// [`DemuxedPack`] produced by [`crate::tar_demux::run`] for this
    /// task's service.
    pub fn resolve(task: &BuildTask, pack: DemuxedPack, ctx: &ResolverContext) -> Result<ResolvedTask> {
        let TaskKind::Build {
            dockerfile_path,
            args,
            labels,
            tag,
            ..
        } = &task.kind
        else {
            return Err(MultibuildError::ProjectResolutionError {
                service_name: task.service_name.clone(),
            })
            .stack_err_locationless("Resolver::resolve: called on an external task");
        };

        let (dockerfile, resolved_path, project_type) =
            Self::classify(&pack, dockerfile_path.as_deref(), ctx)
                .stack_err_locationless(format!("Resolver::resolve: service {:?}", task.service_name))?;

        Ok(ResolvedTask {
            service_name: task.service_name.clone(),
            context_pack: pack,
            dockerfile,
            dockerfile_path: resolved_path,
            project_type: project_type.to_string(),
            docker_platform: docker_platform_for(ctx.arch.as_deref()),
            args: args.clone(),
            labels: labels.clone(),
            tag: tag.clone(),
        })
    }

    fn classify(
        pack: &DemuxedPack,
        declared_dockerfile_path: Option<&str>,
        ctx: &ResolverContext,
    ) -> Result<(String, String, &'static str)> {
        // strategy 1: explicit dockerfilePath — tar_demux already duplicated the
        // declared file to a fixed location.
        if declared_dockerfile_path.is_some() {
            if let Some(bytes) = pack.get(ALTERNATE_DOCKERFILE_PATH) {
                let text = String::from_utf8_lossy(bytes).into_owned();
                return Ok((text, ALTERNATE_DOCKERFILE_PATH.to_string(), EXPLICIT_DOCKERFILE_PATH));
            }
        }

        // strategy 2: architecture/device-specific Dockerfile, most specific wins.
        if let Some(device_type) = &ctx.device_type {
            let name = format!("Dockerfile.{device_type}");
            if let Some(bytes) = pack.get(&name) {
                let text = String::from_utf8_lossy(bytes).into_owned();
                return Ok((text, "Dockerfile".to_string(), ARCH_SPECIFIC_DOCKERFILE));
            }
        }
        if let Some(arch) = &ctx.arch {
            let name = format!("Dockerfile.{arch}");
            if let Some(bytes) = pack.get(&name) {
                let text = String::from_utf8_lossy(bytes).into_owned();
                return Ok((text, "Dockerfile".to_string(), ARCH_SPECIFIC_DOCKERFILE));
            }
        }

        // strategy 3: Dockerfile.template with variable substitution.
        if let Some(bytes) = pack.get("Dockerfile.template") {
            let template = String::from_utf8_lossy(bytes).into_owned();
            let rendered = substitute_template(&template, ctx)?;
            return Ok((rendered, "Dockerfile".to_string(), DOCKERFILE_TEMPLATE));
        }

        // strategy 4: standard top-level Dockerfile.
        if let Some(bytes) = pack.get("Dockerfile") {
            let text = String::from_utf8_lossy(bytes).into_owned();
            return Ok((text, "Dockerfile".to_string(), STANDARD_DOCKERFILE));
        }

        Err(MultibuildError::ProjectResolutionError {
            service_name: String::new(),
        })
        .stack_err_locationless("Resolver::classify: no strategy matched")
    }
}

/// Substitutes `%%TOKEN%%` placeholders. Recognized built-in tokens
/// mirror the arch/device-type under both the `RESIN_` and `BALENA_`
/// prefixes (§4.5); any other `%%FOO%%` fails resolution.
fn substitute_template(template: &str, ctx: &ResolverContext) -> Result<String> {
    let mut tokens: HashMap<String, String> = HashMap::new();
    if let Some(device_type) = &ctx.device_type {
        tokens.insert("RESIN_MACHINE_NAME".to_string(), device_type.clone());
        tokens.insert("BALENA_MACHINE_NAME".to_string(), device_type.clone());
    }
    if let Some(arch) = &ctx.arch {
        tokens.insert("RESIN_ARCH".to_string(), arch.clone());
        tokens.insert("BALENA_ARCH".to_string(), arch.clone());
    }
    tokens.extend(ctx.extra_vars.clone());

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("%%") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("%%") else {
            out.push_str("%%");
            rest = after;
            continue;
        };
        let token = &after[..end];
        let Some(value) = tokens.get(token) else {
            return Err(MultibuildError::ProjectResolutionError {
                service_name: String::new(),
            })
            .stack_err_locationless(format!("substitute_template: unknown token %%{token}%%"));
        };
        out.push_str(value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Derives the daemon `--platform` string from a target arch name
/// (§4.5). Unknown arch names leave the platform unset rather than
/// erroring, since PlatformPolicy may still decide not to pass it.
fn docker_platform_for(arch: Option<&str>) -> Option<String> {
    match arch? {
        "x86_64" | "amd64" => Some("linux/amd64".to_string()),
        "i386" | "x86" => Some("linux/386".to_string()),
        "armv7hf" => Some("linux/arm/v7".to_string()),
        "aarch64" => Some("linux/arm64".to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tar_demux::DemuxedPack;

    fn pack_with(entries: &[(&str, &str)]) -> DemuxedPack {
        let mut pack = DemuxedPack::default();
        for (name, content) in entries {
            pack.push(name.to_string(), content.as_bytes().to_vec());
        }
        pack
    }

    fn build_task(dockerfile_path: Option<&str>) -> BuildTask {
        BuildTask {
            service_name: "svc".to_string(),
            kind: TaskKind::Build {
                context: ".".to_string(),
                dockerfile_path: dockerfile_path.map(str::to_string),
                args: HashMap::new(),
                labels: HashMap::new(),
                tag: None,
            },
        }
    }

    #[test]
    fn standard_dockerfile_is_used_as_is() {
        let pack = pack_with(&[("Dockerfile", "FROM alpine")]);
        let resolved = Resolver::resolve(&build_task(None), pack, &ResolverContext::default()).unwrap();
        assert_eq!(resolved.project_type, STANDARD_DOCKERFILE);
        assert_eq!(resolved.dockerfile, "FROM alpine");
    }

    #[test]
    fn device_specific_wins_over_arch_specific() {
        let pack = pack_with(&[
            ("Dockerfile.armv7hf", "FROM arch"),
            ("Dockerfile.raspberrypi3", "FROM device"),
        ]);
        let ctx = ResolverContext {
            arch: Some("armv7hf".to_string()),
            device_type: Some("raspberrypi3".to_string()),
            extra_vars: HashMap::new(),
        };
        let resolved = Resolver::resolve(&build_task(None), pack, &ctx).unwrap();
        assert_eq!(resolved.project_type, ARCH_SPECIFIC_DOCKERFILE);
        assert_eq!(resolved.dockerfile, "FROM device");
    }

    #[test]
    fn template_substitution_replaces_known_tokens() {
        let pack = pack_with(&[("Dockerfile.template", "FROM %%BALENA_ARCH%%/alpine")]);
        let ctx = ResolverContext {
            arch: Some("amd64".to_string()),
            ..Default::default()
        };
        let resolved = Resolver::resolve(&build_task(None), pack, &ctx).unwrap();
        assert_eq!(resolved.dockerfile, "FROM amd64/alpine");
        assert_eq!(resolved.project_type, DOCKERFILE_TEMPLATE);
    }

    #[test]
    fn template_substitution_fails_on_unknown_token() {
        let pack = pack_with(&[("Dockerfile.template", "FROM %%NOT_A_REAL_TOKEN%%/alpine")]);
        let err = Resolver::resolve(&build_task(None), pack, &ResolverContext::default());
        assert!(err.is_err());
    }

    #[test]
    fn explicit_dockerfile_path_uses_alternate_rewrite() {
        let pack = pack_with(&[(ALTERNATE_DOCKERFILE_PATH, "FROM alternate")]);
        let task = build_task(Some("test2/Dockerfile-alternate"));
        let resolved = Resolver::resolve(&task, pack, &ResolverContext::default()).unwrap();
        assert_eq!(resolved.project_type, EXPLICIT_DOCKERFILE_PATH);
        assert_eq!(resolved.dockerfile_path, ALTERNATE_DOCKERFILE_PATH);
    }

    #[test]
    fn no_strategy_matches_errors() {
        let pack = pack_with(&[("README.md", "hello")]);
        let err = Resolver::resolve(&build_task(None), pack, &ResolverContext::default());
        assert!(err.is_err());
    }

    #[test]
    fn unknown_arch_leaves_platform_unset() {
        assert_eq!(docker_platform_for(Some("riscv64")), None);
        assert_eq!(docker_platform_for(Some("x86_64")), Some("linux/amd64".to_string()));
    }
}
