//! The single entry point wiring every phase together (§4.9).

use bollard::Docker;
use futures::future::join_all;
use stacked_errors::{Result, StackableErr};
use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::{
    build_driver::{BuildDriver, LocalImage, ProgressHook, StreamHook},
    composition::CompositionSource,
    config::RunConfig,
    metadata::{MetadataStore, RegistryCredential, RegistrySecrets},
    platform_policy::PlatformPolicy,
    registry::repo::DEFAULT_INDEX_URL,
    resolver::{Resolver, ResolverContext},
    task_set::{BuildTask, TaskKind, TaskSet},
    tar_demux,
};

pub struct Orchestrator;

impl Orchestrator {
    /// Runs the whole pipeline for one composition against one archive,
    /// returning one [`LocalImage`] per service in composition order
    /// (testable property 3).
    #[tracing::instrument(skip_all, fields(run_id = tracing::field::Empty))]
    pub async fn run<R>(
        composition: &dyn CompositionSource,
        archive: R,
        config: &RunConfig,
        docker: &Docker,
        progress_hook: Option<ProgressHook>,
        stream_hook: Option<StreamHook>,
    ) -> Result<Vec<LocalImage>>
    where
        R: AsyncRead + Unpin + Send,
    {
        // every invocation gets its own id purely for correlating log lines; it
        // carries no meaning across runs and nothing persists it.
        let run_id = Uuid::new_v4();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));

        let descriptors = composition
            .descriptors()
            .stack_err_locationless("Orchestrator::run: parsing composition")?;
        let tasks = TaskSet::from_descriptors(descriptors).stack_err_locationless("Orchestrator::run: building task set")?;

        let mut metadata = MetadataStore::new();
        let packs = tar_demux::run(archive, &tasks, &mut metadata)
            .await
            .stack_err_locationless("Orchestrator::run: demultiplexing archive")?;
        metadata.parse().stack_err_locationless("Orchestrator::run: parsing metadata")?;

        let registry_secrets = merge_registry_secrets(metadata.registry_secrets(), config);
        let resolver_ctx = ResolverContext {
            arch: config.arch.clone(),
            device_type: config.device_type.clone(),
            extra_vars: config.extra_template_vars.clone(),
        };

        let futures = tasks.into_iter().map(|task| {
            let packs = &packs;
            let metadata = &metadata;
            let registry_secrets = &registry_secrets;
            let resolver_ctx = &resolver_ctx;
            let progress_hook = progress_hook.clone();
            let stream_hook = stream_hook.clone();
            async move {
                match &task.kind {
                    TaskKind::External { .. } => BuildDriver::pull(docker, &task, progress_hook).await,
                    TaskKind::Build { .. } => {
                        Self::run_build_task(docker, task, packs, metadata, registry_secrets, resolver_ctx, config, stream_hook)
                            .await
                    }
                }
            }
        });

        Ok(join_all(futures).await)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_build_task(
        docker: &Docker,
        task: BuildTask,
        packs: &std::collections::HashMap<String, tar_demux::DemuxedPack>,
        metadata: &MetadataStore,
        registry_secrets: &RegistrySecrets,
        resolver_ctx: &ResolverContext,
        config: &RunConfig,
        stream_hook: Option<StreamHook>,
    ) -> LocalImage {
        let service_name = task.service_name.clone();
        let now = || {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis()
        };

        let Some(pack) = packs.get(&service_name).cloned() else {
            return LocalImage {
                service_name,
                name: None,
                external: false,
                successful: false,
                layers: Vec::new(),
                base_image_tags: Vec::new(),
                dockerfile: None,
                project_type: None,
                error: Some("no demultiplexed context produced for this service".to_string()),
                start_time: now(),
                end_time: now(),
            };
        };

        let resolved = match Resolver::resolve(&task, pack, resolver_ctx) {
            Ok(resolved) => resolved,
            Err(e) => {
                return LocalImage {
                    service_name,
                    name: None,
                    external: false,
                    successful: false,
                    layers: Vec::new(),
                    base_image_tags: Vec::new(),
                    dockerfile: None,
                    project_type: None,
                    error: Some(format!("{e:?}")),
                    start_time: now(),
                    end_time: now(),
                };
            }
        };

        let platform = match PlatformPolicy::decide(docker, &resolved, registry_secrets).await {
            Ok(platform) => platform,
            Err(_) => None,
        };

        let secret_files = match metadata.build_secrets_for_service(&service_name) {
            Ok(files) => files,
            Err(e) => {
                return LocalImage {
                    service_name,
                    name: None,
                    external: false,
                    successful: false,
                    layers: Vec::new(),
                    base_image_tags: Vec::new(),
                    dockerfile: Some(resolved.dockerfile),
                    project_type: Some(resolved.project_type),
                    error: Some(format!("{e:?}")),
                    start_time: now(),
                    end_time: now(),
                };
            }
        };

        BuildDriver::build(
            docker,
            &resolved,
            platform,
            &config.extra_build_args,
            registry_secrets,
            &secret_files,
            stream_hook,
        )
        .await
    }
}

/// Merges the archive's `registry-secrets.*` with the caller's
/// configured host overrides: the archive wins for every host except
/// the default Docker Hub index, where the caller's entry takes
/// precedence (§4.8 step 2c).
fn merge_registry_secrets(archive: &RegistrySecrets, config: &RunConfig) -> RegistrySecrets {
    let mut merged = archive.clone();
    for host_cred in &config.host_credentials {
        let caller_overrides = host_cred.host == DEFAULT_INDEX_URL || !merged.contains_key(&host_cred.host);
        if caller_overrides {
            merged.insert(
                host_cred.host.clone(),
                RegistryCredential {
                    username: host_cred.username.clone(),
                    password: host_cred.password.clone(),
                },
            );
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostCredentials;

    #[test]
    fn caller_overrides_default_hub_but_not_archive_entries() {
        let mut archive = RegistrySecrets::default();
        archive.insert(
            "docker.io".to_string(),
            RegistryCredential {
                username: "archive".to_string(),
                password: "archive-pass".to_string(),
            },
        );
        archive.insert(
            DEFAULT_INDEX_URL.to_string(),
            RegistryCredential {
                username: "archive-hub".to_string(),
                password: "archive-hub-pass".to_string(),
            },
        );
        let config = RunConfig {
            host_credentials: vec![
                HostCredentials {
                    host: "docker.io".to_string(),
                    username: "caller".to_string(),
                    password: "caller-pass".to_string(),
                },
                HostCredentials {
                    host: DEFAULT_INDEX_URL.to_string(),
                    username: "caller-hub".to_string(),
                    password: "caller-hub-pass".to_string(),
                },
            ],
            ..Default::default()
        };
        let merged = merge_registry_secrets(&archive, &config);
        assert_eq!(merged.get("docker.io").unwrap().username, "archive");
        assert_eq!(merged.get(DEFAULT_INDEX_URL).unwrap().username, "caller-hub");
    }
}
