//! Drives one resolved task (or one external pull) against the
//! container daemon and assembles its [`LocalImage`] result record
//! (§4.8).

use std::{
    collections::HashMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use bollard::{
    auth::DockerCredentials,
    image::{BuildImageOptions, CreateImageOptions},
    Docker,
};
use futures::StreamExt;
use stacked_errors::{Result, StackableErr};
use tracing::warn;

use crate::{
    dockerfile_ast::from_references,
    error::MultibuildError,
    metadata::RegistrySecrets,
    resolver::ResolvedTask,
    task_set::{BuildTask, TaskKind},
};

/// Unix-epoch milliseconds. Kept as a plain integer rather than
/// exposing `SystemTime` directly, since `LocalImage` is a result
/// record callers may serialize.
pub type Timestamp = u128;

pub type ProgressHook = Arc<dyn Fn(String) + Send + Sync>;
pub type StreamHook = Arc<dyn Fn(String) + Send + Sync>;

fn now_ms() -> Timestamp {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis()
}

/// Attaches the [`MultibuildError::BuildProcessError`] variant at the
/// point an infrastructure fault (daemon error, null build stream) is
/// known, rather than carrying a raw string into `LocalImage.error`.
fn build_process_error(service_name: &str, message: impl Into<String>) -> String {
    MultibuildError::BuildProcessError {
        service_name: service_name.to_string(),
        message: message.into(),
    }
    .to_string()
}

/// The per-task result record (§3).
#[derive(Debug, Clone)]
pub struct LocalImage {
    pub service_name: String,
    pub name: Option<String>,
    pub external: bool,
    pub successful: bool,
    pub layers: Vec<String>,
    pub base_image_tags: Vec<(String, String)>,
    pub dockerfile: Option<String>,
    pub project_type: Option<String>,
    pub error: Option<String>,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
}

pub struct BuildDriver;

impl BuildDriver {
    /// Pulls an external task's image, appending `:latest` if the task
    /// didn't already carry a tag (§4.8 external path; already applied
    /// once by [`crate::task_set::TaskSet`], reapplied defensively here
    /// since `BuildDriver` must also be correct if handed a bare task).
    #[tracing::instrument(skip_all, fields(service = %task.service_name))]
    pub async fn pull(docker: &Docker, task: &BuildTask, progress_hook: Option<ProgressHook>) -> LocalImage {
        let TaskKind::External { image_ref } = &task.kind else {
            return LocalImage {
                service_name: task.service_name.clone(),
                name: None,
                external: true,
                successful: false,
                layers: Vec::new(),
                base_image_tags: Vec::new(),
                dockerfile: None,
                project_type: None,
                error: Some(build_process_error(&task.service_name, "BuildDriver::pull called on a build task")),
                start_time: now_ms(),
                end_time: now_ms(),
            };
        };

        let start_time = now_ms();
        let (from_image, tag) = split_tag(image_ref);
        let options = CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };

        let mut stream = docker.create_image(Some(options), None, None);
        let mut error = None;
        while let Some(event) = stream.next().await {
            match event {
                Ok(info) => {
                    if let Some(status) = info.status {
                        if let Some(hook) = &progress_hook {
                            hook(status);
                        }
                    }
                    if let Some(err) = info.error {
                        error = Some(build_process_error(&task.service_name, err));
                    }
                }
                Err(e) => error = Some(build_process_error(&task.service_name, e.to_string())),
            }
        }

        LocalImage {
            service_name: task.service_name.clone(),
            name: error.is_none().then(|| image_ref.clone()),
            external: true,
            successful: error.is_none(),
            layers: Vec::new(),
            base_image_tags: Vec::new(),
            dockerfile: None,
            project_type: None,
            error,
            start_time,
            end_time: now_ms(),
        }
    }

    /// Builds a resolved task against the daemon (§4.8 steps 2-4).
    #[tracing::instrument(skip_all, fields(service = %resolved.service_name))]
    pub async fn build(
        docker: &Docker,
        resolved: &ResolvedTask,
        platform: Option<String>,
        extra_build_args: &HashMap<String, String>,
        registry_secrets: &RegistrySecrets,
        secret_files: &[(String, tempfile::NamedTempFile)],
        stream_hook: Option<StreamHook>,
    ) -> LocalImage {
        let start_time = now_ms();
        let base_image_tags = from_references(&resolved.dockerfile)
            .into_iter()
            .filter(|r| !r.is_stage_reference)
            .map(|r| split_tag(&r.image_ref))
            .collect();

        let body = match assemble_context_tar(resolved, secret_files) {
            Ok(bytes) => bytes,
            Err(e) => {
                return LocalImage {
                    service_name: resolved.service_name.clone(),
                    name: None,
                    external: false,
                    successful: false,
                    layers: Vec::new(),
                    base_image_tags,
                    dockerfile: Some(resolved.dockerfile.clone()),
                    project_type: Some(resolved.project_type.clone()),
                    error: Some(build_process_error(
                        &resolved.service_name,
                        format!("assembling build context: {e}"),
                    )),
                    start_time,
                    end_time: now_ms(),
                };
            }
        };

        let mut buildargs = resolved.args.clone();
        for (k, v) in extra_build_args {
            buildargs.entry(k.clone()).or_insert_with(|| v.clone());
        }

        let mut options = BuildImageOptions {
            dockerfile: resolved.dockerfile_path.clone(),
            t: resolved.tag.clone().unwrap_or_default(),
            buildargs,
            labels: resolved.labels.clone(),
            rm: true,
            ..Default::default()
        };
        if let Some(platform) = &platform {
            options.platform = platform.clone();
        }
        let credentials = build_registry_config(registry_secrets);

        // need the clone-free `.into()` rather than an explicit body type: bollard's
        // third argument only needs `From<Vec<u8>>`, matching the teacher's
        // `tarball.clone().into()` call.
        let mut stream = docker.build_image(options, credentials, Some(body.into()));
        let mut layers = Vec::new();
        let mut error = None;
        let mut image_id = None;
        while let Some(event) = stream.next().await {
            match event {
                Ok(info) => {
                    if let Some(text) = &info.stream {
                        if let Some(hook) = &stream_hook {
                            hook(text.clone());
                        }
                        if let Some(layer) = text.trim().strip_prefix("---> ") {
                            layers.push(layer.to_string());
                        }
                    }
                    if let Some(aux) = &info.aux {
                        if let Some(id) = &aux.id {
                            image_id = Some(id.clone());
                        }
                    }
                    if let Some(err) = info.error {
                        error = Some(build_process_error(&resolved.service_name, err));
                    }
                }
                Err(e) => error = Some(build_process_error(&resolved.service_name, e.to_string())),
            }
        }

        if error.is_some() && !layers.is_empty() {
            warn!(service = %resolved.service_name, "build failed with a partial layer chain");
        }

        let successful = error.is_none();
        let name = if successful {
            resolved.tag.clone().or(image_id).or_else(|| layers.last().cloned())
        } else {
            layers.last().cloned()
        };

        LocalImage {
            service_name: resolved.service_name.clone(),
            name,
            external: false,
            successful,
            layers,
            base_image_tags,
            dockerfile: Some(resolved.dockerfile.clone()),
            project_type: Some(resolved.project_type.clone()),
            error,
            start_time,
            end_time: now_ms(),
        }
    }
}

/// Translates the archive's/caller's merged registry credentials into the
/// `X-Registry-Config` map bollard's `build_image` accepts as its second
/// argument, so base-image pulls the daemon performs mid-build can
/// authenticate against private registries (§4.8 step 2c).
fn build_registry_config(secrets: &RegistrySecrets) -> Option<HashMap<String, DockerCredentials>> {
    if secrets.is_empty() {
        return None;
    }
    Some(
        secrets
            .iter()
            .map(|(host, cred)| {
                (
                    host.clone(),
                    DockerCredentials {
                        username: Some(cred.username.clone()),
                        password: Some(cred.password.clone()),
                        serveraddress: Some(host.clone()),
                        ..Default::default()
                    },
                )
            })
            .collect(),
    )
}

pub(crate) fn split_tag(image_ref: &str) -> (String, String) {
    let last_segment = image_ref.rsplit('/').next().unwrap_or(image_ref);
    match last_segment.rsplit_once(':') {
        Some(_) => {
            let idx = image_ref.len() - last_segment.len();
            let (repo, tag) = image_ref[idx..].rsplit_once(':').unwrap();
            (format!("{}{}", &image_ref[..idx], repo), tag.to_string())
        }
        None => (image_ref.to_string(), "latest".to_string()),
    }
}

/// Serializes the resolved context into a tar byte buffer for
/// `docker.build_image`, materializing secret files at
/// `run/secrets/<dest>` inside the build context rather than as a host
/// bind mount: the classic build API has no bind-mount facility, so
/// secrets travel with the context itself.
fn assemble_context_tar(resolved: &ResolvedTask, secret_files: &[(String, tempfile::NamedTempFile)]) -> Result<Vec<u8>> {
    use std::io::Read;

    let mut builder = tar::Builder::new(Vec::new());
    for (name, bytes) in resolved.context_pack.iter() {
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, bytes.as_slice())
            .stack_err_locationless("assemble_context_tar: appending context entry")?;
    }
    {
        let mut header = tar::Header::new_gnu();
        header.set_size(resolved.dockerfile.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, &resolved.dockerfile_path, resolved.dockerfile.as_bytes())
            .stack_err_locationless("assemble_context_tar: appending resolved dockerfile")?;
    }
    for (dest, file) in secret_files {
        let mut contents = Vec::new();
        file.reopen()
            .stack_err_locationless("assemble_context_tar: reopening secret file")?
            .read_to_end(&mut contents)
            .stack_err_locationless("assemble_context_tar: reading secret file")?;
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o400);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("run/secrets/{dest}"), contents.as_slice())
            .stack_err_locationless("assemble_context_tar: appending secret entry")?;
    }
    builder.into_inner().stack_err_locationless("assemble_context_tar: finalizing tar")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_tag_defaults_to_latest() {
        assert_eq!(split_tag("alpine"), ("alpine".to_string(), "latest".to_string()));
    }

    #[test]
    fn split_tag_preserves_explicit_tag() {
        assert_eq!(split_tag("alpine:3.19"), ("alpine".to_string(), "3.19".to_string()));
    }

    #[test]
    fn split_tag_handles_registry_with_port() {
        assert_eq!(
            split_tag("registry.example.com:5000/myrepo:v1"),
            ("registry.example.com:5000/myrepo".to_string(), "v1".to_string())
        );
    }

    #[test]
    fn split_tag_registry_with_port_no_tag() {
        assert_eq!(
            split_tag("registry.example.com:5000/myrepo"),
            ("registry.example.com:5000/myrepo".to_string(), "latest".to_string())
        );
    }
}
