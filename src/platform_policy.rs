//! Decides whether to pass `--platform` to the daemon for a resolved
//! build, based on the daemon's API version and the manifest schema of
//! each `FROM` image it already has cached (§4.7).

use bollard::Docker;
use futures::future::try_join_all;
use stacked_errors::{Result, StackableErr};
use tracing::warn;

use crate::{
    build_driver::split_tag,
    dockerfile_ast::from_references,
    metadata::RegistrySecrets,
    registry::{ManifestResult, RegistryClient},
    resolver::ResolvedTask,
};

/// Below this daemon API version, `--platform` is not a recognized
/// build option at all.
const MIN_PLATFORM_API_VERSION: (u32, u32) = (1, 38);

const V1_MEDIA_TYPES: &[&str] = &[
    "application/vnd.docker.distribution.manifest.v1+json",
    "application/vnd.docker.distribution.manifest.v1+prettyjws",
];

pub struct PlatformPolicy;

impl PlatformPolicy {
    /// Returns `Some(platform)` if the caller should pass it to the
    /// build, `None` otherwise.
    #[tracing::instrument(skip_all, fields(service = %resolved.service_name))]
    pub async fn decide(
        docker: &Docker,
        resolved: &ResolvedTask,
        registry_secrets: &RegistrySecrets,
    ) -> Result<Option<String>> {
        let Some(platform) = &resolved.docker_platform else {
            return Ok(None);
        };

        let version = docker
            .version()
            .await
            .stack_err_locationless("PlatformPolicy::decide: querying daemon version")?;
        let Some(api_version) = version.api_version.as_deref().and_then(parse_api_version) else {
            return Ok(None);
        };
        if api_version < MIN_PLATFORM_API_VERSION {
            return Ok(None);
        }

        let references: Vec<String> = from_references(&resolved.dockerfile)
            .into_iter()
            .filter(|r| !r.is_stage_reference)
            .map(|r| r.image_ref)
            .collect();
        if references.is_empty() {
            return Ok(Some(platform.clone()));
        }

        let lookups = references
            .iter()
            .map(|image_ref| Self::media_type_for(docker, image_ref, registry_secrets));
        let media_types = try_join_all(lookups)
            .await
            .stack_err_locationless("PlatformPolicy::decide: looking up cached manifest media types")?;

        let mut v1 = Vec::new();
        let mut v2 = Vec::new();
        for (image_ref, media_type) in references.iter().zip(media_types) {
            if is_v1(media_type.as_deref()) {
                v1.push(image_ref.clone());
            } else {
                v2.push(image_ref.clone());
            }
        }

        if !v1.is_empty() {
            warn!(v1_images = ?v1, v2_images = ?v2, "skipping --platform: some FROM images are schema v1");
            return Ok(None);
        }

        Ok(Some(platform.clone()))
    }

    /// Looks up the manifest media type for `image_ref`, preferring the
    /// daemon's locally cached distribution info and falling back to a
    /// direct registry manifest fetch when the daemon has never pulled
    /// the image. An image unavailable through either path is assumed
    /// to be V2-schema (§4.7: "if unavailable, assume V2").
    async fn media_type_for(docker: &Docker, image_ref: &str, registry_secrets: &RegistrySecrets) -> Result<Option<String>> {
        if let Ok(dist) = docker.inspect_distribution(image_ref).await {
            if let Some(media_type) = dist.descriptor.and_then(|d| d.media_type) {
                return Ok(Some(media_type));
            }
        }
        Ok(Self::media_type_from_registry(image_ref, registry_secrets).await)
    }

    /// Asks the registry directly for `image_ref`'s manifest, used only
    /// when the daemon has no cached distribution info for it yet.
    async fn media_type_from_registry(image_ref: &str, registry_secrets: &RegistrySecrets) -> Option<String> {
        let (repo, tag) = split_tag(image_ref);
        let mut client = RegistryClient::new(&repo).ok()?.with_registry_secrets(registry_secrets.clone());
        if !client.login(false, false).await.unwrap_or(false) {
            return None;
        }
        match client.get_manifest(&tag, 2, true).await.ok()? {
            ManifestResult::Manifest(manifest) => manifest.media_type,
            ManifestResult::Status(_) => None,
        }
    }
}

fn parse_api_version(raw: &str) -> Option<(u32, u32)> {
    let mut parts = raw.splitn(2, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

fn is_v1(media_type: Option<&str>) -> bool {
    media_type.is_some_and(|mt| V1_MEDIA_TYPES.contains(&mt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_api_version() {
        assert_eq!(parse_api_version("1.41"), Some((1, 41)));
        assert_eq!(parse_api_version("1.41.3"), Some((1, 41)));
        assert_eq!(parse_api_version("garbage"), None);
    }

    #[test]
    fn version_ordering_matches_min_threshold() {
        assert!((1u32, 30u32) < MIN_PLATFORM_API_VERSION);
        assert!((1u32, 41u32) >= MIN_PLATFORM_API_VERSION);
    }

    #[test]
    fn v1_media_type_detection() {
        assert!(is_v1(Some("application/vnd.docker.distribution.manifest.v1+json")));
        assert!(!is_v1(Some("application/vnd.docker.distribution.manifest.v2+json")));
        assert!(!is_v1(None));
    }
}
