//! A minimal OCI/Docker Registry V2 client: ping, the auth
//! challenge/response flow, and manifest retrieval (§4.6).

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use stacked_errors::{Result, StackableErr};
use tracing::debug;

use super::{
    challenge::{parse_challenge, quay_fallback_challenge, AuthState, ChallengeScheme},
    repo::{parse_repo, ParsedRepo},
};
use crate::{error::MultibuildError, metadata::RegistrySecrets};

const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// An explicit authentication mode the caller can force, skipping the
/// challenge/response round trip entirely (§4.6 step 2).
#[derive(Debug, Clone)]
pub enum ExplicitAuth {
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
}

/// The result of [`RegistryClient::get_manifest`]: either a parsed
/// manifest body, or the registry's HTTP status code when it did not
/// return one (§4.6, with 401 rewritten to 404).
#[derive(Debug, Clone)]
pub enum ManifestResult {
    Manifest(Manifest),
    Status(u16),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<ManifestListEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestListEntry {
    pub digest: String,
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    pub platform: Option<PlatformInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformInfo {
    pub architecture: String,
    #[serde(default)]
    pub os: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

pub struct RegistryClient {
    http: reqwest::Client,
    repo: ParsedRepo,
    explicit_auth: Option<ExplicitAuth>,
    explicit_credentials: Option<(String, String)>,
    registry_secrets: RegistrySecrets,
    current_auth: AuthState,
}

impl RegistryClient {
    pub fn new(reference: &str) -> Result<Self> {
        let repo = parse_repo(reference).stack_err_locationless("RegistryClient::new")?;
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(PING_TIMEOUT)
                .build()
                .stack_err_locationless("RegistryClient::new: building http client")?,
            repo,
            explicit_auth: None,
            explicit_credentials: None,
            registry_secrets: RegistrySecrets::default(),
            current_auth: AuthState::None,
        })
    }

    pub fn with_explicit_auth(mut self, auth: ExplicitAuth) -> Self {
        self.explicit_auth = Some(auth);
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.explicit_credentials = Some((username.into(), password.into()));
        self
    }

    pub fn with_registry_secrets(mut self, secrets: RegistrySecrets) -> Self {
        self.registry_secrets = secrets;
        self
    }

    pub fn repo(&self) -> &ParsedRepo {
        &self.repo
    }

    pub fn current_auth(&self) -> &AuthState {
        &self.current_auth
    }

    fn credentials_lookup(&self) -> (String, String) {
        let mut keys = vec![
            self.repo.index_url.clone(),
            self.repo.index_url.trim_end_matches('/').to_string(),
            self.repo.index_name.clone(),
        ];
        if self.repo.official {
            keys.push(super::repo::DEFAULT_INDEX_URL.to_string());
        }
        for key in keys {
            if let Some(cred) = self.registry_secrets.get(&key) {
                return (cred.username.clone(), cred.password.clone());
            }
        }
        if let Some((u, p)) = &self.explicit_credentials {
            return (u.clone(), p.clone());
        }
        (String::new(), String::new())
    }

    fn auth_header_value(&self) -> Option<String> {
        match &self.current_auth {
            AuthState::None => None,
            AuthState::Basic { username, password } => {
                use base64::Engine;
                let encoded =
                    base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
                Some(format!("Basic {encoded}"))
            }
            AuthState::Bearer { token } => Some(format!("Bearer {token}")),
        }
    }

    /// `GET /v2/` against the index, per §4.6.
    #[tracing::instrument(skip(self), fields(index = %self.repo.index_url))]
    pub async fn ping(&self) -> Result<bool> {
        let mut req = self.http.get(&self.repo.index_url);
        if let Some(auth) = self.auth_header_value() {
            req = req.header(reqwest::header::AUTHORIZATION, auth);
        }
        let res = req
            .send()
            .await
            .stack_err_locationless("RegistryClient::ping")?;
        let status = res.status();
        if status.is_success() {
            return Ok(true);
        }
        if self.current_auth == AuthState::None && status == StatusCode::UNAUTHORIZED {
            let challenge = res
                .headers()
                .get(reqwest::header::WWW_AUTHENTICATE)
                .and_then(|h| h.to_str().ok())
                .and_then(parse_challenge);
            return Ok(challenge.is_some());
        }
        Ok(false)
    }

    /// Runs the auth state machine described in §4.6.
    #[tracing::instrument(skip(self), fields(index = %self.repo.index_url))]
    pub async fn login(&mut self, force_reset: bool, force_validate: bool) -> Result<bool> {
        if force_reset {
            self.current_auth = AuthState::None;
        }

        if let Some(explicit) = &self.explicit_auth {
            self.current_auth = match explicit {
                ExplicitAuth::None => AuthState::None,
                ExplicitAuth::Basic { username, password } => AuthState::Basic {
                    username: username.clone(),
                    password: password.clone(),
                },
                ExplicitAuth::Bearer { token } => AuthState::Bearer {
                    token: token.clone(),
                },
            };
            if !force_validate {
                return Ok(true);
            }
        }

        let res = self
            .http
            .get(&self.repo.index_url)
            .send()
            .await
            .stack_err_locationless("RegistryClient::login: raw ping")?;
        let status = res.status();
        if status.is_success() {
            self.current_auth = AuthState::None;
            return Ok(true);
        }
        if status != StatusCode::UNAUTHORIZED {
            return Err(MultibuildError::InvalidRegistryContent {
                host: self.repo.index_name.clone(),
                message: format!("unexpected status {status} from {}", self.repo.index_url),
            })
            .stack_err_locationless("RegistryClient::login");
        }

        let challenge = res
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|h| h.to_str().ok())
            .and_then(parse_challenge)
            .or_else(|| {
                if self.repo.index_name == "quay.io" {
                    Some(quay_fallback_challenge())
                } else {
                    None
                }
            });

        let Some(challenge) = challenge else {
            return Ok(false);
        };

        match challenge.scheme {
            ChallengeScheme::Basic => {
                let (username, password) = self.credentials_lookup();
                self.current_auth = AuthState::Basic { username, password };
                Ok(true)
            }
            ChallengeScheme::Bearer => {
                let Some(realm) = challenge.realm else {
                    return Ok(false);
                };
                let (username, password) = self.credentials_lookup();
                let mut req = self.http.get(&realm).query(&[(
                    "scope",
                    format!("repository:{}:pull", self.repo.remote_name),
                )]);
                if let Some(service) = &challenge.service {
                    req = req.query(&[("service", service.as_str())]);
                }
                if !username.is_empty() {
                    req = req.query(&[("account", username.as_str())]);
                    req = req.basic_auth(username, Some(password));
                }
                let res = req
                    .send()
                    .await
                    .stack_err_locationless("RegistryClient::login: token request")?;
                if !res.status().is_success() {
                    return Ok(false);
                }
                let body: TokenResponse = match res.json().await {
                    Ok(b) => b,
                    Err(e) => {
                        debug!(error = %e, "token response was not valid json");
                        return Ok(false);
                    }
                };
                let Some(token) = body.token.or(body.access_token) else {
                    return Ok(false);
                };
                self.current_auth = AuthState::Bearer { token };
                Ok(true)
            }
            ChallengeScheme::Unknown => Ok(false),
        }
    }

    /// `GET /v2/<remoteName>/manifests/<tag>` per §4.6. Must be called
    /// after [`RegistryClient::login`].
    #[tracing::instrument(skip(self), fields(index = %self.repo.index_url, repo = %self.repo.remote_name))]
    pub async fn get_manifest(
        &self,
        tag: &str,
        max_schema_version: u32,
        accept_manifest_lists: bool,
    ) -> Result<ManifestResult> {
        let url = format!(
            "{}{}/manifests/{}",
            self.repo.index_url, self.repo.remote_name, tag
        );
        let mut accept = vec![
            "application/vnd.docker.distribution.manifest.v2+json".to_string(),
            "application/vnd.oci.image.manifest.v1+json".to_string(),
        ];
        if accept_manifest_lists {
            accept.push("application/vnd.docker.distribution.manifest.list.v2+json".to_string());
            accept.push("application/vnd.oci.image.index.v1+json".to_string());
        }

        let mut req = self.http.get(&url).header(reqwest::header::ACCEPT, accept.join(", "));
        if let Some(auth) = self.auth_header_value() {
            req = req.header(reqwest::header::AUTHORIZATION, auth);
        }

        let res = req
            .send()
            .await
            .stack_err_locationless("RegistryClient::get_manifest")?;
        let mut status = res.status();
        if status == StatusCode::UNAUTHORIZED {
            // an unauthenticated response here means the repository does not exist in
            // the scope the caller could see.
            status = StatusCode::NOT_FOUND;
        }
        if !status.is_success() {
            return Ok(ManifestResult::Status(status.as_u16()));
        }

        let manifest: Manifest = res
            .json()
            .await
            .stack_err_locationless("RegistryClient::get_manifest: invalid manifest body")?;
        if manifest.schema_version > max_schema_version {
            return Err(MultibuildError::InvalidRegistryContent {
                host: self.repo.index_name.clone(),
                message: format!(
                    "manifest schemaVersion {} exceeds max {}",
                    manifest.schema_version, max_schema_version
                ),
            })
            .stack_err_locationless("RegistryClient::get_manifest");
        }

        Ok(ManifestResult::Manifest(manifest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_lookup_prefers_archive_secrets_over_explicit() {
        let mut secrets = RegistrySecrets::default();
        secrets.insert(
            "docker.io".to_string(),
            crate::metadata::RegistryCredential {
                username: "archive-user".to_string(),
                password: "archive-pass".to_string(),
            },
        );
        let client = RegistryClient::new("busybox")
            .unwrap()
            .with_credentials("caller-user", "caller-pass")
            .with_registry_secrets(secrets);
        let (u, _) = client.credentials_lookup();
        assert_eq!(u, "archive-user");
    }

    #[test]
    fn credentials_lookup_falls_back_to_explicit() {
        let client = RegistryClient::new("busybox")
            .unwrap()
            .with_credentials("caller-user", "caller-pass");
        let (u, p) = client.credentials_lookup();
        assert_eq!(u, "caller-user");
        assert_eq!(p, "caller-pass");
    }

    // needs live network access to docker.io.
    #[tokio::test]
    #[ignore]
    async fn s4_registry_ping_anon() {
        let mut client = RegistryClient::new("busybox").unwrap();
        assert!(client.login(false, false).await.unwrap());
        assert!(client.ping().await.unwrap());

        match client.get_manifest("latest", 2, true).await.unwrap() {
            ManifestResult::Manifest(manifest) => {
                assert_eq!(manifest.schema_version, 2);
                assert_eq!(
                    manifest.media_type.as_deref(),
                    Some("application/vnd.docker.distribution.manifest.list.v2+json")
                );
                assert!(!manifest.manifests.is_empty());
                for entry in &manifest.manifests {
                    assert!(!entry.digest.is_empty());
                    assert!(entry.platform.is_some());
                }
            }
            ManifestResult::Status(status) => panic!("expected a manifest, got status {status}"),
        }
    }

    // needs live network access to docker.io.
    #[tokio::test]
    #[ignore]
    async fn s5_registry_bad_creds() {
        let mut client = RegistryClient::new("busybox")
            .unwrap()
            .with_explicit_auth(ExplicitAuth::Basic {
                username: "userNoExisty".to_string(),
                password: "wrong".to_string(),
            });
        client.login(false, false).await.unwrap();
        assert!(!client.ping().await.unwrap());

        match client.get_manifest("latest", 2, true).await.unwrap() {
            ManifestResult::Status(status) => assert_eq!(status, 404),
            ManifestResult::Manifest(_) => panic!("expected a status code, not a manifest"),
        }
    }
}
