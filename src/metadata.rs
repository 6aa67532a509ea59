//! Collects and validates the `.balena/`/`.resin/` metadata directory
//! found in the source archive: `balena.yml`, `registry-secrets.*`, and
//! arbitrary per-service secret files (§4.3, §4.4).
//!
//! [`MetadataStore`] is filled incrementally as [`crate::tar_demux`]
//! streams entries past it (`add_file`), then finalized once with
//! [`MetadataStore::parse`] once the whole archive has been seen, since
//! candidate precedence (`balena.yml` over `balena.yaml`, etc.) can only
//! be resolved after every entry has been observed.

use std::collections::HashMap;

use serde::Deserialize;
use stacked_errors::{Result, StackableErr};

use crate::error::MultibuildError;

/// `registry-secrets.json`'s shape once parsed: index/host name to
/// credentials.
pub type RegistrySecrets = HashMap<String, RegistryCredential>;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegistryCredential {
    pub username: String,
    pub password: String,
}

const BALENA_YML_CANDIDATES: &[&str] = &[
    "balena.yml",
    "balena.yaml",
    "balena.json",
    "resin.yml",
    "resin.yaml",
    "resin.json",
];

const REGISTRY_SECRETS_CANDIDATES: &[&str] = &[
    "registry-secrets.json",
    "registry-secrets.yml",
    "registry-secrets.yaml",
];

#[derive(Debug, Clone, Default, Deserialize)]
struct RawBalenaYml {
    #[serde(rename = "build-variables", default)]
    build_variables: RawVarsSection,
    #[serde(rename = "build-secrets", default)]
    build_secrets: RawSecretsSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawVarsSection {
    #[serde(default)]
    global: HashMap<String, String>,
    #[serde(default)]
    services: HashMap<String, HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawSecretsSection {
    #[serde(default)]
    global: Vec<SecretEntry>,
    #[serde(default)]
    services: HashMap<String, Vec<SecretEntry>>,
}

/// One `build-secrets` entry: a file in `secrets/<source>` is mounted
/// into the build under the name `dest`.
#[derive(Debug, Clone, Deserialize)]
pub struct SecretEntry {
    pub source: String,
    pub dest: String,
}

#[derive(Debug, Clone, Default)]
pub struct BalenaYml {
    build_variables: RawVarsSection,
    build_secrets: RawSecretsSection,
}

/// Accumulates every file found under a reserved metadata directory,
/// then resolves candidate precedence and validates schemas once.
#[derive(Debug, Default)]
pub struct MetadataStore {
    source_dir: Option<String>,
    balena_candidates: HashMap<&'static str, Vec<u8>>,
    registry_secrets_candidates: HashMap<&'static str, Vec<u8>>,
    secret_files: HashMap<String, Vec<u8>>,
    balena_yml: Option<BalenaYml>,
    registry_secrets: RegistrySecrets,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `archive_path` is the full path as it appeared in the tar archive
    /// (e.g. `.balena/balena.yml`, `.resin/secrets/myservice/cert.pem`).
    /// Returns an error immediately if this entry's reserved directory
    /// conflicts with one already seen.
    pub fn add_file(&mut self, archive_path: &str, contents: Vec<u8>) -> Result<()> {
        let (dir, rel) = split_reserved_dir(archive_path)
            .stack_err_locationless(format!("add_file: {archive_path:?} is not under a reserved metadata directory"))?;

        match &self.source_dir {
            Some(existing) if existing != dir => {
                return Err(MultibuildError::MultipleMetadataDirectoryError {
                    first: existing.clone(),
                    second: dir.to_string(),
                })
                .stack_err_locationless("MetadataStore::add_file");
            }
            Some(_) => {}
            None => self.source_dir = Some(dir.to_string()),
        }

        if let Some(slot) = BALENA_YML_CANDIDATES.iter().find(|c| **c == rel) {
            self.balena_candidates.insert(slot, contents);
            return Ok(());
        }
        if let Some(slot) = REGISTRY_SECRETS_CANDIDATES.iter().find(|c| **c == rel) {
            self.registry_secrets_candidates.insert(slot, contents);
            return Ok(());
        }

        self.secret_files.insert(rel.to_string(), contents);
        Ok(())
    }

    /// Resolves candidate precedence and validates both schemas. Must be
    /// called after the whole archive has been streamed through
    /// [`Self::add_file`].
    pub fn parse(&mut self) -> Result<()> {
        if let Some(bytes) = first_present(&self.balena_candidates, BALENA_YML_CANDIDATES) {
            let (path, bytes) = bytes;
            let raw: RawBalenaYml = parse_by_extension(path, bytes)
                .stack_err_locationless(format!("MetadataStore::parse: {path}"))?;
            validate_balena_yml(path, bytes)?;
            self.balena_yml = Some(BalenaYml {
                build_variables: raw.build_variables,
                build_secrets: raw.build_secrets,
            });
        }

        if let Some((path, bytes)) = first_present(&self.registry_secrets_candidates, REGISTRY_SECRETS_CANDIDATES) {
            validate_registry_secrets(bytes)?;
            let secrets: RegistrySecrets = parse_by_extension(path, bytes)
                .stack_err_locationless(format!("MetadataStore::parse: {path}"))?;
            self.registry_secrets = secrets;
        }

        Ok(())
    }

    pub fn registry_secrets(&self) -> &RegistrySecrets {
        &self.registry_secrets
    }

    /// Global `build-variables` merged with `services.<name>`, the
    /// latter taking precedence (§4.3).
    pub fn build_vars_for_service(&self, service_name: &str) -> HashMap<String, String> {
        let mut out = HashMap::new();
        if let Some(balena) = &self.balena_yml {
            out.extend(balena.build_variables.global.clone());
            if let Some(service_vars) = balena.build_variables.services.get(service_name) {
                out.extend(service_vars.clone());
            }
        }
        out
    }

    /// The bytes of `secrets/<source>` from the metadata directory, or
    /// nothing if absent (§4.3 `getSecretFile`).
    pub fn get_secret_file(&self, source: &str) -> Option<&[u8]> {
        self.secret_files.get(&format!("secrets/{source}")).map(Vec::as_slice)
    }

    /// Global `build-secrets` entries merged with `services.<name>`
    /// ones (service entries win on a `dest` collision), materialized
    /// onto disk so a caller can bind-mount them at `/run/secrets`
    /// (§10 supplemented feature; the daemon API only accepts build
    /// secrets as files, not inline bytes).
    pub fn build_secrets_for_service(&self, service_name: &str) -> Result<Vec<(String, tempfile::NamedTempFile)>> {
        use std::io::Write;

        let Some(balena) = &self.balena_yml else {
            return Ok(Vec::new());
        };
        let mut by_dest: HashMap<String, String> = HashMap::new();
        for entry in &balena.build_secrets.global {
            by_dest.insert(entry.dest.clone(), entry.source.clone());
        }
        if let Some(service_entries) = balena.build_secrets.services.get(service_name) {
            for entry in service_entries {
                by_dest.insert(entry.dest.clone(), entry.source.clone());
            }
        }

        let mut dests: Vec<&String> = by_dest.keys().collect();
        dests.sort();
        let mut out = Vec::with_capacity(dests.len());
        for dest in dests {
            let source = &by_dest[dest];
            let bytes = self.get_secret_file(source).stack_err_locationless(format!(
                "MetadataStore::build_secrets_for_service: secret source {source:?} not found"
            ))?;
            let mut file = tempfile::NamedTempFile::new()
                .stack_err_locationless("MetadataStore::build_secrets_for_service: creating temp file")?;
            file.write_all(bytes)
                .stack_err_locationless("MetadataStore::build_secrets_for_service: writing temp file")?;
            out.push((dest.clone(), file));
        }
        Ok(out)
    }
}

fn split_reserved_dir(path: &str) -> Option<(&'static str, &str)> {
    if let Some(rest) = path.strip_prefix(".balena/") {
        Some((".balena", rest))
    } else if let Some(rest) = path.strip_prefix(".resin/") {
        Some((".resin", rest))
    } else {
        None
    }
}

fn first_present<'a>(
    candidates: &'a HashMap<&'static str, Vec<u8>>,
    order: &[&'static str],
) -> Option<(&'static str, &'a [u8])> {
    order
        .iter()
        .find_map(|name| candidates.get(name).map(|bytes| (*name, bytes.as_slice())))
}

fn parse_by_extension<T: for<'de> Deserialize<'de>>(path: &str, bytes: &[u8]) -> Result<T> {
    if path.ends_with(".json") {
        serde_json::from_slice(bytes).stack_err_locationless(format!("invalid JSON in {path}"))
    } else {
        serde_yaml::from_slice(bytes).stack_err_locationless(format!("invalid YAML in {path}"))
    }
}

/// Hand-rolled validation (rather than the `jsonschema` crate) so the
/// error text matches the AJV-style messages the rest of the ecosystem
/// around this format already produces: unknown top-level keys are
/// rejected.
fn validate_balena_yml(path: &str, bytes: &[u8]) -> Result<()> {
    let value: serde_json::Value = if path.ends_with(".json") {
        serde_json::from_slice(bytes).stack_err_locationless(format!("invalid JSON in {path}"))?
    } else {
        serde_yaml::from_slice(bytes).stack_err_locationless(format!("invalid YAML in {path}"))?
    };
    let Some(obj) = value.as_object() else {
        return Err(MultibuildError::BalenaYmlValidationError {
            path: path.to_string(),
            message: "data should be object".to_string(),
        })
        .stack_err_locationless("validate_balena_yml");
    };
    const KNOWN_KEYS: &[&str] = &["build-variables", "build-secrets"];
    for key in obj.keys() {
        if !KNOWN_KEYS.contains(&key.as_str()) {
            return Err(MultibuildError::BalenaYmlValidationError {
                path: path.to_string(),
                message: "data should NOT have additional properties".to_string(),
            })
            .stack_err_locationless("validate_balena_yml");
        }
    }
    Ok(())
}

/// Validates `registry-secrets.*` against the shape
/// `{ "<host>": { "username": "...", "password": "..." } }`, producing
/// AJV-style error text (spec scenario S6).
fn validate_registry_secrets(bytes: &[u8]) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).or_else(|_| serde_yaml::from_slice(bytes)).stack_err_locationless(
            "validate_registry_secrets: invalid JSON/YAML",
        )?;
    let Some(obj) = value.as_object() else {
        return Err(MultibuildError::RegistrySecretValidationError(
            "data should be object".to_string(),
        ))
        .stack_err_locationless("validate_registry_secrets");
    };

    let mut errors = Vec::new();
    for (host, entry) in obj {
        if !is_valid_host_key(host) {
            errors.push("data should NOT have additional properties".to_string());
            continue;
        }
        let Some(entry_obj) = entry.as_object() else {
            errors.push(format!("data['{host}'] should be object"));
            continue;
        };
        const KNOWN_KEYS: &[&str] = &["username", "password"];
        for key in entry_obj.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                errors.push(format!("data['{host}'] should NOT have additional properties"));
            }
        }
        for required in KNOWN_KEYS {
            if !entry_obj.contains_key(*required) {
                errors.push(format!("data['{host}'] should have required property '{required}'"));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(MultibuildError::RegistrySecretValidationError(errors.join("; ")))
            .stack_err_locationless("validate_registry_secrets")
    }
}

/// §4.3/S6 specifies the host-key pattern as `^\S+$`: any non-empty,
/// whitespace-free string, not just hostname-shaped ones.
fn is_valid_host_key(host: &str) -> bool {
    !host.is_empty() && !host.chars().any(char::is_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutually_exclusive_metadata_dirs() {
        let mut store = MetadataStore::new();
        store.add_file(".balena/balena.yml", b"services: {}\n".to_vec()).unwrap();
        let err = store.add_file(".resin/registry-secrets.json", b"{}".to_vec());
        assert!(err.is_err());
    }

    #[test]
    fn candidate_precedence_prefers_yml_over_yaml() {
        let mut store = MetadataStore::new();
        store
            .add_file(
                ".balena/balena.yaml",
                b"build-variables:\n  global:\n    A: \"1\"\n".to_vec(),
            )
            .unwrap();
        store
            .add_file(
                ".balena/balena.yml",
                b"build-variables:\n  global:\n    A: \"2\"\n".to_vec(),
            )
            .unwrap();
        store.parse().unwrap();
        assert_eq!(store.build_vars_for_service("anything").get("A").unwrap(), "2");
    }

    #[test]
    fn unknown_top_level_key_rejected() {
        let mut store = MetadataStore::new();
        store.add_file(".balena/balena.yml", b"bogus-key: 1\n".to_vec()).unwrap();
        assert!(store.parse().is_err());
    }

    #[test]
    fn registry_secrets_valid_entry_parses() {
        let mut store = MetadataStore::new();
        store
            .add_file(
                ".balena/registry-secrets.json",
                br#"{"docker.example.com":{"username":"ann","password":"hunter2"}}"#.to_vec(),
            )
            .unwrap();
        store.parse().unwrap();
        let creds = store.registry_secrets().get("docker.example.com").unwrap();
        assert_eq!(creds.username, "ann");
    }

    #[test]
    fn registry_secrets_rejects_malformed_host_key() {
        let mut store = MetadataStore::new();
        store
            .add_file(
                ".balena/registry-secrets.json",
                br#"{"host dot com":{"username":"ann","password":"hunter2"}}"#.to_vec(),
            )
            .unwrap();
        let err = store.parse().unwrap_err();
        assert!(format!("{err:?}").contains("should NOT have additional properties"));
    }

    #[test]
    fn registry_secrets_accepts_non_hostname_shaped_keys() {
        let mut store = MetadataStore::new();
        store
            .add_file(
                ".balena/registry-secrets.json",
                br#"{"user@registry.example.com":{"username":"ann","password":"hunter2"}}"#.to_vec(),
            )
            .unwrap();
        store.parse().unwrap();
        assert!(store.registry_secrets().contains_key("user@registry.example.com"));
    }

    #[test]
    fn registry_secrets_rejects_bad_sub_keys() {
        let mut store = MetadataStore::new();
        store
            .add_file(
                ".balena/registry-secrets.json",
                br#"{"h":{"usrname":"a","password":"b"}}"#.to_vec(),
            )
            .unwrap();
        let err = store.parse().unwrap_err();
        let msg = format!("{err:?}");
        assert!(msg.contains("'h'"));
    }

    #[test]
    fn build_secrets_for_service_materializes_files() {
        let mut store = MetadataStore::new();
        store
            .add_file(
                ".balena/balena.yml",
                b"build-secrets:\n  services:\n    myservice:\n      - source: cert.pem\n        dest: tls.pem\n"
                    .to_vec(),
            )
            .unwrap();
        store.add_file(".balena/secrets/cert.pem", b"hello".to_vec()).unwrap();
        store.parse().unwrap();
        let secrets = store.build_secrets_for_service("myservice").unwrap();
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[0].0, "tls.pem");
        assert!(store.build_secrets_for_service("other-service").unwrap().is_empty());
    }
}
