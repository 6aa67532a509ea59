//! Repository reference parsing, shared between [`crate::task_set`] (for
//! `:latest` tag normalization) and [`super::client::RegistryClient`].

use stacked_errors::{Result, StackableErr};

use crate::error::MultibuildError;

pub const DEFAULT_INDEX_NAME: &str = "docker.io";
pub const DEFAULT_INDEX_URL: &str = "https://index.docker.io/v2/";
pub const OFFICIAL_NAMESPACE: &str = "library";

/// A fully-resolved repository reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRepo {
    /// The index hostname used for API calls, e.g. `docker.io`.
    pub index_name: String,
    /// The base V2 API URL for the index, e.g.
    /// `https://index.docker.io/v2/`.
    pub index_url: String,
    /// The repository name as the registry knows it, with `library/`
    /// injected for official single-segment names.
    pub remote_name: String,
    /// The repository name as originally written by the caller.
    pub local_name: String,
    /// `index_name/remote_name`, suitable for round-tripping through
    /// [`parse_repo`] again (testable property 4).
    pub canonical_name: String,
    /// True if this is being served by the default Docker Hub index.
    pub official: bool,
}

fn is_namespace_component(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

fn valid_namespace(ns: &str) -> bool {
    if ns.len() < 2 || ns.len() > 255 {
        return false;
    }
    if !ns
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'_' || b == b'-')
    {
        return false;
    }
    if ns.starts_with('-') || ns.ends_with('-') || ns.contains("--") {
        return false;
    }
    true
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'_' | b'/' | b'.' | b'-'))
}

/// Parses a repository reference according to the Docker Hub naming
/// rules described in §4.6: scheme stripping, default-index inference,
/// `library/` injection, and index-name normalization.
pub fn parse_repo(reference: &str) -> Result<ParsedRepo> {
    let mut rest = reference;
    let mut explicit_http = false;
    if let Some(stripped) = rest.strip_prefix("https://") {
        rest = stripped;
    } else if let Some(stripped) = rest.strip_prefix("http://") {
        rest = stripped;
        explicit_http = true;
    }

    let mut parts = rest.splitn(2, '/');
    let first = parts.next().unwrap_or_default();
    let remainder = parts.next();

    let (index_name_raw, local_name) = if remainder.is_some() && is_namespace_component(first) {
        (first.to_string(), remainder.unwrap().to_string())
    } else {
        (DEFAULT_INDEX_NAME.to_string(), rest.to_string())
    };

    if local_name.is_empty() {
        return Err(MultibuildError::InvalidRepoReference {
            reference: reference.to_string(),
            message: "empty repository name".to_string(),
        })
        .stack_err_locationless("parse_repo");
    }

    let index_name = if index_name_raw == "index.docker.io" {
        DEFAULT_INDEX_NAME.to_string()
    } else {
        index_name_raw
    };
    let official = index_name == DEFAULT_INDEX_NAME;

    if explicit_http && official {
        return Err(MultibuildError::InvalidRepoReference {
            reference: reference.to_string(),
            message: "http:// is rejected against the official index".to_string(),
        })
        .stack_err_locationless("parse_repo");
    }

    if !official {
        // namespace/name are on a non-default index; index_name plays the role of
        // the namespace-shaped host component and is not re-validated against the
        // docker hub namespace charset (it's a hostname, validated implicitly by
        // having matched `is_namespace_component`).
        if !valid_name(&local_name.replace('/', "")) {
            return Err(MultibuildError::InvalidRepoReference {
                reference: reference.to_string(),
                message: format!("invalid repository name {local_name:?}"),
            })
            .stack_err_locationless("parse_repo");
        }
    } else if let Some((namespace, name)) = local_name.split_once('/') {
        if !valid_namespace(namespace) {
            return Err(MultibuildError::InvalidRepoReference {
                reference: reference.to_string(),
                message: format!("invalid namespace {namespace:?}"),
            })
            .stack_err_locationless("parse_repo");
        }
        if !valid_name(name) {
            return Err(MultibuildError::InvalidRepoReference {
                reference: reference.to_string(),
                message: format!("invalid repository name {name:?}"),
            })
            .stack_err_locationless("parse_repo");
        }
    } else if !valid_name(&local_name) {
        return Err(MultibuildError::InvalidRepoReference {
            reference: reference.to_string(),
            message: format!("invalid repository name {local_name:?}"),
        })
        .stack_err_locationless("parse_repo");
    }

    let remote_name = if official && !local_name.contains('/') {
        format!("{OFFICIAL_NAMESPACE}/{local_name}")
    } else {
        local_name.clone()
    };

    let index_url = if official {
        DEFAULT_INDEX_URL.to_string()
    } else {
        format!("https://{index_name}/v2/")
    };

    Ok(ParsedRepo {
        canonical_name: format!("{index_name}/{remote_name}"),
        index_name,
        index_url,
        remote_name,
        local_name,
        official,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn official_single_segment_gets_library_prefix() {
        let r = parse_repo("busybox").unwrap();
        assert_eq!(r.remote_name, "library/busybox");
        assert!(r.official);
        assert_eq!(r.index_name, "docker.io");
    }

    #[test]
    fn official_namespaced_name_is_untouched() {
        let r = parse_repo("myuser/myrepo").unwrap();
        assert_eq!(r.remote_name, "myuser/myrepo");
        assert!(r.official);
    }

    #[test]
    fn private_registry_with_port_is_preserved() {
        let r = parse_repo("registry.example.com:5000/myrepo").unwrap();
        assert_eq!(r.index_name, "registry.example.com:5000");
        assert_eq!(r.remote_name, "myrepo");
        assert!(!r.official);
    }

    #[test]
    fn localhost_is_treated_as_an_index() {
        let r = parse_repo("localhost/myrepo").unwrap();
        assert_eq!(r.index_name, "localhost");
        assert!(!r.official);
    }

    #[test]
    fn index_docker_io_normalizes() {
        let r = parse_repo("index.docker.io/busybox").unwrap();
        assert_eq!(r.index_name, "docker.io");
    }

    #[test]
    fn http_against_official_index_rejected() {
        assert!(parse_repo("http://busybox").is_err());
    }

    #[test]
    fn parsing_is_idempotent() {
        for reference in [
            "busybox",
            "myuser/myrepo",
            "registry.example.com:5000/myrepo",
            "localhost/myrepo",
        ] {
            let once = parse_repo(reference).unwrap();
            let twice = parse_repo(&once.canonical_name).unwrap();
            assert_eq!(once.canonical_name, twice.canonical_name);
        }
    }
}
