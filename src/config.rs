//! Run-level configuration: target architecture/device type, registry
//! credential overrides, and daemon connection parameters (§10 ambient
//! stack).

use std::collections::HashMap;

use bollard::Docker;
use serde::Deserialize;
use stacked_errors::{Result, StackableErr};

use crate::registry::client::ExplicitAuth;

/// How long to wait while establishing a daemon connection over a
/// socket or HTTP address, in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 120;

/// One caller-supplied override for a specific registry host, taking
/// the place of the archive's `registry-secrets.*` entry for that host
/// when no archive entry exists (§4.6 credentials lookup order).
#[derive(Debug, Clone, Deserialize)]
pub struct HostCredentials {
    pub host: String,
    pub username: String,
    pub password: String,
}

/// How to reach the container daemon. Mirrors the connection knobs
/// `bollard::Docker::connect_with_*` exposes.
#[derive(Debug, Clone, Deserialize)]
pub enum DaemonConnection {
    Local,
    Socket { path: String },
    Http { address: String },
}

impl Default for DaemonConnection {
    fn default() -> Self {
        DaemonConnection::Local
    }
}

impl DaemonConnection {
    /// Builds the `bollard::Docker` handle this connection variant
    /// describes.
    pub fn connect(&self) -> Result<Docker> {
        match self {
            DaemonConnection::Local => {
                Docker::connect_with_local_defaults().stack_err_locationless("DaemonConnection::connect: local defaults")
            }
            DaemonConnection::Socket { path } => {
                Docker::connect_with_socket(path, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                    .stack_err_locationless(format!("DaemonConnection::connect: socket {path}"))
            }
            DaemonConnection::Http { address } => {
                Docker::connect_with_http(address, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                    .stack_err_locationless(format!("DaemonConnection::connect: http {address}"))
            }
        }
    }
}

/// Everything the orchestrator needs beyond the composition and archive
/// themselves.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunConfig {
    /// Target CPU architecture, e.g. `"armv7hf"`, `"amd64"`.
    pub arch: Option<String>,
    /// Target device type, e.g. `"raspberrypi3"`.
    pub device_type: Option<String>,
    /// Additional `%%TOKEN%%` substitutions for `Dockerfile.template`,
    /// beyond the built-in arch/device-type tokens.
    #[serde(default)]
    pub extra_template_vars: HashMap<String, String>,
    /// Build args applied to every build task, merged with (and
    /// overridden by) each task's own `args` (§4.8 step 2d).
    #[serde(default)]
    pub extra_build_args: HashMap<String, String>,
    /// Explicit credentials handed to every `RegistryClient` unless the
    /// archive's `registry-secrets.*` supplies an entry for that host.
    #[serde(default)]
    pub host_credentials: Vec<HostCredentials>,
    #[serde(default)]
    pub daemon: DaemonConnection,
}

impl RunConfig {
    /// Connects to the daemon described by `self.daemon`.
    pub fn connect(&self) -> Result<Docker> {
        self.daemon.connect()
    }

    pub fn credentials_for_host(&self, host: &str) -> Option<(&str, &str)> {
        self.host_credentials
            .iter()
            .find(|c| c.host == host)
            .map(|c| (c.username.as_str(), c.password.as_str()))
    }

    pub fn explicit_auth_for_host(&self, host: &str) -> Option<ExplicitAuth> {
        self.credentials_for_host(host).map(|(username, password)| ExplicitAuth::Basic {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_lookup_by_host() {
        let config = RunConfig {
            host_credentials: vec![HostCredentials {
                host: "docker.io".to_string(),
                username: "u".to_string(),
                password: "p".to_string(),
            }],
            ..Default::default()
        };
        assert_eq!(config.credentials_for_host("docker.io"), Some(("u", "p")));
        assert_eq!(config.credentials_for_host("quay.io"), None);
    }

    #[test]
    fn daemon_connection_dispatches_by_variant() {
        assert!(DaemonConnection::Local.connect().is_ok());
        assert!(DaemonConnection::Socket {
            path: "unix:///var/run/docker.sock".to_string()
        }
        .connect()
        .is_ok());
        assert!(DaemonConnection::Http {
            address: "tcp://127.0.0.1:2375".to_string()
        }
        .connect()
        .is_ok());
    }
}
