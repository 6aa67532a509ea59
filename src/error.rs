use thiserror::Error;

/// The named error taxonomy for this crate.
///
/// Every fatal, cross-cutting failure mode gets its own variant so that
/// callers can match on `kind` instead of parsing strings out of a
/// stacked error chain. Per-task faults (`ProjectResolutionError`,
/// `BuildProcessError`) still flow through here, but they are captured in
/// a [`crate::LocalImage`] rather than propagated as an `Err` out of
/// [`crate::Orchestrator::run`].
#[derive(Debug, Error)]
pub enum MultibuildError {
    /// Tar framing error on the input stream, or an I/O error writing to a
    /// per-task output pack.
    #[error("tar error: {0}")]
    TarError(String),

    /// Both `.balena/` and `.resin/` metadata directories were present in
    /// the same archive.
    #[error("multiple metadata directories present: found both {first:?} and {second:?}")]
    MultipleMetadataDirectoryError { first: String, second: String },

    /// The metadata file failed schema validation.
    #[error("balena.yml validation error at {path}: {message}")]
    BalenaYmlValidationError { path: String, message: String },

    /// The `registry-secrets.*` file failed schema validation.
    #[error("registry secrets validation error: {0}")]
    RegistrySecretValidationError(String),

    /// No resolver strategy matched by end of stream.
    #[error("could not determine the project type for service {service_name:?}: no resolver strategy matched")]
    ProjectResolutionError { service_name: String },

    /// Daemon communication failure, null build stream, or other
    /// infrastructure fault while driving a build or pull.
    #[error("build process error for service {service_name:?}: {message}")]
    BuildProcessError { service_name: String, message: String },

    /// A task declared a `dockerfilePath` without a `context`.
    #[error("service {service_name:?} declares a dockerfilePath without a context")]
    InvalidTaskDescriptor { service_name: String },

    /// A repository reference failed to parse under the Docker Hub naming
    /// rules (§4.6).
    #[error("invalid repository reference {reference:?}: {message}")]
    InvalidRepoReference { reference: String, message: String },

    /// A registry returned content this client does not understand (e.g.
    /// an unsupported `schemaVersion`).
    #[error("invalid registry response from {host:?}: {message}")]
    InvalidRegistryContent { host: String, message: String },
}
