//! A minimal OCI/Docker Registry V2 client, used by [`crate::task_set`]
//! for reference normalization and by [`crate::platform_policy`] for
//! manifest-list lookups.

pub mod challenge;
pub mod client;
pub mod repo;

pub use challenge::{AuthState, ChallengeScheme, ParsedChallenge};
pub use client::{ExplicitAuth, Manifest, ManifestListEntry, ManifestResult, PlatformInfo, RegistryClient};
pub use repo::{parse_repo, ParsedRepo};
