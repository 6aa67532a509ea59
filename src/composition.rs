//! The boundary to "the composition parser": given a composition
//! document, return an ordered list of image descriptors.
//!
//! The distilled spec treats this purely as an external collaborator
//! interface. This module defines that interface as [`CompositionSource`]
//! and ships a small reference implementation, [`Composition`], that
//! reads a docker-compose-flavored YAML document well enough to exercise
//! the rest of the pipeline end to end.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::Deserialize;
use stacked_errors::{Result, StackableErr};

/// One service's image, either an external reference to pull or a build
/// from a context inside the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageDescriptor {
    External {
        service_name: String,
        image_ref: String,
    },
    Build {
        service_name: String,
        context: String,
        dockerfile_path: Option<String>,
        args: HashMap<String, String>,
        labels: HashMap<String, String>,
        tag: Option<String>,
    },
}

impl ImageDescriptor {
    pub fn service_name(&self) -> &str {
        match self {
            ImageDescriptor::External { service_name, .. } => service_name,
            ImageDescriptor::Build { service_name, .. } => service_name,
        }
    }
}

/// The seam the orchestrator depends on instead of a concrete parser.
pub trait CompositionSource {
    fn descriptors(&self) -> Result<Vec<ImageDescriptor>>;
}

/// A minimal docker-compose-shaped document:
///
/// ```yaml
/// services:
///   s1:
///     build:
///       context: ./
///       dockerfile: Dockerfile.template
///       args:
///         FOO: bar
///       labels:
///         io.example: "1"
///     image: my-registry/s1:latest
///   s2:
///     image: alpine
/// ```
///
/// `image` alone (no `build`) makes the service external. `build` present
/// makes it a build task; `image` is then only used as the build's `tag`.
#[derive(Debug, Clone)]
pub struct Composition {
    services: Vec<(String, ServiceSpec)>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawComposition {
    #[serde(default)]
    services: IndexMap<String, RawService>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawService {
    image: Option<String>,
    build: Option<RawBuild>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawBuild {
    #[serde(default = "default_context")]
    context: String,
    dockerfile: Option<String>,
    #[serde(default)]
    args: HashMap<String, String>,
    #[serde(default)]
    labels: HashMap<String, String>,
}

fn default_context() -> String {
    ".".to_string()
}

#[derive(Debug, Clone)]
struct ServiceSpec {
    image: Option<String>,
    build: Option<RawBuild>,
}

impl Composition {
    /// Parses a YAML composition document, preserving service declaration
    /// order (required by §8 testable property 3).
    pub fn from_yaml(text: &str) -> Result<Self> {
        let raw: RawComposition = serde_yaml::from_str(text)
            .stack_err_locationless("Composition::from_yaml: invalid YAML")?;
        let services = raw
            .services
            .into_iter()
            .map(|(name, svc)| {
                (
                    name,
                    ServiceSpec {
                        image: svc.image,
                        build: svc.build,
                    },
                )
            })
            .collect();
        Ok(Self { services })
    }
}

impl CompositionSource for Composition {
    fn descriptors(&self) -> Result<Vec<ImageDescriptor>> {
        let mut out = Vec::with_capacity(self.services.len());
        for (service_name, spec) in &self.services {
            let descriptor = match &spec.build {
                Some(build) => ImageDescriptor::Build {
                    service_name: service_name.clone(),
                    context: build.context.clone(),
                    dockerfile_path: build.dockerfile.clone(),
                    args: build.args.clone(),
                    labels: build.labels.clone(),
                    tag: spec.image.clone(),
                },
                None => {
                    let image_ref = spec
                        .image
                        .clone()
                        .stack_err_locationless(format!(
                            "service {service_name:?} has neither `build` nor `image`"
                        ))?;
                    ImageDescriptor::External {
                        service_name: service_name.clone(),
                        image_ref,
                    }
                }
            };
            out.push(descriptor);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_build_and_external_services_preserving_order() {
        let yaml = "\
services:
  s1:
    build:
      context: ./
  s2:
    build:
      context: ./s2
  s3:
    image: alpine
";
        let comp = Composition::from_yaml(yaml).unwrap();
        let descriptors = comp.descriptors().unwrap();
        let names: Vec<&str> = descriptors.iter().map(|d| d.service_name()).collect();
        assert_eq!(names, vec!["s1", "s2", "s3"]);
        assert!(matches!(descriptors[2], ImageDescriptor::External { .. }));
    }

    #[test]
    fn service_without_image_or_build_errors() {
        let yaml = "services:\n  s1: {}\n";
        let comp = Composition::from_yaml(yaml).unwrap();
        assert!(comp.descriptors().is_err());
    }
}
