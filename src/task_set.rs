//! Turns the composition's ordered [`ImageDescriptor`]s into the
//! immutable [`BuildTask`]s the rest of the pipeline works from (§4.5).
//!
//! `TaskSet` is deliberately the first of three staged types
//! (`BuildTask` → [`crate::resolver::ResolvedTask`] →
//! [`crate::build_driver::LocalImage`]) rather than one `BuildTask` that
//! mutates in place as it moves through the pipeline: each stage only
//! ever adds fields, so a task's shape at a given point tells you
//! exactly which stages it has already passed through.

use std::collections::HashMap;

use stacked_errors::{Result, StackableErr};

use crate::{composition::ImageDescriptor, error::MultibuildError, registry::repo::parse_repo};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    External {
        image_ref: String,
    },
    Build {
        context: String,
        dockerfile_path: Option<String>,
        args: HashMap<String, String>,
        labels: HashMap<String, String>,
        tag: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTask {
    pub service_name: String,
    pub kind: TaskKind,
}

/// Builds the ordered list of [`BuildTask`]s from the composition's
/// descriptors, preserving declaration order (testable property 3).
pub struct TaskSet;

impl TaskSet {
    pub fn from_descriptors(descriptors: Vec<ImageDescriptor>) -> Result<Vec<BuildTask>> {
        descriptors
            .into_iter()
            .map(|descriptor| {
                let service_name = descriptor.service_name().to_string();
                let kind = match descriptor {
                    ImageDescriptor::External { image_ref, .. } => {
                        let image_ref = ensure_tag(&image_ref)
                            .stack_err_locationless(format!("TaskSet: service {service_name:?}"))?;
                        TaskKind::External { image_ref }
                    }
                    ImageDescriptor::Build {
                        context,
                        dockerfile_path,
                        args,
                        labels,
                        tag,
                        ..
                    } => {
                        if dockerfile_path.is_some() && context.trim().is_empty() {
                            return Err(MultibuildError::InvalidTaskDescriptor {
                                service_name: service_name.clone(),
                            })
                            .stack_err_locationless("TaskSet::from_descriptors");
                        }
                        TaskKind::Build {
                            context,
                            dockerfile_path,
                            args,
                            labels,
                            tag,
                        }
                    }
                };
                Ok(BuildTask { service_name, kind })
            })
            .collect()
    }
}

/// Appends `:latest` to an external reference with no explicit tag,
/// validating it against the Docker Hub naming rules in the process.
fn ensure_tag(image_ref: &str) -> Result<String> {
    let parsed = parse_repo(image_ref).stack_err_locationless("ensure_tag")?;
    let last_segment = parsed.local_name.rsplit('/').next().unwrap_or(&parsed.local_name);
    if last_segment.contains(':') {
        Ok(image_ref.to_string())
    } else {
        Ok(format!("{image_ref}:latest"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_without_tag_gets_latest() {
        let tasks = TaskSet::from_descriptors(vec![ImageDescriptor::External {
            service_name: "s1".to_string(),
            image_ref: "alpine".to_string(),
        }])
        .unwrap();
        assert_eq!(
            tasks[0].kind,
            TaskKind::External {
                image_ref: "alpine:latest".to_string()
            }
        );
    }

    #[test]
    fn external_with_tag_is_untouched() {
        let tasks = TaskSet::from_descriptors(vec![ImageDescriptor::External {
            service_name: "s1".to_string(),
            image_ref: "alpine:3.19".to_string(),
        }])
        .unwrap();
        assert_eq!(
            tasks[0].kind,
            TaskKind::External {
                image_ref: "alpine:3.19".to_string()
            }
        );
    }

    #[test]
    fn external_with_registry_port_is_untouched() {
        let tasks = TaskSet::from_descriptors(vec![ImageDescriptor::External {
            service_name: "s1".to_string(),
            image_ref: "registry.example.com:5000/myrepo".to_string(),
        }])
        .unwrap();
        assert_eq!(
            tasks[0].kind,
            TaskKind::External {
                image_ref: "registry.example.com:5000/myrepo:latest".to_string()
            }
        );
    }

    #[test]
    fn build_with_dockerfile_path_but_no_context_errors() {
        let err = TaskSet::from_descriptors(vec![ImageDescriptor::Build {
            service_name: "s1".to_string(),
            context: String::new(),
            dockerfile_path: Some("Dockerfile".to_string()),
            args: HashMap::new(),
            labels: HashMap::new(),
            tag: None,
        }]);
        assert!(err.is_err());
    }

    #[test]
    fn preserves_declaration_order() {
        let tasks = TaskSet::from_descriptors(vec![
            ImageDescriptor::External {
                service_name: "b".to_string(),
                image_ref: "alpine".to_string(),
            },
            ImageDescriptor::External {
                service_name: "a".to_string(),
                image_ref: "busybox".to_string(),
            },
        ])
        .unwrap();
        let names: Vec<&str> = tasks.iter().map(|t| t.service_name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }
}
