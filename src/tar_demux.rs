//! Streams one input tar archive and routes every entry into the
//! per-service packs it belongs to, intercepting the metadata directory
//! along the way (§4.2).

use std::collections::HashMap;

use futures::StreamExt;
use stacked_errors::{Result, StackableErr};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_tar::EntryType;
use tracing::debug;

use crate::{
    error::MultibuildError,
    metadata::MetadataStore,
    path_ops,
    task_set::{BuildTask, TaskKind},
};

/// A file named `qemu-execve` under the metadata directory is a
/// cross-arch emulation shim broadcast to every build context rather
/// than routed by containment (§4.2 step 2 exception). The exception
/// only lifts the metadata-directory restriction: a same-named file
/// that lives inside a service's own context is routed normally.
const QEMU_EXECVE: &str = "qemu-execve";

/// The fixed path [`TarDemux`] rewrites a task's alternate Dockerfile to
/// (§4.2 step 4, §9 DESIGN NOTES).
pub const ALTERNATE_DOCKERFILE_PATH: &str = ".resin/Dockerfile";

/// One build task's demultiplexed context: entries in archive order,
/// looked up by name.
#[derive(Debug, Clone, Default)]
pub struct DemuxedPack {
    entries: Vec<(String, Vec<u8>)>,
}

impl DemuxedPack {
    fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, name: String, bytes: Vec<u8>) {
        self.entries.push((name, bytes));
    }

    pub(crate) fn insert_or_replace(&mut self, name: String, bytes: Vec<u8>) {
        self.entries.retain(|(n, _)| n != &name);
        self.entries.push((name, bytes));
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, b)| b.as_slice())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Vec<u8>)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_under_metadata_dir(name: &str) -> bool {
    name.starts_with(".balena/") || name.starts_with(".resin/")
}

/// Consumes `archive` to completion, routing every entry per §4.2 and
/// feeding `metadata`. Returns one [`DemuxedPack`] per non-external task,
/// keyed by service name.
#[tracing::instrument(skip_all, fields(task_count = tasks.len()))]
pub async fn run<R>(archive: R, tasks: &[BuildTask], metadata: &mut MetadataStore) -> Result<HashMap<String, DemuxedPack>>
where
    R: AsyncRead + Unpin + Send,
{
    let mut packs: HashMap<String, DemuxedPack> = tasks
        .iter()
        .filter(|t| matches!(t.kind, TaskKind::Build { .. }))
        .map(|t| (t.service_name.clone(), DemuxedPack::new()))
        .collect();

    let mut archive = tokio_tar::Archive::new(archive);
    let mut entries = archive
        .entries()
        .map_err(|e| MultibuildError::TarError(e.to_string()))
        .stack_err_locationless("tar_demux::run: opening archive")?;

    while let Some(entry) = entries.next().await {
        let mut entry = entry
            .map_err(|e| MultibuildError::TarError(e.to_string()))
            .stack_err_locationless("tar_demux::run: reading entry header")?;

        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }

        let raw_path = entry
            .path()
            .map_err(|e| MultibuildError::TarError(e.to_string()))
            .stack_err_locationless("tar_demux::run: entry path")?
            .to_string_lossy()
            .into_owned();
        let name = path_ops::normalize(&raw_path);

        let mut buf = Vec::with_capacity(entry.header().size().unwrap_or(0) as usize);
        entry
            .read_to_end(&mut buf)
            .await
            .map_err(|e| MultibuildError::TarError(e.to_string()))
            .stack_err_locationless(format!("tar_demux::run: reading body of {name}"))?;

        let basename = name.rsplit('/').next().unwrap_or(&name);
        if is_under_metadata_dir(&name) && basename == QEMU_EXECVE {
            debug!(name = %name, "forwarding qemu-execve to every build context");
            for pack in packs.values_mut() {
                pack.push(QEMU_EXECVE.to_string(), buf.clone());
            }
            continue;
        }

        if is_under_metadata_dir(&name) {
            metadata
                .add_file(&name, buf)
                .stack_err_locationless(format!("tar_demux::run: metadata entry {name}"))?;
            continue;
        }

        for task in tasks {
            let TaskKind::Build {
                context,
                dockerfile_path,
                ..
            } = &task.kind
            else {
                continue;
            };
            let pack = packs.get_mut(&task.service_name).expect("pack created for every build task");

            if path_ops::contains(context, &name) {
                pack.push(path_ops::relative(context, &name), buf.clone());
            }

            if let Some(declared) = dockerfile_path {
                if path_ops::join(context, declared) == name {
                    pack.insert_or_replace(ALTERNATE_DOCKERFILE_PATH.to_string(), buf.clone());
                }
            }
        }
    }

    Ok(packs)
}
