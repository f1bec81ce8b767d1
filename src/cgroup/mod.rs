//! Process to container attribution using `/proc/<pid>/cgroup` introspection.
//!
//! The cgroup file of a process encodes the path of the container runtime's hierarchy,
//! one `<hierarchy-id>:<controllers>:<path>` line per hierarchy. The path shapes differ
//! between runtimes and cgroup versions, and may be nested when containers run inside
//! containers (e.g. kind clusters). [`resolve_container_id`] maps such a file to the id of
//! the innermost container and is shared by every component that needs the attribution.
//!
//! [`collect_containers`] scans all processes of a proc root and groups them by container.
mod error;
mod resolver;

use std::path::Path;

use crate::container::{ContainerProcesses, ProcessId};
use crate::fsutil;

pub use error::{Error, Result};
pub use resolver::resolve_container_id;

/// Reads `<proc_root>/<pid>/cgroup`.
///
/// Returns `None` if the file is missing, unreadable or blank. Processes exit at any time,
/// so this is not an error.
pub fn read_cgroup_file(proc_root: &Path, pid: ProcessId) -> Option<String> {
    let path = fsutil::process_dir(proc_root, pid).join("cgroup");
    match fsutil::read_to_string(&path) {
        Ok(content) if !content.trim().is_empty() => Some(content),
        Ok(_) => {
            log::trace!("empty cgroup file `{}`", path.display());
            None
        }
        Err(err) => {
            log::trace!("{err}");
            None
        }
    }
}

/// Scans every process below `proc_root` and groups the pids by the container they belong to.
///
/// Pids without a readable cgroup file or without a recognizable container id are skipped.
/// The pid list of every container is sorted ascending, and a container only appears once
/// at least one of its processes was resolved.
///
/// # Errors
///
/// Returns [`Error::ProcRoot`] if the proc root itself cannot be listed.
pub fn collect_containers(proc_root: &Path) -> Result<ContainerProcesses> {
    let pids = fsutil::list_pids(proc_root).map_err(Error::ProcRoot)?;

    let mut containers = ContainerProcesses::new();
    for pid in pids {
        let Some(cgroup) = read_cgroup_file(proc_root, pid) else {
            continue;
        };
        match resolve_container_id(&cgroup) {
            Ok(container_id) => containers.entry(container_id).or_default().push(pid),
            Err(err) => log::trace!("skipping pid {pid}: {err}"),
        }
    }

    for pids in containers.values_mut() {
        pids.sort_unstable();
    }

    Ok(containers)
}
