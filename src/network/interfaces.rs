use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;

use crate::cgroup;
use crate::container::{ContainerId, ContainerProcesses, ProcessId};

use super::error::Result;
use super::iplink::{self, IpLinkInfo};

/// The links visible in a container's network namespace and the container's processes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceDescription {
    pub link_info: Vec<IpLinkInfo>,
    pub pids: Vec<ProcessId>,
}

/// Lists container and host network links.
pub trait LinkSource: Send + Sync + 'static {
    /// The links of every container on the node.
    fn list(&self) -> impl Future<Output = Result<HashMap<ContainerId, InterfaceDescription>>> + Send;

    /// The links of the host network namespace.
    fn host_links(&self) -> impl Future<Output = Result<Vec<IpLinkInfo>>> + Send;
}

/// Resolves the network links of every container by entering the network namespace of the
/// container's first process.
#[derive(Debug, Clone)]
pub struct ContainerNetworkEnumerator {
    proc_root: PathBuf,
}

impl ContainerNetworkEnumerator {
    pub fn new(proc_root: PathBuf) -> Self {
        Self { proc_root }
    }

    /// Scans `/proc` for container processes, see [`cgroup::collect_containers`].
    pub async fn find_processes_with_container_ids(&self) -> Result<ContainerProcesses> {
        let proc_root = self.proc_root.clone();
        let containers =
            tokio::task::spawn_blocking(move || cgroup::collect_containers(&proc_root))
                .await
                .expect("container scan panicked")?;
        Ok(containers)
    }

    pub fn container_id_from_cgroup(&self, cgroup: &str) -> cgroup::Result<ContainerId> {
        cgroup::resolve_container_id(cgroup)
    }

    pub async fn request_interface_description(&self) -> Result<Vec<IpLinkInfo>> {
        iplink::request_interface_description().await
    }
}

impl LinkSource for ContainerNetworkEnumerator {
    /// Containers whose namespace cannot be entered, e.g. because the process just exited,
    /// are logged and left out.
    async fn list(&self) -> Result<HashMap<ContainerId, InterfaceDescription>> {
        let containers = self.find_processes_with_container_ids().await?;

        let mut interfaces = HashMap::with_capacity(containers.len());
        for (container_id, pids) in containers {
            let Some(&pid) = pids.first() else {
                continue;
            };
            match iplink::request_namespaced_interface_description(&self.proc_root, pid).await {
                Ok(link_info) => {
                    interfaces.insert(container_id, InterfaceDescription { link_info, pids });
                }
                Err(err) => {
                    log::error!(
                        target: "network enumerator",
                        "failed to list links of container {container_id} (pid {pid}): {err}"
                    );
                }
            }
        }

        Ok(interfaces)
    }

    async fn host_links(&self) -> Result<Vec<IpLinkInfo>> {
        self.request_interface_description().await
    }
}
