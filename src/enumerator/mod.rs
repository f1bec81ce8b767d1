//! The container enumerator keeps a periodically refreshed view of all containers on the
//! node, their processes and the pods they belong to.
//!
//! A single background task owns the state. It is spawned by the first caller and answers
//! requests sent over a channel, so a request always observes a completely applied refresh.
mod error;

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::cgroup;
use crate::container::{ContainerId, ContainerProcesses};
use crate::pod::{self, PodInfo, PodInventory};

pub use error::{Error, Result};

const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Read access to the containers and pods of the node.
pub trait ContainerSource: Send + Sync + 'static {
    /// All containers with the ascending pids of their processes.
    fn processes_with_container_ids(&self) -> impl Future<Output = ContainerProcesses> + Send;

    /// All non host-network pods with ready, running containers.
    fn pods_with_container_ids(&self) -> impl Future<Output = Vec<PodInfo>> + Send;
}

impl<T: ContainerSource> ContainerSource for Arc<T> {
    fn processes_with_container_ids(&self) -> impl Future<Output = ContainerProcesses> + Send {
        (**self).processes_with_container_ids()
    }

    fn pods_with_container_ids(&self) -> impl Future<Output = Vec<PodInfo>> + Send {
        (**self).pods_with_container_ids()
    }
}

enum Request {
    Processes(oneshot::Sender<ContainerProcesses>),
    Pods(oneshot::Sender<Vec<PodInfo>>),
}

/// Actor owning the container and pod snapshots of the node.
pub struct ContainerEnumerator<I: PodInventory> {
    running: AtomicBool,
    worker: Mutex<Option<Worker<I>>>,
    requests: mpsc::Sender<Request>,
}

impl<I: PodInventory> ContainerEnumerator<I> {
    /// Creates the enumerator. The background task is started by the first request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingNodeName`] if `node_name` is empty.
    pub fn new(proc_root: PathBuf, node_name: &str, inventory: I) -> Result<Self> {
        if node_name.trim().is_empty() {
            return Err(Error::MissingNodeName);
        }

        let (tx, rx) = mpsc::channel(1);
        Ok(Self {
            running: AtomicBool::new(false),
            worker: Mutex::new(Some(Worker {
                proc_root,
                field_selector: pod::field_selector(node_name),
                inventory,
                requests: rx,
            })),
            requests: tx,
        })
    }

    /// Resolves a container id from the content of a cgroup file.
    pub fn container_id_from_cgroup(&self, cgroup: &str) -> cgroup::Result<ContainerId> {
        cgroup::resolve_container_id(cgroup)
    }

    fn start_worker(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker {
            tokio::spawn(worker.run());
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Option<T> {
        self.start_worker();
        let (tx, rx) = oneshot::channel();
        if self.requests.send(make(tx)).await.is_err() {
            log::error!(target: "container enumerator", "worker is not running");
            return None;
        }
        rx.await.ok()
    }
}

impl<I: PodInventory> ContainerSource for ContainerEnumerator<I> {
    async fn processes_with_container_ids(&self) -> ContainerProcesses {
        self.request(Request::Processes).await.unwrap_or_default()
    }

    async fn pods_with_container_ids(&self) -> Vec<PodInfo> {
        self.request(Request::Pods).await.unwrap_or_default()
    }
}

struct Worker<I> {
    proc_root: PathBuf,
    field_selector: String,
    inventory: I,
    requests: mpsc::Receiver<Request>,
}

impl<I: PodInventory> Worker<I> {
    async fn run(mut self) {
        let Some((mut containers, mut pods)) = self.refresh().await else {
            return;
        };
        let mut interval = tokio::time::interval_at(
            tokio::time::Instant::now() + REFRESH_INTERVAL,
            REFRESH_INTERVAL,
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let Some(refreshed) = self.refresh().await else {
                        return;
                    };
                    (containers, pods) = refreshed;
                }
                request = self.requests.recv() => {
                    let Some(request) = request else {
                        return;
                    };
                    match request {
                        Request::Processes(reply) => {
                            let _ = reply.send(containers.clone());
                        }
                        Request::Pods(reply) => {
                            let _ = reply.send(pods.clone());
                        }
                    }
                }
            }
        }
    }

    /// Rescans `/proc` and the pod inventory. Returns `None` if the proc root is unreadable,
    /// which stops the worker.
    async fn refresh(&self) -> Option<(ContainerProcesses, Vec<PodInfo>)> {
        let containers = match self.collect_containers().await {
            Ok(containers) => containers,
            Err(err) => {
                log::error!(target: "container enumerator", "aborting: {err}");
                return None;
            }
        };
        let pods =
            pod::generate_current_pod_list(&self.inventory, &self.field_selector, &containers)
                .await;
        log::trace!(
            target: "container enumerator",
            "refreshed {} containers, {} pods",
            containers.len(),
            pods.len()
        );
        Some((containers, pods))
    }

    async fn collect_containers(&self) -> cgroup::Result<ContainerProcesses> {
        let proc_root = self.proc_root.clone();
        tokio::task::spawn_blocking(move || cgroup::collect_containers(&proc_root))
            .await
            .expect("container scan panicked")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pod::inventory_tests::FakeInventory;
    use crate::pod::tests::k8s_pod;

    /// A fixed container and pod view.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct FakeContainers {
        pub processes: ContainerProcesses,
        pub pods: Vec<PodInfo>,
    }

    impl FakeContainers {
        pub(crate) fn with_pods(pods: Vec<PodInfo>) -> Self {
            let processes = pods
                .iter()
                .flat_map(|pod| pod.containers.clone())
                .collect();
            Self { processes, pods }
        }
    }

    impl ContainerSource for FakeContainers {
        async fn processes_with_container_ids(&self) -> ContainerProcesses {
            self.processes.clone()
        }

        async fn pods_with_container_ids(&self) -> Vec<PodInfo> {
            self.pods.clone()
        }
    }

    fn proc_tree() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        for (pid, cgroup) in [
            (10, "0::/kubepods/besteffort/pod1/aaa\n"),
            (11, "0::/kubepods/besteffort/pod1/aaa\n"),
            (20, "0::/system.slice/docker-bbb.scope\n"),
            (1, "0::/init.scope\n"),
        ] {
            let dir = root.path().join(pid.to_string());
            std::fs::create_dir(&dir).unwrap();
            std::fs::write(dir.join("cgroup"), cgroup).unwrap();
        }
        root
    }

    #[test]
    fn test_rejects_empty_node_name() {
        let result = ContainerEnumerator::new(PathBuf::from("/proc"), "", FakeInventory::default());
        assert!(matches!(result, Err(Error::MissingNodeName)));
    }

    #[tokio::test]
    async fn test_serves_processes_and_pods() {
        let root = proc_tree();
        let inventory = FakeInventory::new(vec![
            k8s_pod("default", "web", false, true, &[("containerd://aaa", true)]),
            k8s_pod("default", "host", true, true, &[("containerd://bbb", true)]),
        ]);
        let enumerator =
            ContainerEnumerator::new(root.path().to_path_buf(), "node-1", inventory).unwrap();

        let processes = enumerator.processes_with_container_ids().await;
        assert_eq!(processes.len(), 2);
        assert_eq!(processes.get("aaa"), Some(&vec![10, 11]));
        assert_eq!(processes.get("bbb"), Some(&vec![20]));

        let pods = enumerator.pods_with_container_ids().await;
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].namespace_and_name(), "default/web");
    }

    #[tokio::test]
    async fn test_unreadable_proc_root_yields_empty_results() {
        let enumerator = ContainerEnumerator::new(
            PathBuf::from("/definitely/not/a/proc"),
            "node-1",
            FakeInventory::default(),
        )
        .unwrap();
        assert!(enumerator.processes_with_container_ids().await.is_empty());
        assert!(enumerator.pods_with_container_ids().await.is_empty());
    }

    #[test]
    fn test_container_id_from_cgroup() {
        let enumerator =
            ContainerEnumerator::new(PathBuf::from("/proc"), "node-1", FakeInventory::default())
                .unwrap();
        assert_eq!(
            enumerator
                .container_id_from_cgroup("0::/system.slice/docker-abc.scope")
                .unwrap()
                .as_ref(),
            "abc"
        );
        assert!(matches!(
            enumerator.container_id_from_cgroup("0::/"),
            Err(cgroup::Error::NoMatchFound)
        ));
    }
}
