use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::container::{ContainerId, ContainerProcesses, ProcessId};
use crate::enumerator::ContainerSource;
use crate::fsutil;
use crate::pod::PodInfo;

use super::error::{Error, Result};
use super::netdev::{KernelNetworkInterfaceInfo, read_network_interface_info};
use super::{ContainerInfo, ContainerMetrics, InterfaceName, MetricSnapshot, TrafficCounter};

const REFRESH_INTERVAL: Duration = Duration::from_secs(5);
const UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// A registered container and the counters of its interfaces at registration.
#[derive(Debug, Clone)]
struct Entry {
    pod: PodInfo,
    container_id: ContainerId,
    /// The process whose `net/dev` is read.
    pid: ProcessId,
    pids: Vec<ProcessId>,
    start_infos: Vec<KernelNetworkInterfaceInfo>,
}

impl Entry {
    /// Counters since registration. Interfaces appearing later start at their first reading.
    fn sample(&mut self, proc_root: &Path) -> BTreeMap<InterfaceName, MetricSnapshot> {
        let current = match read_network_interface_info(proc_root, self.pid) {
            Ok(current) => current,
            Err(err) => {
                log::error!(
                    target: "stats reader",
                    "failed to read interfaces of container {} (pid {}): {err}",
                    self.container_id,
                    self.pid
                );
                return self
                    .start_infos
                    .iter()
                    .map(|start| (start.interface.clone(), delta(start, start)))
                    .collect();
            }
        };

        let mut metrics = BTreeMap::new();
        for info in current {
            let position = self
                .start_infos
                .iter()
                .position(|start| start.interface == info.interface);
            let snapshot = match position {
                Some(idx) => delta(&self.start_infos[idx], &info),
                None => {
                    let snapshot = delta(&info, &info);
                    self.start_infos.push(info.clone());
                    snapshot
                }
            };
            metrics.insert(info.interface, snapshot);
        }
        metrics
    }
}

fn delta(start: &KernelNetworkInterfaceInfo, current: &KernelNetworkInterfaceInfo) -> MetricSnapshot {
    MetricSnapshot {
        ingress: TrafficCounter {
            start_bytes: start.receive_bytes,
            packets: current.receive_packets.saturating_sub(start.receive_packets),
            bytes: current.receive_bytes.saturating_sub(start.receive_bytes),
        },
        egress: TrafficCounter {
            start_bytes: start.transmit_bytes,
            packets: current.transmit_packets.saturating_sub(start.transmit_packets),
            bytes: current.transmit_bytes.saturating_sub(start.transmit_bytes),
        },
    }
}

enum Request {
    Metrics(oneshot::Sender<ContainerMetrics>),
    Register(Box<Entry>, oneshot::Sender<Result<()>>),
    Remove(ContainerId, oneshot::Sender<Result<()>>),
}

/// Accounting backend reading `/proc/<pid>/net/dev` of one process per container.
///
/// Used on nodes without BTF, where snoopy cannot run. When the process of a container
/// exits, the next process of the same container is used without resetting the baselines,
/// so container restarts do not produce counter jumps.
pub struct NetworkStatsReader<S: ContainerSource> {
    proc_root: PathBuf,
    running: AtomicBool,
    worker: Mutex<Option<Worker<S>>>,
    requests: mpsc::Sender<Request>,
}

impl<S: ContainerSource> NetworkStatsReader<S> {
    pub fn new(proc_root: PathBuf, containers: S) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            running: AtomicBool::new(false),
            worker: Mutex::new(Some(Worker {
                proc_root: proc_root.clone(),
                source: containers,
                requests: rx,
                containers: ContainerProcesses::new(),
                entries: Vec::new(),
                metrics: ContainerMetrics::new(),
            })),
            proc_root,
            requests: tx,
        }
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
            log::error!(target: "stats reader", "worker is not running");
            return None;
        }
        rx.await.ok()
    }

    pub async fn register(&self, pod: &PodInfo) -> Vec<Error> {
        let mut containers: Vec<_> = pod.containers_with_first_pid().into_iter().collect();
        containers.sort();

        let mut errors = Vec::new();
        for (container_id, pid) in containers {
            if let Err(err) = self.register_container(pod, container_id, pid).await {
                errors.push(err);
            }
        }
        errors
    }

    /// Records the current interface counters of `pid` as baseline of the container.
    ///
    /// # Errors
    ///
    /// Fails if the counters cannot be read or the container is already registered.
    pub async fn register_container(
        &self,
        pod: &PodInfo,
        container_id: ContainerId,
        pid: ProcessId,
    ) -> Result<()> {
        let start_infos = read_network_interface_info(&self.proc_root, pid)?;
        let entry = Entry {
            pod: pod.clone(),
            pids: pod.containers.get(&container_id).cloned().unwrap_or_default(),
            container_id,
            pid,
            start_infos,
        };
        self.request(|reply| Request::Register(Box::new(entry), reply))
            .await
            .unwrap_or(Err(Error::WorkerStopped))
    }

    pub async fn remove(&self, pod: &PodInfo) -> Vec<Error> {
        let mut errors = Vec::new();
        for container_id in pod.containers.keys() {
            if let Err(err) = self.remove_container(container_id).await {
                errors.push(err);
            }
        }
        errors
    }

    /// # Errors
    ///
    /// Returns [`Error::NotRegistered`] if the container is unknown.
    pub async fn remove_container(&self, container_id: &ContainerId) -> Result<()> {
        let container_id = container_id.clone();
        self.request(|reply| Request::Remove(container_id, reply))
            .await
            .unwrap_or(Err(Error::WorkerStopped))
    }

    /// The counters of all registered containers as of the last update.
    pub async fn metrics(&self) -> ContainerMetrics {
        self.request(Request::Metrics).await.unwrap_or_default()
    }
}

struct Worker<S> {
    proc_root: PathBuf,
    source: S,
    requests: mpsc::Receiver<Request>,

    containers: ContainerProcesses,
    entries: Vec<Entry>,
    metrics: ContainerMetrics,
}

impl<S: ContainerSource> Worker<S> {
    async fn run(mut self) {
        self.containers = self.source.processes_with_container_ids().await;
        let mut refresh = tokio::time::interval_at(
            tokio::time::Instant::now() + REFRESH_INTERVAL,
            REFRESH_INTERVAL,
        );
        let mut update = tokio::time::interval(UPDATE_INTERVAL);

        loop {
            tokio::select! {
                _ = refresh.tick() => {
                    self.containers = self.source.processes_with_container_ids().await;
                }
                _ = update.tick() => self.update(),
                request = self.requests.recv() => {
                    let Some(request) = request else {
                        return;
                    };
                    self.handle(request);
                }
            }
        }
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Metrics(reply) => {
                let _ = reply.send(self.metrics.clone());
            }
            Request::Register(entry, reply) => {
                let result = if self
                    .entries
                    .iter()
                    .any(|known| known.container_id == entry.container_id)
                {
                    Err(Error::AlreadyRegistered(entry.container_id.clone()))
                } else {
                    self.entries.push(*entry);
                    Ok(())
                };
                let _ = reply.send(result);
            }
            Request::Remove(container_id, reply) => {
                let result = match self
                    .entries
                    .iter()
                    .position(|known| known.container_id == container_id)
                {
                    Some(idx) => {
                        self.entries.remove(idx);
                        Ok(())
                    }
                    None => Err(Error::NotRegistered(container_id)),
                };
                let _ = reply.send(result);
            }
        }
    }

    /// Replaces exited processes and recomputes the metrics of all entries.
    fn update(&mut self) {
        for entry in &mut self.entries {
            if fsutil::process_exists(&self.proc_root, entry.pid) {
                continue;
            }
            match self.containers.get(&entry.container_id) {
                Some(pids) if !pids.is_empty() => {
                    log::debug!(
                        target: "stats reader",
                        "process {} of container {} is gone, continuing with {}",
                        entry.pid,
                        entry.container_id,
                        pids[0]
                    );
                    entry.pid = pids[0];
                    entry.pids = pids.clone();
                }
                // Not recoverable yet, the container may be restarting.
                _ => {}
            }
        }

        self.metrics = self
            .entries
            .iter_mut()
            .map(|entry| {
                let info = ContainerInfo {
                    pod: entry.pod.clone(),
                    metrics: entry.sample(&self.proc_root),
                };
                (entry.container_id.clone(), info)
            })
            .collect();
    }
}
