use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::container::ContainerId;
use crate::enumerator::ContainerSource;
use crate::error::ResultOkLogExt;
use crate::fsutil;
use crate::pod::PodInfo;

use super::ebpf::{CountState, CounterSource};
use super::interfaces::LinkSource;
use super::{ContainerInfo, ContainerMetrics, InterfaceName, MetricSnapshot, TrafficCounter};

const ATTACH_INTERVAL: Duration = Duration::from_secs(30);
const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Keeps eBPF counters attached to the host side of every pod container's veth pair.
///
/// Every 30 seconds the container links are enumerated. Counters are attached to the host
/// peer of every link and detached from peers that vanished. Attach failures are retried
/// on the next cycle. Every second the latest sample of every counter is collected.
///
/// Traffic entering the host side of a veth pair left the container, so host ingress is
/// reported as container egress and vice versa.
pub struct CounterMonitor<L, C, S> {
    running: AtomicBool,
    worker: Mutex<Option<Worker<L, C, S>>>,
    requests: mpsc::Sender<oneshot::Sender<ContainerMetrics>>,
    cancel: CancellationToken,
}

impl<L, C, S> CounterMonitor<L, C, S>
where
    L: LinkSource,
    C: CounterSource,
    S: ContainerSource,
{
    /// `sys_class_net` is the host's `/sys/class/net`, used for the baselines. Cancelling
    /// `cancel` detaches all counters.
    pub fn new(
        links: L,
        counters: C,
        containers: S,
        sys_class_net: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            running: AtomicBool::new(false),
            worker: Mutex::new(Some(Worker {
                links,
                counters,
                containers,
                sys_class_net,
                cancel: cancel.clone(),
                requests: rx,
                pods: HashMap::new(),
                handles: HashMap::new(),
                metrics: ContainerMetrics::new(),
            })),
            requests: tx,
            cancel,
        }
    }

    /// Starts the background task. Subsequent calls do nothing.
    pub fn start(&self) {
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

    /// The latest counters of all watched container interfaces.
    pub async fn metrics(&self) -> ContainerMetrics {
        self.start();
        if self.cancel.is_cancelled() {
            return ContainerMetrics::new();
        }
        let (tx, rx) = oneshot::channel();
        if self.requests.send(tx).await.is_err() {
            return ContainerMetrics::new();
        }
        rx.await.unwrap_or_default()
    }
}

#[derive(Debug)]
struct CounterHandle {
    container_id: ContainerId,
    interface: InterfaceName,
    token: CancellationToken,
    samples: mpsc::Receiver<CountState>,
    /// Host side counters at attach time, `(rx_bytes, tx_bytes)`.
    baseline: (u64, u64),
    last: CountState,
    closed: bool,
}

impl CounterHandle {
    /// Takes the newest pending sample without waiting.
    fn poll(&mut self) {
        loop {
            match self.samples.try_recv() {
                Ok(sample) => self.last = sample,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
    }

    fn snapshot(&self) -> MetricSnapshot {
        let (host_rx_bytes, host_tx_bytes) = self.baseline;
        MetricSnapshot {
            ingress: TrafficCounter {
                start_bytes: host_tx_bytes,
                packets: self.last.egress_packets,
                bytes: self.last.egress_bytes,
            },
            egress: TrafficCounter {
                start_bytes: host_rx_bytes,
                packets: self.last.ingress_packets,
                bytes: self.last.ingress_bytes,
            },
        }
    }
}

struct Worker<L, C, S> {
    links: L,
    counters: C,
    containers: S,
    sys_class_net: PathBuf,
    cancel: CancellationToken,
    requests: mpsc::Receiver<oneshot::Sender<ContainerMetrics>>,

    pods: HashMap<ContainerId, PodInfo>,
    /// Keyed by host interface index.
    handles: HashMap<u32, CounterHandle>,
    metrics: ContainerMetrics,
}

impl<L, C, S> Worker<L, C, S>
where
    L: LinkSource,
    C: CounterSource,
    S: ContainerSource,
{
    async fn run(mut self) {
        let mut attach = tokio::time::interval(ATTACH_INTERVAL);
        let mut sample = tokio::time::interval(SAMPLE_INTERVAL);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = attach.tick() => self.sync_handles().await,
                _ = sample.tick() => self.sample(),
                request = self.requests.recv() => match request {
                    Some(reply) => {
                        let _ = reply.send(self.metrics.clone());
                    }
                    None => break,
                },
            }
        }

        for handle in self.handles.values() {
            handle.token.cancel();
        }
        log::debug!(target: "counter monitor", "stopped");
    }

    /// Attaches counters to new container links and detaches them from vanished ones.
    async fn sync_handles(&mut self) {
        self.pods.clear();
        for pod in self.containers.pods_with_container_ids().await {
            for container_id in pod.containers.keys() {
                self.pods.insert(container_id.clone(), pod.clone());
            }
        }

        let host_links = match self.links.host_links().await {
            Ok(links) => links,
            Err(err) => {
                log::warn!(target: "counter monitor", "failed to list host links: {err}");
                return;
            }
        };
        let host_names: HashMap<u32, String> = host_links
            .into_iter()
            .map(|link| (link.ifindex, link.ifname))
            .collect();

        let interfaces = match self.links.list().await {
            Ok(interfaces) => interfaces,
            Err(err) => {
                log::warn!(target: "counter monitor", "failed to list container links: {err}");
                return;
            }
        };

        let mut wanted: HashMap<u32, (ContainerId, InterfaceName)> = HashMap::new();
        for (container_id, description) in interfaces {
            if !self.pods.contains_key(&container_id) {
                continue;
            }
            for link in description.link_info {
                if link.is_loopback() {
                    continue;
                }
                let Some(peer) = link.link_index else {
                    continue;
                };
                if host_names.contains_key(&peer) {
                    wanted.insert(peer, (container_id.clone(), link.ifname));
                }
            }
        }

        self.handles.retain(|index, handle| {
            let keep = !handle.closed
                && wanted
                    .get(index)
                    .is_some_and(|(container_id, _)| *container_id == handle.container_id);
            if !keep {
                log::debug!(
                    target: "counter monitor",
                    "detaching {} of container {}",
                    handle.interface,
                    handle.container_id
                );
                handle.token.cancel();
            }
            keep
        });

        // New links are attached concurrently.
        let attaching: Vec<_> = wanted
            .into_iter()
            .filter(|(index, _)| !self.handles.contains_key(index))
            .filter_map(|(index, (container_id, interface))| {
                let host_name = host_names.get(&index)?.clone();
                let token = self.cancel.child_token();
                let counters = &self.counters;
                Some(async move {
                    let samples = counters
                        .watch_interface(token.clone(), index, SAMPLE_INTERVAL)
                        .await;
                    (index, container_id, interface, host_name, token, samples)
                })
            })
            .collect();

        for (index, container_id, interface, host_name, token, samples) in join_all(attaching).await {
            match samples {
                Ok(samples) => {
                    let baseline = read_host_baseline(&self.sys_class_net, &host_name);
                    self.handles.insert(
                        index,
                        CounterHandle {
                            container_id,
                            interface,
                            token,
                            samples,
                            baseline,
                            last: CountState::default(),
                            closed: false,
                        },
                    );
                }
                Err(err) => {
                    log::warn!(
                        target: "counter monitor",
                        "failed to attach counters to {host_name} ({index}) of container {container_id}, retrying next cycle: {err}"
                    );
                }
            }
        }
    }

    /// Collects the newest sample of every handle and rebuilds the snapshot.
    fn sample(&mut self) {
        for handle in self.handles.values_mut() {
            handle.poll();
        }

        let mut metrics = ContainerMetrics::new();
        for handle in self.handles.values() {
            let Some(pod) = self.pods.get(&handle.container_id) else {
                continue;
            };
            metrics
                .entry(handle.container_id.clone())
                .or_insert_with(|| ContainerInfo {
                    pod: pod.clone(),
                    metrics: Default::default(),
                })
                .metrics
                .insert(handle.interface.clone(), handle.snapshot());
        }
        self.metrics = metrics;
    }
}

/// Reads `(rx_bytes, tx_bytes)` of a host interface. Unreadable counters count as `0`.
fn read_host_baseline(sys_class_net: &Path, interface: &str) -> (u64, u64) {
    let statistics = sys_class_net.join(interface).join("statistics");
    let read = |name: &str| {
        fsutil::read_to_string(statistics.join(name))
            .ok_debug()
            .and_then(|content| content.trim().parse::<u64>().ok())
            .unwrap_or(0)
    };
    (read("rx_bytes"), read("tx_bytes"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use crate::enumerator::tests::FakeContainers;
    use crate::network::error::{Error, Result};
    use crate::network::interfaces::InterfaceDescription;
    use crate::network::iplink::IpLinkInfo;
    use crate::pod::tests::pod_info;

    #[derive(Default)]
    struct FakeLinks {
        host: Vec<IpLinkInfo>,
        containers: Mutex<HashMap<ContainerId, InterfaceDescription>>,
    }

    impl LinkSource for FakeLinks {
        async fn list(&self) -> Result<HashMap<ContainerId, InterfaceDescription>> {
            Ok(self.containers.lock().unwrap().clone())
        }

        async fn host_links(&self) -> Result<Vec<IpLinkInfo>> {
            Ok(self.host.clone())
        }
    }

    #[derive(Default)]
    struct FakeCounters {
        senders: Mutex<HashMap<u32, mpsc::Sender<CountState>>>,
        tokens: Mutex<HashMap<u32, CancellationToken>>,
        failing: Mutex<HashSet<u32>>,
        /// Holds every attach until this many attaches wait at once.
        attach_barrier: Option<tokio::sync::Barrier>,
    }

    impl CounterSource for Arc<FakeCounters> {
        async fn watch_interface(
            &self,
            cancel: CancellationToken,
            interface_index: u32,
            _tick: Duration,
        ) -> Result<mpsc::Receiver<CountState>> {
            if let Some(barrier) = &self.attach_barrier {
                barrier.wait().await;
            }
            if self.failing.lock().unwrap().contains(&interface_index) {
                return Err(Error::NoCounterObject);
            }
            let (tx, rx) = mpsc::channel(4);
            self.senders.lock().unwrap().insert(interface_index, tx);
            self.tokens.lock().unwrap().insert(interface_index, cancel);
            Ok(rx)
        }
    }

    fn link(ifindex: u32, ifname: &str, link_index: Option<u32>) -> IpLinkInfo {
        IpLinkInfo {
            ifindex,
            ifname: ifname.to_owned(),
            flags: vec!["UP".to_owned()],
            link_index,
            ..Default::default()
        }
    }

    fn worker(
        sys: &Path,
        counters: Arc<FakeCounters>,
    ) -> Worker<FakeLinks, Arc<FakeCounters>, FakeContainers> {
        let links = FakeLinks {
            host: vec![link(1, "lo", None), link(17, "veth17", Some(2)), link(18, "veth18", Some(2))],
            containers: Mutex::new(HashMap::from([(
                ContainerId::new("aaa").unwrap(),
                InterfaceDescription {
                    link_info: vec![
                        IpLinkInfo {
                            flags: vec!["LOOPBACK".to_owned()],
                            ..link(1, "lo", None)
                        },
                        link(2, "eth0", Some(17)),
                        link(3, "eth1", Some(18)),
                    ],
                    pids: vec![10],
                },
            )])),
        };
        let (_tx, rx) = mpsc::channel(1);
        Worker {
            links,
            counters,
            containers: FakeContainers::with_pods(vec![pod_info("default", "web", &[("aaa", &[10])])]),
            sys_class_net: sys.to_path_buf(),
            cancel: CancellationToken::new(),
            requests: rx,
            pods: HashMap::new(),
            handles: HashMap::new(),
            metrics: ContainerMetrics::new(),
        }
    }

    fn write_statistics(sys: &Path, interface: &str, rx_bytes: u64, tx_bytes: u64) {
        let dir = sys.join(interface).join("statistics");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("rx_bytes"), format!("{rx_bytes}\n")).unwrap();
        std::fs::write(dir.join("tx_bytes"), format!("{tx_bytes}\n")).unwrap();
    }

    #[tokio::test]
    async fn test_attaches_to_host_peers_and_swaps_directions() {
        let sys = tempfile::tempdir().unwrap();
        write_statistics(sys.path(), "veth17", 1000, 2000);
        let counters = Arc::new(FakeCounters::default());
        let mut worker = worker(sys.path(), Arc::clone(&counters));

        worker.sync_handles().await;
        assert_eq!(worker.handles.len(), 2);

        let sender = counters.senders.lock().unwrap()[&17].clone();
        sender
            .try_send(CountState {
                ingress_packets: 1,
                ingress_bytes: 100,
                egress_packets: 2,
                egress_bytes: 200,
            })
            .unwrap();
        sender
            .try_send(CountState {
                ingress_packets: 3,
                ingress_bytes: 300,
                egress_packets: 4,
                egress_bytes: 400,
            })
            .unwrap();
        worker.sample();

        let info = &worker.metrics["aaa"];
        assert_eq!(info.pod.name, "web");
        let eth0 = info.metrics["eth0"];
        assert_eq!(eth0.ingress, TrafficCounter { start_bytes: 2000, packets: 4, bytes: 400 });
        assert_eq!(eth0.egress, TrafficCounter { start_bytes: 1000, packets: 3, bytes: 300 });
        // No sample and no sysfs statistics yet.
        assert_eq!(info.metrics["eth1"], MetricSnapshot::default());

        // Without a new sample the previous value is kept.
        worker.sample();
        assert_eq!(worker.metrics["aaa"].metrics["eth0"], eth0);
    }

    #[tokio::test]
    async fn test_detaches_vanished_links_and_retries_failures() {
        let sys = tempfile::tempdir().unwrap();
        let counters = Arc::new(FakeCounters::default());
        counters.failing.lock().unwrap().insert(18);
        let mut worker = worker(sys.path(), Arc::clone(&counters));

        worker.sync_handles().await;
        assert_eq!(worker.handles.keys().copied().collect::<Vec<_>>(), vec![17]);

        counters.failing.lock().unwrap().clear();
        worker.links.containers.lock().unwrap().insert(
            ContainerId::new("aaa").unwrap(),
            InterfaceDescription {
                link_info: vec![link(3, "eth1", Some(18))],
                pids: vec![10],
            },
        );
        worker.sync_handles().await;

        assert_eq!(worker.handles.keys().copied().collect::<Vec<_>>(), vec![18]);
        assert!(counters.tokens.lock().unwrap()[&17].is_cancelled());
        assert!(!counters.tokens.lock().unwrap()[&18].is_cancelled());
    }

    #[tokio::test]
    async fn test_new_links_are_attached_concurrently() {
        let sys = tempfile::tempdir().unwrap();
        let counters = Arc::new(FakeCounters {
            attach_barrier: Some(tokio::sync::Barrier::new(2)),
            ..Default::default()
        });
        let mut worker = worker(sys.path(), Arc::clone(&counters));

        tokio::time::timeout(Duration::from_secs(5), worker.sync_handles())
            .await
            .expect("attaches of eth0 and eth1 must overlap");
        assert_eq!(worker.handles.len(), 2);
    }

    #[tokio::test]
    async fn test_cancellation_cascades_to_handles() {
        let sys = tempfile::tempdir().unwrap();
        let counters = Arc::new(FakeCounters::default());
        let mut worker = worker(sys.path(), Arc::clone(&counters));
        worker.sync_handles().await;

        worker.cancel.cancel();
        assert!(counters.tokens.lock().unwrap().values().all(CancellationToken::is_cancelled));
    }

    #[test]
    fn test_read_host_baseline() {
        let sys = tempfile::tempdir().unwrap();
        write_statistics(sys.path(), "veth9", 11, 22);
        assert_eq!(read_host_baseline(sys.path(), "veth9"), (11, 22));
        assert_eq!(read_host_baseline(sys.path(), "missing"), (0, 0));
    }
}
