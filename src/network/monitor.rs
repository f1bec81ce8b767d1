use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::enumerator::ContainerSource;
use crate::pod::PodInfo;

use super::error::{Error, Result};
use super::snoopy::{SnoopyArgs, SnoopyManager, SnoopyStatus};
use super::stats_reader::NetworkStatsReader;
use super::{ContainerMetrics, PodNetworkStats};

const POD_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Interfaces never reported.
const IGNORED_INTERFACES: [&str; 1] = ["lo"];

const BTF_PATH: &str = "/sys/kernel/btf";

/// Whether the kernel exposes BTF type information, which snoopy needs to load its eBPF
/// programs.
pub fn btf_available() -> bool {
    path_available(Path::new(BTF_PATH))
}

fn path_available(path: &Path) -> bool {
    !matches!(std::fs::metadata(path), Err(err) if err.kind() == std::io::ErrorKind::NotFound)
}

/// Selects the accounting backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum SnoopyImplementation {
    /// snoopy if BTF is available, procdev otherwise.
    #[default]
    Auto,
    Snoopy,
    Procdev,
}

impl SnoopyImplementation {
    pub fn uses_snoopy(self, btf_available: bool) -> bool {
        match self {
            Self::Auto => btf_available,
            Self::Snoopy => true,
            Self::Procdev => false,
        }
    }
}

/// The accounting backend the [`NetworkMonitor`] keeps in sync with the pods of the node.
pub enum Backend<S: ContainerSource> {
    Snoopy(SnoopyManager),
    ProcDev(NetworkStatsReader<S>),
}

impl<S: ContainerSource> Backend<S> {
    /// # Errors
    ///
    /// Fails if snoopy is selected but not installed.
    pub fn new(
        implementation: SnoopyImplementation,
        proc_root: PathBuf,
        args: SnoopyArgs,
        containers: S,
        cancel: CancellationToken,
    ) -> Result<Self> {
        if implementation.uses_snoopy(btf_available()) {
            log::info!(target: "network monitor", "accounting traffic with snoopy");
            Ok(Self::Snoopy(SnoopyManager::new(proc_root, args, cancel)?))
        } else {
            log::info!(target: "network monitor", "accounting traffic from net/dev");
            Ok(Self::ProcDev(NetworkStatsReader::new(proc_root, containers)))
        }
    }

    pub async fn register(&self, pod: &PodInfo) -> Vec<Error> {
        match self {
            Self::Snoopy(snoopy) => snoopy.register(pod).await,
            Self::ProcDev(reader) => reader.register(pod).await,
        }
    }

    pub async fn remove(&self, pod: &PodInfo) -> Vec<Error> {
        match self {
            Self::Snoopy(snoopy) => snoopy.remove(pod).await,
            Self::ProcDev(reader) => reader.remove(pod).await,
        }
    }

    pub async fn metrics(&self) -> ContainerMetrics {
        match self {
            Self::Snoopy(snoopy) => snoopy.metrics(),
            Self::ProcDev(reader) => reader.metrics().await,
        }
    }

    /// Resolves once the backend can no longer account traffic. Never resolves for the
    /// procdev backend.
    pub async fn fatal_error(&self) -> Error {
        match self {
            Self::Snoopy(snoopy) => snoopy.protocol_violation().await,
            Self::ProcDev(_) => std::future::pending().await,
        }
    }

    /// The snoopy process overview. Empty for the procdev backend.
    pub async fn status(&self) -> SnoopyStatus {
        match self {
            Self::Snoopy(snoopy) => snoopy.status().await,
            Self::ProcDev(_) => SnoopyStatus::default(),
        }
    }
}

/// Pod list changes between two refreshes.
#[derive(Debug, Default)]
struct PodDiff<'a> {
    removed: Vec<&'a PodInfo>,
    added: Vec<&'a PodInfo>,
    /// `(previous, next)`
    changed: Vec<(&'a PodInfo, &'a PodInfo)>,
}

fn find_pod<'a>(pods: &'a [PodInfo], id: &str) -> Option<&'a PodInfo> {
    pods.iter().find(|pod| pod.namespace_and_name() == id)
}

/// Pods are matched by `<namespace>/<name>`. A pod whose containers restarted is changed.
fn diff_pods<'a>(current: &'a [PodInfo], next: &'a [PodInfo]) -> PodDiff<'a> {
    let mut diff = PodDiff::default();
    for pod in current {
        match find_pod(next, &pod.namespace_and_name()) {
            None => diff.removed.push(pod),
            Some(next_pod) if !pod.equals(next_pod) => diff.changed.push((pod, next_pod)),
            Some(_) => {}
        }
    }
    for next_pod in next {
        if find_pod(current, &next_pod.namespace_and_name()).is_none() {
            diff.added.push(next_pod);
        }
    }
    diff
}

/// Flattens the container metrics into one record per pod interface.
///
/// Interfaces without traffic and loopback interfaces are left out.
fn metrics_to_podstats(metrics: &ContainerMetrics, created_at: u64) -> Vec<PodNetworkStats> {
    let mut stats = Vec::new();
    for info in metrics.values() {
        for (interface, snapshot) in &info.metrics {
            if snapshot.is_empty() || IGNORED_INTERFACES.contains(&interface.as_str()) {
                continue;
            }
            stats.push(PodNetworkStats {
                pod: info.pod.name.clone(),
                namespace: info.pod.namespace.clone(),
                received_packets: snapshot.ingress.packets,
                received_bytes: snapshot.ingress.bytes,
                received_start_bytes: snapshot.ingress.start_bytes,
                transmit_packets: snapshot.egress.packets,
                transmit_bytes: snapshot.egress.bytes,
                transmit_start_bytes: snapshot.egress.start_bytes,
                created_at,
            });
        }
    }
    stats
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

fn log_errors(level: log::Level, action: &str, pod: &PodInfo, errors: &[Error]) {
    for err in errors {
        log::log!(
            target: "network monitor",
            level,
            "failed to {action} pod {}: {err}",
            pod.namespace_and_name()
        );
    }
}

/// Keeps the backend registered with the current pods of the node and collects the
/// per pod traffic.
pub struct NetworkMonitor<S: ContainerSource> {
    backend: Arc<Backend<S>>,
    running: AtomicBool,
    worker: Mutex<Option<Worker<S>>>,
    requests: mpsc::Sender<oneshot::Sender<Vec<PodNetworkStats>>>,
    cancel: CancellationToken,
}

impl<S: ContainerSource> NetworkMonitor<S> {
    pub fn new(containers: S, backend: Backend<S>, cancel: CancellationToken) -> Self {
        let backend = Arc::new(backend);
        let (tx, rx) = mpsc::channel(1);
        Self {
            worker: Mutex::new(Some(Worker {
                containers,
                backend: Arc::clone(&backend),
                requests: rx,
                cancel: cancel.clone(),
            })),
            backend,
            running: AtomicBool::new(false),
            requests: tx,
            cancel,
        }
    }

    pub fn backend(&self) -> &Backend<S> {
        &self.backend
    }

    /// Starts the background task. Subsequent calls do nothing.
    pub fn run(&self) {
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

    /// The traffic of all pod interfaces as of the last collection.
    pub async fn pod_network_usage(&self) -> Vec<PodNetworkStats> {
        self.run();
        let (tx, rx) = oneshot::channel();
        let reply = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            sent = self.requests.send(tx) => match sent {
                Ok(()) => tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    reply = rx => reply.ok(),
                },
                Err(_) => None,
            },
        };
        reply.unwrap_or_else(|| {
            log::warn!(target: "network monitor", "requested pod network usage after shutdown");
            Vec::new()
        })
    }
}

struct Worker<S: ContainerSource> {
    containers: S,
    backend: Arc<Backend<S>>,
    requests: mpsc::Receiver<oneshot::Sender<Vec<PodNetworkStats>>>,
    cancel: CancellationToken,
}

impl<S: ContainerSource> Worker<S> {
    async fn run(mut self) {
        let mut pods = self.containers.pods_with_container_ids().await;
        for pod in &pods {
            log_errors(log::Level::Error, "register", pod, &self.backend.register(pod).await);
        }
        let mut stats = metrics_to_podstats(&self.backend.metrics().await, unix_now());

        let start = tokio::time::Instant::now();
        let mut refresh = tokio::time::interval_at(start + POD_REFRESH_INTERVAL, POD_REFRESH_INTERVAL);
        let mut collect = tokio::time::interval_at(start + STATS_INTERVAL, STATS_INTERVAL);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = refresh.tick() => {
                    let next = self.containers.pods_with_container_ids().await;
                    self.sync_pods(&pods, &next).await;
                    pods = next;
                }
                _ = collect.tick() => {
                    stats = metrics_to_podstats(&self.backend.metrics().await, unix_now());
                }
                request = self.requests.recv() => match request {
                    Some(reply) => {
                        let _ = reply.send(stats.clone());
                    }
                    None => break,
                },
            }
        }
        log::debug!(target: "network monitor", "stopped");
    }

    async fn sync_pods(&self, current: &[PodInfo], next: &[PodInfo]) {
        let diff = diff_pods(current, next);
        for pod in diff.removed {
            log::info!(target: "network monitor", "removing pod {}", pod.namespace_and_name());
            log_errors(log::Level::Warn, "remove", pod, &self.backend.remove(pod).await);
        }
        for pod in diff.added {
            log::info!(target: "network monitor", "registering pod {}", pod.namespace_and_name());
            log_errors(log::Level::Error, "register", pod, &self.backend.register(pod).await);
        }
        for (previous, pod) in diff.changed {
            log::info!(target: "network monitor", "updating pod {}", pod.namespace_and_name());
            log_errors(log::Level::Warn, "remove", previous, &self.backend.remove(previous).await);
            log_errors(log::Level::Error, "register", pod, &self.backend.register(pod).await);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::container::ContainerId;
    use crate::enumerator::tests::FakeContainers;
    use crate::network::netdev::tests::write_net_dev;
    use crate::network::{ContainerInfo, MetricSnapshot, TrafficCounter};
    use crate::pod::tests::pod_info;

    #[test]
    fn test_implementation_selection() {
        assert!(SnoopyImplementation::Auto.uses_snoopy(true));
        assert!(!SnoopyImplementation::Auto.uses_snoopy(false));
        assert!(SnoopyImplementation::Snoopy.uses_snoopy(false));
        assert!(!SnoopyImplementation::Procdev.uses_snoopy(true));
    }

    #[test]
    fn test_path_available() {
        let dir = tempfile::tempdir().unwrap();
        assert!(path_available(dir.path()));
        assert!(!path_available(&dir.path().join("btf")));
    }

    #[tokio::test]
    async fn test_snoopy_backend_reports_removal_errors() {
        let root = tempfile::tempdir().unwrap();
        let backend: Backend<FakeContainers> = Backend::Snoopy(SnoopyManager::with_binaries(
            root.path().to_path_buf(),
            PathBuf::from("/definitely/not/snoopy"),
            PathBuf::from("/definitely/not/nsenter"),
            SnoopyArgs::default(),
            CancellationToken::new(),
        ));
        let errors = backend
            .remove(&pod_info("default", "web", &[("aaa", &[1]), ("bbb", &[2])]))
            .await;
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|err| matches!(err, Error::NotRegistered(_))));
    }

    #[test]
    fn test_diff_pods() {
        let current = vec![
            pod_info("default", "gone", &[("aaa", &[1])]),
            pod_info("default", "same", &[("bbb", &[2, 3])]),
            pod_info("default", "restarted", &[("ccc", &[4])]),
        ];
        let next = vec![
            pod_info("default", "same", &[("bbb", &[2, 9])]),
            pod_info("default", "restarted", &[("ccc", &[5])]),
            pod_info("default", "new", &[("ddd", &[6])]),
        ];

        let diff = diff_pods(&current, &next);

        let names = |pods: &[&PodInfo]| pods.iter().map(|pod| pod.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(&diff.removed), vec!["gone"]);
        assert_eq!(names(&diff.added), vec!["new"]);
        assert_eq!(diff.changed.len(), 1);
        let (previous, pod) = diff.changed[0];
        assert_eq!(previous.containers["ccc"], vec![4]);
        assert_eq!(pod.containers["ccc"], vec![5]);
    }

    fn snapshot(received_bytes: u64, transmit_bytes: u64) -> MetricSnapshot {
        MetricSnapshot {
            ingress: TrafficCounter {
                start_bytes: 100,
                packets: u64::from(received_bytes > 0),
                bytes: received_bytes,
            },
            egress: TrafficCounter {
                start_bytes: 200,
                packets: u64::from(transmit_bytes > 0),
                bytes: transmit_bytes,
            },
        }
    }

    #[test]
    fn test_metrics_to_podstats() {
        let mut metrics = ContainerMetrics::new();
        metrics.insert(ContainerId::new("bbb").unwrap(), ContainerInfo {
            pod: pod_info("default", "api", &[("bbb", &[2])]),
            metrics: BTreeMap::from([("eth0".to_owned(), snapshot(5, 6))]),
        });
        metrics.insert(ContainerId::new("aaa").unwrap(), ContainerInfo {
            pod: pod_info("default", "web", &[("aaa", &[1])]),
            metrics: BTreeMap::from([
                ("lo".to_owned(), snapshot(10, 10)),
                ("eth1".to_owned(), snapshot(0, 0)),
                ("eth0".to_owned(), snapshot(1, 2)),
                ("net1".to_owned(), snapshot(3, 0)),
            ]),
        });

        let stats = metrics_to_podstats(&metrics, 1_700_000_000);

        assert_eq!(stats.len(), 3);
        assert_eq!(stats[0], PodNetworkStats {
            pod: "web".to_owned(),
            namespace: "default".to_owned(),
            received_packets: 1,
            received_bytes: 1,
            received_start_bytes: 100,
            transmit_packets: 1,
            transmit_bytes: 2,
            transmit_start_bytes: 200,
            created_at: 1_700_000_000,
        });
        assert_eq!(stats[1].received_bytes, 3);
        assert_eq!(stats[2].pod, "api");
    }

    #[tokio::test]
    async fn test_collects_pod_traffic() {
        let root = tempfile::tempdir().unwrap();
        write_net_dev(root.path(), 10, &[("lo", 0, 0, 0, 0), ("eth0", 1000, 10, 2000, 20)]);
        let containers = Arc::new(FakeContainers::with_pods(vec![pod_info(
            "default",
            "web",
            &[("aaa", &[10])],
        )]));
        let cancel = CancellationToken::new();
        let monitor = NetworkMonitor::new(
            Arc::clone(&containers),
            Backend::ProcDev(NetworkStatsReader::new(
                root.path().to_path_buf(),
                Arc::clone(&containers),
            )),
            cancel.clone(),
        );
        monitor.run();

        // Wait for the registration to be picked up by an update.
        for _ in 0..60 {
            if monitor.backend().metrics().await.contains_key("aaa") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        write_net_dev(root.path(), 10, &[("lo", 50, 5, 50, 5), ("eth0", 1400, 14, 2100, 21)]);

        let mut stats = Vec::new();
        for _ in 0..60 {
            stats = monitor.pod_network_usage().await;
            if !stats.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].pod, "web");
        assert_eq!(stats[0].received_start_bytes, 1000);
        assert_eq!(stats[0].received_bytes, 400);
        assert_eq!(stats[0].transmit_packets, 1);

        cancel.cancel();
        assert!(monitor.pod_network_usage().await.is_empty());
    }
}
