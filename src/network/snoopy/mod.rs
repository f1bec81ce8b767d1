//! Network accounting with one external `snoopy` probe per container.
//!
//! snoopy is started inside the network namespace of a container process via `nsenter`. It
//! reports interface lifecycle events and per-interface counters as JSON lines on stdout
//! and structured log lines on stderr. The counters reported by snoopy are relative to the
//! moment it attached, so the kernel counters of every new interface are recorded as
//! baseline.
//!
//! A probe that exits on its own is not restarted. Its last counters stay visible until the
//! container is removed. A probe emitting an event type the monitor does not know is a
//! version mismatch between snoopy and the monitor; it is reported through
//! [`SnoopyManager::protocol_violation`] and the monitor shuts down.
mod protocol;
mod status;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::container::{ContainerId, ProcessId};
use crate::error::ResultOkLogExt;
use crate::fsutil;
use crate::pod::PodInfo;

use super::error::{Error, Result};
use super::{
    ContainerInfo, ContainerMetrics, InterfaceName, MetricSnapshot, TrafficCounter, command,
    netdev,
};

pub use protocol::{InterfaceCounter, SnoopyEvent, SnoopyInterface};
pub use status::{
    RegisterFailure, RegisterRequest, SnoopyProcess, SnoopyStatus, SnoopyStatusInterface,
};

use protocol::{DecodeError, StderrLine};
use status::{StatusEvent, StatusSender, StatusTracker};

const SNOOPY_BINARIES: [&str; 2] = ["snoopy", "mogenius-snoopy"];
const NSENTER_BINARY: &str = "nsenter";

/// Command line tunables of the snoopy processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnoopyArgs {
    /// Milliseconds between two metrics reports.
    pub metrics_rate: u64,
    /// Milliseconds between two scans for added or removed interfaces.
    pub network_device_poll_rate: u64,
    /// Upper bound of concurrently running snoopy processes.
    pub max_processes: usize,
}

impl Default for SnoopyArgs {
    fn default() -> Self {
        Self {
            metrics_rate: 2000,
            network_device_poll_rate: 1000,
            max_processes: 256,
        }
    }
}

/// Baselines and the latest counters of the interfaces seen by one probe.
#[derive(Debug, Default)]
struct Accounting {
    /// `(rx_bytes, tx_bytes)` of the kernel when the interface appeared.
    start_bytes: HashMap<InterfaceName, (u64, u64)>,
    /// `(ingress, egress)`
    last_metrics: HashMap<InterfaceName, (InterfaceCounter, InterfaceCounter)>,
}

impl Accounting {
    fn interface_added(&mut self, interface: InterfaceName, baseline: (u64, u64)) {
        self.start_bytes.insert(interface, baseline);
    }

    fn interface_removed(&mut self, interface: &str) {
        self.start_bytes.remove(interface);
        self.last_metrics.remove(interface);
    }

    fn record(&mut self, interface: InterfaceName, ingress: InterfaceCounter, egress: InterfaceCounter) {
        self.last_metrics.insert(interface, (ingress, egress));
    }

    /// Only interfaces with a baseline are reported.
    fn snapshot(&self) -> BTreeMap<InterfaceName, MetricSnapshot> {
        self.start_bytes
            .iter()
            .map(|(interface, &(ingress_start, egress_start))| {
                let (ingress, egress) = self
                    .last_metrics
                    .get(interface)
                    .copied()
                    .unwrap_or_default();
                let snapshot = MetricSnapshot {
                    ingress: TrafficCounter {
                        start_bytes: ingress_start,
                        packets: ingress.packets,
                        bytes: ingress.bytes,
                    },
                    egress: TrafficCounter {
                        start_bytes: egress_start,
                        packets: egress.packets,
                        bytes: egress.bytes,
                    },
                };
                (interface.clone(), snapshot)
            })
            .collect()
    }
}

struct SnoopyHandle {
    pod: PodInfo,
    snoopy_pid: ProcessId,
    accounting: Arc<RwLock<Accounting>>,
    token: CancellationToken,
}

/// Starts, tracks and stops the snoopy processes of all registered containers.
pub struct SnoopyManager {
    proc_root: PathBuf,
    snoopy: PathBuf,
    nsenter: PathBuf,
    args: SnoopyArgs,
    handles: DashMap<ContainerId, SnoopyHandle>,
    permits: Arc<Semaphore>,
    status: StatusTracker,
    violations: mpsc::Sender<Error>,
    violation: Mutex<mpsc::Receiver<Error>>,
    cancel: CancellationToken,
}

impl SnoopyManager {
    /// Resolves the snoopy and nsenter binaries from `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BinaryNotFound`] if either binary is missing.
    pub fn new(proc_root: PathBuf, args: SnoopyArgs, cancel: CancellationToken) -> Result<Self> {
        let snoopy = SNOOPY_BINARIES
            .iter()
            .find_map(|name| command::find_in_path(name))
            .ok_or_else(|| Error::BinaryNotFound {
                name: SNOOPY_BINARIES.join(" or "),
            })?;
        let nsenter = command::find_in_path(NSENTER_BINARY).ok_or_else(|| Error::BinaryNotFound {
            name: NSENTER_BINARY.to_owned(),
        })?;
        log::info!(target: "snoopy", "using {}", snoopy.display());
        Ok(Self::with_binaries(proc_root, snoopy, nsenter, args, cancel))
    }

    pub(crate) fn with_binaries(
        proc_root: PathBuf,
        snoopy: PathBuf,
        nsenter: PathBuf,
        args: SnoopyArgs,
        cancel: CancellationToken,
    ) -> Self {
        let (violations, violation) = mpsc::channel(1);
        Self {
            proc_root,
            snoopy,
            nsenter,
            permits: Arc::new(Semaphore::new(args.max_processes)),
            args,
            handles: DashMap::new(),
            status: StatusTracker::new(),
            violations,
            violation: Mutex::new(violation),
            cancel,
        }
    }

    /// Starts a probe for every container of the pod. Returns the errors of the containers
    /// that could not be registered.
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

    /// Starts a probe in the network namespace of `pid`. A probe already running for the
    /// container is replaced.
    pub async fn register_container(
        &self,
        pod: &PodInfo,
        container_id: ContainerId,
        pid: ProcessId,
    ) -> Result<()> {
        let status = self.status.sender();
        let request = RegisterRequest {
            pod_namespace: pod.namespace.clone(),
            pod_name: pod.name.clone(),
            container_id: container_id.clone(),
            ns_process_pid: pid,
        };
        status.send(StatusEvent::RegisterRequest(request.clone())).await;

        match self.spawn(&request, status.clone()).await {
            Ok((snoopy_pid, accounting, token)) => {
                log::debug!(
                    target: "snoopy",
                    "attached snoopy {snoopy_pid} to container {container_id} of {} (pid {pid})",
                    pod.namespace_and_name()
                );
                let handle = SnoopyHandle {
                    pod: pod.clone(),
                    snoopy_pid,
                    accounting,
                    token,
                };
                if let Some(previous) = self.handles.insert(container_id, handle) {
                    previous.token.cancel();
                    status
                        .send(StatusEvent::Remove {
                            snoopy_pid: previous.snoopy_pid,
                        })
                        .await;
                }
                Ok(())
            }
            Err(err) => {
                status
                    .send(StatusEvent::RegisterFailure(RegisterFailure {
                        request,
                        error: err.to_string(),
                    }))
                    .await;
                Err(err)
            }
        }
    }

    /// Starts the probe and its consumers. The success is reported before the first event
    /// of the probe.
    async fn spawn(
        &self,
        request: &RegisterRequest,
        status: StatusSender,
    ) -> Result<(ProcessId, Arc<RwLock<Accounting>>, CancellationToken)> {
        let pid = request.ns_process_pid;
        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| Error::TooManyProbes {
                limit: self.args.max_processes,
            })?;

        let netns = fsutil::process_dir(&self.proc_root, pid).join("ns").join("net");
        let args = [
            format!("--net={}", netns.display()),
            "--".to_owned(),
            self.snoopy.display().to_string(),
            "--metrics-rate".to_owned(),
            self.args.metrics_rate.to_string(),
            "--network-device-poll-rate".to_owned(),
            self.args.network_device_poll_rate.to_string(),
        ];
        let nsenter = self.nsenter.display().to_string();
        let spawn_error = |source| Error::Spawn {
            command: command::display(&nsenter, &args),
            source,
        };

        let mut child = Command::new(&self.nsenter)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(spawn_error(std::io::Error::other("stdio not captured")));
        };
        let snoopy_pid = child.id().map(ProcessId::from).unwrap_or_default();
        status
            .send(StatusEvent::RegisterSuccess {
                request: request.clone(),
                snoopy_pid,
            })
            .await;

        let token = self.cancel.child_token();
        let accounting = Arc::new(RwLock::new(Accounting::default()));
        let probe = Probe {
            proc_root: self.proc_root.clone(),
            nsenter: self.nsenter.clone(),
            container_id: request.container_id.clone(),
            pid,
            snoopy_pid,
            accounting: Arc::clone(&accounting),
            status,
            violations: self.violations.clone(),
            token: token.clone(),
        };

        tokio::spawn(read_logs(stderr, probe.container_id.clone(), snoopy_pid));
        tokio::spawn(supervise(child, token.clone(), permit, probe.container_id.clone()));
        tokio::spawn(probe.read_events(stdout));

        Ok((snoopy_pid, accounting, token))
    }

    /// Stops the probes of all containers of the pod. Returns the errors of the containers
    /// that could not be removed.
    pub async fn remove(&self, pod: &PodInfo) -> Vec<Error> {
        let mut errors = Vec::new();
        for container_id in pod.containers.keys() {
            if let Err(err) = self.remove_container(container_id).await {
                errors.push(err);
            }
        }
        errors
    }

    /// Stops the probe of the container and drops its counters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRegistered`] if no probe runs for the container.
    pub async fn remove_container(&self, container_id: &ContainerId) -> Result<()> {
        let (_, handle) = self
            .handles
            .remove(container_id)
            .ok_or_else(|| Error::NotRegistered(container_id.clone()))?;
        handle.token.cancel();
        self.status
            .sender()
            .send(StatusEvent::Remove {
                snoopy_pid: handle.snoopy_pid,
            })
            .await;
        Ok(())
    }

    /// The counters of all registered containers.
    pub fn metrics(&self) -> ContainerMetrics {
        self.handles
            .iter()
            .map(|entry| {
                let accounting = entry
                    .accounting
                    .read()
                    .unwrap_or_else(PoisonError::into_inner);
                let info = ContainerInfo {
                    pod: entry.pod.clone(),
                    metrics: accounting.snapshot(),
                };
                (entry.key().clone(), info)
            })
            .collect()
    }

    pub async fn status(&self) -> SnoopyStatus {
        self.status.status().await
    }

    /// Resolves with [`Error::ProtocolViolation`] once any probe emitted an unknown event
    /// type. The offending probe is stopped; the caller is expected to shut down.
    pub async fn protocol_violation(&self) -> Error {
        match self.violation.lock().await.recv().await {
            Some(err) => err,
            None => std::future::pending().await,
        }
    }
}

/// Kills the child once the token is cancelled, or logs its exit.
async fn supervise(
    mut child: Child,
    token: CancellationToken,
    permit: OwnedSemaphorePermit,
    container_id: ContainerId,
) {
    let exited = tokio::select! {
        _ = token.cancelled() => None,
        status = child.wait() => Some(status),
    };
    match exited {
        None => {
            if let Err(err) = child.kill().await {
                log::debug!(target: "snoopy", "failed to kill snoopy of container {container_id}: {err}");
            }
        }
        Some(Ok(status)) => {
            log::warn!(target: "snoopy", "snoopy of container {container_id} exited with {status}");
        }
        Some(Err(err)) => {
            log::error!(target: "snoopy", "failed to wait for snoopy of container {container_id}: {err}");
        }
    }
    drop(permit);
}

async fn read_logs(stderr: ChildStderr, container_id: ContainerId, snoopy_pid: ProcessId) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match protocol::classify_stderr(&line) {
            StderrLine::Nsenter(line) => {
                log::error!(target: "snoopy", "nsenter failed to execute snoopy for container {container_id}: {line}");
            }
            StderrLine::Log(message) => {
                log::log!(
                    target: "snoopy",
                    message.log_level(),
                    "container {container_id} snoopy {snoopy_pid} {}: {}",
                    message.target,
                    message.message
                );
            }
            StderrLine::Unparsable(line) => {
                log::error!(target: "snoopy", "failed to parse log message of container {container_id}: {line}");
            }
        }
    }
}

/// The stdout consumer of one probe.
struct Probe {
    proc_root: PathBuf,
    nsenter: PathBuf,
    container_id: ContainerId,
    pid: ProcessId,
    snoopy_pid: ProcessId,
    accounting: Arc<RwLock<Accounting>>,
    status: StatusSender,
    violations: mpsc::Sender<Error>,
    token: CancellationToken,
}

impl Probe {
    async fn read_events(self, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            let line = tokio::select! {
                _ = self.token.cancelled() => break,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    if let Err(err) = self.handle_line(&line).await {
                        log::error!(target: "snoopy", "{err}, stopping snoopy {}", self.snoopy_pid);
                        if self.violations.try_send(err).is_err() {
                            log::debug!(target: "snoopy", "protocol violation already reported");
                        }
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    log::error!(target: "snoopy", "failed to read snoopy output of container {}: {err}", self.container_id);
                    break;
                }
            }
        }
        self.token.cancel();
    }

    /// Applies one stdout line. Malformed lines are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolViolation`] for an unknown event type.
    async fn handle_line(&self, line: &str) -> Result<()> {
        let event = match protocol::decode_event(line) {
            Ok(event) => event,
            Err(DecodeError::UnknownType(kind)) => {
                return Err(Error::ProtocolViolation {
                    container_id: self.container_id.clone(),
                    kind,
                });
            }
            Err(err) => {
                log::error!(target: "snoopy", "container {}: {err}: {line}", self.container_id);
                return Ok(());
            }
        };
        self.apply(&event).await;
        self.status
            .send(StatusEvent::Probe {
                snoopy_pid: self.snoopy_pid,
                event,
            })
            .await;
        Ok(())
    }

    async fn apply(&self, event: &SnoopyEvent) {
        match event {
            SnoopyEvent::InterfaceAdded { interface } => {
                let baseline = self.read_baseline(&interface.name).await;
                self.accounting
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .interface_added(interface.name.clone(), baseline);
            }
            SnoopyEvent::InterfaceRemoved { interface } => {
                self.accounting
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .interface_removed(&interface.name);
            }
            SnoopyEvent::InterfaceMetrics {
                interface,
                ingress,
                egress,
            } => {
                self.accounting
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record(interface.clone(), *ingress, *egress);
            }
            SnoopyEvent::InterfaceBpfInitializationFailed { interface, error } => {
                log::warn!(
                    target: "snoopy",
                    "failed to initialize eBPF for {interface} of container {}: {error}",
                    self.container_id
                );
            }
            SnoopyEvent::InterfaceChanged { .. } | SnoopyEvent::InterfaceBpfInitialized { .. } => {}
        }
    }

    /// `(rx_bytes, tx_bytes)` of the interface inside the container.
    ///
    /// Read from sysfs in the mount namespace of the container, falling back to the
    /// `net/dev` file of the process and finally to `0`.
    async fn read_baseline(&self, interface: &str) -> (u64, u64) {
        match read_sysfs_baseline(&self.nsenter, &self.proc_root, self.pid, interface).await {
            Ok(baseline) => return baseline,
            Err(err) => log::debug!(target: "snoopy", "{err}"),
        }
        netdev::read_network_interface_info(&self.proc_root, self.pid)
            .ok_log()
            .and_then(|infos| {
                infos
                    .into_iter()
                    .find(|info| info.interface == interface)
                    .map(|info| (info.receive_bytes, info.transmit_bytes))
            })
            .unwrap_or_default()
    }
}

async fn read_sysfs_baseline(
    nsenter: &Path,
    proc_root: &Path,
    pid: ProcessId,
    interface: &str,
) -> Result<(u64, u64)> {
    let mntns = fsutil::process_dir(proc_root, pid).join("ns").join("mnt");
    let mount = format!("--mount={}", mntns.display());
    let rx_bytes = read_sysfs_counter(nsenter, &mount, interface, "rx_bytes").await?;
    let tx_bytes = read_sysfs_counter(nsenter, &mount, interface, "tx_bytes").await?;
    Ok((rx_bytes, tx_bytes))
}

async fn read_sysfs_counter(
    nsenter: &Path,
    mount: &str,
    interface: &str,
    counter: &str,
) -> Result<u64> {
    let path = format!("/sys/class/net/{interface}/statistics/{counter}");
    let args = [mount, "--", "cat", &path];
    let nsenter = nsenter.display().to_string();
    let out = command::output(&nsenter, &args).await?;
    let out = String::from_utf8_lossy(&out);
    out.trim().parse().map_err(|_| Error::InvalidCounter {
        command: command::display(&nsenter, &args),
        output: out.trim().to_owned(),
    })
}
