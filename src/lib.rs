//! Podnet Monitor: per pod network traffic accounting for a Kubernetes node.
//!
//! The monitor resolves the containers running on the node from the cgroups of the host's
//! processes, correlates them with the pods scheduled on the node and accounts the traffic
//! of every pod interface. Traffic is read either by snoopy probes attached to the pod
//! network namespaces or from `/proc/<pid>/net/dev`, and optionally by eBPF counters
//! attached to the host side of the container veth pairs.
pub mod cgroup;
pub mod config;
pub mod container;
pub mod enumerator;
pub mod error;
pub mod fsutil;
pub mod network;
pub mod pod;
pub mod stats;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use config::Config;
use enumerator::ContainerEnumerator;
use network::{
    Backend, ContainerNetworkEnumerator, CounterMonitor, EbpfApi, NetworkMonitor,
    PodNetworkStats,
};
use stats::InterfaceStats;

const HOST_SYS_CLASS_NET: &str = "/sys/class/net";

/// Runs the monitor until interrupted.
///
/// # Errors
///
/// Fails if the proc root is unreadable, the node name is missing, no Kubernetes client
/// can be configured or the selected accounting backend is not installed. Returns the
/// backend's error if it stops accounting, e.g. when snoopy speaks an unknown protocol.
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let proc_root = config.host_proc_path.clone();
    std::fs::read_dir(&proc_root).map_err(|err| {
        format!(
            "failed to read proc root `{}`: {err}",
            proc_root.display()
        )
    })?;
    log::debug!("Proc root: {}", proc_root.display());
    log::debug!("Node: {}", config.node_name);

    let client = kube::Client::try_default().await?;
    let containers = Arc::new(ContainerEnumerator::new(
        proc_root.clone(),
        &config.node_name,
        client,
    )?);

    let cancel = CancellationToken::new();
    let backend = Backend::new(
        config.snoopy_implementation,
        proc_root.clone(),
        config.snoopy_args(),
        Arc::clone(&containers),
        cancel.child_token(),
    )?;
    let monitor = NetworkMonitor::new(Arc::clone(&containers), backend, cancel.child_token());
    monitor.run();

    let counters = config.ebpf_counter_object.clone().map(|object| {
        log::info!("attaching eBPF counters from {}", object.display());
        let counters = CounterMonitor::new(
            ContainerNetworkEnumerator::new(proc_root.clone()),
            EbpfApi::new(object),
            Arc::clone(&containers),
            PathBuf::from(HOST_SYS_CLASS_NET),
            cancel.child_token(),
        );
        counters.start();
        counters
    });

    let mut interval = tokio::time::interval(config.usage_log_interval());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutting down");
                break;
            }
            err = monitor.backend().fatal_error() => {
                log::error!("{err}");
                cancel.cancel();
                return Err(err.into());
            }
            _ = interval.tick() => {
                log_usage(&monitor.pod_network_usage().await);
                if let Some(counters) = &counters {
                    for (id, info) in counters.metrics().await {
                        log::debug!("{id} ({}): {:?}", info.pod.namespace_and_name(), info.metrics);
                    }
                }
                if log::log_enabled!(target: "snoopy", log::Level::Debug) {
                    let status = monitor.backend().status().await;
                    log::debug!(
                        target: "snoopy",
                        "{} initializing, {} failed, {} running",
                        status.initializing.len(),
                        status.failures.len(),
                        status.snoopy_processes.len()
                    );
                }
            }
        }
    }

    cancel.cancel();
    Ok(())
}

/// Logs one traffic summary line per pod.
fn log_usage(usage: &[PodNetworkStats]) {
    let mut pods: BTreeMap<(&str, &str), InterfaceStats> = BTreeMap::new();
    for entry in usage {
        pods.entry((entry.namespace.as_str(), entry.pod.as_str()))
            .or_insert_with(|| InterfaceStats {
                pod_name: entry.pod.clone(),
                namespace: entry.namespace.clone(),
                ..Default::default()
            })
            .sum(&InterfaceStats::from(entry));
    }
    for ((namespace, _), total) in pods {
        log::info!("{namespace}/{total}");
    }
}
