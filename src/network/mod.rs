//! Network traffic accounting per container and pod.
//!
//! Traffic is attributed by one of two interchangeable backends driven by the
//! [`NetworkMonitor`]:
//!
//! - [`SnoopyManager`] attaches an external probe to the network namespace of every
//!   container and consumes its event stream.
//! - [`NetworkStatsReader`] reads `/proc/<pid>/net/dev` of a representative process per
//!   container, for nodes without BTF support.
//!
//! Additionally the [`CounterMonitor`] attaches in-process eBPF counters to the host side of
//! container veth pairs if a compiled counter object is configured.
//!
//! All backends report session relative counters: the kernel counter value seen at the
//! first observation of an interface is kept as baseline (`start_bytes`) and subtracted from
//! later readings.
mod command;
mod counter_monitor;
mod ebpf;
mod error;
mod interfaces;
mod iplink;
mod monitor;
mod netdev;
mod snoopy;
mod stats_reader;

use std::collections::BTreeMap;

use serde::Serialize;

use crate::container::ContainerId;
use crate::pod::PodInfo;

pub use counter_monitor::CounterMonitor;
pub use ebpf::{CountState, CounterSource, EbpfApi};
pub use error::{Error, Result};
pub use interfaces::{ContainerNetworkEnumerator, InterfaceDescription, LinkSource};
pub use iplink::IpLinkInfo;
pub use monitor::{Backend, NetworkMonitor, SnoopyImplementation, btf_available};
pub use netdev::{KernelNetworkInterfaceInfo, read_network_interface_info};
pub use snoopy::{SnoopyArgs, SnoopyManager, SnoopyStatus};
pub use stats_reader::NetworkStatsReader;

/// Name of a network interface inside a container, e.g. `eth0`.
pub type InterfaceName = String;

/// Per-container network view keyed by container id, iterated in id order.
pub type ContainerMetrics = BTreeMap<ContainerId, ContainerInfo>;

/// One direction of an interface's traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficCounter {
    /// Kernel byte counter at the first observation of the interface.
    pub start_bytes: u64,
    /// Packets since the first observation.
    pub packets: u64,
    /// Bytes since the first observation.
    pub bytes: u64,
}

/// Ingress and egress counters of one interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricSnapshot {
    pub ingress: TrafficCounter,
    pub egress: TrafficCounter,
}

impl MetricSnapshot {
    /// Whether no traffic was observed since the baseline.
    pub fn is_empty(&self) -> bool {
        self.ingress.packets == 0
            && self.ingress.bytes == 0
            && self.egress.packets == 0
            && self.egress.bytes == 0
    }
}

/// The pod a container belongs to and the counters of all its interfaces.
#[derive(Debug, Clone, Default)]
pub struct ContainerInfo {
    pub pod: PodInfo,
    pub metrics: BTreeMap<InterfaceName, MetricSnapshot>,
}

/// Traffic of one pod interface, ready to be handed to a metrics sink.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodNetworkStats {
    pub pod: String,
    pub namespace: String,
    pub received_packets: u64,
    pub received_bytes: u64,
    pub received_start_bytes: u64,
    pub transmit_packets: u64,
    pub transmit_bytes: u64,
    pub transmit_start_bytes: u64,
    /// Unix timestamp in seconds.
    pub created_at: u64,
}
