//! Command line and environment configuration.
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::network::{SnoopyArgs, SnoopyImplementation};

/// Per pod network traffic accounting for the node this process runs on.
#[derive(Debug, Clone, Parser)]
#[command(version, about)]
pub struct Config {
    /// Mount point of the host's proc filesystem.
    #[arg(long, env = "MO_HOST_PROC_PATH", default_value = "/proc")]
    pub host_proc_path: PathBuf,

    /// Name of the node whose pods are monitored.
    #[arg(long, env = "OWN_NODE_NAME")]
    pub node_name: String,

    /// Traffic accounting backend.
    #[arg(long, env = "MO_SNOOPY_IMPLEMENTATION", value_enum, default_value_t)]
    pub snoopy_implementation: SnoopyImplementation,

    /// Compiled eBPF counter object. Enables the veth counter monitor when set.
    #[arg(long, env = "MO_EBPF_COUNTER_OBJECT")]
    pub ebpf_counter_object: Option<PathBuf>,

    /// Milliseconds between two snoopy metrics reports.
    #[arg(long, env = "MO_SNOOPY_METRICS_RATE", default_value_t = 2000)]
    pub snoopy_metrics_rate: u64,

    /// Milliseconds between two snoopy interface scans.
    #[arg(long, env = "MO_SNOOPY_NETWORK_DEVICE_POLL_RATE", default_value_t = 1000)]
    pub snoopy_network_device_poll_rate: u64,

    /// Upper bound of concurrently running snoopy processes.
    #[arg(long, env = "MO_SNOOPY_MAX_PROCESSES", default_value_t = 256)]
    pub snoopy_max_processes: usize,

    /// Seconds between two usage summaries in the log.
    #[arg(long, env = "MO_USAGE_LOG_INTERVAL", default_value_t = 60)]
    pub usage_log_interval: u64,
}

impl Config {
    pub fn snoopy_args(&self) -> SnoopyArgs {
        SnoopyArgs {
            metrics_rate: self.snoopy_metrics_rate,
            network_device_poll_rate: self.snoopy_network_device_poll_rate,
            max_processes: self.snoopy_max_processes,
        }
    }

    pub fn usage_log_interval(&self) -> Duration {
        Duration::from_secs(self.usage_log_interval.max(1))
    }
}
