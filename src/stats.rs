//! Aggregated traffic records as they are stored and summed per controller.
use std::fmt;

use k8s_openapi::chrono::{DateTime, SecondsFormat};
use serde::{Deserialize, Serialize};

use crate::network::PodNetworkStats;

/// Traffic of a pod, possibly summed up over several samples or pods.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InterfaceStats {
    pub ip: String,
    pub pod_name: String,
    pub namespace: String,
    pub packets_sum: u64,
    pub transmit_bytes: u64,
    pub received_bytes: u64,
    pub unknown_bytes: u64,
    pub local_transmit_bytes: u64,
    pub local_received_bytes: u64,
    pub transmit_start_bytes: u64,
    pub received_start_bytes: u64,
    /// RFC3339 start of the pod.
    pub start_time: String,
    /// RFC3339 time the sample was taken.
    pub created_at: String,
}

impl InterfaceStats {
    /// Adds all counters, baselines included.
    pub fn sum(&mut self, other: &InterfaceStats) {
        self.add_counters(other);
        self.transmit_start_bytes += other.transmit_start_bytes;
        self.received_start_bytes += other.received_start_bytes;
    }

    /// Adds the counters of `other`, unless `other` has a larger baseline in either
    /// direction. A larger baseline means the collector restarted and counts from a fresh
    /// kernel reading, so `other` replaces the counters and baselines.
    pub fn sum_or_replace(&mut self, other: &InterfaceStats) {
        if other.transmit_start_bytes > self.transmit_start_bytes
            || other.received_start_bytes > self.received_start_bytes
        {
            self.transmit_start_bytes = other.transmit_start_bytes;
            self.received_start_bytes = other.received_start_bytes;

            self.packets_sum = other.packets_sum;
            self.transmit_bytes = other.transmit_bytes;
            self.received_bytes = other.received_bytes;
            self.unknown_bytes = other.unknown_bytes;
            self.local_transmit_bytes = other.local_transmit_bytes;
            self.local_received_bytes = other.local_received_bytes;
        } else {
            self.add_counters(other);
        }
    }

    fn add_counters(&mut self, other: &InterfaceStats) {
        self.packets_sum += other.packets_sum;
        self.transmit_bytes += other.transmit_bytes;
        self.received_bytes += other.received_bytes;
        self.unknown_bytes += other.unknown_bytes;
        self.local_transmit_bytes += other.local_transmit_bytes;
        self.local_received_bytes += other.local_received_bytes;
    }

    pub fn total_transmit_bytes(&self) -> u64 {
        self.transmit_bytes + self.transmit_start_bytes + self.local_transmit_bytes
    }

    pub fn total_received_bytes(&self) -> u64 {
        self.received_bytes + self.received_start_bytes + self.local_received_bytes
    }
}

impl From<&PodNetworkStats> for InterfaceStats {
    fn from(stats: &PodNetworkStats) -> Self {
        let created_at = i64::try_from(stats.created_at)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .map(|time| time.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default();
        Self {
            pod_name: stats.pod.clone(),
            namespace: stats.namespace.clone(),
            packets_sum: stats.received_packets + stats.transmit_packets,
            transmit_bytes: stats.transmit_bytes,
            received_bytes: stats.received_bytes,
            transmit_start_bytes: stats.transmit_start_bytes,
            received_start_bytes: stats.received_start_bytes,
            created_at,
            ..Default::default()
        }
    }
}

impl fmt::Display for InterfaceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> Packets: {}, Send: {} | Received: {}",
            self.pod_name,
            self.packets_sum,
            human_readable_bytes(self.total_transmit_bytes()),
            human_readable_bytes(self.total_received_bytes())
        )
    }
}

/// Sums the entries of all pods of a controller, newest first.
///
/// Consecutive entries of the same pod are successive samples of the same counters and
/// merged with [`InterfaceStats::sum_or_replace`]. When the pod changes, the totals of the
/// previous pod are kept and the new pod's entry is added on top.
pub fn aggregate_controller_entries<'a>(
    entries: impl IntoIterator<Item = &'a InterfaceStats>,
) -> InterfaceStats {
    let mut entries = entries.into_iter();
    let Some(first) = entries.next() else {
        return InterfaceStats::default();
    };

    let mut total = first.clone();
    for entry in entries {
        if total.pod_name != entry.pod_name {
            total.sum(entry);
            total.pod_name.clone_from(&entry.pod_name);
        } else {
            total.sum_or_replace(entry);
        }
    }
    total
}

fn human_readable_bytes(bytes: u64) -> String {
    const UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(pod: &str, start: (u64, u64), bytes: (u64, u64)) -> InterfaceStats {
        InterfaceStats {
            pod_name: pod.to_owned(),
            namespace: "default".to_owned(),
            packets_sum: 1,
            transmit_start_bytes: start.0,
            received_start_bytes: start.1,
            transmit_bytes: bytes.0,
            received_bytes: bytes.1,
            ..Default::default()
        }
    }

    #[test]
    fn test_sum_adds_baselines() {
        let mut total = stats("web", (100, 200), (10, 20));
        total.sum(&stats("web", (1, 2), (3, 4)));
        assert_eq!(total.transmit_start_bytes, 101);
        assert_eq!(total.received_start_bytes, 202);
        assert_eq!(total.transmit_bytes, 13);
        assert_eq!(total.received_bytes, 24);
        assert_eq!(total.packets_sum, 2);
    }

    #[test]
    fn test_sum_or_replace_adds_with_same_baseline() {
        let mut total = stats("web", (100, 200), (10, 20));
        total.sum_or_replace(&stats("web", (100, 200), (5, 5)));
        assert_eq!(total.transmit_start_bytes, 100);
        assert_eq!(total.received_start_bytes, 200);
        assert_eq!(total.transmit_bytes, 15);
        assert_eq!(total.received_bytes, 25);
    }

    #[test]
    fn test_sum_or_replace_adds_on_smaller_incoming_baseline() {
        let mut total = stats("web", (100, 100), (10, 10));
        total.sum_or_replace(&stats("web", (50, 50), (1, 1)));
        assert_eq!(total.transmit_start_bytes, 100);
        assert_eq!(total.received_start_bytes, 100);
        assert_eq!(total.transmit_bytes, 11);
        assert_eq!(total.packets_sum, 2);

        total.sum_or_replace(&stats("web", (150, 150), (3, 3)));
        assert_eq!(total, stats("web", (150, 150), (3, 3)));
    }

    #[test]
    fn test_sum_or_replace_replaces_on_larger_baseline() {
        let mut total = stats("web", (100, 200), (10, 20));
        total.sum_or_replace(&stats("web", (100, 900), (7, 8)));
        assert_eq!(total, stats("web", (100, 900), (7, 8)));
    }

    #[test]
    fn test_aggregate_controller_entries() {
        let entries = [
            stats("web-2", (500, 500), (30, 40)),
            stats("web-2", (500, 500), (1, 1)),
            stats("web-1", (100, 100), (10, 10)),
            stats("web-1", (200, 200), (2, 2)),
        ];

        let total = aggregate_controller_entries(&entries);

        // The second web-1 baseline is below the summed baseline of both pods.
        assert_eq!(total.pod_name, "web-1");
        assert_eq!(total.transmit_start_bytes, 600);
        assert_eq!(total.transmit_bytes, 43);
        assert_eq!(total.packets_sum, 4);

        let restarted = [
            stats("web-1", (100, 100), (10, 10)),
            stats("web-1", (700, 100), (2, 2)),
        ];
        assert_eq!(
            aggregate_controller_entries(&restarted),
            stats("web-1", (700, 100), (2, 2))
        );
    }

    #[test]
    fn test_aggregate_first_entry_is_not_counted_twice() {
        let entries = [stats("web", (100, 100), (10, 10))];
        assert_eq!(aggregate_controller_entries(&entries), entries[0]);
        assert_eq!(aggregate_controller_entries([]), InterfaceStats::default());
    }

    #[test]
    fn test_from_pod_network_stats() {
        let pod_stats = PodNetworkStats {
            pod: "web".to_owned(),
            namespace: "default".to_owned(),
            received_packets: 3,
            received_bytes: 300,
            received_start_bytes: 1000,
            transmit_packets: 4,
            transmit_bytes: 400,
            transmit_start_bytes: 2000,
            created_at: 1_700_000_000,
        };
        let stats = InterfaceStats::from(&pod_stats);
        assert_eq!(stats.packets_sum, 7);
        assert_eq!(stats.received_start_bytes, 1000);
        assert_eq!(stats.created_at, "2023-11-14T22:13:20Z");
        assert_eq!(
            stats.to_string(),
            "web -> Packets: 7, Send: 2.3 KiB | Received: 1.3 KiB"
        );
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_value(stats("web", (1, 2), (3, 4))).unwrap();
        assert_eq!(json["podName"], "web");
        assert_eq!(json["transmitStartBytes"], 1);
        assert_eq!(json["receivedStartBytes"], 2);
        let parsed: InterfaceStats =
            serde_json::from_str(r#"{"podName":"web","receivedBytes":9}"#).unwrap();
        assert_eq!(parsed.received_bytes, 9);
    }
}
