//! Correlation of node-local Kubernetes pods with the containers and processes found in `/proc`.
mod error;
mod inventory;

use std::collections::{BTreeSet, HashMap};

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::chrono::SecondsFormat;

use crate::container::{ContainerId, ContainerProcesses, ProcessId};

pub use error::{Error, Result};
pub use inventory::{PodInventory, field_selector, generate_current_pod_list};

#[cfg(test)]
pub(crate) use inventory::tests as inventory_tests;

/// A pod running on this node together with the live processes of its ready containers.
#[derive(Debug, Clone, Default)]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    pub pod_ip: String,
    /// RFC3339 timestamp of the pod start.
    pub start_time: String,
    /// Never contains an empty process list.
    pub containers: ContainerProcesses,
}

impl PodInfo {
    /// The `<namespace>/<name>` identifier of the pod.
    pub fn namespace_and_name(&self) -> String {
        debug_assert!(!self.namespace.is_empty(), "encountered empty namespace");
        debug_assert!(!self.name.is_empty(), "encountered empty name");
        format!("{}/{}", self.namespace, self.name)
    }

    /// The first, i.e. lowest, pid of every container.
    pub fn containers_with_first_pid(&self) -> HashMap<ContainerId, ProcessId> {
        self.containers
            .iter()
            .filter_map(|(container_id, pids)| Some((container_id.clone(), *pids.first()?)))
            .collect()
    }

    /// Whether `other` describes the same pod with the same container processes.
    ///
    /// Namespace and name must match, both pods must have the same containers and the first
    /// pid of every container must be the same. Other pids are ignored as containers spawn
    /// and reap child processes all the time.
    pub fn equals(&self, other: &PodInfo) -> bool {
        if self.namespace != other.namespace || self.name != other.name {
            return false;
        }

        let container_ids: BTreeSet<&ContainerId> = self
            .containers
            .keys()
            .chain(other.containers.keys())
            .collect();

        container_ids.into_iter().all(|container_id| {
            let first = self.containers.get(container_id).and_then(|p| p.first());
            let other_first = other.containers.get(container_id).and_then(|p| p.first());
            matches!((first, other_first), (Some(a), Some(b)) if a == b)
        })
    }
}

/// Builds the [`PodInfo`] list for the given pods from the current container processes.
///
/// Pods without a start time are still starting and skipped. Only ready containers whose
/// id is known to `containers` with at least one process are included. Pods ending up
/// without any container are dropped, they are picked up on a later refresh.
pub fn pod_info_list(pods: &[Pod], containers: &ContainerProcesses) -> Vec<PodInfo> {
    let mut infos = Vec::new();

    for pod in pods {
        let Some(status) = pod.status.as_ref() else {
            continue;
        };
        let Some(start_time) = status.start_time.as_ref() else {
            continue;
        };

        let mut info = PodInfo {
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            name: pod.metadata.name.clone().unwrap_or_default(),
            pod_ip: status.pod_ip.clone().unwrap_or_default(),
            start_time: start_time.0.to_rfc3339_opts(SecondsFormat::Secs, true),
            containers: ContainerProcesses::new(),
        };

        for container in status.container_statuses.iter().flatten() {
            if !container.ready {
                continue;
            }
            let Some(raw_id) = container.container_id.as_deref() else {
                continue;
            };
            let container_id = match ContainerId::from_runtime_url(raw_id) {
                Ok(container_id) => container_id,
                Err(err) => {
                    log::warn!(
                        "failed to parse container id of pod {}: {err}",
                        info.namespace_and_name()
                    );
                    continue;
                }
            };
            // The container may have become ready after the last proc scan.
            match containers.get(&container_id) {
                Some(pids) if !pids.is_empty() => {
                    info.containers.insert(container_id, pids.clone());
                }
                _ => {}
            }
        }

        if !info.containers.is_empty() {
            infos.push(info);
        }
    }

    infos
}

#[cfg(test)]
pub(crate) mod tests {
    use k8s_openapi::api::core::v1::{ContainerStatus, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use k8s_openapi::chrono::{TimeZone, Utc};

    use super::*;

    pub(crate) fn pod_info(ns: &str, name: &str, containers: &[(&str, &[ProcessId])]) -> PodInfo {
        PodInfo {
            namespace: ns.to_owned(),
            name: name.to_owned(),
            pod_ip: "10.0.0.1".to_owned(),
            start_time: "2025-01-01T00:00:00Z".to_owned(),
            containers: containers
                .iter()
                .map(|(id, pids)| (ContainerId::new(id).unwrap(), pids.to_vec()))
                .collect(),
        }
    }

    pub(crate) fn k8s_pod(
        ns: &str,
        name: &str,
        host_network: bool,
        started: bool,
        statuses: &[(&str, bool)],
    ) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some(ns.to_owned()),
                name: Some(name.to_owned()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                host_network: Some(host_network),
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: Some("10.1.2.3".to_owned()),
                start_time: started
                    .then(|| Time(Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap())),
                container_statuses: Some(
                    statuses
                        .iter()
                        .map(|(id, ready)| ContainerStatus {
                            name: "app".to_owned(),
                            container_id: Some(id.to_string()),
                            ready: *ready,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
        }
    }

    fn containers(entries: &[(&str, &[ProcessId])]) -> ContainerProcesses {
        entries
            .iter()
            .map(|(id, pids)| (ContainerId::new(id).unwrap(), pids.to_vec()))
            .collect()
    }

    #[test]
    fn test_equals_ignores_non_first_pids() {
        let a = pod_info("default", "web", &[("aaa", &[10, 11]), ("bbb", &[20])]);
        let b = pod_info("default", "web", &[("aaa", &[10, 99, 100]), ("bbb", &[20, 21])]);
        assert!(a.equals(&b));
        assert!(b.equals(&a));
    }

    #[test]
    fn test_equals_detects_changes() {
        let base = pod_info("default", "web", &[("aaa", &[10, 11])]);
        assert!(!base.equals(&pod_info("default", "web", &[("aaa", &[12, 11])])));
        assert!(!base.equals(&pod_info("other", "web", &[("aaa", &[10])])));
        assert!(!base.equals(&pod_info("default", "api", &[("aaa", &[10])])));
        assert!(!base.equals(&pod_info("default", "web", &[("aaa", &[10]), ("bbb", &[30])])));
        assert!(!base.equals(&pod_info("default", "web", &[("ccc", &[10])])));
    }

    #[test]
    fn test_namespace_and_name_and_first_pids() {
        let info = pod_info("default", "web", &[("aaa", &[10, 11]), ("bbb", &[20])]);
        assert_eq!(info.namespace_and_name(), "default/web");
        let first = info.containers_with_first_pid();
        assert_eq!(first.get("aaa"), Some(&10));
        assert_eq!(first.get("bbb"), Some(&20));
    }

    #[test]
    fn test_pod_info_list_filters() {
        let pods = vec![
            k8s_pod("default", "ready", false, true, &[
                ("containerd://aaa", true),
                ("containerd://bbb", false),
                ("containerd://ccc", true),
                ("not-a-url", true),
            ]),
            k8s_pod("default", "starting", false, false, &[("containerd://ddd", true)]),
            k8s_pod("default", "no-processes", false, true, &[("containerd://eee", true)]),
        ];
        let known = containers(&[
            ("aaa", &[5, 6]),
            ("bbb", &[7]),
            ("ddd", &[8]),
            ("eee", &[]),
        ]);

        let infos = pod_info_list(&pods, &known);

        assert_eq!(infos.len(), 1);
        let info = &infos[0];
        assert_eq!(info.namespace_and_name(), "default/ready");
        assert_eq!(info.pod_ip, "10.1.2.3");
        assert_eq!(info.start_time, "2025-03-04T05:06:07Z");
        assert_eq!(info.containers.len(), 1);
        assert_eq!(info.containers.get("aaa"), Some(&vec![5, 6]));
    }

    #[test]
    fn test_pod_info_list_never_has_empty_process_lists() {
        let pods = vec![k8s_pod("ns", "p", false, true, &[
            ("docker://aaa", true),
            ("docker://bbb", true),
        ])];
        let known = containers(&[("aaa", &[]), ("bbb", &[3])]);
        let infos = pod_info_list(&pods, &known);
        assert_eq!(infos.len(), 1);
        assert!(infos[0].containers.values().all(|pids| !pids.is_empty()));
        assert!(!infos[0].containers.contains_key("aaa"));
    }
}
