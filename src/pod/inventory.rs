use std::future::Future;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};

use crate::container::ContainerProcesses;

use super::error::{Error, Result};
use super::{PodInfo, pod_info_list};

/// Source of the pods scheduled on a node.
pub trait PodInventory: Send + Sync + 'static {
    /// Lists the pods of all namespaces matching the given field selector.
    fn list_pods(&self, field_selector: &str) -> impl Future<Output = Result<Vec<Pod>>> + Send;
}

impl PodInventory for kube::Client {
    async fn list_pods(&self, field_selector: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::all(self.clone());
        let params = ListParams::default().fields(field_selector);
        let list = pods.list(&params).await.map_err(|source| Error::ListPods {
            field_selector: field_selector.to_owned(),
            source,
        })?;
        Ok(list.items)
    }
}

/// The field selector for all pods on `node_name` outside of `kube-system`.
pub fn field_selector(node_name: &str) -> String {
    format!("metadata.namespace!=kube-system,spec.nodeName={node_name}")
}

/// Lists the node's pods and correlates them with the given container processes.
///
/// Pods in the host network namespace are dropped since their traffic cannot be attributed.
/// A failing inventory is logged and yields an empty list.
pub async fn generate_current_pod_list<I: PodInventory>(
    inventory: &I,
    field_selector: &str,
    containers: &ContainerProcesses,
) -> Vec<PodInfo> {
    let pods = match inventory.list_pods(field_selector).await {
        Ok(pods) => pods,
        Err(err) => {
            log::error!("{err}");
            return Vec::new();
        }
    };

    let pods: Vec<Pod> = pods
        .into_iter()
        .filter(|pod| {
            !pod.spec
                .as_ref()
                .and_then(|spec| spec.host_network)
                .unwrap_or(false)
        })
        .collect();

    pod_info_list(&pods, containers)
}
