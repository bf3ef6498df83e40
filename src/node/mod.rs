//! Lookup of the Kubernetes node object of this host and extraction of
//! its subnets.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::config::{Config, KubeConfigOptions, Kubeconfig};
use kube::{Client, ResourceExt};
use std::path::{Path, PathBuf};
use tokio::sync::OnceCell;
use tracing::{debug, trace};

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};
use crate::types::parse_cidr;

/// Read access to node objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeReader: Send + Sync {
    /// All node objects of the cluster
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// The named node, `None` if it does not exist
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;
}

/// `NodeReader` backed by the API server. The client is created on first
/// use so invocations served from the cache never build one.
pub struct KubeNodeReader {
    kubeconfig: Option<PathBuf>,
    client: OnceCell<Client>,
}

impl KubeNodeReader {
    /// Use `kubeconfig` if given, otherwise the in-cluster config or the
    /// default kubeconfig
    pub fn new(kubeconfig: Option<PathBuf>) -> Self {
        Self {
            kubeconfig,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<Client> {
        let client = self
            .client
            .get_or_try_init(|| async {
                let config = match &self.kubeconfig {
                    Some(path) => {
                        let kubeconfig = Kubeconfig::read_from(path)
                            .map_err(|e| Error::ClientConfig(format!("{}: {e}", path.display())))?;
                        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                            .await
                            .map_err(|e| Error::ClientConfig(e.to_string()))?
                    }
                    None => Config::infer()
                        .await
                        .map_err(|e| Error::ClientConfig(e.to_string()))?,
                };
                Client::try_from(config).map_err(Error::Kube)
            })
            .await?;
        Ok(client.clone())
    }

    async fn api(&self) -> Result<Api<Node>> {
        Ok(Api::all(self.client().await?))
    }
}

#[async_trait]
impl NodeReader for KubeNodeReader {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let nodes = self.api().await?.list(&ListParams::default()).await?;
        trace!(count = nodes.items.len(), "Read nodes");
        Ok(nodes.items)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        if name.is_empty() {
            return Err(Error::NodeNotFound(String::new()));
        }
        Ok(self.api().await?.get_opt(name).await?)
    }
}

/// Find the node object of this host. An explicit node name is trusted,
/// otherwise the node is matched on machine-id since the node name may
/// differ from the hostname and hostnames need not be unique.
pub async fn get_own_node(
    reader: &dyn NodeReader,
    node_name: Option<&str>,
    machine_id_path: &Path,
) -> Result<Node> {
    if let Some(name) = node_name.filter(|n| !n.is_empty()) {
        return reader
            .get_node(name)
            .await?
            .ok_or_else(|| Error::NodeNotFound(name.to_string()));
    }

    let nodes = reader.list_nodes().await?;
    let machine_id = read_machine_id(machine_id_path)?;
    trace!(machine_id = %machine_id, "Read machine-id");
    let node = find_own_node(nodes, &machine_id).ok_or(Error::OwnNodeNotFound)?;
    debug!(name = %node.name_any(), "Found own node");
    Ok(node)
}

/// First non-blank line of the machine-id file
pub fn read_machine_id(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path).map_err(|source| Error::MachineId {
        path: path.to_path_buf(),
        source,
    })?;
    content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .ok_or(Error::OwnNodeNotFound)
}

/// The node whose status.nodeInfo.machineID equals `machine_id`
pub fn find_own_node(nodes: Vec<Node>, machine_id: &str) -> Option<Node> {
    nodes.into_iter().find(|n| {
        n.status
            .as_ref()
            .and_then(|s| s.node_info.as_ref())
            .is_some_and(|info| info.machine_id == machine_id)
    })
}

/// Subnets for the network. Without an annotation these are the
/// spec.podCIDRs of the node, otherwise the comma separated value of the
/// annotation. The number of subnets is checked later.
pub fn get_subnets(node: &Node, annotation: &str) -> Result<Vec<String>> {
    if annotation.is_empty() {
        return node
            .spec
            .as_ref()
            .and_then(|spec| spec.pod_cidrs.clone())
            .filter(|cidrs| !cidrs.is_empty())
            .ok_or_else(|| Error::config("no spec.podCIDRs found"));
    }

    let value = node
        .annotations()
        .get(annotation)
        .ok_or_else(|| Error::config(format!("annotation {annotation:?} not found")))?;
    let cidrs: Vec<String> = value.split(',').map(str::to_string).collect();
    for cidr in &cidrs {
        parse_cidr(cidr)?;
    }
    Ok(cidrs)
}
