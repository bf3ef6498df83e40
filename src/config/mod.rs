use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::HOST_LOCAL;

/// CNI version reported when the request carries none
pub const DEFAULT_CNI_VERSION: &str = "0.1.0";

/// CNI_ARGS key carrying the pod namespace
pub const POD_NAMESPACE_ARG: &str = "K8S_POD_NAMESPACE";

/// Defaults and fixed locations used by the plugin
#[derive(Debug, Clone)]
pub struct Settings {
    /// Parent of the per-network data directories
    pub data_root: PathBuf,
    /// File name of the resolution cache inside the data directory
    pub cache_file: String,
    /// File holding the local machine-id
    pub machine_id_path: PathBuf,
    /// Executable name of the delegate IPAM plugin
    pub delegate: String,
    /// Deadline for the whole invocation
    pub timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/var/lib/cni/networks"),
            cache_file: "kube-node.json".to_string(),
            machine_id_path: PathBuf::from("/etc/machine-id"),
            delegate: HOST_LOCAL.to_string(),
            timeout: Duration::from_secs(15),
        }
    }
}

impl Settings {
    /// Data directory of a network unless overridden by "dataDir"
    pub fn default_data_dir(&self, network: &str) -> PathBuf {
        self.data_root.join(network)
    }
}

/// Network configuration read from stdin
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginInput {
    /// Name of the network
    #[serde(default)]
    pub name: String,
    /// CNI specification version
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    /// Passed on to host-local
    #[serde(rename = "isDefaultGateway", default)]
    pub is_default_gateway: bool,
    /// IPAM configuration
    #[serde(default)]
    pub ipam: Option<IpamConfig>,
}

/// The "ipam" section of the input
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpamConfig {
    /// Type of IPAM plugin, "kube-node"
    #[serde(rename = "type", default)]
    pub ipam_type: String,
    /// Node annotation holding the subnets. Empty means spec.podCIDRs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
    /// Overrides the default data directory
    #[serde(rename = "dataDir", default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    /// Namespaces allowed to get an IPv4 address. Absent allows all.
    #[serde(rename = "ipv4-namespaces", default, skip_serializing_if = "Option::is_none")]
    pub ipv4_namespaces: Option<Vec<String>>,
    /// kubeconfig used to reach the API server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
    /// Log destination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logfile: Option<String>,
    /// Log level, "debug", "trace" or a number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loglevel: Option<String>,
}

impl IpamConfig {
    pub fn annotation(&self) -> &str {
        self.annotation.as_deref().unwrap_or_default()
    }

    /// Explicit "dataDir", ignoring an empty string
    pub fn data_dir(&self) -> Option<&str> {
        self.data_dir.as_deref().filter(|d| !d.is_empty())
    }

    pub fn kubeconfig(&self) -> Option<&Path> {
        self.kubeconfig.as_deref().filter(|k| !k.is_empty()).map(Path::new)
    }
}

impl PluginInput {
    /// Parse the network configuration from bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(Error::Decode)
    }

    /// Version used for every result and error of this invocation
    pub fn cni_version_or_default(&self) -> &str {
        if self.cni_version.is_empty() {
            DEFAULT_CNI_VERSION
        } else {
            &self.cni_version
        }
    }
}

/// The CNI environment of one invocation
#[derive(Debug, Clone, Default)]
pub struct CniEnv {
    /// CNI_COMMAND
    pub command: String,
    /// Parsed CNI_ARGS
    pub args: HashMap<String, String>,
    /// CNI_PATH, unsplit
    pub path: String,
    /// NODE_NAME override
    pub node_name: Option<String>,
}

impl CniEnv {
    /// Capture the CNI variables from the process environment
    pub fn from_env() -> Self {
        Self {
            command: env::var("CNI_COMMAND").unwrap_or_default(),
            args: parse_cni_args(&env::var("CNI_ARGS").unwrap_or_default()),
            path: env::var("CNI_PATH").unwrap_or_default(),
            node_name: env::var("NODE_NAME").ok().filter(|n| !n.is_empty()),
        }
    }

    pub fn is_version(&self) -> bool {
        self.command == "VERSION"
    }

    pub fn is_check(&self) -> bool {
        self.command == "CHECK"
    }

    /// Namespace of the pod, empty when unknown
    pub fn pod_namespace(&self) -> &str {
        self.args.get(POD_NAMESPACE_ARG).map(String::as_str).unwrap_or_default()
    }
}

/// Parse CNI_ARGS string into key-value pairs. The first occurrence of a
/// key wins.
pub fn parse_cni_args(args_str: &str) -> HashMap<String, String> {
    let mut args = HashMap::new();

    for pair in args_str.split(';') {
        if let Some((key, value)) = pair.split_once('=') {
            args.entry(key.to_string()).or_insert_with(|| value.to_string());
        }
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        let input = PluginInput::parse(
            br#"{
                "cniVersion": "1.0.0",
                "name": "net1",
                "isDefaultGateway": true,
                "ipam": {
                    "type": "kube-node",
                    "annotation": "my-cidrs",
                    "ipv4-namespaces": ["team-a"],
                    "kubeconfig": "/etc/kubernetes/kubeconfig"
                },
                "somethingElse": 1
            }"#,
        )
        .unwrap();
        assert_eq!(input.name, "net1");
        assert!(input.is_default_gateway);
        let ipam = input.ipam.unwrap();
        assert_eq!(ipam.annotation(), "my-cidrs");
        assert_eq!(ipam.ipv4_namespaces, Some(vec!["team-a".to_string()]));
        assert_eq!(ipam.kubeconfig(), Some(Path::new("/etc/kubernetes/kubeconfig")));
        assert_eq!(ipam.data_dir(), None);
    }

    #[test]
    fn test_parse_input_without_ipam() {
        let input = PluginInput::parse(br#"{"name": "net1"}"#).unwrap();
        assert!(input.ipam.is_none());
        assert_eq!(input.cni_version_or_default(), DEFAULT_CNI_VERSION);
    }

    #[test]
    fn test_parse_input_malformed() {
        let err = PluginInput::parse(b"{not json").unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_empty_allow_list_is_present() {
        let input = PluginInput::parse(br#"{"ipam": {"ipv4-namespaces": []}}"#).unwrap();
        assert_eq!(input.ipam.unwrap().ipv4_namespaces, Some(vec![]));
    }

    #[test]
    fn test_parse_cni_args() {
        let args = parse_cni_args(
            "IgnoreUnknown=1;K8S_POD_NAMESPACE=team-a;K8S_POD_NAME=p;K8S_POD_NAMESPACE=other",
        );
        assert_eq!(args.get("K8S_POD_NAMESPACE").unwrap(), "team-a");
        assert_eq!(args.get("K8S_POD_NAME").unwrap(), "p");
        assert!(parse_cni_args("").is_empty());
    }

    #[test]
    fn test_default_data_dir() {
        let settings = Settings::default();
        assert_eq!(
            settings.default_data_dir("net1"),
            PathBuf::from("/var/lib/cni/networks/net1")
        );
    }
}
