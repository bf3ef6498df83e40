//! kube-node IPAM CNI plugin
//!
//! This implementation provides a chained IPAM plugin that:
//! - Reads the subnets of the local node from the Kubernetes node object,
//!   spec.podCIDRs for the main network or an annotation for secondary ones
//! - Caches them per network as a ready-to-use host-local config
//! - Optionally restricts IPv4 to an allow-list of namespaces
//! - Delegates address assignment to the host-local plugin

pub mod cache;
pub mod commands;
pub mod config;
pub mod delegate;
pub mod error;
pub mod filter;
pub mod logging;
pub mod node;
pub mod types;

// Re-export commonly used items
pub use cache::ResolutionCache;
pub use commands::{execute, run_cni};
pub use config::{CniEnv, PluginInput, Settings};
pub use error::{Error, Result};
pub use node::{KubeNodeReader, NodeReader};
pub use types::HostLocalIpam;
