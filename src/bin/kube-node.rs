use clap::Parser;
use std::process::ExitCode;

use kube_node::{run_cni, Settings};

/// IPAM CNI plugin taking address ranges from the Kubernetes node object.
/// Invoked by the container runtime with the network configuration on
/// stdin and the CNI_* variables in the environment.
#[derive(Parser)]
#[command(name = "kube-node", version, about)]
struct Cli {}

fn main() -> ExitCode {
    Cli::parse();
    run_cni(&Settings::default())
}
