use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "vpsie-autoscaler")]
#[command(about = "VPSie Kubernetes Cluster Autoscaler")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity and permissions
    Check,

    /// Manage the NodeGroup and NodeMember CRDs
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Start the autoscaler reconcile loop
    Reconcile,
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML to stdout
    Generate,

    /// Install the CRDs into the connected cluster
    Install,
}
