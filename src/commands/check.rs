use k8s_openapi::api::core::v1::Node;
use kube::api::ListParams;
use kube::{Api, Client};

use vpsie_autoscaler::crd::{NodeGroup, NodeMember};

pub async fn run() -> anyhow::Result<()> {
    println!("Running cluster connectivity checks...\n");

    // 1. Build Kubernetes client from kubeconfig
    print!("  Kubeconfig .................. ");
    let client = match Client::try_default().await {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot load kubeconfig: {}", e);
        }
    };

    // 2. Verify actual cluster connectivity by fetching server version
    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            println!("\n  Error: {}", e);
            println!("  Hint:  Is the cluster running? Check with: kubectl cluster-info\n");
            return Ok(());
        }
    }

    // 3. List nodes permission
    print!("  List nodes permission ....... ");
    let nodes: Api<Node> = Api::all(client.clone());
    match nodes.list(&ListParams::default()).await {
        Ok(node_list) => println!("OK ({} nodes)", node_list.items.len()),
        Err(e) => println!("FAIL ({})", e),
    }

    // 4. NodeGroup CRD installed
    print!("  NodeGroup CRD ............... ");
    let groups: Api<NodeGroup> = Api::all(client.clone());
    match groups.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK"),
        Err(e) => println!("FAIL ({}) — run: vpsie-autoscaler crd install", e),
    }

    // 5. NodeMember CRD installed
    print!("  NodeMember CRD .............. ");
    let members: Api<NodeMember> = Api::all(client.clone());
    match members.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK"),
        Err(e) => println!("FAIL ({}) — run: vpsie-autoscaler crd install", e),
    }

    // 6. Provider credentials present
    print!("  VPSie API token ............. ");
    match std::env::var("VPSIE_API_TOKEN") {
        Ok(_) => println!("OK"),
        Err(_) => println!("MISSING (set VPSIE_API_TOKEN)"),
    }

    println!("\nAll checks completed.");
    Ok(())
}
