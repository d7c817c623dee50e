use anyhow::Result;
use kube::CustomResourceExt;

use vpsie_autoscaler::crd::{NodeGroup, NodeMember};

/// Print both CRD manifests to stdout for `kubectl apply -f`.
pub fn generate() -> Result<()> {
    let group_yaml = serde_yaml::to_string(&NodeGroup::crd())?;
    let member_yaml = serde_yaml::to_string(&NodeMember::crd())?;
    println!("{group_yaml}---\n{member_yaml}");
    Ok(())
}

/// Apply both CRDs directly to the connected cluster.
pub async fn install() -> Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::{Api, Client};

    let client = Client::try_default().await?;
    let crds: Api<CustomResourceDefinition> = Api::all(client);

    for crd in [NodeGroup::crd(), NodeMember::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        match crds.create(&Default::default(), &crd).await {
            Ok(_) => {
                println!("CRD '{name}' installed successfully");
            }
            Err(kube::Error::Api(err)) if err.code == 409 => {
                println!("CRD '{name}' already exists — skipping");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}
