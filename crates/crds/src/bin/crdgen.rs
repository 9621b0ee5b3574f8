//! Prints the YAML manifests of every podnet CRD.
//!
//! ```text
//! cargo run -p crds --bin crdgen > deploy/crds.yaml
//! ```

use crds::{Gateway, IPEndpoint, IPPool};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    for crd in [IPPool::crd(), IPEndpoint::crd(), Gateway::crd()] {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
