//! Prints the config audit CRDs as YAML for `kubectl apply -f -`.

use crds::ConfigAuditReport;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&ConfigAuditReport::crd())?);
    Ok(())
}
