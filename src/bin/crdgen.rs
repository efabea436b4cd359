//! # CRD Generator
//!
//! Prints the `Stack` CustomResourceDefinition as YAML.
//!
//! ```bash
//! cargo run --bin crdgen > config/crd/stack.yaml
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use kube::CustomResourceExt;
use stack_controller::crd::Stack;

fn main() -> anyhow::Result<()> {
    let crd = serde_yaml::to_string(&Stack::crd())?;
    print!("{crd}");
    Ok(())
}
