//! # CRD Generator
//!
//! Generates Kubernetes CustomResourceDefinition (CRD) YAML from Rust type definitions.
//!
//! ## Usage
//!
//! ```bash
//! # Generate CRD YAML
//! cargo run --bin crdgen > config/crd/syncedsecret.yaml
//!
//! # Generate and apply directly
//! cargo run --bin crdgen | kubectl apply -f -
//! ```
//!
//! The generated CRD includes OpenAPI schema validation and the status
//! subresource.

use kube::core::CustomResourceExt;
use synced_secret_controller::SyncedSecret;

fn main() {
    let crd = SyncedSecret::crd();
    match serde_yaml::to_string(&crd) {
        Ok(yaml) => print!("{yaml}"),
        Err(e) => {
            eprintln!("Failed to serialize CRD: {e}");
            std::process::exit(1);
        }
    }
}
