//! kube-console-api is the cluster-facing core of a Kubernetes console:
//! a JSON client over an injectable transport, typed resource clients
//! with api version negotiation and auto-reconnecting watches,
//! a registry resolving api paths and object references to clients,
//! and a manager that keeps a list of clusters in sync with kubeconfig files.
//!
//! Nothing here is global. The application constructs an
//! [`ApiRegistry`](registry::ApiRegistry) and a
//! [`KubeconfigSyncManager`](kubeconfig_sync::KubeconfigSyncManager)
//! and passes them where they are needed.

pub mod json_api;
pub mod kube_api;
pub use kube_api::{KubeApi, KubeObject, ResourceDescriptor};
pub mod kubeconfig_sync;
pub use kubeconfig_sync::KubeconfigSyncManager;
pub mod registry;
pub use registry::ApiRegistry;
pub mod seq;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;
