//! Kubernetes hosting of a gateway.
//!
//! The gateway's custom resource carries the watcher list and the durable node
//! status; core/v1 Events carry lifecycle notifications between the source
//! manager and the state reconciler.

pub mod events;
pub mod gateway;
pub mod k8s;
pub mod status;

pub use events::K8sEventBus;
pub use gateway::{Gateway, GatewaySpec, GatewayStatus};
pub use k8s::{K8sHost, K8sHostBuilder};
pub use status::K8sStatusStore;
