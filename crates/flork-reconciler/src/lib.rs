//! Reconciliation engine for flork resources
//!
//! One [`phaser::Phaser`] per resource key drives the resource through its
//! phases while holding the resource's lease. The [`ReconcilerRegistry`]
//! routes watch events to the right phaser; phases talk to the cluster
//! through [`capabilities::WorkloadCapabilities`] and persist status through
//! [`operations::ResourceOperations`].

pub mod capabilities;
pub mod context;
pub mod monitor;
pub mod operations;
pub mod phaser;
pub mod phases;
pub mod registry;

#[cfg(test)]
mod testing;

pub use context::{ReconcilerConfig, ReconcilerContext};
pub use monitor::DeploymentMonitor;
pub use registry::ReconcilerRegistry;
