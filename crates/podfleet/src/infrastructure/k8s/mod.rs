//! Kubernetes-backed implementations of the fleet seams.
//!
//! [`KubeCluster`] talks to the API server for pod CRUD and the health probe,
//! and opens exec streams for remote commands.

pub mod cluster;

use std::error::Error;

use derive_more::Display;

pub use cluster::KubeCluster;

#[derive(Debug, Display)]
pub enum KubernetesError {
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
}

impl Error for KubernetesError {}
