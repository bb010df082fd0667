pub mod cmd;
pub mod config;
pub mod domain;
mod infrastructure;
pub mod logging;

pub use infrastructure::k8s;
pub use infrastructure::kube_client;
