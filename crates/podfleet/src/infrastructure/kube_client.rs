use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;

use crate::infrastructure::k8s::KubernetesError;

/// A connected client plus the namespace its kubeconfig context points at
#[derive(Clone)]
pub struct ClusterHandle {
    pub client: Client,
    pub default_namespace: String,
}

/// Build a client from an explicit kubeconfig, a named context, or the environment.
pub async fn init_kube_client(
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
) -> Result<ClusterHandle, Report<KubernetesError>> {
    let options = KubeConfigOptions {
        context: context.clone(),
        ..Default::default()
    };

    let config = match kubeconfig {
        Some(kubeconfig_path) => {
            let kubeconfig = Kubeconfig::read_from(&kubeconfig_path).change_context(
                KubernetesError::ConnectionFailed {
                    message: format!(
                        "Failed to read kubeconfig file: {}",
                        kubeconfig_path.display()
                    ),
                },
            )?;

            Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .change_context(KubernetesError::ConnectionFailed {
                    message: format!(
                        "Failed to create config from kubeconfig: {}",
                        kubeconfig_path.display()
                    ),
                })?
        }
        None if context.is_some() => Config::from_kubeconfig(&options)
            .await
            .change_context(KubernetesError::ConnectionFailed {
                message: format!(
                    "Failed to load context {} from the default kubeconfig",
                    context.as_deref().unwrap_or_default()
                ),
            })?,
        // In-cluster service account or ~/.kube/config
        None => Config::infer()
            .await
            .change_context(KubernetesError::ConnectionFailed {
                message: "Failed to infer Kubernetes configuration".to_string(),
            })?,
    };

    let default_namespace = config.default_namespace.clone();
    let client = Client::try_from(config).change_context(KubernetesError::ConnectionFailed {
        message: "Failed to create Kubernetes client".to_string(),
    })?;

    Ok(ClusterHandle {
        client,
        default_namespace,
    })
}
