//! Shared Kubernetes utilities using kube-rs

use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, DeleteParams, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, info};

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between HA record deletion rounds
const HA_CLEANUP_INTERVAL: Duration = Duration::from_millis(100);

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal("create_client", format!("failed to read kubeconfig: {}", e))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal("create_client", format!("failed to load kubeconfig: {}", e))
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config)
        .map_err(|e| Error::internal("create_client", format!("failed to create client: {}", e)))
}

/// Delete a Deployment with foreground propagation.
///
/// Dependents are removed before the Deployment record disappears. Returns
/// false when there was nothing to delete.
pub async fn delete_deployment_foreground(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<bool, Error> {
    let api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    match api.delete(name, &DeleteParams::foreground()).await {
        Ok(_) => {
            info!(namespace, deployment = name, "Deleted deployment");
            Ok(true)
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {
            debug!(namespace, deployment = name, "Deployment already gone");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Label selector matching the HA ConfigMaps the runtime leaves behind for
/// the cluster called `cluster_id`
pub fn high_availability_selector(cluster_id: &str) -> String {
    format!("app={cluster_id},configmap-type=high-availability,type=flink-native-kubernetes")
}

/// Remove the HA ConfigMaps of a terminated cluster.
///
/// Lists and deletes until nothing matches, since the runtime may still be
/// writing records while its pods shut down.
pub async fn clean_high_availability_config_maps(
    client: &Client,
    namespace: &str,
    cluster_id: &str,
) -> Result<(), Error> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let params = ListParams::default().labels(&high_availability_selector(cluster_id));

    loop {
        let remaining = api.list(&params).await?;
        if remaining.items.is_empty() {
            break;
        }
        for cm in remaining.items {
            let Some(name) = cm.metadata.name else {
                continue;
            };
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => debug!(namespace, config_map = %name, "Deleted HA record"),
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        tokio::time::sleep(HA_CLEANUP_INTERVAL).await;
    }

    info!(namespace, cluster_id, "High-availability records cleaned");
    Ok(())
}
