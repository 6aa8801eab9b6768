//! Capabilities of `FlinkJob`: standalone application clusters

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use flork_common::crd::{FlinkJob, ManagedResource};
use flork_common::kube_utils::{clean_high_availability_config_maps, delete_deployment_foreground};
use flork_common::{DeployError, Error, Result, FIELD_MANAGER};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

use super::manifests::{self, CONF_FILE_NAME, REST_ADDRESS_KEY};
use super::{
    ManagementClient, RestManagementClient, RuntimeConfig, WorkloadCapabilities,
    REST_SSL_KEYSTORE_KEY,
};

/// [`WorkloadCapabilities`] for `FlinkJob`
#[derive(Clone)]
pub struct JobCapabilities {
    client: Client,
}

impl JobCapabilities {
    /// Capabilities acting through `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Base URL of a job's management endpoint
    fn rest_base_url(job: &FlinkJob, config: &RuntimeConfig) -> String {
        let cluster_id = job.name_any();
        let namespace = job.namespace().unwrap_or_default();
        let service = format!("{}.{}.svc", manifests::rest_service_name(&cluster_id), namespace);
        let host = if job.spec.flork_conf.prefer_cluster_internal_service {
            service
        } else {
            config.get(REST_ADDRESS_KEY).map(str::to_string).unwrap_or(service)
        };
        let scheme = if config.rest_tls_enabled() { "https" } else { "http" };
        format!("{scheme}://{host}:{}", manifests::rest_port(config))
    }

    /// Files of the configuration directory, with the main file rendered
    /// from the effective configuration
    async fn configuration_files(config: &RuntimeConfig) -> Result<BTreeMap<String, String>> {
        let mut files = BTreeMap::new();
        if let Some(dir) = config.conf_dir() {
            let mut entries = tokio::fs::read_dir(dir)
                .await
                .map_err(|e| Error::internal("configuration_files", e.to_string()))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::internal("configuration_files", e.to_string()))?
            {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string)
                else {
                    continue;
                };
                let content = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| Error::internal("configuration_files", e.to_string()))?;
                files.insert(name, content);
            }
        }
        files.insert(CONF_FILE_NAME.to_string(), config.render_yaml()?);
        Ok(files)
    }

    /// Create the JobManager Deployment and everything it owns
    async fn deploy(&self, job: &FlinkJob, config: &RuntimeConfig) -> std::result::Result<(), DeployError> {
        let namespace = job.namespace().unwrap_or_default();
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);

        let jobmanager = manifests::jobmanager_deployment(job, config)?;
        let created = match deployments.create(&PostParams::default(), &jobmanager).await {
            Ok(created) => created,
            Err(kube::Error::Api(e)) if e.code == 409 => {
                return Err(DeployError::AlreadyExists(format!(
                    "deployment {}/{} already exists",
                    namespace,
                    job.name_any()
                )));
            }
            Err(e) => {
                return Err(DeployError::Failed {
                    message: format!("failed to create jobmanager deployment: {e}"),
                    cause: None,
                })
            }
        };
        let owner = manifests::owner_reference(&created);
        let params = PatchParams::apply(FIELD_MANAGER).force();

        let files = Self::configuration_files(config)
            .await
            .map_err(|e| DeployError::Failed {
                message: format!("failed to collect configuration files: {e}"),
                cause: None,
            })?;
        let config_map = manifests::config_map(job, files, owner.as_ref());
        let service = manifests::rest_service(job, config, owner.as_ref());
        let taskmanagers = manifests::taskmanager_deployment(job, config, owner.as_ref())?;

        let failed = |what: &str, e: kube::Error| DeployError::Failed {
            message: format!("failed to apply {what}: {e}"),
            cause: None,
        };

        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);
        config_maps
            .patch(&manifests::config_map_name(&job.name_any()), &params, &Patch::Apply(&config_map))
            .await
            .map_err(|e| failed("configuration", e))?;

        let services: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        services
            .patch(&manifests::rest_service_name(&job.name_any()), &params, &Patch::Apply(&service))
            .await
            .map_err(|e| failed("rest service", e))?;

        deployments
            .patch(&manifests::taskmanager_name(&job.name_any()), &params, &Patch::Apply(&taskmanagers))
            .await
            .map_err(|e| failed("taskmanager deployment", e))?;

        info!(namespace = %namespace, cluster_id = %job.name_any(), "Application cluster deployed");

        // The REST client needs a keystore when TLS is on; report it the way
        // the cluster client would, after the cluster was already created.
        if config.rest_tls_enabled() && config.get(REST_SSL_KEYSTORE_KEY).is_none() {
            return Err(DeployError::wrapping(
                "could not create the cluster client",
                DeployError::IllegalConfiguration(format!(
                    "the config option '{REST_SSL_KEYSTORE_KEY}' is missing"
                )),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkloadCapabilities<FlinkJob> for JobCapabilities {
    async fn prepare(&self, job: &FlinkJob, scratch: &Path) -> Result<RuntimeConfig> {
        let mut config = RuntimeConfig::from_flink_conf(&job.spec.flink_conf);
        manifests::apply_cluster_defaults(&mut config, job);

        for (name, content) in &job.spec.additional_conf_files {
            if name == CONF_FILE_NAME || name.contains('/') {
                return Err(Error::internal(
                    "prepare",
                    format!("additional configuration file '{name}' is not allowed"),
                ));
            }
            tokio::fs::write(scratch.join(name), content)
                .await
                .map_err(|e| Error::internal("prepare", e.to_string()))?;
        }
        tokio::fs::write(scratch.join(CONF_FILE_NAME), config.render_yaml()?)
            .await
            .map_err(|e| Error::internal("prepare", e.to_string()))?;

        debug!(key = %job.key(), dir = %scratch.display(), "Configuration materialized");
        Ok(config.with_conf_dir(scratch))
    }

    async fn submit(&self, job: &FlinkJob, config: &RuntimeConfig) -> Result<()> {
        self.deploy(job, config).await.map_err(|source| Error::Deploy {
            key: job.key().to_string(),
            source,
        })
    }

    async fn connect(
        &self,
        job: &FlinkJob,
        config: &RuntimeConfig,
    ) -> Result<Box<dyn ManagementClient>> {
        let client = RestManagementClient::new(Self::rest_base_url(job, config))?;
        debug!(key = %job.key(), base_url = %client.base_url(), "Connecting to management endpoint");
        Ok(Box::new(client))
    }

    async fn delete_workload(&self, job: &FlinkJob) -> Result<bool> {
        delete_deployment_foreground(
            &self.client,
            &job.namespace().unwrap_or_default(),
            &job.name_any(),
        )
        .await
    }

    async fn clean_high_availability(&self, job: &FlinkJob) -> Result<()> {
        clean_high_availability_config_maps(
            &self.client,
            &job.namespace().unwrap_or_default(),
            &job.name_any(),
        )
        .await
    }
}
