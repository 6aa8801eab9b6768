//! Kubernetes objects making up a standalone application cluster
//!
//! The JobManager Deployment carries the cluster id as its name. Every
//! other object is owned by it, so a foreground deletion of that single
//! Deployment tears the whole cluster down.

use std::collections::BTreeMap;

use flork_common::crd::FlinkJob;
use flork_common::DeployError;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use super::RuntimeConfig;

/// Name of the main configuration file
pub(super) const CONF_FILE_NAME: &str = "flink-conf.yaml";
const CONF_MOUNT_PATH: &str = "/opt/flink/conf";
const CONF_VOLUME: &str = "flink-config-volume";

/// Container that runs the runtime process in every pod
pub(super) const MAIN_CONTAINER: &str = "flink-main-container";

const IMAGE_KEY: &str = "kubernetes.container.image";
const DEFAULT_IMAGE: &str = "flink:1.20";

/// Port key of the management REST endpoint
pub(super) const REST_PORT_KEY: &str = "rest.port";
/// Address key used when the in-cluster service is not preferred
pub(super) const REST_ADDRESS_KEY: &str = "rest.address";
const DEFAULT_REST_PORT: i32 = 8081;
const RPC_ADDRESS_KEY: &str = "jobmanager.rpc.address";
const RPC_PORT_KEY: &str = "jobmanager.rpc.port";
const DEFAULT_RPC_PORT: i32 = 6123;
const BLOB_PORT_KEY: &str = "blob.server.port";
const DEFAULT_BLOB_PORT: i32 = 6124;
const CLUSTER_ID_KEY: &str = "kubernetes.cluster-id";
const NAMESPACE_KEY: &str = "kubernetes.namespace";
const PARALLELISM_KEY: &str = "parallelism.default";
const SLOTS_KEY: &str = "taskmanager.numberOfTaskSlots";

const COMPONENT_JOBMANAGER: &str = "jobmanager";
const COMPONENT_TASKMANAGER: &str = "taskmanager";

/// Labels shared by all objects of a cluster, plus its component
pub(super) fn labels(cluster_id: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), cluster_id.to_string()),
        ("component".to_string(), component.to_string()),
        ("type".to_string(), "flink-native-kubernetes".to_string()),
    ])
}

/// Service exposing the management REST endpoint
pub(super) fn rest_service_name(cluster_id: &str) -> String {
    format!("{cluster_id}-rest")
}

pub(super) fn config_map_name(cluster_id: &str) -> String {
    format!("flink-config-{cluster_id}")
}

pub(super) fn taskmanager_name(cluster_id: &str) -> String {
    format!("{cluster_id}-taskmanager")
}

fn port(config: &RuntimeConfig, key: &str, default: i32) -> i32 {
    config
        .get(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Port of the management REST endpoint
pub(super) fn rest_port(config: &RuntimeConfig) -> i32 {
    port(config, REST_PORT_KEY, DEFAULT_REST_PORT)
}

/// Fill in the cluster wiring the declared configuration left out
pub(super) fn apply_cluster_defaults(config: &mut RuntimeConfig, job: &FlinkJob) {
    let cluster_id = job.name_any();
    config.set_default(CLUSTER_ID_KEY, cluster_id.clone());
    config.set_default(NAMESPACE_KEY, job.namespace().unwrap_or_default());
    config.set_default(RPC_ADDRESS_KEY, rest_service_name(&cluster_id));
    config.set_default(RPC_PORT_KEY, DEFAULT_RPC_PORT.to_string());
    config.set_default(REST_PORT_KEY, DEFAULT_REST_PORT.to_string());
    config.set_default(BLOB_PORT_KEY, DEFAULT_BLOB_PORT.to_string());
    config.set_default(SLOTS_KEY, "1");
}

/// TaskManagers needed to offer `parallelism.default` slots
pub(super) fn taskmanager_replicas(config: &RuntimeConfig) -> i32 {
    let parallelism: i32 = config
        .get(PARALLELISM_KEY)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(1);
    let slots: i32 = config
        .get(SLOTS_KEY)
        .and_then(|v| v.trim().parse().ok())
        .filter(|s| *s > 0)
        .unwrap_or(1);
    ((parallelism + slots - 1) / slots).max(1)
}

/// Reference making an object a dependent of `owner`
pub(super) fn owner_reference(owner: &Deployment) -> Option<OwnerReference> {
    Some(OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: "Deployment".to_string(),
        name: owner.metadata.name.clone()?,
        uid: owner.metadata.uid.clone()?,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

fn metadata(
    name: String,
    job: &FlinkJob,
    labels: BTreeMap<String, String>,
    owner: Option<&OwnerReference>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: job.namespace(),
        labels: Some(labels),
        owner_references: owner.map(|o| vec![o.clone()]),
        ..Default::default()
    }
}

fn jobmanager_args(job: &FlinkJob) -> Vec<String> {
    let mut args = vec!["standalone-job".to_string()];
    if let Some(class_name) = &job.spec.job_class_name {
        args.push("--job-classname".to_string());
        args.push(class_name.clone());
    }
    args.extend(job.spec.job_args.iter().cloned());
    args
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        ..Default::default()
    }
}

/// Pod spec from the declared override with the main container wired in
fn pod_spec(
    base: Option<&serde_json::Value>,
    cluster_id: &str,
    config: &RuntimeConfig,
    args: Vec<String>,
    ports: Vec<ContainerPort>,
) -> Result<PodSpec, DeployError> {
    let mut spec: PodSpec = match base {
        Some(value) => {
            let mut value = value.clone();
            if let Some(obj) = value.as_object_mut() {
                obj.entry("containers")
                    .or_insert_with(|| serde_json::Value::Array(Vec::new()));
            }
            serde_json::from_value(value).map_err(|e| {
                DeployError::IllegalConfiguration(format!("invalid pod spec override: {e}"))
            })?
        }
        None => PodSpec::default(),
    };

    let position = spec.containers.iter().position(|c| c.name == MAIN_CONTAINER);
    let index = match position {
        Some(index) => index,
        None => {
            spec.containers.push(Container {
                name: MAIN_CONTAINER.to_string(),
                ..Default::default()
            });
            spec.containers.len() - 1
        }
    };
    let main = &mut spec.containers[index];
    if main.image.is_none() {
        main.image = Some(config.get(IMAGE_KEY).unwrap_or(DEFAULT_IMAGE).to_string());
    }
    main.args = Some(args);
    main.ports.get_or_insert_with(Vec::new).extend(ports);
    main.volume_mounts
        .get_or_insert_with(Vec::new)
        .push(VolumeMount {
            name: CONF_VOLUME.to_string(),
            mount_path: CONF_MOUNT_PATH.to_string(),
            ..Default::default()
        });

    let volume: Volume = serde_json::from_value(serde_json::json!({
        "name": CONF_VOLUME,
        "configMap": { "name": config_map_name(cluster_id) }
    }))
    .map_err(|e| DeployError::IllegalConfiguration(format!("invalid config volume: {e}")))?;
    spec.volumes.get_or_insert_with(Vec::new).push(volume);

    Ok(spec)
}

fn deployment(
    name: String,
    job: &FlinkJob,
    labels: BTreeMap<String, String>,
    replicas: i32,
    pod: PodSpec,
    owner: Option<&OwnerReference>,
) -> Deployment {
    Deployment {
        metadata: metadata(name, job, labels.clone(), owner),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// JobManager Deployment, named after the cluster id
pub(super) fn jobmanager_deployment(
    job: &FlinkJob,
    config: &RuntimeConfig,
) -> Result<Deployment, DeployError> {
    let cluster_id = job.name_any();
    let ports = vec![
        container_port("rest", rest_port(config)),
        container_port("rpc", port(config, RPC_PORT_KEY, DEFAULT_RPC_PORT)),
        container_port("blob", port(config, BLOB_PORT_KEY, DEFAULT_BLOB_PORT)),
    ];
    let pod = pod_spec(
        job.spec.job_manager_pod_spec.as_ref(),
        &cluster_id,
        config,
        jobmanager_args(job),
        ports,
    )?;
    Ok(deployment(
        cluster_id.clone(),
        job,
        labels(&cluster_id, COMPONENT_JOBMANAGER),
        1,
        pod,
        None,
    ))
}

/// TaskManager Deployment owned by the JobManager Deployment
pub(super) fn taskmanager_deployment(
    job: &FlinkJob,
    config: &RuntimeConfig,
    owner: Option<&OwnerReference>,
) -> Result<Deployment, DeployError> {
    let cluster_id = job.name_any();
    let pod = pod_spec(
        job.spec.task_manager_pod_spec.as_ref(),
        &cluster_id,
        config,
        vec!["taskmanager".to_string()],
        Vec::new(),
    )?;
    Ok(deployment(
        taskmanager_name(&cluster_id),
        job,
        labels(&cluster_id, COMPONENT_TASKMANAGER),
        taskmanager_replicas(config),
        pod,
        owner,
    ))
}

/// Service in front of the JobManager
pub(super) fn rest_service(
    job: &FlinkJob,
    config: &RuntimeConfig,
    owner: Option<&OwnerReference>,
) -> Service {
    let cluster_id = job.name_any();
    let service_port = |name: &str, port: i32| ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        ..Default::default()
    };
    Service {
        metadata: metadata(
            rest_service_name(&cluster_id),
            job,
            labels(&cluster_id, COMPONENT_JOBMANAGER),
            owner,
        ),
        spec: Some(ServiceSpec {
            selector: Some(labels(&cluster_id, COMPONENT_JOBMANAGER)),
            ports: Some(vec![
                service_port("rest", rest_port(config)),
                service_port("rpc", port(config, RPC_PORT_KEY, DEFAULT_RPC_PORT)),
                service_port("blob", port(config, BLOB_PORT_KEY, DEFAULT_BLOB_PORT)),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// ConfigMap holding the configuration files mounted into every pod
pub(super) fn config_map(
    job: &FlinkJob,
    files: BTreeMap<String, String>,
    owner: Option<&OwnerReference>,
) -> ConfigMap {
    let cluster_id = job.name_any();
    ConfigMap {
        metadata: metadata(
            config_map_name(&cluster_id),
            job,
            labels(&cluster_id, COMPONENT_JOBMANAGER),
            owner,
        ),
        data: Some(files),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flork_common::crd::FlinkJobSpec;

    fn job(spec: FlinkJobSpec) -> FlinkJob {
        let mut job = FlinkJob::new("wordcount", spec);
        job.metadata.namespace = Some("analytics".to_string());
        job
    }

    fn config_for(job: &FlinkJob) -> RuntimeConfig {
        let mut config = RuntimeConfig::from_flink_conf(&job.spec.flink_conf);
        apply_cluster_defaults(&mut config, job);
        config
    }

    #[test]
    fn defaults_wire_cluster_to_its_service() {
        let job = job(FlinkJobSpec::default());
        let config = config_for(&job);
        assert_eq!(config.get("kubernetes.cluster-id"), Some("wordcount"));
        assert_eq!(config.get("jobmanager.rpc.address"), Some("wordcount-rest"));
        assert_eq!(rest_port(&config), 8081);
    }

    #[test]
    fn jobmanager_runs_the_declared_class() {
        let job = job(FlinkJobSpec {
            job_class_name: Some("com.example.WordCount".to_string()),
            job_args: vec!["--input".to_string(), "s3://in".to_string()],
            ..Default::default()
        });
        let deployment = jobmanager_deployment(&job, &config_for(&job)).unwrap();

        assert_eq!(deployment.metadata.name.as_deref(), Some("wordcount"));
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        let main = &pod.containers[0];
        assert_eq!(main.name, MAIN_CONTAINER);
        assert_eq!(
            main.args.clone().unwrap(),
            vec![
                "standalone-job",
                "--job-classname",
                "com.example.WordCount",
                "--input",
                "s3://in"
            ]
        );
        assert_eq!(pod.volumes.unwrap().len(), 1);
    }

    #[test]
    fn pod_override_keeps_sidecars_and_image() {
        let job = job(FlinkJobSpec {
            job_manager_pod_spec: Some(serde_json::json!({
                "serviceAccountName": "flink",
                "containers": [
                    {"name": "flink-main-container", "image": "registry/flink:custom"},
                    {"name": "log-shipper", "image": "fluent-bit"}
                ]
            })),
            ..Default::default()
        });
        let deployment = jobmanager_deployment(&job, &config_for(&job)).unwrap();
        let pod = deployment.spec.unwrap().template.spec.unwrap();

        assert_eq!(pod.service_account_name.as_deref(), Some("flink"));
        assert_eq!(pod.containers.len(), 2);
        assert_eq!(
            pod.containers[0].image.as_deref(),
            Some("registry/flink:custom")
        );
    }

    #[test]
    fn override_without_containers_is_accepted() {
        let job = job(FlinkJobSpec {
            task_manager_pod_spec: Some(serde_json::json!({"nodeSelector": {"pool": "batch"}})),
            ..Default::default()
        });
        let deployment = taskmanager_deployment(&job, &config_for(&job), None).unwrap();
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.containers.len(), 1);
        assert_eq!(pod.containers[0].image.as_deref(), Some(DEFAULT_IMAGE));
    }

    #[test]
    fn invalid_override_is_illegal_configuration() {
        let job = job(FlinkJobSpec {
            job_manager_pod_spec: Some(serde_json::json!({"containers": "nope"})),
            ..Default::default()
        });
        let err = jobmanager_deployment(&job, &config_for(&job)).unwrap_err();
        assert!(matches!(err, DeployError::IllegalConfiguration(_)));
    }

    #[test]
    fn replicas_cover_parallelism() {
        let mut config = RuntimeConfig::default();
        config.set("parallelism.default", "5");
        config.set("taskmanager.numberOfTaskSlots", "2");
        assert_eq!(taskmanager_replicas(&config), 3);
        assert_eq!(taskmanager_replicas(&RuntimeConfig::default()), 1);
    }

    #[test]
    fn dependents_are_owned_by_jobmanager() {
        let job = job(FlinkJobSpec::default());
        let mut owner = jobmanager_deployment(&job, &config_for(&job)).unwrap();
        owner.metadata.uid = Some("uid-1".to_string());
        let reference = owner_reference(&owner).unwrap();

        let service = rest_service(&job, &config_for(&job), Some(&reference));
        assert_eq!(service.metadata.name.as_deref(), Some("wordcount-rest"));
        assert_eq!(
            service.metadata.owner_references.unwrap()[0].uid,
            "uid-1"
        );
    }
}
