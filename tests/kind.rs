//! Integration tests against a live cluster
//!
//! These tests require a Kubernetes cluster (kind works) reachable through the
//! current kubeconfig. They are ignored by default and can be run with:
//!
//! ```bash
//! cargo test --test kind -- --ignored
//! ```

use std::time::Duration;

use flork_common::crd::{FlinkJob, FlinkJobSpec, FlinkSession, FlorkPhase, FlorkStatus};
use flork_common::kube_utils::create_client;
use flork_common::leader_election::{KubeLeaseStore, LeaseStore};
use flork_common::FIELD_MANAGER;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, CustomResourceExt, ResourceExt};

const NAMESPACE: &str = "default";

async fn client_with_crds() -> Client {
    let client = create_client(None).await.expect("cluster reachable");
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    for crd in [FlinkJob::crd(), FlinkSession::crd()] {
        crds.patch(&crd.name_any(), &params, &Patch::Apply(&crd))
            .await
            .expect("CRD applied");
    }
    // give the API server time to serve the new kinds
    tokio::time::sleep(Duration::from_secs(2)).await;
    client
}

/// Story: the status subresource accepts the merge patches the engine writes
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn status_merge_patch_round_trips() {
    let client = client_with_crds().await;
    let api: Api<FlinkJob> = Api::namespaced(client, NAMESPACE);
    let name = "flork-it-status";
    let _ = api.delete(name, &DeleteParams::default()).await;

    let created = api
        .create(&PostParams::default(), &FlinkJob::new(name, FlinkJobSpec::default()))
        .await
        .expect("job created");
    assert_eq!(created.metadata.generation, Some(1));

    let status = FlorkStatus {
        flork_phase: FlorkPhase::Completed,
        generation_during_last_transition: Some(1),
        known_savepoint_path: Some("s3://sp/savepoint-1".to_string()),
    };
    api.patch_status(
        name,
        &PatchParams::default(),
        &Patch::Merge(&serde_json::json!({ "status": status })),
    )
    .await
    .expect("status patched");

    let cleared = FlorkStatus {
        known_savepoint_path: None,
        ..status.clone()
    };
    let stored = api
        .patch_status(
            name,
            &PatchParams::default(),
            &Patch::Merge(&serde_json::json!({ "status": cleared })),
        )
        .await
        .expect("status patched");

    assert_eq!(stored.status, Some(cleared));
    assert_eq!(stored.metadata.generation, Some(1), "status writes keep the generation");

    api.delete(name, &DeleteParams::default())
        .await
        .expect("job deleted");
}

/// Story: two replicas racing for a lease, only one wins
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn lease_creation_is_exclusive() {
    let client = create_client(None).await.expect("cluster reachable");
    let store = KubeLeaseStore::new(client, NAMESPACE);
    let name = "flork-lease-it-exclusive";
    store.delete(name).await.expect("stale lease removed");

    let lease = |holder: &str| Lease {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(holder.to_string()),
            lease_duration_seconds: Some(15),
            ..Default::default()
        }),
    };

    assert!(store.create(&lease("pod-0")).await.expect("first create"));
    assert!(!store.create(&lease("pod-1")).await.expect("second create"));

    let stored = store.get(name).await.expect("lease read").expect("lease exists");
    assert_eq!(
        stored.spec.and_then(|s| s.holder_identity).as_deref(),
        Some("pod-0")
    );

    // a replace with a stale resourceVersion loses
    let mut stale = lease("pod-1");
    stale.metadata.resource_version = Some("1".to_string());
    assert!(!store.replace(&stale).await.expect("replace attempted"));

    store.delete(name).await.expect("lease deleted");
    assert!(store.get(name).await.expect("lease read").is_none());
}
