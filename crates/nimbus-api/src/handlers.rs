//! REST API handlers.
//!
//! Each handler reads/writes via the [`Store`] and returns JSON.
//! Failed store calls map onto the error envelope; illegal state
//! transitions surface as the store's `conflict` kind, not as logic
//! here.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::warn;

use nimbus_store::{
    DeploymentStatus, ImageRepository, ImageStatus, InstanceResources, InstanceState, NewInstance,
    NodeResources, NodeState, StoreError,
};

use crate::ApiState;

/// The error envelope: `{"error": "<kind>", "message": "<human>"}`.
#[derive(serde::Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

fn error_response(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: kind,
            message: message.into(),
        }),
    )
        .into_response()
}

fn store_error(e: StoreError) -> Response {
    if e.is_not_found() {
        error_response(StatusCode::NOT_FOUND, "not_found", e.to_string())
    } else if e.is_conflict() {
        error_response(StatusCode::CONFLICT, "conflict", e.to_string())
    } else {
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string())
    }
}

// ── Health ─────────────────────────────────────────────────────

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "healthy"}))
}

// ── Nodes ──────────────────────────────────────────────────────

/// Body of `POST /api/v1/nodes`.
#[derive(serde::Deserialize)]
pub struct RegisterNode {
    pub region_code: String,
    pub hostname: String,
    pub ip_address: String,
    pub resources: NodeResources,
    /// Defaults to `booting`; agents PATCH to `ready` once up.
    pub state: Option<NodeState>,
}

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> Response {
    match state.store.list_nodes() {
        Ok(nodes) => Json(nodes).into_response(),
        Err(e) => store_error(e),
    }
}

/// POST /api/v1/nodes
pub async fn register_node(
    State(state): State<ApiState>,
    Json(body): Json<RegisterNode>,
) -> Response {
    if body.hostname.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "invalid", "hostname must not be empty");
    }
    let region = match state.store.region_by_code(&body.region_code) {
        Ok(region) => region,
        Err(e) => return store_error(e),
    };
    match state.store.create_node(
        &region.id,
        &body.hostname,
        &body.ip_address,
        body.state.unwrap_or(NodeState::Booting),
        body.resources,
    ) {
        Ok(node) => (StatusCode::CREATED, Json(node)).into_response(),
        Err(e) => store_error(e),
    }
}

/// GET /api/v1/nodes/{id}
pub async fn get_node(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.store.get_node(&id) {
        Ok(node) => Json(node).into_response(),
        Err(e) => store_error(e),
    }
}

/// Body of `PATCH /api/v1/nodes/{id}`.
#[derive(serde::Deserialize)]
pub struct PatchNode {
    pub state: NodeState,
}

/// PATCH /api/v1/nodes/{id}
pub async fn patch_node(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<PatchNode>,
) -> Response {
    match state.store.node_set_state(&id, body.state) {
        Ok(node) => Json(node).into_response(),
        Err(e) => store_error(e),
    }
}

// ── Instances ──────────────────────────────────────────────────

/// Query filters for `GET /api/v1/instances`.
#[derive(serde::Deserialize, Default)]
pub struct InstanceFilters {
    pub state: Option<InstanceState>,
    pub node_id: Option<String>,
}

/// GET /api/v1/instances
pub async fn list_instances(
    State(state): State<ApiState>,
    Query(filters): Query<InstanceFilters>,
) -> Response {
    let result = match (&filters.state, &filters.node_id) {
        (Some(s), _) => state.store.instances_by_state(*s),
        (None, Some(node_id)) => state.store.instances_by_node(node_id),
        (None, None) => state.store.list_instances(),
    };
    match result {
        Ok(instances) => {
            let instances: Vec<_> = match &filters.node_id {
                Some(node_id) => instances
                    .into_iter()
                    .filter(|i| &i.node_id == node_id)
                    .collect(),
                None => instances,
            };
            Json(instances).into_response()
        }
        Err(e) => store_error(e),
    }
}

/// Body of `POST /api/v1/instances`.
#[derive(serde::Deserialize)]
pub struct CreateInstance {
    pub deployment_id: String,
    pub region_id: String,
    pub node_id: String,
    pub image_id: String,
    pub resources: InstanceResources,
    pub default_port: u16,
    pub ip_address: String,
    #[serde(default)]
    pub environment_variables: HashMap<String, String>,
}

/// POST /api/v1/instances
pub async fn create_instance(
    State(state): State<ApiState>,
    Json(body): Json<CreateInstance>,
) -> Response {
    match state.store.create_instance(
        &NewInstance {
            deployment_id: body.deployment_id,
            region_id: body.region_id,
            node_id: body.node_id,
            image_id: body.image_id,
            resources: body.resources,
            default_port: body.default_port,
            ip_address: body.ip_address,
            environment_variables: body.environment_variables,
        },
        InstanceState::Pending,
    ) {
        Ok(instance) => (StatusCode::CREATED, Json(instance)).into_response(),
        Err(e) => store_error(e),
    }
}

/// GET /api/v1/instances/{id}
pub async fn get_instance(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.store.get_instance(&id) {
        Ok(instance) => Json(instance).into_response(),
        Err(e) => store_error(e),
    }
}

/// Body of `PATCH /api/v1/instances/{id}` — node agents report state
/// transitions through this.
#[derive(serde::Deserialize)]
pub struct PatchInstance {
    pub state: InstanceState,
}

/// PATCH /api/v1/instances/{id}
pub async fn patch_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<PatchInstance>,
) -> Response {
    match state.store.instance_set_state(&id, body.state) {
        Ok(instance) => Json(instance).into_response(),
        Err(e) => store_error(e),
    }
}

/// DELETE /api/v1/instances/{id}
///
/// Marks the instance `terminating`; the scaling engine's sweep stops
/// the guest and finalizes.
pub async fn terminate_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Response {
    match state.store.instance_set_state(&id, InstanceState::Terminating) {
        Ok(instance) => Json(instance).into_response(),
        Err(e) => store_error(e),
    }
}

// ── Images ─────────────────────────────────────────────────────

/// Body of `POST /api/v1/images`.
#[derive(serde::Deserialize)]
pub struct RegisterImage {
    pub name: String,
    pub repository: ImageRepository,
}

/// GET /api/v1/images
pub async fn list_images(State(state): State<ApiState>) -> Response {
    match state.store.list_images() {
        Ok(images) => Json(images).into_response(),
        Err(e) => store_error(e),
    }
}

/// POST /api/v1/images
pub async fn register_image(
    State(state): State<ApiState>,
    Json(body): Json<RegisterImage>,
) -> Response {
    if body.name.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "invalid", "name must not be empty");
    }
    match state.store.create_image(&body.name, body.repository) {
        Ok(image) => (StatusCode::CREATED, Json(image)).into_response(),
        Err(e) => store_error(e),
    }
}

/// Body of `PATCH /api/v1/images/{id}/status` — the builder reports
/// its outcome here.
#[derive(serde::Deserialize)]
pub struct PatchImageStatus {
    pub status: ImageStatus,
    pub image_hash: Option<String>,
    pub image_size: Option<u64>,
}

/// PATCH /api/v1/images/{id}/status
pub async fn patch_image_status(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<PatchImageStatus>,
) -> Response {
    if body.status == ImageStatus::Ready && body.image_hash.is_none() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid",
            "a ready image requires image_hash",
        );
    }
    match state
        .store
        .image_set_status(&id, body.status, body.image_hash, body.image_size)
    {
        Ok(image) => Json(image).into_response(),
        Err(e) => store_error(e),
    }
}

// ── Deployments ────────────────────────────────────────────────

/// Body of `POST /api/v1/deployments`.
#[derive(serde::Deserialize)]
pub struct CreateDeployment {
    pub project_id: String,
    pub image_id: String,
    /// Defaults to the operator's `default_min_instances`.
    pub min_instances: Option<u32>,
    pub deployment_url: String,
}

/// GET /api/v1/deployments
pub async fn list_deployments(State(state): State<ApiState>) -> Response {
    match state.store.list_deployments() {
        Ok(deployments) => Json(deployments).into_response(),
        Err(e) => store_error(e),
    }
}

/// POST /api/v1/deployments
///
/// Creates the deployment and hands its ID to the workflow engine.
pub async fn create_deployment(
    State(state): State<ApiState>,
    Json(body): Json<CreateDeployment>,
) -> Response {
    if body.project_id.is_empty() || body.deployment_url.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid",
            "project_id and deployment_url must not be empty",
        );
    }
    let min = body.min_instances.unwrap_or(state.default_min_instances);
    match state
        .store
        .create_deployment(&body.project_id, &body.image_id, min, &body.deployment_url)
    {
        Ok(deployment) => {
            if let Err(e) = state.workflow_tx.try_send(deployment.id.clone()) {
                warn!(deployment = %deployment.id, error = %e, "workflow trigger dropped");
            }
            (StatusCode::CREATED, Json(deployment)).into_response()
        }
        Err(e) => store_error(e),
    }
}

/// GET /api/v1/deployments/{id}
pub async fn get_deployment(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.store.get_deployment(&id) {
        Ok(deployment) => Json(deployment).into_response(),
        Err(e) => store_error(e),
    }
}

/// Body of `PATCH /api/v1/deployments/{id}`.
#[derive(serde::Deserialize)]
pub struct PatchDeployment {
    pub status: DeploymentStatus,
    pub activated_at: Option<u64>,
}

/// PATCH /api/v1/deployments/{id}
pub async fn patch_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<PatchDeployment>,
) -> Response {
    match state
        .store
        .deployment_set_status(&id, body.status, body.activated_at)
    {
        Ok(deployment) => Json(deployment).into_response(),
        Err(e) => store_error(e),
    }
}

/// POST /api/v1/deployments/{id}/deploy
///
/// Operational re-trigger of the workflow (no-op if the deployment is
/// already deploying or active).
pub async fn trigger_deploy(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let deployment = match state.store.get_deployment(&id) {
        Ok(deployment) => deployment,
        Err(e) => return store_error(e),
    };
    if let Err(e) = state.workflow_tx.try_send(deployment.id.clone()) {
        warn!(deployment = %deployment.id, error = %e, "workflow trigger dropped");
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "internal",
            "workflow queue unavailable",
        );
    }
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "queued", "deployment_id": deployment.id})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_store::{NodeKind, Store};
    use tokio::sync::mpsc;

    struct Fixture {
        state: ApiState,
        workflow_rx: mpsc::Receiver<String>,
    }

    fn fixture() -> Fixture {
        let store = Store::open_in_memory().unwrap();
        store.create_region("eu", "eu-central-1", "de").unwrap();
        let (workflow_tx, workflow_rx) = mpsc::channel(8);
        Fixture {
            state: ApiState {
                store,
                workflow_tx,
                default_min_instances: 3,
            },
            workflow_rx,
        }
    }

    fn worker_resources() -> NodeResources {
        NodeResources {
            vcpu: 16,
            memory_mib: 32 * 1024,
            disk_gb: 200,
            kind: NodeKind::Worker,
        }
    }

    #[tokio::test]
    async fn health_is_healthy() {
        let resp = health().await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn register_node_resolves_region_code() {
        let f = fixture();
        let resp = register_node(
            State(f.state.clone()),
            Json(RegisterNode {
                region_code: "eu-central-1".to_string(),
                hostname: "worker-1".to_string(),
                ip_address: "10.0.0.1".to_string(),
                resources: worker_resources(),
                state: None,
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let nodes = f.state.store.list_nodes().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].state, NodeState::Booting);
    }

    #[tokio::test]
    async fn register_node_unknown_region_is_not_found() {
        let f = fixture();
        let resp = register_node(
            State(f.state),
            Json(RegisterNode {
                region_code: "mars-1".to_string(),
                hostname: "worker-1".to_string(),
                ip_address: "10.0.0.1".to_string(),
                resources: worker_resources(),
                state: None,
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn duplicate_hostname_is_conflict() {
        let f = fixture();
        let body = || RegisterNode {
            region_code: "eu-central-1".to_string(),
            hostname: "worker-1".to_string(),
            ip_address: "10.0.0.1".to_string(),
            resources: worker_resources(),
            state: None,
        };
        register_node(State(f.state.clone()), Json(body())).await;
        let resp = register_node(State(f.state), Json(body())).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn patch_node_state() {
        let f = fixture();
        let region = f.state.store.region_by_code("eu-central-1").unwrap();
        let node = f
            .state
            .store
            .create_node(
                &region.id,
                "worker-1",
                "10.0.0.1",
                NodeState::Booting,
                worker_resources(),
            )
            .unwrap();

        let resp = patch_node(
            State(f.state.clone()),
            Path(node.id.clone()),
            Json(PatchNode {
                state: NodeState::Ready,
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            f.state.store.get_node(&node.id).unwrap().state,
            NodeState::Ready
        );
    }

    fn seed_instance(f: &Fixture) -> nimbus_store::Instance {
        let region = f.state.store.region_by_code("eu-central-1").unwrap();
        let node = f
            .state
            .store
            .create_node(
                &region.id,
                &format!("worker-{}", f.state.store.list_nodes().unwrap().len() + 1),
                "10.0.0.1",
                NodeState::Ready,
                worker_resources(),
            )
            .unwrap();
        let deployment = f
            .state
            .store
            .create_deployment("proj-a", "img-000001", 3, "proj-a.nimbus.app")
            .unwrap();
        f.state
            .store
            .create_instance(
                &NewInstance {
                    deployment_id: deployment.id,
                    region_id: region.id,
                    node_id: node.id,
                    image_id: "img-000001".to_string(),
                    resources: InstanceResources {
                        vcpu: 1,
                        memory_mib: 1024,
                    },
                    default_port: 8080,
                    ip_address: "fd00::1".to_string(),
                    environment_variables: HashMap::new(),
                },
                InstanceState::Pending,
            )
            .unwrap()
    }

    #[tokio::test]
    async fn instance_state_filter() {
        let f = fixture();
        let instance = seed_instance(&f);
        f.state
            .store
            .instance_set_state(&instance.id, InstanceState::Creating)
            .unwrap();

        let resp = list_instances(
            State(f.state.clone()),
            Query(InstanceFilters {
                state: Some(InstanceState::Creating),
                node_id: None,
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = list_instances(
            State(f.state),
            Query(InstanceFilters {
                state: Some(InstanceState::Running),
                node_id: None,
            }),
        )
        .await;
        let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let instances: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert!(instances.is_empty());
    }

    #[tokio::test]
    async fn illegal_instance_transition_is_conflict() {
        let f = fixture();
        let instance = seed_instance(&f);
        let resp = patch_instance(
            State(f.state),
            Path(instance.id),
            Json(PatchInstance {
                state: InstanceState::Stopped,
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn delete_marks_terminating() {
        let f = fixture();
        let instance = seed_instance(&f);
        let resp = terminate_instance(State(f.state.clone()), Path(instance.id.clone())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            f.state.store.get_instance(&instance.id).unwrap().state,
            InstanceState::Terminating
        );
    }

    #[tokio::test]
    async fn image_ready_requires_hash() {
        let f = fixture();
        let image = f
            .state
            .store
            .create_image(
                "api",
                ImageRepository {
                    url: "https://github.com/acme/api".to_string(),
                    reference: "main".to_string(),
                },
            )
            .unwrap();

        let resp = patch_image_status(
            State(f.state.clone()),
            Path(image.id.clone()),
            Json(PatchImageStatus {
                status: ImageStatus::Ready,
                image_hash: None,
                image_size: None,
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = patch_image_status(
            State(f.state),
            Path(image.id),
            Json(PatchImageStatus {
                status: ImageStatus::Ready,
                image_hash: Some("sha256:abc".to_string()),
                image_size: Some(42),
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_deployment_defaults_min_and_triggers_workflow() {
        let mut f = fixture();
        let resp = create_deployment(
            State(f.state.clone()),
            Json(CreateDeployment {
                project_id: "proj-a".to_string(),
                image_id: "img-000001".to_string(),
                min_instances: None,
                deployment_url: "proj-a.nimbus.app".to_string(),
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let deployments = f.state.store.list_deployments().unwrap();
        assert_eq!(deployments[0].min_instances, 3);

        // The workflow engine got the ID.
        let queued = f.workflow_rx.try_recv().unwrap();
        assert_eq!(queued, deployments[0].id);
    }

    #[tokio::test]
    async fn create_deployment_validates_body() {
        let f = fixture();
        let resp = create_deployment(
            State(f.state),
            Json(CreateDeployment {
                project_id: String::new(),
                image_id: "img-000001".to_string(),
                min_instances: Some(3),
                deployment_url: "proj-a.nimbus.app".to_string(),
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn not_found_envelope_shape() {
        let f = fixture();
        let resp = get_deployment(State(f.state), Path("dep-999999".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "not_found");
        assert!(json["message"].as_str().unwrap().contains("dep-999999"));
    }

    #[tokio::test]
    async fn trigger_deploy_queues_existing_deployment() {
        let mut f = fixture();
        let deployment = f
            .state
            .store
            .create_deployment("proj-a", "img-000001", 3, "proj-a.nimbus.app")
            .unwrap();

        let resp = trigger_deploy(State(f.state.clone()), Path(deployment.id.clone())).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(f.workflow_rx.try_recv().unwrap(), deployment.id);

        let resp = trigger_deploy(State(f.state), Path("dep-999999".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    mod router {
        use super::*;
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        #[tokio::test]
        async fn full_router_round_trip() {
            let f = fixture();
            let router = crate::build_router(f.state);

            let resp = router
                .clone()
                .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);

            let body = serde_json::json!({
                "project_id": "proj-a",
                "image_id": "img-000001",
                "deployment_url": "proj-a.nimbus.app",
            });
            let resp = router
                .clone()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/api/v1/deployments")
                        .header("content-type", "application/json")
                        .body(Body::from(serde_json::to_vec(&body).unwrap()))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::CREATED);

            let resp = router
                .oneshot(
                    Request::builder()
                        .uri("/api/v1/deployments")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }

        #[tokio::test]
        async fn instances_filter_via_query_string() {
            let f = fixture();
            seed_instance(&f);
            let router = crate::build_router(f.state);

            let resp = router
                .oneshot(
                    Request::builder()
                        .uri("/api/v1/instances?state=pending")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
                .await
                .unwrap();
            let instances: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
            assert_eq!(instances.len(), 1);
        }
    }
}
