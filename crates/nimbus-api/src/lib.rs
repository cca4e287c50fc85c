//! nimbus-api — REST surface of the control plane.
//!
//! A thin layer: handlers validate bodies and delegate everything
//! stateful to the store and the workflow engine. State-machine rules
//! live behind the store's transition guards, and deployment creation
//! hands the new ID to the workflow engine over a channel rather than
//! holding the engine itself.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/health` | Liveness |
//! | GET/POST | `/api/v1/nodes` | List; register a node |
//! | GET/PATCH | `/api/v1/nodes/{id}` | Get; update state |
//! | GET/POST | `/api/v1/instances` | List (`state`, `node_id` filters); create |
//! | GET/PATCH/DELETE | `/api/v1/instances/{id}` | Get; update state; terminate |
//! | GET/POST | `/api/v1/images` | List; register |
//! | PATCH | `/api/v1/images/{id}/status` | Builder reports ready/failed |
//! | GET/POST | `/api/v1/deployments` | List; create (triggers workflow) |
//! | GET/PATCH | `/api/v1/deployments/{id}` | Get; status transition |
//! | POST | `/api/v1/deployments/{id}/deploy` | Re-trigger the workflow |
//!
//! Errors use the envelope `{"error": "<kind>", "message": "<human>"}`
//! with kinds `not_found`, `conflict`, `invalid`, and `internal`.

pub mod handlers;

use axum::routing::{get, patch, post};
use axum::Router;
use tokio::sync::mpsc;

use nimbus_store::Store;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    /// Deployment IDs to hand to the workflow engine.
    pub workflow_tx: mpsc::Sender<String>,
    /// Applied when a create-deployment body omits `min_instances`.
    pub default_min_instances: u32,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api = Router::new()
        .route("/nodes", get(handlers::list_nodes).post(handlers::register_node))
        .route(
            "/nodes/{id}",
            get(handlers::get_node).patch(handlers::patch_node),
        )
        .route(
            "/instances",
            get(handlers::list_instances).post(handlers::create_instance),
        )
        .route(
            "/instances/{id}",
            get(handlers::get_instance)
                .patch(handlers::patch_instance)
                .delete(handlers::terminate_instance),
        )
        .route("/images", get(handlers::list_images).post(handlers::register_image))
        .route("/images/{id}/status", patch(handlers::patch_image_status))
        .route(
            "/deployments",
            get(handlers::list_deployments).post(handlers::create_deployment),
        )
        .route(
            "/deployments/{id}",
            get(handlers::get_deployment).patch(handlers::patch_deployment),
        )
        .route("/deployments/{id}/deploy", post(handlers::trigger_deploy))
        .with_state(state);

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", api)
}
