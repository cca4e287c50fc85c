//! Workflow engine error types.

use thiserror::Error;

use nimbus_store::{DeploymentStatus, ImageStatus};

/// Result type alias for workflow operations.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Errors that abort a workflow invocation before fan-out.
///
/// Per-region failures are not errors — they are recorded in the
/// region outcomes and only the all-regions-failed case marks the
/// deployment `failed`.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("image {image_id} is not schedulable (status {status:?})")]
    ImageNotReady {
        image_id: String,
        status: ImageStatus,
    },

    #[error("deployment {deployment_id} cannot start from status {status:?}")]
    NotStartable {
        deployment_id: String,
        status: DeploymentStatus,
    },

    #[error(transparent)]
    Store(#[from] nimbus_store::StoreError),
}
