//! Scaling engine error types.

use thiserror::Error;

/// Result type alias for scaling operations.
pub type ScalingResult<T> = Result<T, ScalingError>;

/// Errors that abort one tick. The run loops log these and try again
/// on the next tick; they never exit in response to one.
#[derive(Debug, Error)]
pub enum ScalingError {
    #[error(transparent)]
    Store(#[from] nimbus_store::StoreError),
}
