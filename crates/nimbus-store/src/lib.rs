//! nimbus-store — persistence gateway for the Nimbus control plane.
//!
//! Backed by [redb](https://docs.rs/redb). All domain entities are
//! JSON-serialized into `&[u8]` value columns; the deployment↔instance
//! association table uses `{deployment_id}:{instance_id}` keys for
//! prefix scans.
//!
//! The [`Store`] is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`) and is shared across every engine in the process.
//! It is the only durable shared state: the engines' in-memory maps
//! are advisory and rebuilt from here on restart.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use store::Store;
pub use types::*;
