//! nimbus-core — shared foundations for the Nimbus control plane.
//!
//! Holds the pieces every other crate leans on: the operator
//! configuration file, instance IP allocation, and duration-string
//! parsing. Deliberately free of async and I/O beyond reading the
//! config file.

pub mod config;
pub mod duration;
pub mod ipam;

pub use config::{ConfigError, DeploymentConfig, NodeClientConfig, OperatorConfig, ScalingConfig};
pub use duration::parse_duration;
pub use ipam::{IpAllocator, UlaAllocator};
