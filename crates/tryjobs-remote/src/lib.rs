//! Remote service clients for the try job integrator.
//!
//! Provides:
//! - `LegacyClient`: the lease-based v1 REST protocol
//! - `AsyncClient`: the token-based v2 JSON-RPC protocol
//! - `PubSubPublisher`: task updates over Pub/Sub
//! - `GerritClient`: code review lookups
//! - `BuildServiceClient`: all of the above behind `RemoteBuildService`

pub mod builds;
pub mod client;
pub mod legacy;
pub mod pubsub;
pub mod review;
mod wire;

pub use builds::AsyncClient;
pub use client::BuildServiceClient;
pub use legacy::LegacyClient;
pub use pubsub::PubSubPublisher;
pub use review::GerritClient;

pub use tryjobs_core::remote::RemoteBuildService;
