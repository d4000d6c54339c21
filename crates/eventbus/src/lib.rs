//! Durable pub/sub core for the frolf bot platform, layered on a JetStream-style broker.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Deployment roles and the streams each one owns.
pub mod app;

/// Capability traits implemented by broker backends.
pub mod broker;

/// The facade tying every subsystem together.
pub mod bus;

/// Bus configuration loaded from TOML.
pub mod config;

/// Durable consumer creation, caching and drift validation.
pub mod consumers;

/// Future-dated publishing with restart recovery.
pub mod delayed;

/// Handler-facing message envelope.
pub mod envelope;

mod error;

/// Liveness probes for the broker connection and stream plane.
pub mod health;

/// Prometheus counters for the bus.
pub mod metrics;

/// Publishing with role authorization.
pub mod publisher;

/// Per-topic consumer settings with layered overrides.
pub mod registry;

/// Stream topology provisioning.
pub mod streams;

/// Pull-based subscription engine.
pub mod subscriber;

#[cfg(test)]
mod testing;

/// Topic to stream routing and subject helpers.
pub mod topic;

/// Trace context propagation through envelope metadata.
pub mod trace;

pub use app::AppType;
pub use bus::EventBus;
pub use config::EventBusConfig;
pub use envelope::Envelope;
pub use error::{Error, Result};
