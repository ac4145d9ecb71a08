//! NATS JetStream integration for the NoETL Workflow Engine.
//!
//! Action requests go out to workers on a JetStream subject; workflow and
//! task state events are published best-effort.

pub mod publisher;

pub use publisher::{NatsError, NatsPublisher};
