//! NATS transport for cross-instance gateway events.

pub mod client;

pub use client::{instance_subject, NatsClient, INSTANCE_SUBJECT_PREFIX};
