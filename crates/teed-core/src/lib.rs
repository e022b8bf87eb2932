//! teed-core
//!
//! Core building blocks for the teed task worker: a long-running consumer
//! that takes processing tasks off a durable RabbitMQ queue, runs the
//! requested operation and reports how it went.
//!
//! # Modules
//! - **domain**: task model and state machine, operations, outcomes, events
//! - **ports**: seams to the outside (Broker, OperationHandler, Clock, EventSink)
//! - **app**: decoder, registry, dispatcher, worker loop, builder, shutdown
//! - **impls**: AMQP client, in-memory broker, command-backed operations
//! - **config**: environment-driven configuration
//! - **observability**: per-run counters
//! - **error**: errors that end a worker run

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;

pub use app::{Worker, WorkerBuilder};
pub use config::{BrokerConfig, ConfigError, WorkerConfig};
pub use error::WorkerError;
pub use observability::WorkerStats;
