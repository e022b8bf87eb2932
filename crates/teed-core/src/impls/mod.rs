//! Impls - adapters for the ports.
//!
//! - **AmqpConnector**: RabbitMQ over `lapin` (production)
//! - **InMemoryBroker**: in-process broker for development and tests
//! - **CommandOperation**: an operation backed by an external program
//! - **MemoryEventSink**: records worker events

pub mod amqp;
pub mod command;
pub mod inmem_broker;
pub mod memory_sink;

pub use self::amqp::{AmqpBroker, AmqpConnector};
pub use self::command::CommandOperation;
pub use self::inmem_broker::{BrokerOp, InMemoryBroker, InMemoryConnection};
pub use self::memory_sink::MemoryEventSink;
