//! Ports - the seams between the worker and the outside world.
//!
//! - **Broker / Connector**: the durable queue (RabbitMQ in production)
//! - **OperationHandler**: the black-box processing for each operation
//! - **Clock**: time source for `processed_at`
//! - **EventSink**: where task outcomes and lifecycle events are recorded

pub mod broker;
pub mod clock;
pub mod event_sink;
pub mod operation;

pub use self::broker::{
    AckMode, Broker, BrokerError, Connector, ConsumeOptions, Consumer, Delivery, QueueSpec,
};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::{EventSink, NoopEventSink};
pub use self::operation::{FnOperation, OperationHandler};
