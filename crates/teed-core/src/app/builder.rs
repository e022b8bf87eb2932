//! WorkerBuilder - wiring and fail-fast validation.
//!
//! ```ignore
//! let worker = WorkerBuilder::from_config(&config)
//!     .connector(Arc::new(AmqpConnector::new(config.broker.clone())))
//!     .register(Operation::BulkcmSplit, Arc::new(split_handler))?
//!     .expect_operations(&[Operation::BulkcmSplit])
//!     .build()?;
//! ```
//!
//! `build()` checks that every expected operation has a handler, so a worker
//! that cannot serve its producers refuses to start instead of failing tasks.

use std::sync::Arc;
use std::time::Duration;

use crate::app::dispatcher::Dispatcher;
use crate::app::reconnect::ReconnectPolicy;
use crate::app::registry::{OperationRegistry, RegistryError};
use crate::app::worker_loop::{Worker, WorkerSettings};
use crate::config::WorkerConfig;
use crate::domain::Operation;
use crate::ports::{AckMode, Clock, Connector, EventSink, NoopEventSink, OperationHandler, SystemClock};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("Missing operations: {0:?}. These operations were expected but not registered.")]
    MissingOperations(Vec<Operation>),

    #[error("no broker connector configured")]
    MissingConnector,
}

pub struct WorkerBuilder {
    connector: Option<Arc<dyn Connector>>,
    registry: OperationRegistry,
    expected: Option<Vec<Operation>>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    settings: WorkerSettings,
    worker_name: String,
    task_timeout: Option<Duration>,
}

impl WorkerBuilder {
    pub fn new() -> Self {
        Self::from_config(&WorkerConfig::default())
    }

    /// Queue, consumer and reconnect settings, worker name and task time limit
    /// taken from `config`. Handlers and the connector still have to be set.
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            connector: None,
            registry: OperationRegistry::new(),
            expected: None,
            sink: Arc::new(NoopEventSink),
            clock: Arc::new(SystemClock),
            settings: WorkerSettings::from_config(config),
            worker_name: config.worker_name.clone(),
            task_timeout: config.task_timeout,
        }
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn register(
        mut self,
        operation: Operation,
        handler: Arc<dyn OperationHandler>,
    ) -> Result<Self, RegistryError> {
        self.registry.register(operation, handler)?;
        Ok(self)
    }

    /// Operations that must have a handler for `build()` to succeed.
    pub fn expect_operations(mut self, operations: &[Operation]) -> Self {
        self.expected = Some(operations.to_vec());
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.settings.queue.name = name.into();
        self
    }

    pub fn ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.settings.consume.ack_mode = ack_mode;
        self
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.settings.consume.prefetch = prefetch.max(1);
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.settings.reconnect = policy;
        self
    }

    /// Also used as the consumer tag.
    pub fn worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self.settings.consume.consumer_tag = self.worker_name.clone();
        self
    }

    pub fn task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<Worker, BuildError> {
        if let Some(expected) = &self.expected {
            let registered = self.registry.registered();
            let missing: Vec<Operation> = expected
                .iter()
                .filter(|op| !registered.contains(op))
                .copied()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingOperations(missing));
            }
        }
        let connector = self.connector.ok_or(BuildError::MissingConnector)?;

        let dispatcher = Dispatcher::new(Arc::new(self.registry), self.clock, self.worker_name)
            .with_timeout(self.task_timeout);
        Ok(Worker::new(connector, dispatcher, self.sink, self.settings))
    }
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
