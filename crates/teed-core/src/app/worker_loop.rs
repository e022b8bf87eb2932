//! Worker loop - the consumption lifecycle.
//!
//! starting -> consuming -> draining -> stopped
//!
//! - starting: connect, declare the durable queue, register the consumer.
//! - consuming: one delivery at a time: decode, dispatch, settle.
//! - draining: entered on shutdown. Intake stops, the in-flight task (if any)
//!   runs to completion and is settled.
//! - stopped: the connection is released.
//!
//! A lost connection during consuming is retried per `ReconnectPolicy`; the
//! unacked in-flight message is redelivered by the broker.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::app::decoder::decode;
use crate::app::dispatcher::{DispatchReport, Dispatcher, Resolution};
use crate::app::reconnect::ReconnectPolicy;
use crate::app::shutdown::ShutdownSignal;
use crate::config::WorkerConfig;
use crate::domain::{Envelope, LifecyclePhase, SchemaError, Task, WorkerEvent};
use crate::error::WorkerError;
use crate::observability::WorkerStats;
use crate::ports::{
    AckMode, Broker, BrokerError, ConsumeOptions, Connector, Consumer, Delivery, EventSink,
    QueueSpec,
};

/// Longest body excerpt written to logs for a rejected message.
const BODY_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub queue: QueueSpec,
    pub consume: ConsumeOptions,
    pub reconnect: ReconnectPolicy,
}

impl WorkerSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            queue: QueueSpec::durable(config.broker.queue_name.as_str()),
            consume: ConsumeOptions {
                consumer_tag: config.worker_name.clone(),
                ack_mode: config.ack_mode,
                prefetch: config.prefetch,
            },
            reconnect: config.reconnect.clone(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    Reject { requeue: bool },
}

/// Settlement for a message that never became a task.
///
/// Non-JSON messages are not ours to judge and are acked away. Malformed
/// tasks are rejected without requeue so they cannot loop forever.
pub fn settle_rejected(err: &SchemaError) -> AckDecision {
    if err.is_content_type() {
        AckDecision::Ack
    } else {
        AckDecision::Reject { requeue: false }
    }
}

/// Decode + dispatch + report, shared by every delivery.
struct Pipeline {
    dispatcher: Dispatcher,
    sink: Arc<dyn EventSink>,
}

impl Pipeline {
    async fn process(&self, stats: &mut WorkerStats, delivery: Box<dyn Delivery>) {
        stats.received += 1;
        let delivery_tag = delivery.delivery_tag();
        if delivery.redelivered() {
            stats.redelivered += 1;
            warn!(
                delivery_tag,
                "Message {} was delivered before and never acknowledged; processing it again",
                delivery_tag
            );
        }

        let decision = match decode(delivery.envelope()) {
            Ok(task) => {
                self.run_task(stats, task).await;
                AckDecision::Ack
            }
            Err(err) => {
                stats.rejected += 1;
                log_rejection(delivery_tag, delivery.envelope(), &err);
                let decision = settle_rejected(&err);
                self.sink.emit(&WorkerEvent::MessageRejected {
                    delivery_tag,
                    error: err,
                });
                decision
            }
        };

        settle(delivery, decision).await;
    }

    async fn run_task(&self, stats: &mut WorkerStats, task: Task) {
        let task_id = task.id();
        info!(
            task_id = %task_id,
            operation = %task.operation(),
            "Received task {}",
            task_id
        );

        match self.dispatcher.dispatch(task).await {
            Ok(report) => {
                let state = report.state();
                stats.record(state);
                info!(task_id = %task_id, state = %state, "Task {} resolved as {}", task_id, state);

                let error = report.error().map(ToString::to_string);
                let DispatchReport { task, resolution } = report;
                let outcome = match resolution {
                    Resolution::Completed(outcome) => Some(outcome),
                    Resolution::Failed(_) => None,
                };
                self.sink.emit(&WorkerEvent::TaskResolved {
                    task,
                    outcome,
                    error,
                });
            }
            Err(err) => error!(task_id = %task_id, "{}", err),
        }
    }
}

fn log_rejection(delivery_tag: u64, envelope: &Envelope, err: &SchemaError) {
    if err.is_content_type() {
        debug!(
            delivery_tag,
            content_type = envelope.content_type.as_deref().unwrap_or(""),
            "Message content type isn't JSON, skipping it"
        );
    } else {
        warn!(
            delivery_tag,
            error = %err,
            body = %envelope.body_preview(BODY_PREVIEW_CHARS),
            "Rejecting message {}: {}",
            delivery_tag,
            err
        );
    }
}

async fn settle(delivery: Box<dyn Delivery>, decision: AckDecision) {
    let delivery_tag = delivery.delivery_tag();
    let result = match decision {
        AckDecision::Ack => delivery.ack().await,
        AckDecision::Reject { requeue } => delivery.reject(requeue).await,
    };
    if let Err(e) = result {
        warn!(
            delivery_tag,
            error = %e,
            "Failed to settle message {}; the broker will redeliver it",
            delivery_tag
        );
    }
}

async fn stop_intake(broker: &dyn Broker, consumer_tag: &str) {
    if !broker.is_connected() {
        return;
    }
    if let Err(e) = broker.cancel(consumer_tag).await {
        warn!(consumer_tag, "Failed to cancel consumer {}: {}", consumer_tag, e);
    }
}

async fn close_quietly(broker: &dyn Broker) {
    if let Err(e) = broker.close().await {
        warn!("Failed to close broker connection: {}", e);
    }
}

fn enter_phase(tx: &watch::Sender<LifecyclePhase>, sink: &dyn EventSink, phase: LifecyclePhase) {
    tx.send_replace(phase);
    sink.emit(&WorkerEvent::PhaseChanged(phase));
    debug!(phase = %phase, "Worker is {}", phase);
}

enum Exit {
    Shutdown,
    Fatal(WorkerError),
}

enum Reconnect {
    Restored(Arc<dyn Broker>, Box<dyn Consumer>),
    Interrupted,
    GaveUp(WorkerError),
}

/// A configured worker. Built by `WorkerBuilder`, consumed by `run`.
pub struct Worker {
    connector: Arc<dyn Connector>,
    pipeline: Pipeline,
    settings: WorkerSettings,
    phase: watch::Sender<LifecyclePhase>,
    stats: WorkerStats,
}

impl Worker {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        dispatcher: Dispatcher,
        sink: Arc<dyn EventSink>,
        settings: WorkerSettings,
    ) -> Self {
        let (phase, _) = watch::channel(LifecyclePhase::Starting);
        Self {
            connector,
            pipeline: Pipeline { dispatcher, sink },
            settings,
            phase,
            stats: WorkerStats::default(),
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Follow the lifecycle phase while `run` is going.
    pub fn phase(&self) -> watch::Receiver<LifecyclePhase> {
        self.phase.subscribe()
    }

    fn enter(&self, phase: LifecyclePhase) {
        enter_phase(&self.phase, self.pipeline.sink.as_ref(), phase);
    }

    /// Run until shutdown is requested (`Ok`) or the broker is unusable (`Err`).
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> Result<WorkerStats, WorkerError> {
        self.enter(LifecyclePhase::Starting);

        let endpoint = self.connector.endpoint();
        let queue = self.settings.queue.name.clone();
        info!(
            endpoint = %endpoint,
            queue = %queue,
            worker = self.pipeline.dispatcher.worker_name(),
            operations = ?self.pipeline.dispatcher.registry().registered(),
            "Starting worker"
        );
        if self.settings.consume.ack_mode == AckMode::Auto {
            warn!(
                "Auto-ack is on: the message being processed and any already pushed to this \
                 worker are lost if it dies or drains"
            );
        }

        let mut broker = match self.connector.connect().await {
            Ok(broker) => broker,
            Err(source) => {
                error!(endpoint = %endpoint, "Cannot connect to broker: {}", source);
                self.enter(LifecyclePhase::Stopped);
                return Err(WorkerError::Connect { endpoint, source });
            }
        };
        let mut consumer = match self.bind(broker.as_ref()).await {
            Ok(consumer) => consumer,
            Err(source) => {
                error!(queue = %queue, "Cannot set up consumption: {}", source);
                close_quietly(broker.as_ref()).await;
                self.enter(LifecyclePhase::Stopped);
                return Err(WorkerError::Setup { queue, source });
            }
        };

        self.enter(LifecyclePhase::Consuming);
        info!(queue = %queue, "Start consuming, listening to {} queue", queue);

        let exit = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.triggered() => break Exit::Shutdown,
                next = consumer.next() => next,
            };

            let reason = match next {
                Some(Ok(delivery)) => {
                    let draining = self
                        .process_in_flight(delivery, broker.as_ref(), consumer.tag(), &mut shutdown)
                        .await;
                    if draining {
                        break Exit::Shutdown;
                    }
                    continue;
                }
                Some(Err(err)) => err.to_string(),
                None => "consumer was cancelled by the broker".to_string(),
            };

            close_quietly(broker.as_ref()).await;
            match self.reconnect(reason, &mut shutdown).await {
                Reconnect::Restored(b, c) => {
                    broker = b;
                    consumer = c;
                }
                Reconnect::Interrupted => break Exit::Shutdown,
                Reconnect::GaveUp(err) => break Exit::Fatal(err),
            }
        };

        if matches!(exit, Exit::Shutdown) && *self.phase.borrow() != LifecyclePhase::Draining {
            self.enter(LifecyclePhase::Draining);
            stop_intake(broker.as_ref(), consumer.tag()).await;
        }
        drop(consumer);
        close_quietly(broker.as_ref()).await;
        self.enter(LifecyclePhase::Stopped);

        match exit {
            Exit::Shutdown => {
                info!(stats = ?self.stats, "Worker stopped");
                Ok(self.stats)
            }
            Exit::Fatal(err) => {
                error!(stats = ?self.stats, "Worker stopped: {}", err);
                Err(err)
            }
        }
    }

    async fn bind(&self, broker: &dyn Broker) -> Result<Box<dyn Consumer>, BrokerError> {
        let queue = &self.settings.queue;
        broker.declare_queue(queue).await?;
        info!(queue = %queue.name, durable = queue.durable, "Queue {} declared", queue.name);

        let options = &self.settings.consume;
        let consumer = broker.consume(&queue.name, options).await?;
        info!(
            consumer_tag = consumer.tag(),
            ack_mode = options.ack_mode.as_str(),
            prefetch = options.prefetch,
            "Ready to consume messages"
        );
        Ok(consumer)
    }

    /// Process one delivery to completion. A shutdown arriving meanwhile
    /// switches to draining and stops intake, but never interrupts the task.
    ///
    /// Returns true when draining started.
    async fn process_in_flight(
        &mut self,
        delivery: Box<dyn Delivery>,
        broker: &dyn Broker,
        consumer_tag: &str,
        shutdown: &mut ShutdownSignal,
    ) -> bool {
        let work = self.pipeline.process(&mut self.stats, delivery);
        tokio::pin!(work);

        tokio::select! {
            biased;
            () = &mut work => false,
            _ = shutdown.triggered() => {
                enter_phase(&self.phase, self.pipeline.sink.as_ref(), LifecyclePhase::Draining);
                info!("Shutdown requested, finishing the current task");
                stop_intake(broker, consumer_tag).await;
                work.await;
                true
            }
        }
    }

    async fn reconnect(&mut self, mut reason: String, shutdown: &mut ShutdownSignal) -> Reconnect {
        let policy = self.settings.reconnect.clone();
        if !policy.is_enabled() {
            error!("Broker connection lost and reconnection is disabled: {}", reason);
            return Reconnect::GaveUp(WorkerError::ConnectionLost { reason });
        }

        let mut attempt = 1;
        while policy.allows(attempt) {
            self.pipeline
                .sink
                .emit(&WorkerEvent::ConnectionLost { attempt });
            let delay = policy.next_delay(attempt);
            warn!(
                attempt,
                max_attempts = policy.max_attempts,
                "Broker connection lost ({}), reconnecting in {:?}",
                reason,
                delay
            );

            tokio::select! {
                biased;
                _ = shutdown.triggered() => return Reconnect::Interrupted,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.connector.connect().await {
                Ok(broker) => match self.bind(broker.as_ref()).await {
                    Ok(consumer) => {
                        self.stats.reconnects += 1;
                        info!(attempt, "Reconnected to broker");
                        return Reconnect::Restored(broker, consumer);
                    }
                    Err(e) => {
                        close_quietly(broker.as_ref()).await;
                        reason = e.to_string();
                    }
                },
                Err(e) => reason = e.to_string(),
            }
            attempt += 1;
        }

        Reconnect::GaveUp(WorkerError::ConnectionLost {
            reason: format!(
                "giving up after {} reconnect attempts: {}",
                policy.max_attempts, reason
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{WorkerBuilder, shutdown_channel};
    use crate::domain::FieldError;
    use crate::impls::InMemoryBroker;
    use rstest::rstest;
    use std::sync::Mutex;
    use tracing::field::{Field, Visit};
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    /// Records the level and message of every event.
    struct Recorder(Arc<Mutex<Vec<(Level, String)>>>);

    struct MessageVisitor(String);

    impl Visit for MessageVisitor {
        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            if field.name() == "message" {
                self.0 = format!("{value:?}");
            }
        }
    }

    impl<S: Subscriber> Layer<S> for Recorder {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let mut visitor = MessageVisitor(String::new());
            event.record(&mut visitor);
            self.0
                .lock()
                .unwrap()
                .push((*event.metadata().level(), visitor.0));
        }
    }

    fn recording() -> (Arc<Mutex<Vec<(Level, String)>>>, impl Subscriber + Send + Sync) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(Recorder(events.clone()));
        (events, subscriber)
    }

    #[rstest]
    #[case::non_json(SchemaError::UnsupportedContentType(Some("text/plain".to_string())), Level::DEBUG)]
    #[case::no_content_type(SchemaError::UnsupportedContentType(None), Level::DEBUG)]
    #[case::malformed(SchemaError::Malformed("eof".to_string()), Level::WARN)]
    fn rejection_log_level(#[case] err: SchemaError, #[case] expected: Level) {
        let (events, subscriber) = recording();
        let envelope = Envelope::new(Some("text/plain".to_string()), "Hello!");

        tracing::subscriber::with_default(subscriber, || log_rejection(7, &envelope, &err));

        let levels: Vec<Level> = events.lock().unwrap().iter().map(|(l, _)| *l).collect();
        assert_eq!(levels, vec![expected]);
    }

    #[tokio::test]
    async fn auto_ack_warns_about_pushed_ahead_messages() {
        let (events, subscriber) = recording();
        let _guard = tracing::subscriber::set_default(subscriber);

        let worker = WorkerBuilder::new()
            .connector(Arc::new(InMemoryBroker::new()))
            .ack_mode(AckMode::Auto)
            .build()
            .unwrap();
        let (handle, signal) = shutdown_channel();
        handle.trigger();
        worker.run(signal).await.unwrap();

        let events = events.lock().unwrap();
        assert!(
            events.iter().any(|(level, message)| *level == Level::WARN
                && message.contains("Auto-ack")
                && message.contains("already pushed")),
            "{events:?}"
        );
    }

    #[test]
    fn non_json_messages_are_acked_away() {
        let err = SchemaError::UnsupportedContentType(Some("text/plain".to_string()));
        assert_eq!(settle_rejected(&err), AckDecision::Ack);
    }

    #[test]
    fn malformed_tasks_are_rejected_for_good() {
        let errs = [
            SchemaError::Malformed("eof".to_string()),
            SchemaError::NotAnObject,
            SchemaError::InvalidFields(vec![FieldError::missing("id")]),
        ];
        for err in errs {
            assert_eq!(
                settle_rejected(&err),
                AckDecision::Reject { requeue: false }
            );
        }
    }

    #[test]
    fn settings_follow_config() {
        let mut config = WorkerConfig::default();
        config.broker.queue_name = "bulkcm".to_string();
        config.worker_name = "w1:42".to_string();
        config.prefetch = 4;

        let settings = WorkerSettings::from_config(&config);
        assert_eq!(settings.queue, QueueSpec::durable("bulkcm"));
        assert_eq!(settings.consume.consumer_tag, "w1:42");
        assert_eq!(settings.consume.prefetch, 4);
        assert_eq!(settings.consume.ack_mode, AckMode::Manual);
    }
}
