//! End-to-end worker scenarios against the in-memory broker.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use teed_core::app::{ReconnectPolicy, ShutdownHandle, WorkerBuilder, shutdown_channel};
use teed_core::domain::{
    Envelope, LifecyclePhase, Operation, OperationError, Outcome, TaskArgs, TaskState,
};
use teed_core::impls::{BrokerOp, InMemoryBroker, MemoryEventSink};
use teed_core::ports::{AckMode, FixedClock, FnOperation, OperationHandler};
use teed_core::{WorkerError, WorkerStats};

const QUEUE: &str = "tasks";
const WORKER: &str = "worker-a:1";

// ============================================================================
// Harness
// ============================================================================

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 7, 22, 18, 30, 0).unwrap()
}

fn task_json(id: &str, operation: &str) -> serde_json::Value {
    json!({
        "id": id,
        "created_at": "2023-07-22T18:24:47Z",
        "created_by": "x",
        "operation": operation,
        "state": "todo",
        "args": {"file_path": "p", "output_dir": "o"}
    })
}

fn task_message(id: &str, operation: &str) -> Envelope {
    Envelope::json(serde_json::to_vec(&task_json(id, operation)).unwrap())
}

const ID_A: &str = "093b1603-240b-4660-9bad-861caee1e7a8";
const ID_B: &str = "5d1c6b4e-8f3a-4c1e-9a57-2b0d7f6e1c11";

fn fast_reconnect(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts,
        base_delay: Duration::from_millis(10),
        multiplier: 1.0,
        max_delay: Duration::from_millis(50),
    }
}

fn counting(calls: &Arc<AtomicUsize>, result: fn() -> Result<Outcome, OperationError>) -> Arc<dyn OperationHandler> {
    let calls = Arc::clone(calls);
    Arc::new(FnOperation::new(move |_: &TaskArgs| {
        calls.fetch_add(1, Ordering::SeqCst);
        result()
    }))
}

fn builder(server: &InMemoryBroker, sink: &Arc<MemoryEventSink>) -> WorkerBuilder {
    WorkerBuilder::new()
        .connector(Arc::new(server.clone()))
        .event_sink(sink.clone())
        .clock(Arc::new(FixedClock(now())))
        .queue(QUEUE)
        .worker_name(WORKER)
        .reconnect(fast_reconnect(3))
}

struct Running {
    handle: ShutdownHandle,
    phase: watch::Receiver<LifecyclePhase>,
    join: JoinHandle<Result<WorkerStats, WorkerError>>,
}

impl Running {
    fn start(builder: WorkerBuilder) -> Self {
        let worker = builder.build().unwrap();
        let phase = worker.phase();
        let (handle, signal) = shutdown_channel();
        let join = tokio::spawn(worker.run(signal));
        Self {
            handle,
            phase,
            join,
        }
    }

    async fn wait_for_phase(&mut self, phase: LifecyclePhase) {
        tokio::time::timeout(Duration::from_secs(5), self.phase.wait_for(|p| *p == phase))
            .await
            .expect("phase not reached in time")
            .unwrap();
    }

    async fn finish(self) -> Result<WorkerStats, WorkerError> {
        tokio::time::timeout(Duration::from_secs(5), self.join)
            .await
            .expect("worker did not stop in time")
            .unwrap()
    }

    async fn stop(self) -> WorkerStats {
        self.handle.trigger();
        self.finish().await.unwrap()
    }
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Blocks inside the operation until released, then returns `result`.
struct Gate {
    started: Arc<Notify>,
    release: Arc<Notify>,
    result: fn() -> Result<Outcome, OperationError>,
}

impl Gate {
    fn new(result: fn() -> Result<Outcome, OperationError>) -> Self {
        Self {
            started: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
            result,
        }
    }
}

#[async_trait]
impl OperationHandler for Gate {
    async fn run(&self, _args: &TaskArgs) -> Result<Outcome, OperationError> {
        self.started.notify_one();
        self.release.notified().await;
        (self.result)()
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn valid_task_is_dispatched_resolved_and_acked() {
    let server = InMemoryBroker::new();
    let sink = Arc::new(MemoryEventSink::new());
    let calls = Arc::new(AtomicUsize::new(0));

    server.publish(QUEUE, task_message(ID_A, "bulkcm_split"));
    let mut running = Running::start(
        builder(&server, &sink)
            .register(Operation::BulkcmSplit, counting(&calls, || Ok(Outcome::success())))
            .unwrap(),
    );
    running.wait_for_phase(LifecyclePhase::Consuming).await;
    wait_until("task resolution", || sink.resolved_tasks().len() == 1).await;

    let task = &sink.resolved_tasks()[0];
    assert_eq!(task.id().to_string(), ID_A);
    assert_eq!(task.state(), TaskState::Done);
    assert_eq!(task.processed_by(), Some(WORKER));
    assert_eq!(task.processed_at(), Some(now()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let stats = running.stop().await;
    assert_eq!(stats.received, 1);
    assert_eq!(stats.done, 1);
    assert_eq!(server.queue_depth(QUEUE), 0);
    assert_eq!(server.unacked_count(), 0);
    assert!(server.log().contains(&BrokerOp::Acked(1)));
}

#[tokio::test]
async fn non_json_message_is_acked_without_dispatch() {
    let server = InMemoryBroker::new();
    let sink = Arc::new(MemoryEventSink::new());
    let calls = Arc::new(AtomicUsize::new(0));

    server.publish(QUEUE, Envelope::new(Some("text/plain".to_string()), "Hello!"));
    server.publish(QUEUE, task_message(ID_A, "bulkcm_split"));
    let running = Running::start(
        builder(&server, &sink)
            .register(Operation::BulkcmSplit, counting(&calls, || Ok(Outcome::success())))
            .unwrap(),
    );

    // The loop survives the foreign message and handles the next one.
    wait_until("second message", || sink.resolved_tasks().len() == 1).await;
    let stats = running.stop().await;

    let rejections = sink.rejections();
    assert_eq!(rejections.len(), 1);
    assert!(rejections[0].1.is_content_type());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(stats.rejected, 1);
    assert!(server.log().contains(&BrokerOp::Acked(1)));
}

#[tokio::test]
async fn malformed_task_is_rejected_without_requeue() {
    let server = InMemoryBroker::new();
    let sink = Arc::new(MemoryEventSink::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let mut missing_id = task_json(ID_A, "bulkcm_split");
    missing_id.as_object_mut().unwrap().remove("id");
    server.publish(QUEUE, Envelope::json(serde_json::to_vec(&missing_id).unwrap()));
    server.publish(QUEUE, task_message(ID_A, "bulkcm.split"));
    server.publish(QUEUE, Envelope::json("{not json"));
    server.publish(QUEUE, task_message(ID_B, "bulkcm_split"));

    let running = Running::start(
        builder(&server, &sink)
            .register(Operation::BulkcmSplit, counting(&calls, || Ok(Outcome::success())))
            .unwrap(),
    );
    wait_until("valid task", || sink.resolved_tasks().len() == 1).await;
    let stats = running.stop().await;

    let fields: Vec<Vec<&str>> = sink.rejections().iter().map(|(_, e)| e.fields()).collect();
    assert_eq!(fields, vec![vec!["id"], vec!["operation"], vec![]]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(stats.rejected, 3);

    let log = server.log();
    for tag in 1..=3 {
        assert!(log.contains(&BrokerOp::Rejected {
            delivery_tag: tag,
            requeue: false
        }));
    }
    assert_eq!(server.queue_depth(QUEUE), 0);
}

#[tokio::test]
async fn failing_operation_resolves_failed_and_loop_continues() {
    let server = InMemoryBroker::new();
    let sink = Arc::new(MemoryEventSink::new());
    let calls = Arc::new(AtomicUsize::new(0));

    server.publish(QUEUE, task_message(ID_A, "meas_parse"));
    server.publish(QUEUE, task_message(ID_B, "bulkcm_parse"));
    let running = Running::start(
        builder(&server, &sink)
            .register(
                Operation::MeasParse,
                counting(&calls, || Err(OperationError::new("input file not found"))),
            )
            .unwrap()
            .register(
                Operation::BulkcmParse,
                counting(&calls, || Ok(Outcome::partial("3 records skipped"))),
            )
            .unwrap(),
    );
    wait_until("both tasks", || sink.resolved_tasks().len() == 2).await;
    let stats = running.stop().await;

    let states: Vec<TaskState> = sink.resolved_tasks().iter().map(|t| t.state()).collect();
    assert_eq!(states, vec![TaskState::Failed, TaskState::DoneWithError]);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.done_with_error, 1);
    assert!(server.log().contains(&BrokerOp::Acked(1)));
    assert!(server.log().contains(&BrokerOp::Acked(2)));
}

#[tokio::test]
async fn unregistered_operation_resolves_failed() {
    let server = InMemoryBroker::new();
    let sink = Arc::new(MemoryEventSink::new());

    server.publish(QUEUE, task_message(ID_A, "bulkcm_probe"));
    let running = Running::start(builder(&server, &sink));
    wait_until("task resolution", || sink.resolved_tasks().len() == 1).await;
    running.stop().await;

    assert_eq!(sink.resolved_tasks()[0].state(), TaskState::Failed);
    assert_eq!(server.unacked_count(), 0);
}

#[tokio::test]
async fn shutdown_lets_in_flight_task_finish() {
    let server = InMemoryBroker::new();
    let sink = Arc::new(MemoryEventSink::new());

    server.publish(QUEUE, task_message(ID_A, "bulkcm_split"));
    server.publish(QUEUE, task_message(ID_B, "bulkcm_split"));
    let gate = Gate::new(|| Ok(Outcome::success()));
    let (started, release) = (gate.started.clone(), gate.release.clone());
    let mut running = Running::start(
        builder(&server, &sink)
            .register(Operation::BulkcmSplit, Arc::new(gate))
            .unwrap(),
    );

    started.notified().await;
    running.handle.trigger();
    running.wait_for_phase(LifecyclePhase::Draining).await;

    // Still in flight: not resolved, not acked.
    assert!(sink.resolved_tasks().is_empty());
    assert_eq!(server.unacked_count(), 1);

    release.notify_one();
    let stats = running.finish().await.unwrap();

    assert_eq!(stats.done, 1);
    assert_eq!(sink.resolved_tasks()[0].state(), TaskState::Done);
    assert_eq!(
        sink.phases(),
        vec![
            LifecyclePhase::Starting,
            LifecyclePhase::Consuming,
            LifecyclePhase::Draining,
            LifecyclePhase::Stopped,
        ]
    );

    // Acked before the connection was released; the second task stays queued.
    let log = server.log();
    let acked = log.iter().position(|op| *op == BrokerOp::Acked(1)).unwrap();
    let closed = log
        .iter()
        .position(|op| matches!(op, BrokerOp::Closed(_)))
        .unwrap();
    assert!(acked < closed);
    assert_eq!(server.queue_depth(QUEUE), 1);
    assert_eq!(server.open_connections(), 0);
}

#[tokio::test]
async fn shutdown_during_failing_task_still_resolves_and_acks_it() {
    let server = InMemoryBroker::new();
    let sink = Arc::new(MemoryEventSink::new());

    server.publish(QUEUE, task_message(ID_A, "meas_parse"));
    server.publish(QUEUE, task_message(ID_B, "meas_parse"));
    let gate = Gate::new(|| Err(OperationError::new("input file not found")));
    let (started, release) = (gate.started.clone(), gate.release.clone());
    let mut running = Running::start(
        builder(&server, &sink)
            .prefetch(3)
            .register(Operation::MeasParse, Arc::new(gate))
            .unwrap(),
    );

    started.notified().await;
    running.handle.trigger();
    running.wait_for_phase(LifecyclePhase::Draining).await;
    release.notify_one();
    let stats = running.finish().await.unwrap();

    assert_eq!(stats.failed, 1);
    let resolved = sink.resolved_tasks();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].id().to_string(), ID_A);
    assert_eq!(resolved[0].state(), TaskState::Failed);

    // Ack, then cancel, then close; the prefetched second task goes back.
    let log = server.log();
    let position = |wanted: fn(&BrokerOp) -> bool| log.iter().position(wanted).unwrap();
    let acked = position(|op| *op == BrokerOp::Acked(1));
    let cancelled = position(|op| matches!(op, BrokerOp::Cancelled(_)));
    let closed = position(|op| matches!(op, BrokerOp::Closed(_)));
    assert!(acked < closed);
    assert!(cancelled < closed);
    assert_eq!(server.queue_depth(QUEUE), 1);
    assert_eq!(server.unacked_count(), 0);
    assert_eq!(server.open_connections(), 0);
}

#[tokio::test]
async fn idle_shutdown_stops_cleanly() {
    let server = InMemoryBroker::new();
    let sink = Arc::new(MemoryEventSink::new());

    let mut running = Running::start(builder(&server, &sink));
    running.wait_for_phase(LifecyclePhase::Consuming).await;
    let stats = running.stop().await;

    assert_eq!(stats, WorkerStats::default());
    assert_eq!(sink.phases().last(), Some(&LifecyclePhase::Stopped));
    assert!(server.log().contains(&BrokerOp::Cancelled(WORKER.to_string())));
    assert_eq!(server.open_connections(), 0);
}

// ============================================================================
// Connection management
// ============================================================================

#[tokio::test]
async fn unreachable_broker_fails_startup() {
    let server = InMemoryBroker::new();
    let sink = Arc::new(MemoryEventSink::new());
    server.refuse_connections(true);

    let result = Running::start(builder(&server, &sink)).finish().await;

    assert!(matches!(result, Err(WorkerError::Connect { .. })));
    assert_eq!(
        sink.phases(),
        vec![LifecyclePhase::Starting, LifecyclePhase::Stopped]
    );
}

#[tokio::test]
async fn durability_mismatch_fails_startup() {
    let server = InMemoryBroker::new();
    let sink = Arc::new(MemoryEventSink::new());
    server.declare(QUEUE, false);

    let result = Running::start(builder(&server, &sink)).finish().await;

    assert!(matches!(result, Err(WorkerError::Setup { .. })));
    assert_eq!(server.open_connections(), 0);
}

#[tokio::test]
async fn reconnects_after_connection_loss() {
    let server = InMemoryBroker::new();
    let sink = Arc::new(MemoryEventSink::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let mut running = Running::start(
        builder(&server, &sink)
            .register(Operation::BulkcmSplit, counting(&calls, || Ok(Outcome::success())))
            .unwrap(),
    );
    running.wait_for_phase(LifecyclePhase::Consuming).await;

    server.sever_connections();
    wait_until("reconnect", || server.open_connections() == 1 && !sink.reconnect_attempts().is_empty()).await;
    server.publish(QUEUE, task_message(ID_A, "bulkcm_split"));
    wait_until("task after reconnect", || sink.resolved_tasks().len() == 1).await;

    let stats = running.stop().await;
    assert_eq!(stats.reconnects, 1);
    assert_eq!(sink.reconnect_attempts(), vec![1]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn message_in_flight_during_loss_is_redelivered() {
    let server = InMemoryBroker::new();
    let sink = Arc::new(MemoryEventSink::new());
    let calls = Arc::new(AtomicUsize::new(0));

    // The first run of the operation loses the connection before its ack.
    let severing = {
        let server = server.clone();
        let calls = Arc::clone(&calls);
        FnOperation::new(move |_: &TaskArgs| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                server.sever_connections();
            }
            Ok(Outcome::success())
        })
    };

    server.publish(QUEUE, task_message(ID_A, "bulkcm_split"));
    let running = Running::start(
        builder(&server, &sink)
            .register(Operation::BulkcmSplit, Arc::new(severing))
            .unwrap(),
    );
    wait_until("redelivered task", || sink.resolved_tasks().len() == 2).await;
    let stats = running.stop().await;

    // At-least-once: the same task ran twice, the second time as a redelivery.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(stats.redelivered, 1);
    assert_eq!(stats.reconnects, 1);
    assert!(sink.resolved_tasks().iter().all(|t| t.id().to_string() == ID_A));
    assert_eq!(server.queue_depth(QUEUE), 0);
    assert_eq!(server.unacked_count(), 0);
}

#[tokio::test]
async fn connection_loss_is_fatal_without_reconnect() {
    let server = InMemoryBroker::new();
    let sink = Arc::new(MemoryEventSink::new());

    let mut running = Running::start(builder(&server, &sink).reconnect(ReconnectPolicy::disabled()));
    running.wait_for_phase(LifecyclePhase::Consuming).await;
    server.sever_connections();

    let result = running.finish().await;
    assert!(matches!(result, Err(WorkerError::ConnectionLost { .. })));
    assert_eq!(sink.phases().last(), Some(&LifecyclePhase::Stopped));
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let server = InMemoryBroker::new();
    let sink = Arc::new(MemoryEventSink::new());

    let mut running = Running::start(builder(&server, &sink).reconnect(fast_reconnect(2)));
    running.wait_for_phase(LifecyclePhase::Consuming).await;
    server.refuse_connections(true);
    server.sever_connections();

    match running.finish().await {
        Err(WorkerError::ConnectionLost { reason }) => {
            assert!(reason.contains("giving up after 2"), "{reason}");
        }
        other => panic!("expected connection loss, got {other:?}"),
    }
    assert_eq!(sink.reconnect_attempts(), vec![1, 2]);
}

#[tokio::test]
async fn shutdown_interrupts_reconnect_backoff() {
    let server = InMemoryBroker::new();
    let sink = Arc::new(MemoryEventSink::new());
    let slow = ReconnectPolicy {
        base_delay: Duration::from_secs(60),
        ..ReconnectPolicy::default()
    };

    let mut running = Running::start(builder(&server, &sink).reconnect(slow));
    running.wait_for_phase(LifecyclePhase::Consuming).await;
    server.sever_connections();
    wait_until("first reconnect attempt", || sink.reconnect_attempts() == vec![1]).await;

    let stats = running.stop().await;
    assert_eq!(stats.reconnects, 0);
    assert_eq!(sink.phases().last(), Some(&LifecyclePhase::Stopped));
}

#[tokio::test]
async fn auto_ack_consumes_on_receipt() {
    let server = InMemoryBroker::new();
    let sink = Arc::new(MemoryEventSink::new());

    server.publish(QUEUE, task_message(ID_A, "bulkcm_split"));
    let gate = Gate::new(|| Ok(Outcome::success()));
    let (started, release) = (gate.started.clone(), gate.release.clone());
    let running = Running::start(
        builder(&server, &sink)
            .ack_mode(AckMode::Auto)
            .register(Operation::BulkcmSplit, Arc::new(gate))
            .unwrap(),
    );

    started.notified().await;
    // Nothing is held for the in-flight message: a crash now would lose it.
    assert_eq!(server.unacked_count(), 0);
    assert_eq!(server.queue_depth(QUEUE), 0);

    release.notify_one();
    wait_until("task resolution", || sink.resolved_tasks().len() == 1).await;
    running.stop().await;
}
