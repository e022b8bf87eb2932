//! InMemoryBroker - an in-process stand-in for the durable queue.
//!
//! Models just enough of AMQP for the worker loop: durable queue declaration,
//! per-connection unacked tracking with redelivery on close, prefetch,
//! consumer cancellation, and connection loss on demand.
//!
//! State lives behind a `std::sync::Mutex` that is never held across an
//! `.await`; consumers park on a `Notify`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::domain::Envelope;
use crate::ports::{
    AckMode, Broker, BrokerError, ConsumeOptions, Connector, Consumer, Delivery, QueueSpec,
};

/// Broker-side operations, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerOp {
    Connected(u64),
    Declared(String),
    Consumed(String),
    Delivered(u64),
    Acked(u64),
    Rejected { delivery_tag: u64, requeue: bool },
    Cancelled(String),
    Published(String),
    Closed(u64),
    Severed(u64),
}

#[derive(Debug, Clone)]
struct StoredMessage {
    envelope: Envelope,
    redelivered: bool,
}

struct QueueState {
    durable: bool,
    ready: VecDeque<StoredMessage>,
}

struct Unacked {
    conn_id: u64,
    consumer_tag: String,
    queue: String,
    message: StoredMessage,
}

struct ConsumerState {
    conn_id: u64,
}

#[derive(Default)]
struct ServerState {
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
    consumers: HashMap<String, ConsumerState>,
    open: HashSet<u64>,
    next_conn: u64,
    next_tag: u64,
    refuse_connections: bool,
    log: Vec<BrokerOp>,
}

impl ServerState {
    /// Drop a connection: its consumers go away and its unacked messages go
    /// back to the head of their queues, flagged as redelivered.
    fn drop_connection(&mut self, conn_id: u64) -> bool {
        if !self.open.remove(&conn_id) {
            return false;
        }
        self.consumers.retain(|_, c| c.conn_id != conn_id);

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.conn_id == conn_id)
            .map(|(tag, _)| *tag)
            .collect();
        // Requeue newest first so the oldest ends up at the very front.
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(u) = self.unacked.remove(&tag) {
                self.requeue(u);
            }
        }
        true
    }

    fn requeue(&mut self, unacked: Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            queue.ready.push_front(StoredMessage {
                redelivered: true,
                ..unacked.message
            });
        }
    }
}

struct Shared {
    state: Mutex<ServerState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The broker "server". Hands out connections through `Connector`, and lets
/// tests publish, inspect and break things.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ServerState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Publish as an external producer would. Declares the queue durable if
    /// it does not exist yet.
    pub fn publish(&self, queue: &str, envelope: Envelope) {
        {
            let mut state = self.shared.lock();
            let q = state
                .queues
                .entry(queue.to_string())
                .or_insert_with(|| QueueState {
                    durable: true,
                    ready: VecDeque::new(),
                });
            q.ready.push_back(StoredMessage {
                envelope,
                redelivered: false,
            });
            state.log.push(BrokerOp::Published(queue.to_string()));
        }
        self.shared.notify.notify_waiters();
    }

    pub fn declare(&self, queue: &str, durable: bool) {
        self.shared
            .lock()
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| QueueState {
                durable,
                ready: VecDeque::new(),
            });
    }

    /// Messages waiting to be delivered.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Delivered but not yet acked or rejected.
    pub fn unacked_count(&self) -> usize {
        self.shared.lock().unacked.len()
    }

    pub fn open_connections(&self) -> usize {
        self.shared.lock().open.len()
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.lock().refuse_connections = refuse;
    }

    /// Drop every open connection, as a broker restart would.
    pub fn sever_connections(&self) {
        {
            let mut state = self.shared.lock();
            let ids: Vec<u64> = state.open.iter().copied().collect();
            for id in ids {
                if state.drop_connection(id) {
                    state.log.push(BrokerOp::Severed(id));
                }
            }
        }
        self.shared.notify.notify_waiters();
    }

    pub fn log(&self) -> Vec<BrokerOp> {
        self.shared.lock().log.clone()
    }

    /// Peek at waiting message bodies, head first.
    pub fn pending_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.envelope.body.clone()).collect())
            .unwrap_or_default()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    fn endpoint(&self) -> String {
        "memory://".to_string()
    }

    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        let mut state = self.shared.lock();
        if state.refuse_connections {
            return Err(BrokerError::Connect {
                endpoint: self.endpoint(),
                reason: "connection refused".to_string(),
            });
        }
        state.next_conn += 1;
        let conn_id = state.next_conn;
        state.open.insert(conn_id);
        state.log.push(BrokerOp::Connected(conn_id));

        Ok(Arc::new(InMemoryConnection {
            shared: Arc::clone(&self.shared),
            conn_id,
        }))
    }
}

pub struct InMemoryConnection {
    shared: Arc<Shared>,
    conn_id: u64,
}

impl InMemoryConnection {
    fn ensure_open(&self, state: &ServerState) -> Result<(), BrokerError> {
        if state.open.contains(&self.conn_id) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }
}

#[async_trait]
impl Broker for InMemoryConnection {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;

        let queue = state
            .queues
            .entry(spec.name.clone())
            .or_insert_with(|| QueueState {
                durable: spec.durable,
                ready: VecDeque::new(),
            });
        if queue.durable != spec.durable {
            return Err(BrokerError::QueueDeclare {
                queue: spec.name.clone(),
                reason: format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable': received {}, current is {}",
                    spec.durable, queue.durable
                ),
            });
        }
        state.log.push(BrokerOp::Declared(spec.name.clone()));
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<Box<dyn Consumer>, BrokerError> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;

        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Consume {
                queue: queue.to_string(),
                reason: format!("NOT_FOUND - no queue '{queue}'"),
            });
        }
        if state.consumers.contains_key(&options.consumer_tag) {
            return Err(BrokerError::Consume {
                queue: queue.to_string(),
                reason: format!("consumer tag '{}' already in use", options.consumer_tag),
            });
        }
        state.consumers.insert(
            options.consumer_tag.clone(),
            ConsumerState {
                conn_id: self.conn_id,
            },
        );
        state.log.push(BrokerOp::Consumed(options.consumer_tag.clone()));

        Ok(Box::new(InMemoryConsumer {
            shared: Arc::clone(&self.shared),
            conn_id: self.conn_id,
            tag: options.consumer_tag.clone(),
            queue: queue.to_string(),
            auto_ack: options.ack_mode == AckMode::Auto,
            prefetch: options.prefetch.max(1) as usize,
        }))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        {
            let mut state = self.shared.lock();
            self.ensure_open(&state)?;
            if state.consumers.remove(consumer_tag).is_some() {
                state.log.push(BrokerOp::Cancelled(consumer_tag.to_string()));
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn publish(&self, queue: &str, envelope: &Envelope) -> Result<(), BrokerError> {
        {
            let mut state = self.shared.lock();
            self.ensure_open(&state)?;
            let Some(q) = state.queues.get_mut(queue) else {
                return Err(BrokerError::Publish {
                    queue: queue.to_string(),
                    reason: format!("NOT_FOUND - no queue '{queue}'"),
                });
            };
            q.ready.push_back(StoredMessage {
                envelope: envelope.clone(),
                redelivered: false,
            });
            state.log.push(BrokerOp::Published(queue.to_string()));
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        {
            let mut state = self.shared.lock();
            if state.drop_connection(self.conn_id) {
                state.log.push(BrokerOp::Closed(self.conn_id));
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.lock().open.contains(&self.conn_id)
    }
}

struct InMemoryConsumer {
    shared: Arc<Shared>,
    conn_id: u64,
    tag: String,
    queue: String,
    auto_ack: bool,
    prefetch: usize,
}

impl InMemoryConsumer {
    /// `Some(None)`: consumer or connection is gone. `None`: nothing to take yet.
    fn try_take(&self) -> Option<Option<InMemoryDelivery>> {
        let mut guard = self.shared.lock();
        let state = &mut *guard;

        if !state.open.contains(&self.conn_id) || !state.consumers.contains_key(&self.tag) {
            return Some(None);
        }
        if !self.auto_ack {
            let in_flight = state
                .unacked
                .values()
                .filter(|u| u.consumer_tag == self.tag)
                .count();
            if in_flight >= self.prefetch {
                return None;
            }
        }

        let message = state.queues.get_mut(&self.queue)?.ready.pop_front()?;
        state.next_tag += 1;
        let delivery_tag = state.next_tag;
        state.log.push(BrokerOp::Delivered(delivery_tag));
        if !self.auto_ack {
            state.unacked.insert(
                delivery_tag,
                Unacked {
                    conn_id: self.conn_id,
                    consumer_tag: self.tag.clone(),
                    queue: self.queue.clone(),
                    message: message.clone(),
                },
            );
        }

        Some(Some(InMemoryDelivery {
            shared: Arc::clone(&self.shared),
            conn_id: self.conn_id,
            delivery_tag,
            auto_ack: self.auto_ack,
            redelivered: message.redelivered,
            envelope: message.envelope,
        }))
    }
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn next(&mut self) -> Option<Result<Box<dyn Delivery>, BrokerError>> {
        loop {
            // Register interest before looking, so a publish between the check
            // and the await is not missed.
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_take() {
                Some(Some(delivery)) => return Some(Ok(Box::new(delivery))),
                Some(None) => return None,
                None => notified.await,
            }
        }
    }
}

struct InMemoryDelivery {
    shared: Arc<Shared>,
    conn_id: u64,
    delivery_tag: u64,
    auto_ack: bool,
    redelivered: bool,
    envelope: Envelope,
}

impl InMemoryDelivery {
    fn settle(&self, requeue: Option<bool>) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        if !state.open.contains(&self.conn_id) {
            return Err(BrokerError::ChannelClosed);
        }
        let Some(unacked) = state.unacked.remove(&self.delivery_tag) else {
            return Err(BrokerError::Ack {
                delivery_tag: self.delivery_tag,
                reason: "PRECONDITION_FAILED - unknown delivery tag".to_string(),
            });
        };
        match requeue {
            None => state.log.push(BrokerOp::Acked(self.delivery_tag)),
            Some(requeue) => {
                if requeue {
                    state.requeue(unacked);
                }
                state.log.push(BrokerOp::Rejected {
                    delivery_tag: self.delivery_tag,
                    requeue,
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        if self.auto_ack {
            return Ok(());
        }
        self.settle(None)?;
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        if self.auto_ack {
            return Ok(());
        }
        self.settle(Some(requeue))?;
        self.shared.notify.notify_waiters();
        Ok(())
    }
}
