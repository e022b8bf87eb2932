//! AMQP 0-9-1 broker client (RabbitMQ) on top of `lapin`.
//!
//! One connection, one channel. Queues are declared on the default exchange
//! and addressed by name.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{FieldTable, ShortString};
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info};

use crate::config::BrokerConfig;
use crate::domain::Envelope;
use crate::ports::{
    AckMode, Broker, BrokerError, ConsumeOptions, Connector, Consumer, Delivery, QueueSpec,
};

/// AMQP `delivery_mode` for messages that survive a broker restart.
const PERSISTENT: u8 = 2;

/// Reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

fn lost(err: lapin::Error) -> BrokerError {
    BrokerError::ConnectionLost(err.to_string())
}

/// Map the broker's answer to a publish. Only an explicit ack counts.
fn confirmed(queue: &str, confirmation: Confirmation) -> Result<(), BrokerError> {
    let reason = match confirmation {
        Confirmation::Ack(_) => return Ok(()),
        Confirmation::Nack(_) => "broker refused the message (nack)",
        Confirmation::NotRequested => "publisher confirms are not enabled on the channel",
    };
    Err(BrokerError::Publish {
        queue: queue.to_string(),
        reason: reason.to_string(),
    })
}

/// Both close steps always run; the first failure is the one reported.
fn first_close_error(
    channel: Result<(), lapin::Error>,
    connection: Result<(), lapin::Error>,
) -> Result<(), BrokerError> {
    channel
        .and(connection)
        .map_err(|e| BrokerError::Close(e.to_string()))
}

pub struct AmqpConnector {
    config: BrokerConfig,
}

impl AmqpConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    fn uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.config.username.clone(),
                    password: self.config.password.clone(),
                },
                host: self.config.host.clone(),
                port: self.config.port,
            },
            vhost: self.config.virtual_host.clone(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    fn endpoint(&self) -> String {
        self.config.endpoint()
    }

    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        let connect_err = |e: lapin::Error| BrokerError::Connect {
            endpoint: self.endpoint(),
            reason: e.to_string(),
        };

        let connection = Connection::connect_uri(self.uri(), ConnectionProperties::default())
            .await
            .map_err(connect_err)?;
        info!(endpoint = %self.endpoint(), "Connection opened");

        let channel = connection.create_channel().await.map_err(connect_err)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(connect_err)?;
        info!(channel_id = channel.id(), "Channel created");

        Ok(Arc::new(AmqpBroker {
            connection,
            channel,
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
    closed: AtomicBool,
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions {
            durable: spec.durable,
            ..Default::default()
        };
        self.channel
            .queue_declare(&spec.name, options, FieldTable::default())
            .await
            .map_err(|e| BrokerError::QueueDeclare {
                queue: spec.name.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<Box<dyn Consumer>, BrokerError> {
        let consume_err = |e: lapin::Error| BrokerError::Consume {
            queue: queue.to_string(),
            reason: e.to_string(),
        };

        let auto_ack = options.ack_mode == AckMode::Auto;
        if !auto_ack {
            self.channel
                .basic_qos(options.prefetch, BasicQosOptions::default())
                .await
                .map_err(consume_err)?;
        }

        let inner = self
            .channel
            .basic_consume(
                queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(consume_err)?;

        Ok(Box::new(AmqpConsumer {
            inner,
            tag: options.consumer_tag.clone(),
            auto_ack,
        }))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(lost)
    }

    async fn publish(&self, queue: &str, envelope: &Envelope) -> Result<(), BrokerError> {
        let publish_err = |e: lapin::Error| BrokerError::Publish {
            queue: queue.to_string(),
            reason: e.to_string(),
        };

        let mut properties = BasicProperties::default().with_delivery_mode(PERSISTENT);
        if let Some(content_type) = &envelope.content_type {
            properties = properties.with_content_type(ShortString::from(content_type.as_str()));
        }

        let confirmation = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &envelope.body,
                properties,
            )
            .await
            .map_err(publish_err)?
            .await
            .map_err(publish_err)?;
        confirmed(queue, confirmation)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.connection.status().connected() {
            debug!("Connection already gone; nothing to close");
            return Ok(());
        }

        // Closing the connection closes its channels too; close the channel
        // first anyway so the broker sees an orderly shutdown.
        let channel_closed = if self.channel.status().connected() {
            self.channel.close(REPLY_SUCCESS, "Bye").await
        } else {
            Ok(())
        };
        let connection_closed = self.connection.close(REPLY_SUCCESS, "Bye").await;
        if let Err(err) = first_close_error(channel_closed, connection_closed) {
            // Let a later call try again.
            self.closed.store(false, Ordering::SeqCst);
            return Err(err);
        }
        info!("Connection closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.connection.status().connected()
    }
}

struct AmqpConsumer {
    inner: lapin::Consumer,
    tag: String,
    auto_ack: bool,
}

#[async_trait]
impl Consumer for AmqpConsumer {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn next(&mut self) -> Option<Result<Box<dyn Delivery>, BrokerError>> {
        let delivery = match self.inner.next().await? {
            Ok(delivery) => delivery,
            Err(e) => return Some(Err(lost(e))),
        };

        let content_type = delivery
            .properties
            .content_type()
            .as_ref()
            .map(|ct| ct.as_str().to_string());

        Some(Ok(Box::new(AmqpDelivery {
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            envelope: Envelope::new(content_type, delivery.data),
            acker: delivery.acker,
            auto_ack: self.auto_ack,
        })))
    }
}

struct AmqpDelivery {
    delivery_tag: u64,
    redelivered: bool,
    envelope: Envelope,
    acker: lapin::acker::Acker,
    auto_ack: bool,
}

#[async_trait]
impl Delivery for AmqpDelivery {
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
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack {
                delivery_tag: self.delivery_tag,
                reason: e.to_string(),
            })
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        if self.auto_ack {
            return Ok(());
        }
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| BrokerError::Ack {
                delivery_tag: self.delivery_tag,
                reason: e.to_string(),
            })
    }
}
