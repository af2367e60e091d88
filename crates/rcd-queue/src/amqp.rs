//! AMQP bus gateway
//!
//! Declares exchanges and queues, binds them, consumes the service's route and
//! publishes JSON documents. Every broker operation goes through the shared
//! [`ConnectionManager`]; faults are classified, logged and reported back to
//! it instead of being returned to dispatch code.

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use lapin::{
    acker::Acker,
    message::Delivery,
    options::*,
    types::{AMQPValue, FieldTable},
    BasicProperties, ExchangeKind,
};
use rcd_common::TaskSupervisor;
use parking_lot::Mutex;
use rcd_config::{BrokerConfig, ConsumeRoute, ExchangeType, PublishRoute};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionManager, ConnectionSettings};
use crate::{Broker, MessageHandler, Publisher, QueueError, Result};

/// Exchange kind as lapin understands it
pub fn exchange_kind(exchange_type: ExchangeType) -> ExchangeKind {
    match exchange_type {
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Headers => ExchangeKind::Headers,
        ExchangeType::Delayed | ExchangeType::ConsistentHash => {
            ExchangeKind::Custom(exchange_type.as_str().to_string())
        }
    }
}

fn exchange_arguments(exchange_type: ExchangeType) -> FieldTable {
    let mut args = FieldTable::default();
    if exchange_type == ExchangeType::Delayed {
        args.insert("x-delayed-type".into(), AMQPValue::LongString("direct".into()));
    }
    args
}

/// Acks parked by deliveries whose handler task ended without acking
type ParkedAcks = Arc<Mutex<Vec<(u64, Acker)>>>;

/// An ack owed for one delivery. Acked explicitly once the handler returns;
/// if dropped first (task aborted during shutdown) the acker is parked and
/// settled by the broker before the channel closes.
struct PendingAck {
    delivery_tag: u64,
    acker: Option<Acker>,
    parked: ParkedAcks,
}

impl PendingAck {
    fn new(delivery_tag: u64, acker: Acker, parked: ParkedAcks) -> Self {
        Self {
            delivery_tag,
            acker: Some(acker),
            parked,
        }
    }

    async fn ack(mut self) -> std::result::Result<(), lapin::Error> {
        match self.acker.take() {
            Some(acker) => acker.ack(BasicAckOptions::default()).await,
            None => Ok(()),
        }
    }
}

impl Drop for PendingAck {
    fn drop(&mut self) {
        if let Some(acker) = self.acker.take() {
            debug!(delivery_tag = self.delivery_tag, "Delivery ack parked");
            self.parked.lock().push((self.delivery_tag, acker));
        }
    }
}

pub struct AmqpBroker {
    connection: Arc<ConnectionManager>,
    route: Option<ConsumeRoute>,
    supervisor: Arc<TaskSupervisor>,
    consumer_tag: String,
    stopped: AtomicBool,
    parked: ParkedAcks,
}

impl AmqpBroker {
    pub fn new(
        config: &BrokerConfig,
        service: &str,
        route: Option<ConsumeRoute>,
        supervisor: Arc<TaskSupervisor>,
    ) -> Self {
        let settings = ConnectionSettings::from_config(config, &format!("rcd-{}", service));
        Self::with_connection(Arc::new(ConnectionManager::new(settings)), route, supervisor)
    }

    pub fn with_connection(
        connection: Arc<ConnectionManager>,
        route: Option<ConsumeRoute>,
        supervisor: Arc<TaskSupervisor>,
    ) -> Self {
        Self {
            connection,
            route,
            supervisor,
            consumer_tag: format!("rcd-consumer-{}", uuid::Uuid::new_v4()),
            stopped: AtomicBool::new(false),
            parked: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Turn a lapin result into an option, reporting the fault on failure
    async fn settle<T>(&self, op: &'static str, result: std::result::Result<T, lapin::Error>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                let err = QueueError::from(e);
                warn!(op, "Broker operation failed");
                self.connection.report_fault(&err).await;
                None
            }
        }
    }

    /// Declare a durable exchange; redeclaring with the same type is a no-op
    pub async fn declare_exchange(&self, exchange_type: ExchangeType, name: &str) -> Option<()> {
        let channel = self.connection.channel().await?;
        let result = channel
            .exchange_declare(
                name,
                exchange_kind(exchange_type),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                exchange_arguments(exchange_type),
            )
            .await;
        let declared = self.settle("exchange_declare", result).await;
        if declared.is_some() {
            debug!(exchange = name, exchange_type = %exchange_type, "Exchange declared");
        }
        declared
    }

    /// Declare a durable queue
    pub async fn declare_queue(&self, name: &str) -> Option<lapin::Queue> {
        let channel = self.connection.channel().await?;
        let result = channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;
        let queue = self.settle("queue_declare", result).await;
        if let Some(queue) = &queue {
            debug!(queue = name, messages = queue.message_count(), "Queue declared");
        }
        queue
    }

    pub async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Option<()> {
        let channel = self.connection.channel().await?;
        let result = channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await;
        let bound = self.settle("queue_bind", result).await;
        if bound.is_some() {
            debug!(queue, exchange, routing_key, "Queue bound");
        }
        bound
    }

    /// Set up the route and pump deliveries until the stream ends, a
    /// delivery error occurs, or shutdown is requested
    async fn consume_once(
        &self,
        route: &ConsumeRoute,
        handler: &Arc<dyn MessageHandler>,
        token: &CancellationToken,
    ) -> Result<()> {
        self.declare_exchange(route.exchange_type, &route.exchange)
            .await
            .ok_or_else(|| QueueError::Broker(format!("cannot declare exchange {}", route.exchange)))?;
        self.declare_queue(&route.queue_name)
            .await
            .ok_or_else(|| QueueError::Broker(format!("cannot declare queue {}", route.queue_name)))?;
        self.bind_queue(&route.queue_name, &route.exchange, route.binding_key())
            .await
            .ok_or_else(|| QueueError::Broker(format!("cannot bind queue {}", route.queue_name)))?;

        let channel = self
            .connection
            .channel()
            .await
            .ok_or_else(|| QueueError::Channel("no channel available".to_string()))?;
        let result = channel
            .basic_consume(
                &route.queue_name,
                &self.consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;
        let mut consumer = self
            .settle("basic_consume", result)
            .await
            .ok_or_else(|| QueueError::Broker(format!("cannot consume {}", route.queue_name)))?;

        info!(
            queue = %route.queue_name,
            exchange = %route.exchange,
            binding_key = route.binding_key(),
            auto_ack = route.auto_ack,
            "Consuming"
        );

        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                next = consumer.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.on_delivery(delivery, route.auto_ack, handler).await,
                Some(Err(e)) => {
                    let err = QueueError::from(e);
                    self.connection.report_fault(&err).await;
                    return Err(err);
                }
                None => {
                    warn!(queue = %route.queue_name, "Consumer stream ended");
                    self.connection
                        .report_fault(&QueueError::Channel("consumer stream ended".to_string()))
                        .await;
                    return Ok(());
                }
            }
        }
    }

    /// Hand one delivery to the handler as a supervised task. With auto-ack
    /// the delivery is acked right away; otherwise it is acked once the
    /// handler has finished, whether it succeeded, panicked or was aborted.
    async fn on_delivery(&self, delivery: Delivery, auto_ack: bool, handler: &Arc<dyn MessageHandler>) {
        let Delivery {
            delivery_tag,
            data,
            acker,
            ..
        } = delivery;
        debug!(delivery_tag, bytes = data.len(), "Delivery received");
        self.ack_parked().await;

        let handler = Arc::clone(handler);

        if auto_ack {
            let accepted = self.supervisor.spawn("handle-delivery", async move {
                handler.handle(data).await;
                Ok(())
            });
            if !accepted {
                warn!(delivery_tag, "Shutting down, delivery not handled");
            }
            self.ack(&acker, delivery_tag).await;
            return;
        }

        let connection = Arc::clone(&self.connection);
        let pending = PendingAck::new(delivery_tag, acker, Arc::clone(&self.parked));
        let accepted = self.supervisor.spawn("handle-delivery", async move {
            let outcome = AssertUnwindSafe(handler.handle(data)).catch_unwind().await;
            if let Err(e) = pending.ack().await {
                connection.report_fault(&QueueError::from(e)).await;
            }
            if outcome.is_err() {
                anyhow::bail!("handler panicked on delivery {}", delivery_tag);
            }
            Ok(())
        });
        if !accepted {
            // The refused future, and the ack it owned, were dropped and parked
            warn!(delivery_tag, "Shutting down, delivery not handled");
            self.ack_parked().await;
        }
    }

    /// Settle acks parked by aborted handler tasks
    async fn ack_parked(&self) {
        let parked = std::mem::take(&mut *self.parked.lock());
        for (delivery_tag, acker) in parked {
            self.ack(&acker, delivery_tag).await;
        }
    }

    async fn ack(&self, acker: &Acker, delivery_tag: u64) {
        let result = acker.ack(BasicAckOptions::default()).await;
        if self.settle("basic_ack", result).await.is_some() {
            debug!(delivery_tag, "Delivery acknowledged");
        }
    }
}

#[async_trait]
impl Publisher for AmqpBroker {
    async fn publish(&self, body: &serde_json::Value, destination: &PublishRoute) {
        if self.is_stopped() {
            warn!(exchange = %destination.exchange, "Broker is stopped, message dropped");
            return;
        }

        let payload = match serde_json::to_vec(body) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to serialize message");
                return;
            }
        };

        if self
            .declare_exchange(destination.exchange_type, &destination.exchange)
            .await
            .is_none()
        {
            error!(exchange = %destination.exchange, "Exchange unavailable, message dropped");
            return;
        }

        let Some(channel) = self.connection.channel().await else {
            error!(exchange = %destination.exchange, "No channel, message dropped");
            return;
        };

        let result = channel
            .basic_publish(
                &destination.exchange,
                destination.routing_key(),
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type("application/json".into()),
            )
            .await;
        let Some(confirm) = self.settle("basic_publish", result).await else {
            return;
        };
        if self.settle("publish_confirm", confirm.await).await.is_some() {
            debug!(
                exchange = %destination.exchange,
                routing_key = destination.routing_key(),
                bytes = payload.len(),
                "Message published"
            );
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn consume(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let route = self
            .route
            .clone()
            .ok_or_else(|| QueueError::Config("no consume route configured".to_string()))?;
        let token = self.supervisor.cancellation_token();
        let delay = self.connection.settings().reconnect_delay;

        while !token.is_cancelled() && !self.is_stopped() {
            if let Err(e) = self.consume_once(&route, &handler, &token).await {
                error!(error = %e, queue = %route.queue_name, "Broker consumption is failed");
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(queue = %route.queue_name, "Consume loop finished");
        Ok(())
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("Broker already stopped");
            return;
        }
        self.ack_parked().await;
        self.connection.close().await;
        info!("Broker stopped");
    }
}
