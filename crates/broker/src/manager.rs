//! Broker topology manager.
//!
//! Owns the declared [`Topology`], resolves exchanges/bindings on publish, and drives
//! consumers: each delivered message goes to a [`MessageHandler`] whose
//! [`Disposition`] decides whether it is acknowledged, requeued after a delay, or
//! routed to its queue's dead-letter exchange.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;

use herald_common::config::BrokerSettings;
use herald_common::error::AppError;
use herald_common::types::Channel;

use crate::backend::Broker;
use crate::message::{Delivery, Envelope, PublishProperties};
use crate::topology::{LIVE_EXCHANGE, Topology};

/// What to do with a delivery once its handler has finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Processing reached a terminal success; remove the message.
    Ack,
    /// Hold the message for `delay`, then put it back with its retry count incremented.
    Requeue { delay: Duration },
    /// Reject without requeue; the message follows its queue's dead-letter route.
    Reject { reason: String },
}

/// Per-message consumer callback.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Disposition;
}

/// Declares the topology and exposes publish/consume on top of a [`Broker`] backend.
pub struct TopologyManager {
    broker: Arc<dyn Broker>,
    topology: Topology,
    settings: BrokerSettings,
    connected: AtomicBool,
}

impl TopologyManager {
    pub fn new(broker: Arc<dyn Broker>, topology: Topology, settings: BrokerSettings) -> Self {
        Self {
            broker,
            topology,
            settings,
            connected: AtomicBool::new(false),
        }
    }

    /// Live queue consumed for `channel`.
    pub fn queue_for(channel: Channel) -> &'static str {
        channel.queue_name()
    }

    /// Whether the topology has been declared on the current connection.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Round-trip to the backend by re-declaring the topology.
    pub async fn check(&self) -> Result<(), AppError> {
        if !self.is_connected() {
            return Err(AppError::BrokerUnavailable(
                "broker channel not established".to_string(),
            ));
        }
        self.declare().await
    }

    async fn declare(&self) -> Result<(), AppError> {
        for queue in &self.topology.queues {
            self.broker.declare_queue(queue).await?;
        }
        Ok(())
    }

    /// Declare the topology, retrying with a fixed delay.
    ///
    /// Fails after `connect_attempts`; a process cannot run without its broker.
    pub async fn connect(&self) -> Result<(), AppError> {
        let attempts = self.settings.connect_attempts.max(1);

        for attempt in 1..=attempts {
            match self.declare().await {
                Ok(()) => {
                    self.connected.store(true, Ordering::SeqCst);
                    tracing::info!(
                        exchanges = self.topology.exchanges.len(),
                        queues = self.topology.queues.len(),
                        bindings = self.topology.bindings.len(),
                        "Broker topology declared"
                    );
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!(attempt, attempts, error = %e, "Broker connection failed");
                    if attempt < attempts {
                        tracing::warn!(
                            delay_ms = self.settings.connect_delay.as_millis() as u64,
                            remaining = attempts - attempt,
                            "Retrying broker connection"
                        );
                        tokio::time::sleep(self.settings.connect_delay).await;
                    }
                }
            }
        }

        Err(AppError::BrokerUnavailable(format!(
            "broker not available after {} attempts",
            attempts
        )))
    }

    /// Re-establish a dropped connection, retrying forever with a fixed backoff.
    pub async fn reconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            tokio::time::sleep(self.settings.reconnect_delay).await;
            match self.declare().await {
                Ok(()) => {
                    self.connected.store(true, Ordering::SeqCst);
                    tracing::info!(attempt, "Broker connection re-established, topology re-declared");
                    return;
                }
                Err(e) => tracing::warn!(attempt, error = %e, "Broker reconnect failed"),
            }
        }
    }

    /// Publish `payload` to the live exchange.
    pub async fn publish<T: Serialize + Sync>(
        &self,
        routing_key: &str,
        payload: &T,
        properties: PublishProperties,
    ) -> Result<(), AppError> {
        self.publish_to(LIVE_EXCHANGE, routing_key, payload, properties)
            .await
    }

    /// Publish `payload` as a persistent JSON message on `exchange`.
    ///
    /// Fails when the topology has not been declared or nothing is bound to `routing_key`.
    pub async fn publish_to<T: Serialize + Sync>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        properties: PublishProperties,
    ) -> Result<(), AppError> {
        if !self.is_connected() {
            return Err(AppError::BrokerUnavailable(
                "broker channel not established".to_string(),
            ));
        }

        if !self.topology.has_exchange(exchange) {
            return Err(AppError::Config(format!("exchange '{}' not declared", exchange)));
        }
        let targets = self.topology.route(exchange, routing_key);
        if targets.is_empty() {
            return Err(AppError::Config(format!(
                "no queue bound to exchange '{}' with routing key '{}'",
                exchange, routing_key
            )));
        }

        let envelope = Envelope::json(payload, properties)?;
        for queue in &targets {
            self.broker.append(queue, &envelope).await?;
        }

        tracing::debug!(
            exchange,
            routing_key,
            message_id = %envelope.message_id,
            correlation_id = %envelope.correlation_id,
            "Message published"
        );
        Ok(())
    }

    /// Fetch up to `prefetch` messages from `queue` and settle each through `handler`.
    ///
    /// Returns the number of messages handled. Messages in one batch are handled
    /// concurrently; with the default prefetch of 1 this is strictly one at a time.
    pub async fn consume_once(
        &self,
        queue: &str,
        consumer: &str,
        handler: &dyn MessageHandler,
    ) -> Result<usize, AppError> {
        if !self.is_connected() {
            return Err(AppError::BrokerUnavailable(
                "broker channel not established".to_string(),
            ));
        }

        let deliveries = self
            .broker
            .receive(
                queue,
                consumer,
                self.settings.prefetch.max(1),
                self.settings.poll_wait,
            )
            .await?;

        let handled = deliveries.len();
        let results = join_all(deliveries.iter().map(|d| self.settle(d, handler))).await;
        for result in results {
            result?;
        }
        Ok(handled)
    }

    /// Consume `queue` until the task is cancelled, reconnecting on broker errors.
    pub async fn consume(&self, queue: &str, consumer: &str, handler: &dyn MessageHandler) {
        tracing::info!(queue, consumer, prefetch = self.settings.prefetch, "Consumer started");
        loop {
            match self.consume_once(queue, consumer, handler).await {
                Ok(0) => tokio::task::yield_now().await,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(queue, error = %e, "Consumer lost its broker connection");
                    self.reconnect().await;
                }
            }
        }
    }

    async fn settle(&self, delivery: &Delivery, handler: &dyn MessageHandler) -> Result<(), AppError> {
        match handler.handle(delivery).await {
            Disposition::Ack => self.broker.ack(delivery).await,
            Disposition::Requeue { delay } => {
                let next = delivery.envelope.next_attempt();
                tracing::debug!(
                    queue = %delivery.queue,
                    message_id = %delivery.envelope.message_id,
                    retry_count = next.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Requeueing after backoff"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                self.broker
                    .transfer(delivery, &[delivery.queue.as_str()], &next)
                    .await
            }
            Disposition::Reject { reason } => self.dead_letter(delivery, &reason).await,
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), AppError> {
        let targets = self.topology.dead_letter_targets(&delivery.queue);
        if targets.is_empty() {
            tracing::warn!(
                queue = %delivery.queue,
                message_id = %delivery.envelope.message_id,
                reason,
                "Rejected message has no dead-letter route, discarding"
            );
            return self.broker.ack(delivery).await;
        }

        let envelope = delivery.envelope.dead_lettered(&delivery.queue, reason);
        self.broker.transfer(delivery, &targets, &envelope).await?;

        tracing::warn!(
            queue = %delivery.queue,
            message_id = %delivery.envelope.message_id,
            correlation_id = %delivery.envelope.correlation_id,
            dead_letter_queues = ?targets,
            reason,
            "Message dead-lettered"
        );
        Ok(())
    }
}
