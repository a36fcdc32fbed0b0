//! Declarative broker topology: exchanges, queues, bindings and dead-letter routes.
//!
//! Exchanges are direct (exact routing-key match). Every process declares the same
//! topology on startup; declaration is idempotent.

use serde::{Deserialize, Serialize};

use herald_common::types::Channel;

/// Exchange carrying live notification traffic.
pub const LIVE_EXCHANGE: &str = "notifications.direct";
/// Exchange receiving dead-lettered traffic.
pub const DEAD_LETTER_EXCHANGE: &str = "notifications.failed";
/// Holding queue for messages that exhausted retries or failed permanently.
pub const DEAD_LETTER_QUEUE: &str = "failed.queue";

/// A named direct exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    pub durable: bool,
}

/// Where a queue sends messages that are rejected without requeue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRoute {
    pub exchange: String,
    pub routing_key: String,
}

/// A durable queue, optionally with a dead-letter route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub dead_letter: Option<DeadLetterRoute>,
}

/// Binds `queue` to `exchange` for messages published with `routing_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
}

/// Full set of exchanges, queues and bindings a process relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<Binding>,
}

impl Topology {
    /// The notification pipeline topology.
    ///
    /// One live exchange with a queue per channel, one dead-letter exchange feeding
    /// `failed.queue` on each channel's `<channel>_failed` routing key.
    pub fn notifications() -> Self {
        let mut topology = Topology::default()
            .exchange(LIVE_EXCHANGE)
            .exchange(DEAD_LETTER_EXCHANGE);

        for channel in Channel::ALL {
            topology = topology
                .queue(QueueSpec {
                    name: channel.queue_name().to_string(),
                    durable: true,
                    dead_letter: Some(DeadLetterRoute {
                        exchange: DEAD_LETTER_EXCHANGE.to_string(),
                        routing_key: channel.failed_routing_key().to_string(),
                    }),
                })
                .bind(LIVE_EXCHANGE, channel.routing_key(), channel.queue_name());
        }

        topology = topology.queue(QueueSpec {
            name: DEAD_LETTER_QUEUE.to_string(),
            durable: true,
            dead_letter: None,
        });
        for channel in Channel::ALL {
            topology = topology.bind(
                DEAD_LETTER_EXCHANGE,
                channel.failed_routing_key(),
                DEAD_LETTER_QUEUE,
            );
        }

        topology
    }

    pub fn exchange(mut self, name: &str) -> Self {
        if !self.exchanges.iter().any(|e| e.name == name) {
            self.exchanges.push(ExchangeSpec {
                name: name.to_string(),
                durable: true,
            });
        }
        self
    }

    pub fn queue(mut self, spec: QueueSpec) -> Self {
        self.queues.retain(|q| q.name != spec.name);
        self.queues.push(spec);
        self
    }

    pub fn bind(mut self, exchange: &str, routing_key: &str, queue: &str) -> Self {
        let binding = Binding {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        };
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        self
    }

    /// Queues that receive a message published to `exchange` with `routing_key`.
    pub fn route(&self, exchange: &str, routing_key: &str) -> Vec<&str> {
        self.bindings
            .iter()
            .filter(|b| b.exchange == exchange && b.routing_key == routing_key)
            .map(|b| b.queue.as_str())
            .collect()
    }

    pub fn queue_spec(&self, name: &str) -> Option<&QueueSpec> {
        self.queues.iter().find(|q| q.name == name)
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.exchanges.iter().any(|e| e.name == name)
    }

    /// Queues a rejected message from `queue` is transferred to.
    ///
    /// Empty when the queue has no dead-letter route or the route has no binding.
    pub fn dead_letter_targets(&self, queue: &str) -> Vec<&str> {
        match self.queue_spec(queue).and_then(|q| q.dead_letter.as_ref()) {
            Some(route) => self.route(&route.exchange, &route.routing_key),
            None => Vec::new(),
        }
    }
}
