use std::time::Duration;

use async_trait::async_trait;

use herald_common::error::AppError;

use crate::message::{Delivery, Envelope};
use crate::topology::QueueSpec;

/// Storage primitives a broker backend provides to the topology manager.
///
/// Routing (exchanges, bindings, dead-letter routes) lives in the manager; a backend
/// only knows queues. Every error is reported as [`AppError::BrokerUnavailable`].
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create `queue` if it does not exist. Must be idempotent.
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), AppError>;

    /// Append a message to the tail of `queue`.
    async fn append(&self, queue: &str, envelope: &Envelope) -> Result<(), AppError>;

    /// Hand out up to `max` messages to `consumer`, waiting at most `wait` when none are ready.
    ///
    /// Messages left unacknowledged by a consumer that went away are handed out
    /// again once they have been idle long enough.
    async fn receive(
        &self,
        queue: &str,
        consumer: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, AppError>;

    /// Remove a delivered message for good.
    async fn ack(&self, delivery: &Delivery) -> Result<(), AppError>;

    /// Atomically acknowledge `delivery` and append `envelope` to each of `targets`.
    ///
    /// Used for requeue (target is the source queue) and dead-lettering.
    async fn transfer(
        &self,
        delivery: &Delivery,
        targets: &[&str],
        envelope: &Envelope,
    ) -> Result<(), AppError>;
}
