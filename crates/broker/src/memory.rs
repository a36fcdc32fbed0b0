//! In-process broker backend for tests and local runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use herald_common::error::AppError;

use crate::backend::Broker;
use crate::message::{Delivery, Envelope};
use crate::topology::QueueSpec;

#[derive(Debug, Default)]
struct MemoryQueue {
    ready: VecDeque<(Envelope, bool)>,
    unacked: HashMap<String, Envelope>,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, MemoryQueue>,
    next_tag: u64,
}

/// Broker backend that keeps queues in memory.
///
/// Unacknowledged messages stay parked until acknowledged, transferred, or handed
/// back with [`MemoryBroker::recover`], which stands in for a consumer crash.
pub struct MemoryBroker {
    state: Mutex<State>,
    notify: Notify,
    available: AtomicBool,
    failing_declares: AtomicU32,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            available: AtomicBool::new(true),
            failing_declares: AtomicU32::new(0),
        }
    }

    /// Simulate the broker going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `count` queue declarations fail.
    pub fn fail_next_declares(&self, count: u32) {
        self.failing_declares.store(count, Ordering::SeqCst);
    }

    /// Messages waiting in `queue`, oldest first.
    pub fn messages(&self, queue: &str) -> Vec<Envelope> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|(e, _)| e.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of messages handed out but not yet acknowledged.
    pub fn unacked(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }

    pub fn is_declared(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    /// Return every unacknowledged message in `queue` to the front of the queue,
    /// flagged as redelivered.
    pub fn recover(&self, queue: &str) {
        let mut state = self.state.lock();
        if let Some(q) = state.queues.get_mut(queue) {
            let mut parked: Vec<(String, Envelope)> = q.unacked.drain().collect();
            parked.sort_by(|a, b| b.0.cmp(&a.0));
            for (_, envelope) in parked {
                q.ready.push_front((envelope, true));
            }
        }
        drop(state);
        self.notify.notify_waiters();
    }

    fn check_available(&self) -> Result<(), AppError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::BrokerUnavailable("connection refused".to_string()))
        }
    }

    fn take(&self, queue: &str, max: usize) -> Result<Vec<Delivery>, AppError> {
        let mut state = self.state.lock();
        let State { queues, next_tag } = &mut *state;
        let q = queues
            .get_mut(queue)
            .ok_or_else(|| AppError::BrokerUnavailable(format!("queue '{}' not declared", queue)))?;

        let mut deliveries = Vec::new();
        while deliveries.len() < max {
            let Some((envelope, redelivered)) = q.ready.pop_front() else {
                break;
            };
            *next_tag += 1;
            let tag = format!("{:020}", *next_tag);
            q.unacked.insert(tag.clone(), envelope.clone());
            deliveries.push(Delivery {
                queue: queue.to_string(),
                tag,
                redelivered,
                envelope,
            });
        }
        Ok(deliveries)
    }

    fn settle(&self, delivery: &Delivery) -> Result<(), AppError> {
        let mut state = self.state.lock();
        let removed = state
            .queues
            .get_mut(&delivery.queue)
            .and_then(|q| q.unacked.remove(&delivery.tag));
        match removed {
            Some(_) => Ok(()),
            None => Err(AppError::BrokerUnavailable(format!(
                "unknown delivery tag {} on '{}'",
                delivery.tag, delivery.queue
            ))),
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), AppError> {
        self.check_available()?;
        let pending_failures = self.failing_declares.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.failing_declares
                .store(pending_failures - 1, Ordering::SeqCst);
            return Err(AppError::BrokerUnavailable("connection refused".to_string()));
        }

        self.state
            .lock()
            .queues
            .entry(queue.name.clone())
            .or_default();
        Ok(())
    }

    async fn append(&self, queue: &str, envelope: &Envelope) -> Result<(), AppError> {
        self.check_available()?;
        {
            let mut state = self.state.lock();
            let q = state.queues.get_mut(queue).ok_or_else(|| {
                AppError::BrokerUnavailable(format!("queue '{}' not declared", queue))
            })?;
            q.ready.push_back((envelope.clone(), false));
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        _consumer: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, AppError> {
        self.check_available()?;

        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let deliveries = self.take(queue, max)?;
        if !deliveries.is_empty() || wait.is_zero() {
            return Ok(deliveries);
        }

        let _ = tokio::time::timeout(wait, notified).await;
        self.check_available()?;
        self.take(queue, max)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), AppError> {
        self.check_available()?;
        self.settle(delivery)
    }

    async fn transfer(
        &self,
        delivery: &Delivery,
        targets: &[&str],
        envelope: &Envelope,
    ) -> Result<(), AppError> {
        self.check_available()?;
        {
            let mut state = self.state.lock();
            if let Some(missing) = targets.iter().find(|t| !state.queues.contains_key(**t)) {
                return Err(AppError::BrokerUnavailable(format!(
                    "queue '{}' not declared",
                    missing
                )));
            }
            let removed = state
                .queues
                .get_mut(&delivery.queue)
                .and_then(|q| q.unacked.remove(&delivery.tag));
            if removed.is_none() {
                return Err(AppError::BrokerUnavailable(format!(
                    "unknown delivery tag {} on '{}'",
                    delivery.tag, delivery.queue
                )));
            }
            for target in targets {
                if let Some(q) = state.queues.get_mut(*target) {
                    q.ready.push_back((envelope.clone(), false));
                }
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PublishProperties;

    fn spec(name: &str) -> QueueSpec {
        QueueSpec {
            name: name.to_string(),
            durable: true,
            dead_letter: None,
        }
    }

    fn envelope(id: &str) -> Envelope {
        Envelope::json(
            &serde_json::json!({"id": id}),
            PublishProperties {
                message_id: id.to_string(),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_receive_respects_max_and_parks_unacked() {
        let broker = MemoryBroker::new();
        broker.declare_queue(&spec("q")).await.unwrap();
        for id in ["a", "b", "c"] {
            broker.append("q", &envelope(id)).await.unwrap();
        }

        let got = broker.receive("q", "c1", 2, Duration::ZERO).await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].envelope.message_id, "a");
        assert_eq!(broker.unacked("q"), 2);
        assert_eq!(broker.messages("q").len(), 1);

        broker.ack(&got[0]).await.unwrap();
        assert_eq!(broker.unacked("q"), 1);
        assert!(broker.ack(&got[0]).await.is_err());
    }

    #[tokio::test]
    async fn test_recover_redelivers_in_order() {
        let broker = MemoryBroker::new();
        broker.declare_queue(&spec("q")).await.unwrap();
        broker.append("q", &envelope("a")).await.unwrap();
        broker.append("q", &envelope("b")).await.unwrap();

        let first = broker.receive("q", "c1", 2, Duration::ZERO).await.unwrap();
        assert!(!first[0].redelivered);
        broker.recover("q");

        let again = broker.receive("q", "c2", 2, Duration::ZERO).await.unwrap();
        assert_eq!(again.len(), 2);
        assert_eq!(again[0].envelope.message_id, "a");
        assert!(again.iter().all(|d| d.redelivered));
    }

    #[tokio::test]
    async fn test_receive_wakes_on_append() {
        let broker = std::sync::Arc::new(MemoryBroker::new());
        broker.declare_queue(&spec("q")).await.unwrap();

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.append("q", &envelope("late")).await.unwrap();
        });

        let got = broker
            .receive("q", "c1", 1, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].envelope.message_id, "late");
    }

    #[tokio::test]
    async fn test_unavailable_and_failing_declares() {
        let broker = MemoryBroker::new();
        broker.fail_next_declares(1);
        assert!(broker.declare_queue(&spec("q")).await.is_err());
        broker.declare_queue(&spec("q")).await.unwrap();

        broker.set_available(false);
        assert!(broker.append("q", &envelope("a")).await.is_err());
        broker.set_available(true);
        broker.append("q", &envelope("a")).await.unwrap();
        assert!(broker.append("missing", &envelope("a")).await.is_err());
    }
}
