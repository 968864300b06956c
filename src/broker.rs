use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::BrokerError;
use crate::job::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One hand-out of a message. Redeliveries keep the message id and bump
/// `attempt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: MessageId,
    pub job_id: JobId,
    pub attempt: u32,
}

impl Delivery {
    /// Owner token stored on a job claimed by this hand-out. Unique per
    /// hand-out, so a redelivery never shares ownership with the run it
    /// replaces.
    pub fn owner_token(&self) -> String {
        format!("{}#{}", self.message_id, self.attempt)
    }

    /// True when `owner` was written by an earlier hand-out of this message.
    pub fn supersedes(&self, owner: &str) -> bool {
        owner
            .split_once('#')
            .is_some_and(|(message_id, attempt)| {
                message_id == self.message_id.to_string()
                    && attempt
                        .parse::<u32>()
                        .is_ok_and(|attempt| attempt < self.attempt)
            })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub ready: usize,
    pub in_flight: usize,
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn enqueue(&self, job_id: JobId) -> Result<MessageId, BrokerError>;

    /// Blocks until a message is visible. `Ok(None)` once the broker is closed.
    async fn dequeue(&self) -> Result<Option<Delivery>, BrokerError>;

    /// Settles the message. Fails with `UnknownDelivery` when `delivery` is
    /// no longer the latest hand-out.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Returns the message to the queue, visible again after `delay`.
    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<(), BrokerError>;

    /// Restarts the visibility timeout of an in-flight delivery.
    async fn extend(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    fn close(&self);

    fn stats(&self) -> BrokerStats;
}

#[derive(Debug, Clone)]
struct Message {
    id: MessageId,
    job_id: JobId,
    attempt: u32,
    visible_at: Instant,
}

#[derive(Debug)]
struct InFlight {
    message: Message,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Message>,
    in_flight: HashMap<MessageId, InFlight>,
    closed: bool,
}

impl QueueState {
    fn reap_expired(&mut self, now: Instant) {
        let expired: Vec<MessageId> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(entry) = self.in_flight.remove(&id) {
                warn!(
                    message_id = %id,
                    job_id = %entry.message.job_id,
                    attempt = entry.message.attempt,
                    "Visibility timeout elapsed; message returned to queue"
                );
                self.ready.push_back(Message {
                    attempt: entry.message.attempt + 1,
                    visible_at: now,
                    ..entry.message
                });
            }
        }
    }

    fn current_hand_out(&mut self, delivery: &Delivery) -> Option<&mut InFlight> {
        self.in_flight
            .get_mut(&delivery.message_id)
            .filter(|entry| entry.message.attempt == delivery.attempt)
    }

    fn take_visible(&mut self, now: Instant) -> Option<Message> {
        let position = self.ready.iter().position(|msg| msg.visible_at <= now)?;
        self.ready.remove(position)
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let ready = self.ready.iter().map(|msg| msg.visible_at);
        let in_flight = self.in_flight.values().map(|entry| entry.deadline);
        ready.chain(in_flight).min()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BrokerSettings {
    pub visibility_timeout: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// In-process queue with visibility-timeout redelivery.
#[derive(Debug)]
pub struct MemoryBroker {
    state: Mutex<QueueState>,
    notify: Notify,
    settings: BrokerSettings,
}

impl MemoryBroker {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            settings,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, BrokerError> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Unavailable("broker lock poisoned".into()))
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(BrokerSettings::default())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, job_id: JobId) -> Result<MessageId, BrokerError> {
        let id = MessageId::new();
        {
            let mut state = self.lock()?;
            if state.closed {
                return Err(BrokerError::Closed);
            }
            state.ready.push_back(Message {
                id,
                job_id,
                attempt: 1,
                visible_at: Instant::now(),
            });
        }
        debug!(message_id = %id, job_id = %job_id, "Message enqueued");
        self.notify.notify_one();
        Ok(id)
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, BrokerError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wakeup = {
                let mut state = self.lock()?;
                if state.closed {
                    return Ok(None);
                }
                let now = Instant::now();
                state.reap_expired(now);
                if let Some(message) = state.take_visible(now) {
                    let delivery = Delivery {
                        message_id: message.id,
                        job_id: message.job_id,
                        attempt: message.attempt,
                    };
                    state.in_flight.insert(
                        message.id,
                        InFlight {
                            message,
                            deadline: now + self.settings.visibility_timeout,
                        },
                    );
                    return Ok(Some(delivery));
                }
                state.next_wakeup()
            };

            match wakeup {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        if state.current_hand_out(delivery).is_some() {
            state.in_flight.remove(&delivery.message_id);
            return Ok(());
        }
        // An expired delivery that nobody picked up yet is still ours to settle.
        let before = state.ready.len();
        state
            .ready
            .retain(|msg| !(msg.id == delivery.message_id && msg.attempt == delivery.attempt + 1));
        if state.ready.len() < before {
            Ok(())
        } else {
            Err(BrokerError::UnknownDelivery(delivery.message_id))
        }
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<(), BrokerError> {
        {
            let mut state = self.lock()?;
            if state.current_hand_out(delivery).is_none() {
                return Err(BrokerError::UnknownDelivery(delivery.message_id));
            }
            let entry = state
                .in_flight
                .remove(&delivery.message_id)
                .ok_or(BrokerError::UnknownDelivery(delivery.message_id))?;
            state.ready.push_back(Message {
                attempt: entry.message.attempt + 1,
                visible_at: Instant::now() + delay,
                ..entry.message
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn extend(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        let entry = state
            .current_hand_out(delivery)
            .ok_or(BrokerError::UnknownDelivery(delivery.message_id))?;
        entry.deadline = Instant::now() + self.settings.visibility_timeout;
        Ok(())
    }

    fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        self.notify.notify_waiters();
    }

    fn stats(&self) -> BrokerStats {
        self.state
            .lock()
            .map(|state| BrokerStats {
                ready: state.ready.len(),
                in_flight: state.in_flight.len(),
            })
            .unwrap_or_default()
    }
}
