//! Presence-gated retry queue: a bounded FIFO of undelivered envelopes with
//! a fixed backoff schedule and a hard TTL. A single ticker drives
//! processing and parks itself while the queue is empty.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};

use crate::sdk::envelope::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Sending,
    Delivered,
    Failed,
    Expired,
}

impl DeliveryState {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Sending => "sending",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Failed => "failed",
            DeliveryState::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryStatus {
    pub message_id: String,
    pub status: DeliveryState,
    pub attempts: usize,
    pub at: String,
}

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message_id: String,
    pub recipient: String,
    pub payload: Envelope,
    pub group_id: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: usize,
    pub next_retry_at: DateTime<Utc>,
}

pub struct RetryQueue {
    entries: Mutex<VecDeque<QueuedMessage>>,
    /// Delay before attempt N+1; exhausting it fails the message.
    schedule: Vec<Duration>,
    ttl: Duration,
    max_size: usize,
    pub events: broadcast::Sender<DeliveryStatus>,
    wake: Notify,
    stopped: AtomicBool,
}

impl Default for RetryQueue {
    fn default() -> Self {
        Self::new(
            vec![
                Duration::from_secs(10),
                Duration::from_secs(30),
                Duration::from_secs(90),
            ],
            Duration::from_secs(3600),
            100,
        )
    }
}

impl RetryQueue {
    pub fn new(schedule: Vec<Duration>, ttl: Duration, max_size: usize) -> Self {
        let (events, _) = broadcast::channel(256);
        RetryQueue {
            entries: Mutex::new(VecDeque::new()),
            schedule,
            ttl,
            max_size,
            events,
            wake: Notify::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn emit(&self, message_id: &str, status: DeliveryState, attempts: usize) {
        let _ = self.events.send(DeliveryStatus {
            message_id: message_id.to_string(),
            status,
            attempts,
            at: Utc::now().to_rfc3339(),
        });
    }

    /// Returns false when the queue is full; the caller records the message
    /// as failed.
    pub fn enqueue(&self, payload: Envelope, group_id: Option<String>) -> bool {
        let now = Utc::now();
        let first_delay = self.schedule.first().copied().unwrap_or(Duration::ZERO);
        let message_id = payload.message_id.clone();
        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            if entries.len() >= self.max_size {
                return false;
            }
            entries.push_back(QueuedMessage {
                message_id: message_id.clone(),
                recipient: payload.recipient.clone(),
                group_id,
                enqueued_at: now,
                attempts: 0,
                next_retry_at: now + ChronoDuration::from_std(first_delay).unwrap_or_default(),
                payload,
            });
        }
        self.emit(&message_id, DeliveryState::Pending, 0);
        self.wake.notify_one();
        true
    }

    /// One processing pass: expire anything past the TTL, then run the
    /// injected send function for every due entry. Success removes the
    /// entry; failure schedules the next backoff step or, once the schedule
    /// is exhausted, fails the message.
    pub async fn process_due<F, Fut>(&self, now: DateTime<Utc>, send: F)
    where
        F: Fn(QueuedMessage) -> Fut,
        Fut: Future<Output = Result<(), crate::sdk::error::SdkError>>,
    {
        let ttl = ChronoDuration::from_std(self.ttl).unwrap_or_default();

        let due: Vec<QueuedMessage> = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

            let mut expired = Vec::new();
            entries.retain(|e| {
                if now - e.enqueued_at >= ttl {
                    expired.push((e.message_id.clone(), e.attempts));
                    false
                } else {
                    true
                }
            });
            for (id, attempts) in &expired {
                let _ = self.events.send(DeliveryStatus {
                    message_id: id.clone(),
                    status: DeliveryState::Expired,
                    attempts: *attempts,
                    at: now.to_rfc3339(),
                });
            }

            entries
                .iter()
                .filter(|e| e.next_retry_at <= now)
                .cloned()
                .collect()
        };

        for entry in due {
            self.emit(&entry.message_id, DeliveryState::Sending, entry.attempts);
            let message_id = entry.message_id.clone();
            match send(entry).await {
                Ok(()) => {
                    let attempts = self.remove(&message_id);
                    self.emit(&message_id, DeliveryState::Delivered, attempts);
                }
                Err(_) => {
                    let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
                    let Some(entry) = entries.iter_mut().find(|e| e.message_id == message_id)
                    else {
                        continue;
                    };
                    entry.attempts += 1;
                    if entry.attempts >= self.schedule.len() {
                        let attempts = entry.attempts;
                        entries.retain(|e| e.message_id != message_id);
                        drop(entries);
                        self.emit(&message_id, DeliveryState::Failed, attempts);
                    } else {
                        let delay = self.schedule[entry.attempts];
                        entry.next_retry_at =
                            now + ChronoDuration::from_std(delay).unwrap_or_default();
                    }
                }
            }
        }
    }

    fn remove(&self, message_id: &str) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let attempts = entries
            .iter()
            .find(|e| e.message_id == message_id)
            .map(|e| e.attempts)
            .unwrap_or(0);
        entries.retain(|e| e.message_id != message_id);
        attempts
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Drive the queue until stopped. Sleeps on the notifier while empty, so
    /// the timer effectively stops with an empty queue.
    pub async fn run<F, Fut>(self: Arc<Self>, tick: Duration, send: F)
    where
        F: Fn(QueuedMessage) -> Fut,
        Fut: Future<Output = Result<(), crate::sdk::error::SdkError>>,
    {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            if self.is_empty() {
                self.wake.notified().await;
                continue;
            }
            tokio::time::sleep(tick).await;
            self.process_due(Utc::now(), &send).await;
        }
    }
}
