use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace};

use flowline_core::{Clock, CoreError, MessageBus, Record, SystemClock, Topic};

// Delayed records are re-checked at this interval while a consumer waits
const DELAYED_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Default)]
struct Queues {
    topics: HashMap<Topic, VecDeque<Record>>,
    closed: bool,
}

impl Queues {
    fn pop_ready(&mut self, topic: Topic, now: DateTime<Utc>) -> Option<Record> {
        let queue = self.topics.get_mut(&topic)?;
        let index = queue
            .iter()
            .position(|record| record.deliver_at.map(|at| at <= now).unwrap_or(true))?;
        queue.remove(index)
    }

    fn has_delayed(&self, topic: Topic) -> bool {
        self.topics
            .get(&topic)
            .map(|queue| queue.iter().any(|record| record.deliver_at.is_some()))
            .unwrap_or(false)
    }
}

/// In-memory message bus with one FIFO queue per topic.
///
/// Records with `deliver_at` stay queued until the bus clock reaches that
/// instant. Records that are ready keep their publish order.
pub struct InMemoryMessageBus {
    queues: Mutex<Queues>,
    notify: Notify,
    clock: Arc<dyn Clock>,
}

impl InMemoryMessageBus {
    /// Bus using the wall clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Bus that evaluates delayed delivery against `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
            notify: Notify::new(),
            clock,
        }
    }

    /// Next ready record on a topic, without waiting
    pub async fn try_consume(&self, topic: Topic) -> Option<Record> {
        let now = self.clock.now();
        self.queues.lock().await.pop_ready(topic, now)
    }

    /// Every ready record on a topic, in order
    pub async fn drain(&self, topic: Topic) -> Vec<Record> {
        let now = self.clock.now();
        let mut queues = self.queues.lock().await;
        let mut drained = Vec::new();
        while let Some(record) = queues.pop_ready(topic, now) {
            drained.push(record);
        }
        drained
    }

    /// Records queued on a topic, ready or not
    pub async fn queued(&self, topic: Topic) -> usize {
        self.queues
            .lock()
            .await
            .topics
            .get(&topic)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Earliest delivery instant among delayed records on a topic
    pub async fn next_delivery(&self, topic: Topic) -> Option<DateTime<Utc>> {
        self.queues
            .lock()
            .await
            .topics
            .get(&topic)?
            .iter()
            .filter_map(|record| record.deliver_at)
            .min()
    }

    /// Stop accepting records and release waiting consumers once their
    /// topics run dry
    pub async fn close(&self) {
        self.queues.lock().await.closed = true;
        self.notify.notify_waiters();
        debug!("Message bus closed");
    }
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, records: Vec<Record>) -> Result<(), CoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut queues = self.queues.lock().await;
        if queues.closed {
            return Err(CoreError::BusError("bus is closed".to_string()));
        }
        for record in records {
            trace!(topic = ?record.topic, key = %record.key, "Publishing record");
            queues.topics.entry(record.topic).or_default().push_back(record);
        }
        drop(queues);

        self.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, topic: Topic) -> Result<Option<Record>, CoreError> {
        loop {
            let notified = self.notify.notified();
            let has_delayed = {
                let mut queues = self.queues.lock().await;
                if let Some(record) = queues.pop_ready(topic, self.clock.now()) {
                    return Ok(Some(record));
                }
                if queues.closed {
                    return Ok(None);
                }
                queues.has_delayed(topic)
            };

            if has_delayed {
                let _ = tokio::time::timeout(DELAYED_POLL_INTERVAL, notified).await;
            } else {
                notified.await;
            }
        }
    }
}
