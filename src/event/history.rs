//! Event history - recent lifecycle events with sequential ids
//!
//! Attached to the bus for every [`ServerEvent`], it provides:
//! - polling by id via `get_since()` (`GET /api/server/events?since=<id>`)
//! - the most recent entries via `recent()`
//! - real-time delivery via `subscribe()`

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

use super::{EventBus, ServerEvent};

pub const DEFAULT_HISTORY: usize = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Sequential ID for polling
    pub id: u64,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    pub event: ServerEvent,
}

/// Ring buffer that stores recent events with sequential IDs.
struct EventBuffer {
    records: VecDeque<EventRecord>,
    next_id: u64,
    max_size: usize,
}

impl EventBuffer {
    fn with_capacity(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            records: VecDeque::with_capacity(max_size),
            next_id: 0,
            max_size,
        }
    }

    fn push(&mut self, event: ServerEvent) -> EventRecord {
        let record = EventRecord {
            id: self.next_id,
            timestamp: current_timestamp(),
            event,
        };
        self.next_id += 1;

        if self.records.len() >= self.max_size {
            self.records.pop_front();
        }
        self.records.push_back(record.clone());
        record
    }

    fn get_since(&self, since_id: u64) -> Vec<EventRecord> {
        self.records
            .iter()
            .filter(|r| r.id > since_id)
            .cloned()
            .collect()
    }

    fn get_recent(&self, count: usize) -> Vec<EventRecord> {
        self.records.iter().rev().take(count).rev().cloned().collect()
    }
}

pub struct EventHistory {
    buffer: Mutex<EventBuffer>,
    broadcast: broadcast::Sender<EventRecord>,
}

impl EventHistory {
    pub fn with_capacity(max_size: usize) -> Self {
        let (broadcast, _) = broadcast::channel(256);
        Self {
            buffer: Mutex::new(EventBuffer::with_capacity(max_size)),
            broadcast,
        }
    }

    /// Subscribes a new history to every event on `bus`.
    pub fn attach(bus: &EventBus, max_size: usize) -> Arc<Self> {
        let history = Arc::new(Self::with_capacity(max_size));
        for event in ServerEvent::ALL {
            let history = history.clone();
            bus.subscribe(event, move || {
                history.record(event);
                async { anyhow::Ok(()) }
            });
        }
        history
    }

    fn buffer(&self) -> MutexGuard<'_, EventBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, event: ServerEvent) -> EventRecord {
        let record = self.buffer().push(event);
        // no receivers is fine
        let _ = self.broadcast.send(record.clone());
        record
    }

    /// All records with `id > since_id`.
    pub fn get_since(&self, since_id: u64) -> Vec<EventRecord> {
        self.buffer().get_since(since_id)
    }

    /// The most recent `count` records, oldest first.
    pub fn recent(&self, count: usize) -> Vec<EventRecord> {
        self.buffer().get_recent(count)
    }

    /// Real-time feed of records pushed after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.broadcast.subscribe()
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
