use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use dockhand_types::JobStatus;
use tokio::sync::mpsc;

/// How a job ended, as delivered to subscribers when the ring closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingTerminal {
    pub status: JobStatus,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingMessage {
    Line(String),
    Closed(RingTerminal),
}

#[derive(Debug)]
struct RingState {
    lines: VecDeque<String>,
    capacity: usize,
    sinks: HashMap<u64, mpsc::UnboundedSender<RingMessage>>,
    next_sink_id: u64,
    closed: Option<RingTerminal>,
}

/// Bounded per-job line buffer with live fan-out.
///
/// Buffer mutation and delivery happen under one lock, and `subscribe`
/// snapshots and registers under the same lock, so a subscriber sees every
/// retained line exactly once: either in its backlog or live.
#[derive(Debug, Clone)]
pub struct OutputRing {
    inner: Arc<Mutex<RingState>>,
}

/// A registered sink. Dropping it unregisters the sink.
#[derive(Debug)]
pub struct RingSubscription {
    pub backlog: Vec<String>,
    /// Set when the ring was already closed at subscribe time; no live
    /// messages will follow.
    pub closed: Option<RingTerminal>,
    id: u64,
    receiver: mpsc::UnboundedReceiver<RingMessage>,
    ring: Weak<Mutex<RingState>>,
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl OutputRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RingState {
                lines: VecDeque::new(),
                capacity: capacity.max(1),
                sinks: HashMap::new(),
                next_sink_id: 1,
                closed: None,
            })),
        }
    }

    /// Stores the line and pushes it to every live sink. Empty lines and
    /// appends after `close` are dropped; returns whether the line was kept.
    pub fn append(&self, line: impl Into<String>) -> bool {
        let line = line.into();
        if line.is_empty() {
            return false;
        }
        let mut state = lock_unpoisoned(&self.inner);
        if state.closed.is_some() {
            return false;
        }
        if state.lines.len() >= state.capacity {
            state.lines.pop_front();
        }
        state.lines.push_back(line.clone());

        let mut dead = Vec::new();
        for (id, sink) in &state.sinks {
            if sink.send(RingMessage::Line(line.clone())).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            state.sinks.remove(&id);
        }
        true
    }

    pub fn subscribe(&self) -> RingSubscription {
        let (tx, receiver) = mpsc::unbounded_channel();
        let mut state = lock_unpoisoned(&self.inner);
        let backlog: Vec<String> = state.lines.iter().cloned().collect();
        let id = state.next_sink_id;
        state.next_sink_id += 1;
        let closed = state.closed;
        if closed.is_none() {
            state.sinks.insert(id, tx);
        }
        RingSubscription {
            backlog,
            closed,
            id,
            receiver,
            ring: Arc::downgrade(&self.inner),
        }
    }

    /// Delivers the terminal marker and clears every sink. Idempotent; the
    /// first terminal wins.
    pub fn close(&self, terminal: RingTerminal) {
        let mut state = lock_unpoisoned(&self.inner);
        if state.closed.is_some() {
            return;
        }
        state.closed = Some(terminal);
        for (_, sink) in state.sinks.drain() {
            let _ = sink.send(RingMessage::Closed(terminal));
        }
    }

    pub fn is_closed(&self) -> bool {
        lock_unpoisoned(&self.inner).closed.is_some()
    }

    /// The last `n` retained lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let state = lock_unpoisoned(&self.inner);
        let skip = state.lines.len().saturating_sub(n);
        state.lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.inner).lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscriber_count(&self) -> usize {
        lock_unpoisoned(&self.inner).sinks.len()
    }
}

impl RingSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next live message. `None` once the ring has closed and the terminal
    /// marker was consumed, or if the subscription started closed.
    pub async fn recv(&mut self) -> Option<RingMessage> {
        self.receiver.recv().await
    }
}

impl Drop for RingSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.ring.upgrade() {
            lock_unpoisoned(&inner).sinks.remove(&self.id);
        }
    }
}
