//! Bounded outbound event queue, shared between the coordinator (producer)
//! and the single writer task (consumer).
//!
//! Overflow policy: when full, the oldest non-critical event (status chatter,
//! keepalives) is evicted first; a non-critical newcomer is dropped outright.
//! If the queue is full of critical events, the connection is beyond saving
//! and the queue closes with the overflow flag set so the writer can emit a
//! final backpressure diagnostic.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::warn;

use glint_agent::EventSink;
use glint_core::ServerEvent;

#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

struct QueueState {
    queue: VecDeque<ServerEvent>,
    closed: bool,
    overflowed: bool,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::with_capacity(capacity),
                    closed: false,
                    overflowed: false,
                }),
                notify: Notify::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    pub fn push(&self, event: ServerEvent) {
        let mut state = self.inner.state.lock().expect("outbound queue lock");
        if state.closed {
            return;
        }
        if state.queue.len() >= self.inner.capacity {
            if let Some(pos) = state.queue.iter().position(|e| !e.is_critical()) {
                let evicted = state.queue.remove(pos);
                warn!(
                    kind = evicted.map(|e| e.kind_name()).unwrap_or("?"),
                    "outbound queue full, evicted non-critical event"
                );
            } else if !event.is_critical() {
                warn!(
                    kind = event.kind_name(),
                    "outbound queue full, dropped non-critical event"
                );
                return;
            } else {
                state.overflowed = true;
                state.closed = true;
                drop(state);
                self.inner.notify.notify_one();
                return;
            }
        }
        state.queue.push_back(event);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Next event, in enqueue order. Returns `None` once the queue is closed
    /// and drained.
    pub async fn pop(&self) -> Option<ServerEvent> {
        loop {
            {
                let mut state = self.inner.state.lock().expect("outbound queue lock");
                if let Some(event) = state.queue.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    pub fn close(&self) {
        let mut state = self.inner.state.lock().expect("outbound queue lock");
        state.closed = true;
        drop(state);
        self.inner.notify.notify_one();
    }

    pub fn was_overflowed(&self) -> bool {
        self.inner
            .state
            .lock()
            .expect("outbound queue lock")
            .overflowed
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("outbound queue lock")
            .queue
            .len()
    }
}

impl EventSink for EventQueue {
    fn emit(&self, event: ServerEvent) {
        self.push(event);
    }
}
