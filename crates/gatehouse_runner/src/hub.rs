//! Per-runner event log with replaying subscriptions.
//!
//! Every published event gets the next `seq` (starting at 0) and is appended
//! to the log. A new subscriber first receives the whole log and then live
//! events, with no gap and no duplicate between the two. Nothing is
//! published after the terminal event.

use chrono::Utc;
use gatehouse_protocol::{EventKind, RunnerEvent, RunnerId, RunnerState};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::debug;

struct HubState {
    next_seq: u64,
    log: Vec<RunnerEvent>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<RunnerEvent>>,
    next_subscriber: u64,
    closed: bool,
}

pub struct EventHub {
    runner_id: RunnerId,
    state: Mutex<HubState>,
    status: watch::Sender<RunnerState>,
}

impl EventHub {
    pub fn new(runner_id: RunnerId) -> Arc<Self> {
        let (status, _) = watch::channel(RunnerState::Created);
        Arc::new(Self {
            runner_id,
            state: Mutex::new(HubState {
                next_seq: 0,
                log: Vec::new(),
                subscribers: HashMap::new(),
                next_subscriber: 0,
                closed: false,
            }),
            status,
        })
    }

    pub fn runner_id(&self) -> &RunnerId {
        &self.runner_id
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Append and deliver an event. Returns `None` once the hub is closed.
    pub fn publish(&self, kind: EventKind) -> Option<RunnerEvent> {
        let mut state = self.lock();
        if state.closed {
            debug!(
                "Dropping {} event for finished runner {}",
                kind.type_name(),
                self.runner_id.short()
            );
            return None;
        }

        let next_state = match &kind {
            EventKind::Started { .. } => Some(RunnerState::Running),
            other => other.terminal_state(),
        };
        let terminal = kind.is_terminal();

        let event = RunnerEvent {
            runner_id: self.runner_id,
            seq: state.next_seq,
            timestamp: Utc::now(),
            kind,
        };
        state.next_seq += 1;
        state.log.push(event.clone());
        state
            .subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());

        if terminal {
            state.closed = true;
            // dropping the senders ends every subscription after this event
            state.subscribers.clear();
        }
        drop(state);

        if let Some(next) = next_state {
            self.status.send_if_modified(|current| {
                if current.can_transition_to(next) {
                    *current = next;
                    true
                } else {
                    false
                }
            });
        }
        Some(event)
    }

    /// Subscribe from `seq` 0.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        for event in &state.log {
            // receiver is alive in this scope
            let _ = tx.send(event.clone());
        }
        let key = state.next_subscriber;
        state.next_subscriber += 1;
        if !state.closed {
            state.subscribers.insert(key, tx);
        }
        drop(state);

        Subscription {
            key,
            rx,
            hub: Arc::clone(self),
        }
    }

    pub fn state(&self) -> RunnerState {
        *self.status.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Snapshot of everything published so far.
    pub fn events(&self) -> Vec<RunnerEvent> {
        self.lock().log.clone()
    }

    pub fn terminal_event(&self) -> Option<RunnerEvent> {
        let state = self.lock();
        if !state.closed {
            return None;
        }
        state.log.last().cloned()
    }

    /// Wait until the runner reaches a terminal state.
    pub async fn wait(&self) -> RunnerState {
        let mut rx = self.status.subscribe();
        let reached = match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            // sender lives in self
            Err(_) => self.state(),
        };
        reached
    }

    fn unsubscribe(&self, key: u64) {
        self.lock().subscribers.remove(&key);
    }
}

/// Event stream of one runner. Ends after the terminal event.
pub struct Subscription {
    key: u64,
    rx: mpsc::UnboundedReceiver<RunnerEvent>,
    hub: Arc<EventHub>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<RunnerEvent> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Option<RunnerEvent> {
        self.rx.try_recv().ok()
    }

    pub fn runner_id(&self) -> &RunnerId {
        self.hub.runner_id()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.key);
    }
}
