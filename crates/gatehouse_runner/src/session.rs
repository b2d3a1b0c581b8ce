//! Sessions group the runners started on behalf of one connection.
//!
//! A session owns its runner handles, enforces a concurrency cap, cancels
//! everything on teardown and keeps a record of every run it started.
//!
//! A handle is released once its runner finished and nobody holds its event
//! stream any more; only its [`RunRecord`] stays behind.

use crate::error::{Result, RunnerError};
use crate::hub::{EventHub, Subscription};
use crate::runner::{spawn_runner, RunnerHandle, RunnerOptions};
use chrono::{DateTime, Utc};
use gatehouse_protocol::config::GatehouseConfig;
use gatehouse_protocol::{EventKind, Progress, RunnerId, RunnerState, RunnerTask, SessionId};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_runners: usize,
    pub runner: RunnerOptions,
}

impl SessionConfig {
    pub fn from_config(config: &GatehouseConfig) -> Self {
        Self {
            max_runners: config.max_runners_per_session,
            runner: RunnerOptions::from_config(config),
        }
    }
}

/// One line of a session's run history.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub runner_id: RunnerId,
    pub label: String,
    pub state: RunnerState,
    pub rows: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    fn from_handle(handle: &RunnerHandle) -> Self {
        let events = handle.hub().events();
        let mut rows = 0;
        let mut finished_at = None;
        for event in &events {
            match &event.kind {
                EventKind::Progress(Progress::Rows { rows: n, .. }) => rows = rows.max(*n),
                EventKind::Finished(summary) => rows = summary.rows,
                EventKind::Cancelled { rows: n, .. } => rows = *n,
                _ => {}
            }
            if event.kind.is_terminal() {
                finished_at = Some(event.timestamp);
            }
        }
        Self {
            runner_id: *handle.id(),
            label: handle.label().to_string(),
            state: handle.state(),
            rows,
            started_at: handle.started_at(),
            finished_at,
        }
    }
}

struct SessionInner {
    runners: IndexMap<RunnerId, RunnerHandle>,
    /// Records of released runners.
    finished: IndexMap<RunnerId, RunRecord>,
    closed: bool,
}

impl SessionInner {
    /// Move drained runners into `finished`, dropping their handle and hub.
    fn release_drained(&mut self) {
        let drained: Vec<RunnerId> = self
            .runners
            .iter()
            .filter(|(_, handle)| handle.is_drained())
            .map(|(id, _)| *id)
            .collect();
        for id in drained {
            if let Some(handle) = self.runners.shift_remove(&id) {
                debug!("Releasing finished runner {}", id.short());
                self.finished.insert(id, RunRecord::from_handle(&handle));
            }
        }
    }

    fn active(&self) -> usize {
        self.runners
            .values()
            .filter(|handle| !handle.state().is_terminal())
            .count()
    }
}

pub struct Session {
    id: SessionId,
    conid: String,
    config: SessionConfig,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new(conid: impl Into<String>, config: SessionConfig) -> Self {
        Self {
            id: SessionId::new(),
            conid: conid.into(),
            config,
            inner: Mutex::new(SessionInner {
                runners: IndexMap::new(),
                finished: IndexMap::new(),
                closed: false,
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn conid(&self) -> &str {
        &self.conid
    }

    /// Spawn a runner for `task`. Returns once the runner process is up; the
    /// run itself proceeds asynchronously.
    pub async fn create_runner(&self, task: RunnerTask) -> Result<RunnerId> {
        let mut inner = self.lock().await;
        if inner.closed {
            return Err(RunnerError::SessionClosed);
        }
        let active = inner.active();
        if active >= self.config.max_runners {
            return Err(RunnerError::AtCapacity(active));
        }

        let handle = spawn_runner(task, &self.config.runner)?;
        let id = *handle.id();
        info!(
            "Session {} started runner {} ({} active)",
            self.id.short(),
            id.short(),
            active + 1
        );
        inner.runners.insert(id, handle);
        Ok(id)
    }

    /// Event stream of a runner, replayed from `seq` 0.
    pub async fn subscribe(&self, id: &RunnerId) -> Result<Subscription> {
        match self.lookup(id).await? {
            Tracked::Live(hub) => Ok(hub.subscribe()),
            Tracked::Released(_) => Err(RunnerError::Released(*id)),
        }
    }

    /// Idempotent; cancelling a finished runner is a no-op.
    pub async fn cancel_runner(&self, id: &RunnerId) -> Result<()> {
        let inner = self.lock().await;
        match inner.runners.get(id) {
            Some(handle) => handle.cancel(),
            None if inner.finished.contains_key(id) => {}
            None => return Err(RunnerError::UnknownRunner(*id)),
        }
        Ok(())
    }

    pub async fn cancel_all(&self) {
        let inner = self.lock().await;
        for handle in inner.runners.values() {
            handle.cancel();
        }
    }

    /// Refuse new runners, cancel the active ones and wait until every
    /// runner is terminal.
    pub async fn close(&self) {
        let hubs: Vec<Arc<EventHub>> = {
            let mut inner = self.lock().await;
            inner.closed = true;
            for handle in inner.runners.values() {
                handle.cancel();
            }
            inner.runners.values().map(RunnerHandle::hub).collect()
        };
        for hub in hubs {
            hub.wait().await;
        }
        info!("Session {} closed", self.id.short());
    }

    /// Wait for a runner to reach a terminal state.
    pub async fn wait(&self, id: &RunnerId) -> Result<RunnerState> {
        match self.lookup(id).await? {
            Tracked::Live(hub) => Ok(hub.wait().await),
            Tracked::Released(record) => Ok(record.state),
        }
    }

    pub async fn state(&self, id: &RunnerId) -> Result<RunnerState> {
        match self.lookup(id).await? {
            Tracked::Live(hub) => Ok(hub.state()),
            Tracked::Released(record) => Ok(record.state),
        }
    }

    /// One record per runner, in start order.
    pub async fn history(&self) -> Vec<RunRecord> {
        let inner = self.lock().await;
        let mut records: Vec<RunRecord> = inner
            .finished
            .values()
            .cloned()
            .chain(inner.runners.values().map(RunRecord::from_handle))
            .collect();
        records.sort_by_key(|record| record.started_at);
        records
    }

    pub async fn active_count(&self) -> usize {
        self.lock().await.active()
    }

    /// Runners whose handle is still held, finished or not.
    pub async fn tracked_count(&self) -> usize {
        self.lock().await.runners.len()
    }

    /// Session state with drained runners already released.
    async fn lock(&self) -> MutexGuard<'_, SessionInner> {
        let mut inner = self.inner.lock().await;
        inner.release_drained();
        inner
    }

    async fn lookup(&self, id: &RunnerId) -> Result<Tracked> {
        let inner = self.lock().await;
        if let Some(handle) = inner.runners.get(id) {
            return Ok(Tracked::Live(handle.hub()));
        }
        inner
            .finished
            .get(id)
            .map(|record| Tracked::Released(record.clone()))
            .ok_or_else(|| RunnerError::UnknownRunner(*id))
    }
}

enum Tracked {
    Live(Arc<EventHub>),
    Released(RunRecord),
}

/// Sessions keyed by connection id, created on first use.
pub struct SessionRegistry {
    config: SessionConfig,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn session(&self, conid: &str) -> Arc<Session> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .entry(conid.to_string())
            .or_insert_with(|| Arc::new(Session::new(conid, self.config.clone())));
        Arc::clone(session)
    }

    /// Tear down the session of a closed connection.
    pub async fn close(&self, conid: &str) {
        let session = self.sessions.lock().await.remove(conid);
        if let Some(session) = session {
            session.close().await;
        }
    }

    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
    }
}
