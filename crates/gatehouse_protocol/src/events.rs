//! Runner life-cycle states and the events published per runner.

use crate::types::{Row, SchemaInfo};
use chrono::{DateTime, Utc};
use gatehouse_ids::RunnerId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stage of the pipeline that produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultStage {
    Source,
    Sink,
    Container,
    Runner,
}

impl FaultStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultStage::Source => "source",
            FaultStage::Sink => "sink",
            FaultStage::Container => "container",
            FaultStage::Runner => "runner",
        }
    }
}

impl fmt::Display for FaultStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Runner life-cycle. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunnerState {
    #[default]
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunnerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerState::Created => "created",
            RunnerState::Running => "running",
            RunnerState::Completed => "completed",
            RunnerState::Failed => "failed",
            RunnerState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunnerState::Completed | RunnerState::Failed | RunnerState::Cancelled
        )
    }

    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: RunnerState) -> bool {
        match (self, next) {
            (RunnerState::Created, RunnerState::Running) => true,
            (RunnerState::Created, s) | (RunnerState::Running, s) => s.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Intermediate progress reported while a runner works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Progress {
    /// Rows read so far from `stream`.
    Rows { stream: String, rows: u64 },
    EntryStarted { entry: String },
    EntryFinished { entry: String, rows: u64 },
    StepStarted { index: usize, label: String },
    StepFinished { index: usize },
}

/// Rows written by one writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSummary {
    pub writer: String,
    pub rows: u64,
}

/// Rows captured by a collector sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectedRows {
    pub name: String,
    pub schema: SchemaInfo,
    pub rows: Vec<Row>,
    /// True when rows beyond the collector limit were dropped.
    #[serde(default)]
    pub truncated: bool,
}

/// Payload of a `finished` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RunSummary {
    /// Rows read across all streams.
    pub rows: u64,
    #[serde(default)]
    pub outputs: Vec<OutputSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collected: Vec<CollectedRows>,
}

/// Payload of a `failed` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub stage: FaultStage,
    pub message: String,
    /// Extra diagnostics, e.g. the tail of the runner log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RunFailure {
    pub fn new(stage: FaultStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            detail: None,
        }
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.stage, self.message)
    }
}

/// Event body. Serialized as `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    Started {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        label: String,
    },
    Schema {
        stream: String,
        schema: SchemaInfo,
    },
    Progress(Progress),
    Finished(RunSummary),
    Failed(RunFailure),
    Cancelled {
        message: String,
        rows: u64,
    },
}

impl EventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::Finished(_) | EventKind::Failed(_) | EventKind::Cancelled { .. }
        )
    }

    /// State a runner ends in after publishing this event.
    pub fn terminal_state(&self) -> Option<RunnerState> {
        match self {
            EventKind::Finished(_) => Some(RunnerState::Completed),
            EventKind::Failed(_) => Some(RunnerState::Failed),
            EventKind::Cancelled { .. } => Some(RunnerState::Cancelled),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::Started { .. } => "started",
            EventKind::Schema { .. } => "schema",
            EventKind::Progress(_) => "progress",
            EventKind::Finished(_) => "finished",
            EventKind::Failed(_) => "failed",
            EventKind::Cancelled { .. } => "cancelled",
        }
    }
}

/// Event as delivered to subscribers: gap-free `seq` per runner, starting at 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerEvent {
    pub runner_id: RunnerId,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions() {
        assert!(RunnerState::Created.can_transition_to(RunnerState::Running));
        assert!(RunnerState::Running.can_transition_to(RunnerState::Cancelled));
        assert!(RunnerState::Created.can_transition_to(RunnerState::Failed));
        assert!(!RunnerState::Running.can_transition_to(RunnerState::Created));
        assert!(!RunnerState::Completed.can_transition_to(RunnerState::Failed));
        assert!(!RunnerState::Cancelled.can_transition_to(RunnerState::Running));
    }

    #[test]
    fn event_wire_shape() {
        let event = RunnerEvent {
            runner_id: RunnerId::new(),
            seq: 3,
            timestamp: Utc::now(),
            kind: EventKind::Progress(Progress::Rows {
                stream: "users".into(),
                rows: 1000,
            }),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["payload"]["stage"], "rows");
        assert_eq!(json["payload"]["rows"], 1000);
        assert_eq!(json["seq"], 3);

        let back: RunnerEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn terminal_kinds() {
        let failed = EventKind::Failed(RunFailure::new(FaultStage::Sink, "disk full"));
        assert_eq!(failed.terminal_state(), Some(RunnerState::Failed));
        assert_eq!(failed.type_name(), "failed");
        assert!(!EventKind::Started {
            pid: None,
            label: "x".into()
        }
        .is_terminal());
    }
}
