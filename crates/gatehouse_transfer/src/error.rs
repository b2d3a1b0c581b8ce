use crate::archive::ContainerError;
use gatehouse_protocol::FaultStage;
use std::fmt;

/// Payload of a stream `Error` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    pub stage: FaultStage,
    pub message: String,
}

impl StreamError {
    pub fn source(message: impl Into<String>) -> Self {
        Self {
            stage: FaultStage::Source,
            message: message.into(),
        }
    }

    pub fn sink(message: impl Into<String>) -> Self {
        Self {
            stage: FaultStage::Sink,
            message: message.into(),
        }
    }

    pub fn container(message: impl Into<String>) -> Self {
        Self {
            stage: FaultStage::Container,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::source("cancelled")
    }

    /// Classify a writer error. Container errors keep their own stage.
    pub fn from_writer_error(err: &anyhow::Error) -> Self {
        let stage = if err.downcast_ref::<ContainerError>().is_some() {
            FaultStage::Container
        } else {
            FaultStage::Sink
        };
        Self {
            stage,
            message: format!("{:#}", err),
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.stage, self.message)
    }
}

impl std::error::Error for StreamError {}

/// One writer that ended in error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterFailure {
    pub writer: String,
    pub error: StreamError,
}

/// Errors ending a transfer, step or task.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("source '{stream}' failed: {}", .error.message)]
    Source { stream: String, error: StreamError },

    #[error("{}", describe_failures(.0))]
    Writers(Vec<WriterFailure>),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error("cancelled after {rows} rows")]
    Cancelled { rows: u64 },
}

impl TransferError {
    pub fn writer(writer: impl Into<String>, error: StreamError) -> Self {
        TransferError::Writers(vec![WriterFailure {
            writer: writer.into(),
            error,
        }])
    }

    /// Stage reported on the `failed` event. `None` for cancellation.
    pub fn stage(&self) -> Option<FaultStage> {
        match self {
            TransferError::Source { error, .. } => Some(error.stage),
            TransferError::Writers(failures) => Some(
                failures
                    .first()
                    .map(|f| f.error.stage)
                    .unwrap_or(FaultStage::Sink),
            ),
            TransferError::Container(_) => Some(FaultStage::Container),
            TransferError::Cancelled { .. } => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled { .. })
    }
}

fn describe_failures(failures: &[WriterFailure]) -> String {
    if failures.is_empty() {
        return "writer failed".to_string();
    }
    failures
        .iter()
        .map(|f| format!("writer '{}' failed: {}", f.writer, f.error.message))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_failures_are_listed() {
        let err = TransferError::Writers(vec![
            WriterFailure {
                writer: "table local:users".into(),
                error: StreamError::sink("UNIQUE constraint failed"),
            },
            WriterFailure {
                writer: "console".into(),
                error: StreamError::sink("closed"),
            },
        ]);
        assert_eq!(
            err.to_string(),
            "writer 'table local:users' failed: UNIQUE constraint failed; writer 'console' failed: closed"
        );
        assert_eq!(err.stage(), Some(FaultStage::Sink));
    }

    #[test]
    fn container_errors_keep_their_stage() {
        let err = anyhow::Error::new(ContainerError::DuplicateEntry("users".into()));
        assert_eq!(StreamError::from_writer_error(&err).stage, FaultStage::Container);
        assert_eq!(TransferError::Cancelled { rows: 3 }.stage(), None);
    }
}
