use crate::error::StreamError;
use crate::stream::{ObjectReader, StreamEvent};
use gatehouse_protocol::{ColumnInfo, DataType, Row, SchemaInfo, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Synthetic `{id, name}` rows with optional pacing and failure injection.
pub(crate) struct FakeReader {
    name: String,
    total: u64,
    delay: Option<Duration>,
    fail_after: Option<u64>,
    cancel: CancellationToken,
    emitted: u64,
    schema_sent: bool,
    done: bool,
}

impl FakeReader {
    pub fn new(
        name: String,
        total: u64,
        delay_ms: Option<u64>,
        fail_after: Option<u64>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name,
            total,
            delay: delay_ms.filter(|ms| *ms > 0).map(Duration::from_millis),
            fail_after,
            cancel,
            emitted: 0,
            schema_sent: false,
            done: false,
        }
    }

    pub fn schema() -> SchemaInfo {
        SchemaInfo::new(vec![
            ColumnInfo::new("id", DataType::Int64).not_null(),
            ColumnInfo::new("name", DataType::String),
        ])
    }
}

impl ObjectReader for FakeReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_event(&mut self) -> StreamEvent {
        if self.done {
            return StreamEvent::End;
        }
        if !self.schema_sent {
            self.schema_sent = true;
            return StreamEvent::Schema(Self::schema());
        }
        if self.fail_after == Some(self.emitted) {
            self.done = true;
            return StreamEvent::Error(StreamError::source(format!(
                "fake source failed after {} rows",
                self.emitted
            )));
        }
        if self.emitted >= self.total {
            self.done = true;
            return StreamEvent::End;
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.cancel.is_cancelled() {
            self.done = true;
            return StreamEvent::Error(StreamError::cancelled());
        }

        self.emitted += 1;
        let mut row = Row::with_capacity(2);
        row.insert("id".into(), Value::Int(self.emitted as i64));
        row.insert("name".into(), Value::Text(format!("row{}", self.emitted)));
        StreamEvent::Row(row)
    }

    fn cancel(&mut self) {
        self.done = true;
    }
}
