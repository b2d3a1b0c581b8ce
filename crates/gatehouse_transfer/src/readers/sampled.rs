//! Schema inference for untyped sources.
//!
//! Sheets and JSON-lines files carry no types. [`SampledReader`] buffers the
//! first `sample_rows` records, infers a schema from them and then streams
//! the buffered and remaining records coerced to that schema.

use crate::error::StreamError;
use crate::stream::{ObjectReader, StreamEvent};
use gatehouse_protocol::{ColumnInfo, DataType, Row, SchemaInfo, Value};
use indexmap::IndexMap;
use std::collections::VecDeque;

/// Record-level access to an untyped source.
pub(crate) trait RecordSource: Send {
    /// Next record, `None` at end of input.
    fn next_record(&mut self) -> Option<Result<Row, String>>;
}

/// Interpret a text cell: empty is null, then bool, integer, float, text.
pub(crate) fn parse_cell(cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    if cell.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if cell.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if let Ok(v) = cell.parse::<i64>() {
        return Value::Int(v);
    }
    if cell.bytes().any(|b| b.is_ascii_digit()) {
        if let Ok(v) = cell.parse::<f64>() {
            return Value::Float(v);
        }
    }
    Value::Text(cell.to_string())
}

/// Convert a value to a column type where that is lossless.
pub(crate) fn coerce(value: Value, data_type: DataType) -> Value {
    match (value, data_type) {
        (Value::Int(v), DataType::Float64) => Value::Float(v as f64),
        (Value::Text(v), DataType::String) => Value::Text(v),
        (Value::Null, _) => Value::Null,
        (v, DataType::String) => Value::Text(v.to_cell()),
        (v, _) => v,
    }
}

/// Accumulates column names in first-seen order and their merged types.
#[derive(Default)]
struct SchemaBuilder {
    columns: IndexMap<String, DataType>,
}

impl SchemaBuilder {
    fn observe(&mut self, row: &Row) {
        for (name, value) in row {
            let seen = self.columns.entry(name.clone()).or_default();
            *seen = seen.merge(DataType::of(value));
        }
    }

    fn build(self) -> SchemaInfo {
        SchemaInfo::new(
            self.columns
                .into_iter()
                .map(|(name, data_type)| ColumnInfo::new(name, data_type))
                .collect(),
        )
    }
}

enum Phase {
    Start,
    Buffered,
    Streaming,
    Done,
}

pub(crate) struct SampledReader<S: RecordSource> {
    name: String,
    source: S,
    declared: Option<SchemaInfo>,
    sample_rows: usize,
    schema: SchemaInfo,
    buffer: VecDeque<Row>,
    records: u64,
    phase: Phase,
}

impl<S: RecordSource> SampledReader<S> {
    pub fn new(
        name: impl Into<String>,
        source: S,
        declared: Option<SchemaInfo>,
        sample_rows: usize,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            declared,
            sample_rows: sample_rows.max(1),
            schema: SchemaInfo::default(),
            buffer: VecDeque::new(),
            records: 0,
            phase: Phase::Start,
        }
    }

    fn fail(&mut self, message: String) -> StreamEvent {
        self.phase = Phase::Done;
        self.buffer.clear();
        StreamEvent::Error(StreamError::source(message))
    }

    fn shape(&self, row: Row) -> Row {
        let mut shaped = Row::with_capacity(row.len());
        for (name, value) in row {
            let data_type = self
                .schema
                .column(&name)
                .map(|c| c.data_type)
                .unwrap_or_default();
            shaped.insert(name, coerce(value, data_type));
        }
        shaped
    }

    fn start(&mut self) -> StreamEvent {
        if let Some(declared) = self.declared.take() {
            self.schema = declared;
            self.phase = Phase::Streaming;
            return StreamEvent::Schema(self.schema.clone());
        }

        let mut builder = SchemaBuilder::default();
        while self.buffer.len() < self.sample_rows {
            match self.source.next_record() {
                None => break,
                Some(Ok(row)) => {
                    builder.observe(&row);
                    self.buffer.push_back(row);
                }
                Some(Err(message)) => return self.fail(message),
            }
        }
        self.schema = builder.build();
        self.phase = Phase::Buffered;
        StreamEvent::Schema(self.schema.clone())
    }

    fn stream_next(&mut self) -> StreamEvent {
        match self.source.next_record() {
            None => {
                self.phase = Phase::Done;
                StreamEvent::End
            }
            Some(Err(message)) => self.fail(message),
            Some(Ok(row)) => {
                let record = self.records + 1;
                if let Some(unknown) = row.keys().find(|k| !self.schema.contains(k)) {
                    let message = format!(
                        "record {} has column '{}' which is not in the stream schema",
                        record, unknown
                    );
                    return self.fail(message);
                }
                self.records += 1;
                StreamEvent::Row(self.shape(row))
            }
        }
    }
}

impl<S: RecordSource> ObjectReader for SampledReader<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_event(&mut self) -> StreamEvent {
        match self.phase {
            Phase::Start => self.start(),
            Phase::Buffered => match self.buffer.pop_front() {
                Some(row) => {
                    self.records += 1;
                    StreamEvent::Row(self.shape(row))
                }
                None => {
                    self.phase = Phase::Streaming;
                    self.stream_next()
                }
            },
            Phase::Streaming => self.stream_next(),
            Phase::Done => StreamEvent::End,
        }
    }

    fn cancel(&mut self) {
        self.phase = Phase::Done;
        self.buffer.clear();
    }
}
