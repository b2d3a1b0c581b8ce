//! Canonical default values shared by the orchestrator and runner processes.

/// Rows buffered per writer before the reader is suspended.
pub const DEFAULT_WRITER_QUEUE_DEPTH: usize = 256;
/// Rows between two progress events.
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 1000;
/// Rows per grouped insert statement batch.
pub const DEFAULT_INSERT_BATCH_SIZE: usize = 500;
/// Records sampled for schema inference on untyped sources.
pub const DEFAULT_SAMPLE_ROWS: usize = 256;
/// Maximum rows retained by a collector writer.
pub const DEFAULT_COLLECTOR_LIMIT: usize = 10_000;
/// Time a runner gets to stop cooperatively before it is killed.
pub const DEFAULT_CANCEL_GRACE_MS: u64 = 5000;
/// Maximum concurrently running runners per session.
pub const DEFAULT_MAX_RUNNERS_PER_SESSION: usize = 8;
/// Name of the runner binary looked up next to the current executable.
pub const DEFAULT_RUNNER_EXECUTABLE: &str = "gatehouse-runner";
pub const CANCELLED_BY_USER_MESSAGE: &str = "Cancelled by user";
