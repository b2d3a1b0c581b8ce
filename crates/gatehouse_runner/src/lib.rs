//! Runner processes and the sessions that own them.
//!
//! The orchestrator spawns one `gatehouse-runner exec` child per task, sends
//! it a `Start` frame on stdin and relays the `Event` frames it writes to
//! stdout into a per-runner [`EventHub`]. Cancellation is a `Cancel` frame,
//! followed by a kill once the grace period expires.

pub mod error;
pub mod exec;
pub mod hub;
pub mod ipc;
pub mod runner;
pub mod session;

pub use error::{Result, RunnerError};
pub use exec::{run_child, run_to_frames};
pub use hub::{EventHub, Subscription};
pub use runner::{spawn_runner, RunnerHandle, RunnerOptions};
pub use session::{RunRecord, Session, SessionConfig, SessionRegistry};
