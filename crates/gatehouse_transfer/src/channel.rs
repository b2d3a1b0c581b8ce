use std::sync::mpsc::{SyncSender, TrySendError};
use std::time::Duration;

/// Interval at which a blocked send re-checks cancellation.
pub(crate) const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Result of a bounded send that can be interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendOutcome {
    Sent,
    /// The receiving side is gone.
    Closed,
    /// `stop` became true while the queue was full.
    Stopped,
}

/// Send into a bounded queue, waiting while it is full.
///
/// The wait re-checks `stop` every [`CANCEL_POLL_INTERVAL`], so a consumer
/// that never drains cannot wedge the producer past cancellation.
pub(crate) fn send_or_stop<T>(
    tx: &SyncSender<T>,
    item: T,
    stop: impl Fn() -> bool,
) -> SendOutcome {
    let mut item = item;
    loop {
        match tx.try_send(item) {
            Ok(()) => return SendOutcome::Sent,
            Err(TrySendError::Disconnected(_)) => return SendOutcome::Closed,
            Err(TrySendError::Full(back)) => {
                if stop() {
                    return SendOutcome::Stopped;
                }
                item = back;
                std::thread::sleep(CANCEL_POLL_INTERVAL);
            }
        }
    }
}
