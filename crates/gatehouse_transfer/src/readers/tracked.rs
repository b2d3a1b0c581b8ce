//! File-backed readers registered with the run's finalizer.
//!
//! The open file belongs to the finalizer until the stream reaches its end,
//! so a run that stops pulling still closes it from `run_all`.

use crate::error::StreamError;
use crate::finalizer::{CleanupToken, Finalizer};
use crate::stream::{ObjectReader, StreamEvent};
use std::sync::{Arc, Mutex, MutexGuard};

type Slot = Arc<Mutex<Option<Box<dyn ObjectReader>>>>;

pub(crate) struct TrackedReader {
    name: String,
    inner: Slot,
    finalizer: Finalizer,
    cleanup: Option<CleanupToken>,
}

impl TrackedReader {
    pub fn new(reader: Box<dyn ObjectReader>, finalizer: &Finalizer) -> Self {
        let name = reader.name().to_string();
        let inner: Slot = Arc::new(Mutex::new(Some(reader)));
        let slot = Arc::clone(&inner);
        let cleanup = finalizer.register(format!("reader {}", name), move || {
            let reader = lock(&slot).take();
            if let Some(mut reader) = reader {
                reader.cancel();
            }
            Ok(())
        });
        Self {
            name,
            inner,
            finalizer: finalizer.clone(),
            cleanup: Some(cleanup),
        }
    }

    fn close(&mut self) {
        let reader = lock(&self.inner).take();
        drop(reader);
        if let Some(token) = self.cleanup.take() {
            self.finalizer.dismiss(token);
        }
    }
}

fn lock(slot: &Slot) -> MutexGuard<'_, Option<Box<dyn ObjectReader>>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ObjectReader for TrackedReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_event(&mut self) -> StreamEvent {
        let event = match lock(&self.inner).as_mut() {
            Some(reader) => reader.next_event(),
            None => StreamEvent::Error(StreamError::cancelled()),
        };
        if event.is_terminal() {
            self.close();
        }
        event
    }

    fn cancel(&mut self) {
        if let Some(reader) = lock(&self.inner).as_mut() {
            reader.cancel();
        }
        self.close();
    }
}

impl Drop for TrackedReader {
    fn drop(&mut self) {
        self.close();
    }
}
