//! # Response Sink
//!
//! Append-only in-memory log of model responses plus observer fan-out.
//! Observers are isolated from each other and from the receive loop: an
//! observer that errors or panics is logged and the next one still runs.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Local};
use tracing::{error, warn};

use crate::session::SessionState;

/// One piece of streamed model text.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFragment {
    pub text: String,
    pub received_at: DateTime<Local>,
}

impl ResponseFragment {
    /// Fragment stamped with the current local time.
    pub fn now(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            received_at: Local::now(),
        }
    }
}

impl fmt::Display for ResponseFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.received_at.format("%H:%M:%S"), self.text)
    }
}

/// Receives fragments and session status changes.
pub trait ResponseObserver: Send + Sync {
    fn on_fragment(&self, fragment: &ResponseFragment) -> anyhow::Result<()>;

    fn on_status(&self, _state: &SessionState) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct ResponseSink {
    log: Mutex<Vec<ResponseFragment>>,
    observers: RwLock<Vec<Arc<dyn ResponseObserver>>>,
}

impl ResponseSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer(&self, observer: Arc<dyn ResponseObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(observer);
    }

    /// Store `fragment` and forward it to every observer, in registration
    /// order. Never fails.
    pub fn append(&self, fragment: ResponseFragment) {
        self.log
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(fragment.clone());

        for observer in self.snapshot_observers() {
            match catch_unwind(AssertUnwindSafe(|| observer.on_fragment(&fragment))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("response observer failed: {:#}", e),
                Err(_) => error!("response observer panicked; fragment skipped for it"),
            }
        }
    }

    /// Push a status change to every observer.
    pub fn notify_status(&self, state: &SessionState) {
        for observer in self.snapshot_observers() {
            match catch_unwind(AssertUnwindSafe(|| observer.on_status(state))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("status observer failed: {:#}", e),
                Err(_) => error!("status observer panicked"),
            }
        }
    }

    /// Copy of the log in arrival order.
    pub fn fragments(&self) -> Vec<ResponseFragment> {
        self.log.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.log.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot_observers(&self) -> Vec<Arc<dyn ResponseObserver>> {
        self.observers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}
