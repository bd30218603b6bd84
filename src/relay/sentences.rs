//! Reply assembly.
//!
//! The live service streams a reply as many small text parts. Readers
//! downstream want whole sentences, so parts are joined until the text ends
//! in `.`, `!` or `?`.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::session::SessionState;
use crate::sink::{ResponseFragment, ResponseObserver};

const TERMINATORS: [char; 3] = ['.', '!', '?'];

/// Joins streamed text until it ends a sentence.
#[derive(Debug, Default)]
pub struct SentenceBuffer {
    pending: String,
}

impl SentenceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk`. Returns the trimmed reply once the buffered text ends
    /// in a terminator, leaving the buffer empty.
    pub fn push(&mut self, chunk: &str) -> Option<String> {
        self.pending.push_str(chunk);
        let text = self.pending.trim();
        if !text.ends_with(TERMINATORS) {
            return None;
        }
        let reply = text.to_string();
        self.pending.clear();
        Some(reply)
    }

    /// Take whatever is buffered, if it holds any text.
    pub fn flush(&mut self) -> Option<String> {
        let pending = std::mem::take(&mut self.pending);
        let text = pending.trim();
        (!text.is_empty()).then(|| text.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.pending.trim().is_empty()
    }
}

/// Forwards whole replies to `inner` instead of raw fragments.
///
/// A reply is stamped with the arrival time of its last fragment. Text still
/// buffered when the session ends (`Idle` or `Failed`) is forwarded as is.
pub struct SentenceObserver {
    buffer: Mutex<SentenceBuffer>,
    inner: Arc<dyn ResponseObserver>,
}

impl SentenceObserver {
    pub fn new(inner: Arc<dyn ResponseObserver>) -> Self {
        Self {
            buffer: Mutex::new(SentenceBuffer::new()),
            inner,
        }
    }

    fn buffer(&self) -> std::sync::MutexGuard<'_, SentenceBuffer> {
        self.buffer.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl ResponseObserver for SentenceObserver {
    fn on_fragment(&self, fragment: &ResponseFragment) -> anyhow::Result<()> {
        let Some(text) = self.buffer().push(&fragment.text) else {
            return Ok(());
        };
        self.inner.on_fragment(&ResponseFragment {
            text,
            received_at: fragment.received_at,
        })
    }

    fn on_status(&self, state: &SessionState) -> anyhow::Result<()> {
        if matches!(state, SessionState::Idle | SessionState::Failed(_)) {
            let rest = self.buffer().flush();
            if let Some(text) = rest {
                debug!(chars = text.len(), "forwarding unterminated reply");
                self.inner.on_fragment(&ResponseFragment::now(text))?;
            }
        }
        self.inner.on_status(state)
    }
}
