//! Fatal-exception policy: the first non-cooperative,
//! non-disposed error observed anywhere in the processor wins, is latched
//! once, and triggers full session cancellation. Every later error is
//! logged and swallowed.

use std::sync::Arc;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::ProcessorError;

/// Shared across every subsystem task so any of them can escalate to a
/// fatal session shutdown, and so shutdown code can report why it happened.
#[derive(Clone)]
pub struct FatalState {
    session_cancel: CancellationToken,
    first_exception: Arc<Mutex<Option<ProcessorError>>>,
}

impl FatalState {
    pub fn new(session_cancel: CancellationToken) -> Self {
        Self {
            session_cancel,
            first_exception: Arc::new(Mutex::new(None)),
        }
    }

    pub fn session_cancellation(&self) -> CancellationToken {
        self.session_cancel.clone()
    }

    pub fn is_stopped_exceptional(&self) -> bool {
        self.first_exception.lock().unwrap().is_some()
    }

    /// Latches `error` as the session's terminal exception if none is set
    /// yet, and cancels the session token. Idempotent: later calls are
    /// logged and otherwise ignored.
    pub fn report_fatal(&self, error: ProcessorError) {
        let mut guard = self.first_exception.lock().unwrap();
        if guard.is_some() {
            warn!("fatal error after session already stopped: {error}");
            return;
        }
        warn!("session stopping on fatal error: {error}");
        *guard = Some(error);
        drop(guard);
        self.session_cancel.cancel();
    }

    pub fn last_exception(&self) -> Option<String> {
        self.first_exception
            .lock()
            .unwrap()
            .as_ref()
            .map(ToString::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins_and_cancels_the_session() {
        let state = FatalState::new(CancellationToken::new());
        state.report_fatal(ProcessorError::Protocol("bad frame".into()));
        state.report_fatal(ProcessorError::Disposed);
        assert!(state.is_stopped_exceptional());
        assert!(state.session_cancellation().is_cancelled());
        assert_eq!(state.last_exception().unwrap(), "protocol violation: bad frame");
    }
}
