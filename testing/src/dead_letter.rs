//! In-memory dead-letter sink.

use reliable_events_core::dead_letter::{DeadLetter, DeadLetterSink};
use reliable_events_core::message::MessageId;
use reliable_events_core::persistence::PersistenceError;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct SinkState {
    letters: Vec<DeadLetter>,
    failing: bool,
}

/// Collects dead letters in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeadLetterSink {
    state: Arc<Mutex<SinkState>>,
}

impl InMemoryDeadLetterSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every `send` fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    /// Dead letters received so far.
    #[must_use]
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.lock().letters.clone()
    }

    /// Whether a dead letter exists for `message_id`.
    #[must_use]
    pub fn contains(&self, message_id: MessageId) -> bool {
        self.lock().letters.iter().any(|l| l.message_id == message_id)
    }

    /// Number of dead letters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().letters.len()
    }

    /// Whether nothing was dead-lettered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().letters.is_empty()
    }
}

impl DeadLetterSink for InMemoryDeadLetterSink {
    fn send<'a>(
        &'a self,
        dead_letter: &'a DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.lock();
            if state.failing {
                return Err(PersistenceError::DatabaseError(
                    "dead-letter sink unavailable".to_string(),
                ));
            }
            state.letters.push(dead_letter.clone());
            Ok(())
        })
    }
}
