//! The in-memory session handle.
//!
//! A [`ChatSession`] owns the state of one conversation plus a tokenizer
//! binding for one model. Ending its scope releases the binding and writes
//! the state back, exactly once, on every exit path:
//!
//! - [`ChatSession::dispose`] performs release-then-flush explicitly;
//! - [`ChatSession::scope`] runs a closure and disposes afterwards, even when
//!   the closure fails or panics;
//! - dropping an undisposed handle releases the binding immediately and hands
//!   the pending flush to the current Tokio runtime.

use std::panic::AssertUnwindSafe;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;

use crate::error::{SessionError, SessionResult};
use crate::lock::LockGuard;
use crate::tokenizer::Tokenizer;
use crate::types::{ChatMessage, SessionState};

/// Default token budget for prompt + history.
pub const DEFAULT_MAX_TOKEN_SIZE: usize = 3840;

/// Callback writing the final state back to the store.
pub type PersistFn =
    Box<dyn FnOnce(SessionState) -> BoxFuture<'static, SessionResult<()>> + Send>;

/// Messages to send to the generation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatPayload {
    /// The fixed seed prompt.
    pub prefix: Vec<ChatMessage>,
    /// Most recent history that fits the budget, oldest first.
    pub window: Vec<ChatMessage>,
    /// Token count of prefix + window.
    pub tokens: usize,
}

/// Working handle over one conversation.
pub struct ChatSession {
    state: SessionState,
    tokenizer: Option<Box<dyn Tokenizer>>,
    persist: Option<PersistFn>,
    lock: Option<LockGuard>,
    prompt_tokens: usize,
    max_token_size: usize,
}

impl ChatSession {
    /// Wrap `state` with an acquired tokenizer binding.
    ///
    /// The prompt is counted once here.
    pub fn new(state: SessionState, tokenizer: Box<dyn Tokenizer>, max_token_size: usize) -> Self {
        let prompt_text: String = state.prompt.iter().map(|m| m.content.as_str()).collect();
        let prompt_tokens = tokenizer.count(&prompt_text);
        Self {
            state,
            tokenizer: Some(tokenizer),
            persist: None,
            lock: None,
            prompt_tokens,
            max_token_size,
        }
    }

    /// Write the state back through `persist` when the handle is disposed.
    pub fn with_persist(mut self, persist: PersistFn) -> Self {
        self.persist = Some(persist);
        self
    }

    /// Hold `guard` until the state has been flushed.
    pub fn with_lock_guard(mut self, guard: LockGuard) -> Self {
        self.lock = Some(guard);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.state.session_id
    }

    pub fn prompt_name(&self) -> &str {
        &self.state.prompt_name
    }

    pub fn prompt(&self) -> &[ChatMessage] {
        &self.state.prompt
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.state.messages
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn model(&self) -> &str {
        self.tokenizer.as_deref().map_or("", |t| t.model())
    }

    pub fn max_token_size(&self) -> usize {
        self.max_token_size
    }

    pub fn prompt_tokens(&self) -> usize {
        self.prompt_tokens
    }

    /// Append a message to the history.
    pub fn push(&mut self, message: ChatMessage) {
        self.state.messages.push(message);
    }

    /// Remove the most recent message; `None` when the history is empty.
    pub fn pop(&mut self) -> Option<ChatMessage> {
        self.state.messages.pop()
    }

    fn count(&self, text: &str) -> usize {
        self.tokenizer.as_deref().map_or(0, |t| t.count(text))
    }

    /// Token count of the prompt and the whole, unwindowed history.
    pub fn tokens(&self) -> usize {
        self.prompt_tokens
            + self
                .state
                .messages
                .iter()
                .map(|m| self.count(&m.content))
                .sum::<usize>()
    }

    /// Newest-first greedy walk; stops at the first message that overflows.
    fn take_messages(&self) -> (Vec<ChatMessage>, usize) {
        let mut size = self.prompt_tokens;
        let mut window = Vec::new();
        for message in self.state.messages.iter().rev() {
            let tokens = self.count(&message.content);
            if size + tokens > self.max_token_size {
                break;
            }
            window.push(message.clone());
            size += tokens;
        }
        window.reverse();
        (window, size)
    }

    /// Build the generation payload: the prompt plus the longest recent
    /// suffix of the history that keeps the total within the budget.
    ///
    /// Messages are never cut; if the newest message alone does not fit,
    /// the window is empty.
    pub fn finish(&self) -> ChatPayload {
        let (window, tokens) = self.take_messages();
        tracing::debug!(
            session_id = %self.state.session_id,
            history = self.state.messages.len(),
            window = window.len(),
            tokens,
            budget = self.max_token_size,
            "Windowed chat session"
        );
        ChatPayload {
            prefix: self.state.prompt.clone(),
            window,
            tokens,
        }
    }

    fn release_tokenizer(&mut self) -> SessionResult<()> {
        match self.tokenizer.take() {
            Some(mut tokenizer) => tokenizer.release(),
            None => Ok(()),
        }
    }

    /// End the session: release the tokenizer, then flush the state.
    ///
    /// The flush is attempted even if the release fails. Every failure is
    /// logged; the first one is returned.
    pub async fn dispose(mut self) -> SessionResult<()> {
        let released = self.release_tokenizer();
        if let Err(e) = &released {
            tracing::error!(session_id = %self.state.session_id, error = %e, "Failed to release tokenizer");
        }

        let flushed = match self.persist.take() {
            Some(persist) => {
                let state = std::mem::take(&mut self.state);
                let session_id = state.session_id.clone();
                let result = persist(state).await;
                match &result {
                    Ok(()) => tracing::debug!(session_id = %session_id, "Flushed chat session"),
                    Err(e) => {
                        tracing::error!(session_id = %session_id, error = %e, "Failed to flush chat session")
                    }
                }
                result
            }
            None => Ok(()),
        };

        drop(self.lock.take());
        released.and(flushed)
    }

    /// Run `f` against this session, then dispose it on every exit path.
    ///
    /// A panic inside `f` is resumed after disposal. When `f` fails, its
    /// error wins over a disposal error, which is only logged.
    pub async fn scope<T, E, F>(mut self, f: F) -> Result<T, E>
    where
        F: for<'s> FnOnce(&'s mut ChatSession) -> BoxFuture<'s, Result<T, E>>,
        E: From<SessionError>,
    {
        let outcome = AssertUnwindSafe(f(&mut self)).catch_unwind().await;
        let disposed = self.dispose().await;

        match outcome {
            Err(panic) => std::panic::resume_unwind(panic),
            Ok(Err(err)) => {
                if let Err(dispose_err) = disposed {
                    tracing::error!(error = %dispose_err, "Dispose failed after scope error");
                }
                Err(err)
            }
            Ok(Ok(value)) => {
                disposed?;
                Ok(value)
            }
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if let Err(e) = self.release_tokenizer() {
            tracing::error!(session_id = %self.state.session_id, error = %e, "Failed to release tokenizer");
        }

        let Some(persist) = self.persist.take() else {
            return;
        };
        let state = std::mem::take(&mut self.state);
        let lock = self.lock.take();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(
                    session_id = %state.session_id,
                    "Chat session dropped without dispose, flushing in background"
                );
                handle.spawn(async move {
                    let session_id = state.session_id.clone();
                    if let Err(e) = persist(state).await {
                        tracing::error!(session_id = %session_id, error = %e, "Failed to flush chat session");
                    }
                    drop(lock);
                });
            }
            Err(_) => {
                tracing::error!(
                    session_id = %state.session_id,
                    messages = state.messages.len(),
                    "Chat session dropped outside a runtime, state not persisted"
                );
            }
        }
    }
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("session_id", &self.state.session_id)
            .field("model", &self.model())
            .field("messages", &self.state.messages.len())
            .field("prompt_tokens", &self.prompt_tokens)
            .field("max_token_size", &self.max_token_size)
            .field("persists", &self.persist.is_some())
            .finish()
    }
}
