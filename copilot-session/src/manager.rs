//! Session manager: create-or-resume over a keyed TTL store.

use std::sync::Arc;
use std::time::Duration;

use copilot_common::config::SessionConfig;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use uuid::Uuid;

use crate::error::{SessionError, SessionResult};
use crate::lock::{SessionLock, SessionOwner};
use crate::prompt::PromptProvider;
use crate::session::{ChatSession, PersistFn};
use crate::store::SessionStore;
use crate::tokenizer::TokenizerProvider;
use crate::types::{decode_state, encode_state, session_key, SessionState};

/// Hands out [`ChatSession`] handles backed by a [`SessionStore`].
///
/// `get_or_create` does no locking: two handles over the same id race and
/// the last flush wins. Callers that mutate a session concurrently go through
/// [`resume_or_create`](Self::resume_or_create) with a shared lock.
pub struct ChatSessionService {
    store: Arc<dyn SessionStore>,
    prompts: Arc<dyn PromptProvider>,
    tokenizers: Arc<dyn TokenizerProvider>,
    config: SessionConfig,
}

impl ChatSessionService {
    pub fn new(
        store: Arc<dyn SessionStore>,
        prompts: Arc<dyn PromptProvider>,
        tokenizers: Arc<dyn TokenizerProvider>,
    ) -> Self {
        Self {
            store,
            prompts,
            tokenizers,
            config: SessionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn key(&self, session_id: &str) -> String {
        session_key(&self.config.key_prefix, session_id)
    }

    fn ttl(&self) -> Duration {
        Duration::from_millis(self.config.ttl_ms)
    }

    fn persister(&self, key: String) -> PersistFn {
        let store = Arc::clone(&self.store);
        let ttl = self.ttl();
        Box::new(move |state: SessionState| {
            async move {
                let value = encode_state(&state)?;
                store.set(&key, value, ttl).await
            }
            .boxed()
        })
    }

    async fn read(&self, key: &str, session_id: &str) -> SessionResult<Option<SessionState>> {
        match self.store.get(key).await? {
            Some(raw) => decode_state(key, session_id, &raw).map(Some),
            None => Ok(None),
        }
    }

    /// Read the stored state of `session_id` without opening a handle.
    pub async fn load(&self, session_id: &str) -> SessionResult<Option<SessionState>> {
        self.read(&self.key(session_id), session_id).await
    }

    /// Remove a stored session. Returns true if one existed.
    pub async fn delete(&self, session_id: &str) -> SessionResult<bool> {
        let key = self.key(session_id);
        let removed = self.store.delete(&key).await?;
        tracing::debug!(key = %key, removed, "Deleted chat session");
        Ok(removed)
    }

    fn open(&self, key: String, state: SessionState, model: &str) -> SessionResult<ChatSession> {
        tracing::debug!(
            key = %key,
            model = %model,
            messages = state.messages.len(),
            "Resumed chat session"
        );
        let tokenizer = self.tokenizers.acquire(model)?;
        Ok(ChatSession::new(state, tokenizer, self.config.max_token_size)
            .with_persist(self.persister(key)))
    }

    /// Open a stored session without ever creating one; `None` when it is
    /// absent or expired.
    ///
    /// Without an explicit `model` the session counts with the model it was
    /// created for, falling back to the configured default.
    pub async fn resume(
        &self,
        session_id: &str,
        model: Option<&str>,
    ) -> SessionResult<Option<ChatSession>> {
        let key = self.key(session_id);
        let Some(state) = self.read(&key, session_id).await? else {
            return Ok(None);
        };
        let model = model
            .map(str::to_string)
            .or_else(|| state.model.clone())
            .unwrap_or_else(|| self.config.default_model.clone());
        self.open(key, state, &model).map(Some)
    }

    /// Open the session `session_id`, creating it if the store has none.
    ///
    /// A stored session keeps the prompt it was created with; `prompt_name`
    /// is only resolved for a new one. A new session is written before the
    /// handle is returned.
    pub async fn get_or_create(
        &self,
        session_id: &str,
        prompt_name: &str,
        model: &str,
    ) -> SessionResult<ChatSession> {
        let key = self.key(session_id);

        if let Some(state) = self.read(&key, session_id).await? {
            return self.open(key, state, model);
        }

        let prompt = self.prompts.resolve(prompt_name).await?;
        let mut tokenizer = self.tokenizers.acquire(model)?;
        let state = SessionState::new(session_id, prompt_name, prompt).with_model(model);

        let written = match encode_state(&state) {
            Ok(value) => self.store.set(&key, value, self.ttl()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Err(release_err) = tokenizer.release() {
                tracing::error!(key = %key, error = %release_err, "Failed to release tokenizer");
            }
            return Err(e);
        }

        tracing::info!(
            key = %key,
            prompt = %prompt_name,
            model = %model,
            store = %self.store.name(),
            "Created chat session"
        );
        Ok(ChatSession::new(state, tokenizer, self.config.max_token_size)
            .with_persist(self.persister(key)))
    }

    /// Run `f` against the session and dispose it afterwards, on success,
    /// error, or panic.
    pub async fn with_session<T, E, F>(
        &self,
        session_id: &str,
        prompt_name: &str,
        model: &str,
        f: F,
    ) -> Result<T, E>
    where
        F: for<'s> FnOnce(&'s mut ChatSession) -> BoxFuture<'s, Result<T, E>>,
        E: From<SessionError>,
    {
        let session = self.get_or_create(session_id, prompt_name, model).await?;
        session.scope(f).await
    }

    /// Resume `session_id`, or start a new session under a fresh id, while
    /// holding the owner's lock.
    ///
    /// The lock is held by the returned handle until it has been flushed.
    pub async fn resume_or_create(
        &self,
        session_id: Option<&str>,
        lock: &dyn SessionLock,
        owner: &SessionOwner,
        prompt_name: &str,
        model: &str,
    ) -> SessionResult<ChatSession> {
        let lock_key = owner.lock_key();
        let guard = lock
            .try_lock(&lock_key)
            .await?
            .ok_or_else(|| SessionError::LockBusy(lock_key.clone()))?;

        let session_id = match session_id {
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        let session = self.get_or_create(&session_id, prompt_name, model).await?;
        Ok(session.with_lock_guard(guard))
    }

    /// Create a new session for `owner` and return its id.
    pub async fn create(
        &self,
        lock: &dyn SessionLock,
        owner: &SessionOwner,
        prompt_name: &str,
        model: &str,
    ) -> SessionResult<String> {
        let session = self
            .resume_or_create(None, lock, owner, prompt_name, model)
            .await?;
        let session_id = session.session_id().to_string();
        session.dispose().await?;
        Ok(session_id)
    }
}

impl std::fmt::Debug for ChatSessionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSessionService")
            .field("store", &self.store.name())
            .field("tokenizer", &self.tokenizers.name())
            .field("config", &self.config)
            .finish()
    }
}
