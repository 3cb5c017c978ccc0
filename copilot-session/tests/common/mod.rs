//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use copilot_session::{
    ChatMessage, ChatSessionService, MemoryStore, SessionError, SessionResult, SessionStore,
    StaticPromptProvider, Tokenizer, TokenizerProvider,
};

pub const MODEL: &str = "gpt-4";
pub const PROMPT: &str = "chat:general";

/// `n` one-token words.
pub fn words(n: usize) -> String {
    vec!["w"; n].join(" ")
}

/// Provider of word-count tokenizers that records acquires and releases.
#[derive(Debug, Default)]
pub struct WordTokenizerProvider {
    pub acquired: Arc<AtomicUsize>,
    pub released: Arc<AtomicUsize>,
}

impl WordTokenizerProvider {
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl TokenizerProvider for WordTokenizerProvider {
    fn name(&self) -> &str {
        "words"
    }

    fn acquire(&self, model: &str) -> SessionResult<Box<dyn Tokenizer>> {
        if model != MODEL {
            return Err(SessionError::UnsupportedModel(model.to_string()));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(WordTokenizer {
            released: Arc::clone(&self.released),
            live: true,
        }))
    }
}

pub struct WordTokenizer {
    released: Arc<AtomicUsize>,
    live: bool,
}

impl WordTokenizer {
    pub fn detached() -> Self {
        Self {
            released: Arc::new(AtomicUsize::new(0)),
            live: true,
        }
    }
}

impl Tokenizer for WordTokenizer {
    fn model(&self) -> &str {
        MODEL
    }

    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }

    fn release(&mut self) -> SessionResult<()> {
        if !self.live {
            return Err(SessionError::Release("already released".into()));
        }
        self.live = false;
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Store whose reads miss and whose writes fail.
#[derive(Debug, Default)]
pub struct FailingStore {
    pub writes: AtomicUsize,
}

#[async_trait]
impl SessionStore for FailingStore {
    fn name(&self) -> &str {
        "failing"
    }

    async fn get(&self, _key: &str) -> SessionResult<Option<String>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> SessionResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(SessionError::Store("connection refused".into()))
    }

    async fn delete(&self, _key: &str) -> SessionResult<bool> {
        Err(SessionError::Store("connection refused".into()))
    }
}

pub fn prompts(system: &str) -> StaticPromptProvider {
    StaticPromptProvider::new().with_prompt(PROMPT, vec![ChatMessage::system(system)])
}

pub struct Harness {
    pub service: ChatSessionService,
    pub store: Arc<MemoryStore>,
    pub tokenizers: Arc<WordTokenizerProvider>,
}

pub fn harness() -> Harness {
    harness_with_store(Arc::new(MemoryStore::new()), "You are a helpful assistant.")
}

pub fn harness_with_store(store: Arc<MemoryStore>, system: &str) -> Harness {
    let tokenizers = Arc::new(WordTokenizerProvider::default());
    let service = ChatSessionService::new(
        store.clone(),
        Arc::new(prompts(system)),
        tokenizers.clone(),
    );
    Harness {
        service,
        store,
        tokenizers,
    }
}
