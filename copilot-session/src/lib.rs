//! Copilot Session - Token-budgeted chat session cache.
//!
//! This crate keeps the state of a conversation between a user and a
//! language model in a keyed TTL store, and hands out handles that:
//! - Append and remove messages at the tail of the history
//! - Build the generation payload: the seed prompt plus the most recent
//!   messages that fit a token budget
//! - Release their tokenizer binding and write the state back exactly once
//!   when their scope ends
//!
//! ## Architecture
//!
//! ```text
//! ChatSessionService ── get_or_create ──► ChatSession ── finish ──► ChatPayload
//!        │                                    │
//!        ├── PromptProvider (new sessions)    └── dispose: release tokenizer,
//!        ├── TokenizerProvider                              flush to store
//!        └── SessionStore (memory | file | redis)
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod error;
pub mod lock;
pub mod manager;
pub mod prompt;
pub mod session;
pub mod store;
pub mod tokenizer;
pub mod types;

// Re-export commonly used types
pub use error::{SessionError, SessionResult};
pub use lock::{LocalSessionLock, LockGuard, NoopSessionLock, SessionLock, SessionOwner};
pub use manager::ChatSessionService;
pub use prompt::{PromptProvider, StaticPromptProvider};
pub use session::{ChatPayload, ChatSession, PersistFn, DEFAULT_MAX_TOKEN_SIZE};
#[cfg(feature = "redis-backend")]
pub use store::RedisStore;
pub use store::{create_store, FileStore, MemoryStore, SessionStore};
#[cfg(feature = "tokenizer")]
pub use tokenizer::TiktokenProvider;
pub use tokenizer::{
    create_tokenizer_provider, estimate_tokens, EstimateProvider, Tokenizer, TokenizerProvider,
};
pub use types::{
    decode_state, encode_state, session_key, ChatMessage, MessageRole, SessionState,
    SESSION_SCHEMA_VERSION,
};
