//! Session data model and its stored form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};

/// Version tag written alongside every stored session.
pub const SESSION_SCHEMA_VERSION: u32 = 1;

/// Message role in a conversation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageRole {
    type Err = SessionError;

    fn from_str(s: &str) -> SessionResult<Self> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(SessionError::Config(format!("unknown message role '{other}'"))),
        }
    }
}

/// A single message in a conversation session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    /// Opaque attachment references (URLs, blob ids)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            attachments: Vec::new(),
            created_at: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// User message stamped with the current time.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content).with_created_at(Utc::now())
    }

    /// Assistant message stamped with the current time.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content).with_created_at(Utc::now())
    }

    pub fn with_attachments(mut self, attachments: Vec<String>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

/// Durable state of one conversation.
///
/// `prompt` is resolved once when the session is created and stored verbatim;
/// `messages` only grows or shrinks at the tail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session_id: String,
    pub prompt_name: String,
    /// Model the session was created for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub prompt: Vec<ChatMessage>,
    pub messages: Vec<ChatMessage>,
}

impl SessionState {
    /// Fresh state with an empty history.
    pub fn new(
        session_id: impl Into<String>,
        prompt_name: impl Into<String>,
        prompt: Vec<ChatMessage>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            prompt_name: prompt_name.into(),
            model: None,
            prompt,
            messages: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Build the store key of a session: `{prefix}:{session_id}`.
pub fn session_key(prefix: &str, session_id: &str) -> String {
    format!("{prefix}:{session_id}")
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u32,
    state: &'a SessionState,
}

#[derive(Deserialize)]
struct Envelope {
    version: Option<u32>,
    state: Option<serde_json::Value>,
}

/// Serialize state into the versioned envelope kept in the store.
pub fn encode_state(state: &SessionState) -> SessionResult<String> {
    serde_json::to_string(&EnvelopeRef {
        version: SESSION_SCHEMA_VERSION,
        state,
    })
    .map_err(|e| SessionError::Serialization(e.to_string()))
}

/// Parse a stored envelope read from `key`.
///
/// A missing or unknown version, a missing state, a state that does not
/// match the schema, or a state stored for another session id is rejected.
pub fn decode_state(key: &str, expected_session_id: &str, raw: &str) -> SessionResult<SessionState> {
    let schema_error = |reason: String| SessionError::Schema {
        key: key.to_string(),
        reason,
    };

    let envelope: Envelope =
        serde_json::from_str(raw).map_err(|e| schema_error(format!("not a session envelope: {e}")))?;

    match envelope.version {
        Some(SESSION_SCHEMA_VERSION) => {}
        Some(other) => return Err(schema_error(format!("unsupported schema version {other}"))),
        None => return Err(schema_error("missing schema version".into())),
    }

    let value = envelope
        .state
        .ok_or_else(|| schema_error("missing state".into()))?;
    let state: SessionState =
        serde_json::from_value(value).map_err(|e| schema_error(e.to_string()))?;

    if state.session_id != expected_session_id {
        return Err(schema_error(format!(
            "stored session id '{}' does not match '{expected_session_id}'",
            state.session_id
        )));
    }

    Ok(state)
}
