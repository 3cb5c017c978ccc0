//! Seed prompt resolution.

use std::collections::HashMap;

use async_trait::async_trait;
use copilot_common::config::PromptMessageConfig;

use crate::error::{SessionError, SessionResult};
use crate::types::ChatMessage;

/// Resolves a prompt name to the ordered prefix messages of a new session.
#[async_trait]
pub trait PromptProvider: Send + Sync {
    /// Fails with [`SessionError::UnknownPrompt`] for an unknown name.
    async fn resolve(&self, prompt_name: &str) -> SessionResult<Vec<ChatMessage>>;
}

/// Prompt provider over a fixed map, usually built from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticPromptProvider {
    prompts: HashMap<String, Vec<ChatMessage>>,
}

impl StaticPromptProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a prompt.
    pub fn with_prompt(mut self, name: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        self.prompts.insert(name.into(), messages);
        self
    }

    /// Build from the `prompts` section of the configuration.
    pub fn from_config(prompts: &HashMap<String, Vec<PromptMessageConfig>>) -> SessionResult<Self> {
        let mut provider = Self::new();
        for (name, messages) in prompts {
            let messages = messages
                .iter()
                .map(|m| -> SessionResult<ChatMessage> {
                    Ok(ChatMessage::new(m.role.parse()?, m.content.clone()))
                })
                .collect::<SessionResult<Vec<_>>>()?;
            provider.prompts.insert(name.clone(), messages);
        }
        Ok(provider)
    }
}

#[async_trait]
impl PromptProvider for StaticPromptProvider {
    async fn resolve(&self, prompt_name: &str) -> SessionResult<Vec<ChatMessage>> {
        self.prompts
            .get(prompt_name)
            .cloned()
            .ok_or_else(|| SessionError::UnknownPrompt(prompt_name.to_string()))
    }
}
