//! Token counting adapters.
//!
//! A [`TokenizerProvider`] hands out one [`Tokenizer`] binding per session
//! handle. Bindings are never shared between handles and must be released
//! explicitly, exactly once.
//!
//! - [`TiktokenProvider`] (feature `tokenizer`): exact BPE counts via tiktoken.
//! - [`EstimateProvider`]: chars/4 estimate for an explicit model list.

use std::collections::HashSet;
use std::sync::Arc;

use copilot_common::config::{TokenizerBackend, TokenizerConfig};

use crate::error::{SessionError, SessionResult};

/// A live token counter bound to one model.
pub trait Tokenizer: Send {
    /// Model this binding counts for.
    fn model(&self) -> &str;

    /// Number of tokens in `text`, without special tokens.
    fn count(&self, text: &str) -> usize;

    /// Release the binding. A second call is an error.
    fn release(&mut self) -> SessionResult<()>;
}

/// Source of tokenizer bindings.
pub trait TokenizerProvider: Send + Sync {
    /// Backend name (e.g., "tiktoken", "estimate")
    fn name(&self) -> &str;

    /// Acquire a fresh binding for `model`.
    ///
    /// Fails with [`SessionError::UnsupportedModel`] when no vocabulary exists.
    fn acquire(&self, model: &str) -> SessionResult<Box<dyn Tokenizer>>;
}

/// Create the provider selected by configuration.
pub fn create_tokenizer_provider(
    config: &TokenizerConfig,
) -> SessionResult<Arc<dyn TokenizerProvider>> {
    match config.backend {
        TokenizerBackend::Estimate => Ok(Arc::new(EstimateProvider::new(
            config.estimate_models.iter().cloned(),
        ))),
        #[cfg(feature = "tokenizer")]
        TokenizerBackend::Tiktoken => Ok(Arc::new(TiktokenProvider::new(config.cache_size))),
        #[cfg(not(feature = "tokenizer"))]
        TokenizerBackend::Tiktoken => Err(SessionError::Config(
            "tiktoken backend requires the `tokenizer` feature".into(),
        )),
    }
}

// ============================================================================
// Estimate
// ============================================================================

/// Estimate token count from text (approximate: chars / 4).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Provider using the chars/4 estimate for a fixed set of models.
pub struct EstimateProvider {
    models: HashSet<String>,
}

impl EstimateProvider {
    pub fn new(models: impl IntoIterator<Item = String>) -> Self {
        Self {
            models: models.into_iter().collect(),
        }
    }
}

impl TokenizerProvider for EstimateProvider {
    fn name(&self) -> &str {
        "estimate"
    }

    fn acquire(&self, model: &str) -> SessionResult<Box<dyn Tokenizer>> {
        if !self.models.contains(model) {
            return Err(SessionError::UnsupportedModel(model.to_string()));
        }
        Ok(Box::new(EstimateTokenizer {
            model: model.to_string(),
            released: false,
        }))
    }
}

struct EstimateTokenizer {
    model: String,
    released: bool,
}

impl Tokenizer for EstimateTokenizer {
    fn model(&self) -> &str {
        &self.model
    }

    fn count(&self, text: &str) -> usize {
        estimate_tokens(text)
    }

    fn release(&mut self) -> SessionResult<()> {
        if self.released {
            return Err(SessionError::Release(format!(
                "estimate tokenizer for {} already released",
                self.model
            )));
        }
        self.released = true;
        Ok(())
    }
}

// ============================================================================
// Tiktoken
// ============================================================================

#[cfg(feature = "tokenizer")]
pub use self::tiktoken::TiktokenProvider;

#[cfg(feature = "tokenizer")]
mod tiktoken {
    use std::num::NonZeroUsize;
    use std::sync::{Arc, Mutex};

    use lru::LruCache;
    use tiktoken_rs::CoreBPE;

    use super::{Tokenizer, TokenizerProvider};
    use crate::error::{SessionError, SessionResult};

    /// Tiktoken-backed provider.
    ///
    /// Loaded vocabularies are immutable and kept in an LRU cache keyed by
    /// model, so acquiring a binding for a warm model is cheap. Each binding
    /// still holds its own reference and releases it individually.
    pub struct TiktokenProvider {
        vocabularies: Mutex<LruCache<String, Arc<CoreBPE>>>,
    }

    impl TiktokenProvider {
        pub fn new(cache_size: usize) -> Self {
            let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
            Self {
                vocabularies: Mutex::new(LruCache::new(capacity)),
            }
        }

        /// Number of vocabularies currently loaded.
        pub fn loaded(&self) -> usize {
            self.vocabularies.lock().map_or(0, |cache| cache.len())
        }

        fn vocabulary(&self, model: &str) -> SessionResult<Arc<CoreBPE>> {
            let mut cache = self
                .vocabularies
                .lock()
                .map_err(|_| SessionError::Config("tokenizer cache poisoned".into()))?;

            if let Some(bpe) = cache.get(model) {
                return Ok(Arc::clone(bpe));
            }

            let bpe = tiktoken_rs::get_bpe_from_model(model).map_err(|e| {
                tracing::debug!(model = %model, error = %e, "No tiktoken vocabulary for model");
                SessionError::UnsupportedModel(model.to_string())
            })?;
            let bpe = Arc::new(bpe);
            cache.put(model.to_string(), Arc::clone(&bpe));
            tracing::debug!(model = %model, "Loaded tiktoken vocabulary");
            Ok(bpe)
        }
    }

    impl Default for TiktokenProvider {
        fn default() -> Self {
            Self::new(8)
        }
    }

    impl TokenizerProvider for TiktokenProvider {
        fn name(&self) -> &str {
            "tiktoken"
        }

        fn acquire(&self, model: &str) -> SessionResult<Box<dyn Tokenizer>> {
            let bpe = self.vocabulary(model)?;
            Ok(Box::new(TiktokenBinding {
                model: model.to_string(),
                bpe: Some(bpe),
            }))
        }
    }

    struct TiktokenBinding {
        model: String,
        bpe: Option<Arc<CoreBPE>>,
    }

    impl Tokenizer for TiktokenBinding {
        fn model(&self) -> &str {
            &self.model
        }

        // A released binding counts nothing.
        fn count(&self, text: &str) -> usize {
            self.bpe
                .as_ref()
                .map_or(0, |bpe| bpe.encode_ordinary(text).len())
        }

        fn release(&mut self) -> SessionResult<()> {
            self.bpe.take().map(drop).ok_or_else(|| {
                SessionError::Release(format!("tiktoken binding for {} already released", self.model))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("", 0 ; "empty")]
    #[test_case("hello", 2 ; "five chars")]
    #[test_case("hello world", 3 ; "eleven chars")]
    #[test_case("你好世界", 1 ; "four wide chars")]
    fn test_estimate_tokens(text: &str, expected: usize) {
        assert_eq!(estimate_tokens(text), expected);
    }

    #[test]
    fn test_estimate_provider_rejects_unknown_model() {
        let provider = EstimateProvider::new(vec!["gpt-4".to_string()]);
        let err = provider.acquire("llama-70b").err().unwrap();
        assert!(matches!(err, SessionError::UnsupportedModel(m) if m == "llama-70b"));
    }

    #[test]
    fn test_estimate_binding_releases_once() {
        let provider = EstimateProvider::new(vec!["gpt-4".to_string()]);
        let mut tokenizer = provider.acquire("gpt-4").unwrap();
        assert_eq!(tokenizer.model(), "gpt-4");
        assert_eq!(tokenizer.count("abcdefgh"), 2);

        tokenizer.release().unwrap();
        assert!(matches!(tokenizer.release(), Err(SessionError::Release(_))));
    }

    #[test]
    fn test_create_estimate_provider_from_config() {
        let config = TokenizerConfig {
            backend: TokenizerBackend::Estimate,
            ..Default::default()
        };
        let provider = create_tokenizer_provider(&config).unwrap();
        assert_eq!(provider.name(), "estimate");
        assert!(provider.acquire("gpt-3.5-turbo").is_ok());
    }

    #[cfg(feature = "tokenizer")]
    mod tiktoken_tests {
        use super::super::*;

        #[test]
        fn test_counts_ordinary_tokens() {
            let provider = TiktokenProvider::default();
            let tokenizer = provider.acquire("gpt-4").unwrap();
            assert_eq!(tokenizer.count("hello world"), 2);
            assert_eq!(tokenizer.count(""), 0);
            // Special tokens are counted as plain text, never as a single control token.
            assert!(tokenizer.count("<|endoftext|>") > 1);
        }

        #[test]
        fn test_unsupported_model_fails_at_acquire() {
            let provider = TiktokenProvider::default();
            let err = provider.acquire("not-a-model").err().unwrap();
            assert!(err.is_config());
            assert_eq!(provider.loaded(), 0);
        }

        #[test]
        fn test_vocabulary_is_cached_but_bindings_are_separate() {
            let provider = TiktokenProvider::new(2);
            let mut first = provider.acquire("gpt-4").unwrap();
            let second = provider.acquire("gpt-4").unwrap();
            assert_eq!(provider.loaded(), 1);

            first.release().unwrap();
            assert!(first.release().is_err());
            assert_eq!(second.count("hello world"), 2);
        }

        #[test]
        fn test_create_tiktoken_provider_from_config() {
            let provider = create_tokenizer_provider(&TokenizerConfig::default()).unwrap();
            assert_eq!(provider.name(), "tiktoken");
        }
    }
}
