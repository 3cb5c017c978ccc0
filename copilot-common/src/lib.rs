//! Copilot Common - Shared configuration, errors, and logging for the Copilot session services.
//!
//! This crate provides:
//! - Configuration types and loading (JSON file + environment overrides)
//! - Configuration validation
//! - Error types and handling utilities
//! - Logging setup

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    Config, ObservabilityConfig, PromptMessageConfig, SessionConfig, StoreBackend, StoreConfig,
    TokenizerBackend, TokenizerConfig,
};
pub use error::{Error, Result, ResultExt};
