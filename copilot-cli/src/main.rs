#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use copilot_common::config::{Config, StoreBackend};
use copilot_common::logging::init_logging;
use copilot_common::{Error, ResultExt};
use copilot_session::{
    create_store, create_tokenizer_provider, ChatMessage, ChatPayload, ChatSession,
    ChatSessionService, NoopSessionLock, SessionOwner, StaticPromptProvider,
};
use serde_json::json;
use tracing::{info, warn};

/// Seed used when the configured default prompt is not defined.
const FALLBACK_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Token-budgeted chat sessions from the command line.
#[derive(Parser, Debug)]
#[command(name = "copilot")]
#[command(version = "0.1.0")]
#[command(about = "Keep chat sessions and print the token-budgeted payload.", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.copilot/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the store backend (memory, file, redis)
    #[arg(long, global = true)]
    store: Option<StoreBackend>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add a user message and print the payload for the generation engine.
    ///
    /// Every invocation is a single request, so no session lock is taken.
    /// Callers that run several `send`s against one shared store at the same
    /// time must serialize them per user and workspace themselves.
    Send {
        /// Session to resume; a new one is created when omitted
        #[arg(long)]
        session: Option<String>,

        /// Prompt name for a new session
        #[arg(long)]
        prompt: Option<String>,

        /// Model whose tokenizer counts the budget
        #[arg(long)]
        model: Option<String>,

        /// Owner of a new session
        #[arg(long, default_value = "local")]
        user: String,

        #[arg(long, default_value = "default")]
        workspace: String,

        /// Message text
        message: String,
    },
    /// Record the assistant's reply
    Reply {
        #[arg(long)]
        session: String,

        message: String,
    },
    /// Remove the last message (e.g. after a failed generation)
    Pop {
        #[arg(long)]
        session: String,
    },
    /// Print the stored session
    Show {
        #[arg(long)]
        session: String,
    },
    /// Delete a session
    Delete {
        #[arg(long)]
        session: String,
    },
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = Config::load_from(path)?;
            config.apply_env_overrides();
            config.validate()?;
            config
        }
        None => Config::load_with_env()?,
    };
    if let Some(backend) = cli.store {
        config.store.backend = backend;
    }
    Ok(config)
}

async fn build_service(config: &Config) -> Result<ChatSessionService> {
    if config.store.backend == StoreBackend::Memory {
        warn!("Memory store selected, sessions will not outlive this process");
    }
    let store = create_store(&config.store)
        .await
        .context("opening session store")?;
    let tokenizers =
        create_tokenizer_provider(&config.tokenizer).context("creating tokenizer provider")?;
    let mut prompts =
        StaticPromptProvider::from_config(&config.prompts).context("loading prompts")?;
    if !config.prompts.contains_key(&config.session.default_prompt) {
        prompts = prompts.with_prompt(
            config.session.default_prompt.clone(),
            vec![ChatMessage::system(FALLBACK_SYSTEM_PROMPT)],
        );
    }

    Ok(ChatSessionService::new(store, Arc::new(prompts), tokenizers)
        .with_config(config.session.clone()))
}

/// Open an existing session with the model it was created for.
async fn resume(service: &ChatSessionService, session_id: &str) -> Result<ChatSession> {
    match service
        .resume(session_id, None)
        .await
        .context(format!("opening session {session_id}"))?
    {
        Some(handle) => Ok(handle),
        None => Err(Error::NotFound(format!("session {session_id}")).into()),
    }
}

async fn send(
    service: &ChatSessionService,
    session_id: Option<&str>,
    prompt: Option<&str>,
    model: Option<&str>,
    owner: &SessionOwner,
    message: String,
) -> Result<(String, ChatPayload)> {
    if message.trim().is_empty() {
        bail!(Error::InvalidInput("message is empty".into()));
    }
    let defaults = service.config();
    let prompt = prompt.unwrap_or(&defaults.default_prompt);
    let model = model.unwrap_or(&defaults.default_model);

    let mut handle = service
        .resume_or_create(session_id, &NoopSessionLock, owner, prompt, model)
        .await
        .context("opening session")?;
    handle.push(ChatMessage::user(message));
    let payload = handle.finish();
    let session_id = handle.session_id().to_string();
    handle.dispose().await.context("saving session")?;
    Ok((session_id, payload))
}

async fn reply(service: &ChatSessionService, session_id: &str, message: String) -> Result<()> {
    let mut handle = resume(service, session_id).await?;
    handle.push(ChatMessage::assistant(message));
    handle.dispose().await.context("saving session")?;
    Ok(())
}

async fn pop(service: &ChatSessionService, session_id: &str) -> Result<Option<ChatMessage>> {
    let mut handle = resume(service, session_id).await?;
    let popped = handle.pop();
    handle.dispose().await.context("saving session")?;
    Ok(popped)
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    let service = build_service(&config).await?;

    match cli.command {
        Commands::Send {
            session,
            prompt,
            model,
            user,
            workspace,
            message,
        } => {
            let owner = SessionOwner::new(user, workspace);
            let (session_id, payload) = send(
                &service,
                session.as_deref(),
                prompt.as_deref(),
                model.as_deref(),
                &owner,
                message,
            )
            .await?;

            info!(session_id = %session_id, tokens = payload.tokens, "Prepared payload");
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "sessionId": session_id,
                    "prefix": payload.prefix,
                    "window": payload.window,
                    "tokens": payload.tokens,
                }))?
            );
        }
        Commands::Reply { session, message } => reply(&service, &session, message).await?,
        Commands::Pop { session } => {
            let popped = pop(&service, &session).await?;
            println!("{}", serde_json::to_string_pretty(&popped)?);
        }
        Commands::Show { session } => {
            let state = service
                .load(&session)
                .await
                .context(format!("reading session {session}"))?;
            match state {
                Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                None => return Err(Error::NotFound(format!("session {session}")).into()),
            }
        }
        Commands::Delete { session } => {
            let deleted = service
                .delete(&session)
                .await
                .context(format!("deleting session {session}"))?;
            println!("{}", json!({ "sessionId": session, "deleted": deleted }));
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );
    run(cli, config).await
}
