//! Standalone parley server.
//!
//! Serves the streaming completion endpoint and the conversation REST API
//! over a filesystem-backed store.
//!
//! # Usage
//!
//! ```bash
//! OPENAI_API_KEY=sk-... cargo run -p parley-web
//! OPENAI_API_KEY=sk-... cargo run -p parley-web -- --model gpt-4
//! OPENAI_API_KEY=sk-... cargo run -p parley-web -- --port 8080 --data-dir /var/lib/parley
//! ```
//!
//! Then drive it with curl:
//!
//! ```bash
//! curl -X POST -H 'x-user-id: alice' -H 'content-type: application/json' \
//!   -d '{"title":"First chat"}' http://127.0.0.1:3000/api/conversations
//! curl -N -H 'x-user-id: alice' \
//!   'http://127.0.0.1:3000/completion?conversationId=<id>'
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use parley::store::FsStore;
use parley::tokens::TokenCounter;
use parley::{DEFAULT_MODEL, OpenAiClient};
use parley_web::{WebConfig, spawn_web};
use tracing_subscriber::EnvFilter;

/// Streaming chat-completion server.
#[derive(Parser)]
#[command(about = "Streaming chat-completion server with conversation persistence")]
struct Args {
    /// Model to request completions from.
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Directory for conversation storage.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let api_key = std::env::var("OPENAI_API_KEY")
        .map_err(|_| "Set OPENAI_API_KEY env var to your OpenAI API key")?;

    let store = Arc::new(FsStore::new(&args.data_dir).map_err(|e| e.to_string())?);
    let client = Arc::new(OpenAiClient::new(api_key, &args.model).map_err(|e| e.to_string())?);
    let counter = Arc::new(TokenCounter::new().map_err(|e| e.to_string())?);

    let config = WebConfig {
        bind_addr: ([127, 0, 0, 1], args.port).into(),
    };
    let addr = spawn_web(store, client, counter, config)
        .await
        .map_err(|e| e.to_string())?;
    println!("Listening on http://{addr}");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| e.to_string())?;
    Ok(())
}
