mod config;
mod repl;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chat_session::{
    CredentialCell, HttpBackend, MemoryKeyValueStore, PersistenceBridge, SessionSynchronizer,
    SqliteKeyValueStore, WsTransport, spawn_session,
};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use config::{ClientPaths, FileConfig, load_config};

#[derive(Parser)]
#[command(name = "chat")]
#[command(about = "Terminal client for the real-time chat backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Data directory (default: ~/.chat-session)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// REST base URL, overrides [server] api_url
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Event channel URL, overrides [server] ws_url
    #[arg(long, global = true)]
    ws_url: Option<String>,

    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive session (default)
    Chat,
    /// Forget the remembered user and conversation
    Forget,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout is the conversation; logs go to stderr
    let default_directive = if cli.debug {
        "chat_session=debug,chat_client=debug,warn"
    } else {
        "chat_session=info,chat_client=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let paths = ClientPaths::new(cli.data_dir.clone())?;
    let mut fc: FileConfig = load_config(&paths.data_dir)
        .extract()
        .context("Failed to load configuration")?;
    if let Some(url) = cli.api_url {
        fc.server.api_url = url;
    }
    if let Some(url) = cli.ws_url {
        fc.server.ws_url = Some(url);
    }

    let durable = SqliteKeyValueStore::open(&paths.state_db)
        .await
        .with_context(|| format!("Failed to open state database: {:?}", paths.state_db))?;
    let persistence = PersistenceBridge::new(
        Arc::new(durable),
        Arc::new(MemoryKeyValueStore::new()),
    );

    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Forget => {
            persistence.clear_active_conversation().await;
            persistence.clear_local_user().await;
            println!("Forgot the remembered user and conversation.");
            Ok(())
        }
        Commands::Chat => {
            info!(api_url = %fc.server.api_url, ws_url = %fc.server.ws_url(), "starting session");
            let credential = CredentialCell::default();
            let backend = Arc::new(
                HttpBackend::new(&fc.server.api_url, credential.clone())
                    .with_persistence(persistence.clone()),
            );
            let sync = SessionSynchronizer::new(
                fc.session.clone(),
                Box::new(WsTransport::new(fc.server.ws_url())),
                backend.clone(),
                persistence.clone(),
                credential,
            );
            let handle = spawn_session(sync);
            repl::run(handle, backend, persistence).await
        }
    }
}
