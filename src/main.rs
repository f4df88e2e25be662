use clap::Parser;
use retroterm::chess::ScriptedEngine;
use retroterm::config::Config;
use retroterm::input::router::{execute_with_context, shell_prompt};
use retroterm::models::message::{Message, MessageKind};
use retroterm::models::types::SessionId;
use retroterm::net::sink::ClientSink;
use retroterm::services::chat::OfflineChatBackend;
use retroterm::state::registry::Registry;
use retroterm::store::memory::MemoryStore;
use std::io::Write as _;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Development console for the retroterm core: one local session over
/// stdin/stdout standing in for the real transport.
#[derive(Debug, Parser)]
#[command(name = "retroterm", about = "retro terminal server core console")]
struct Args {
    /// Path to a TOML config file (env RETROTERM_CONFIG works too)
    #[arg(long)]
    config: Option<String>,
}

/// Prints pushed messages the way the frontend would render them.
struct ConsoleSink;

#[async_trait::async_trait]
impl ClientSink for ConsoleSink {
    async fn send(&self, _session_id: &SessionId, message: Message) -> anyhow::Result<()> {
        print_message(&message);
        Ok(())
    }
}

fn print_message(message: &Message) {
    match message.kind {
        MessageKind::Text | MessageKind::Telnet => println!("{}", message.content),
        MessageKind::Prompt => {
            print!("{}", message.content);
            let _ = std::io::stdout().flush();
        }
        MessageKind::InputControl if message.content == "clear" => {
            print!("\x1b[2J\x1b[H");
            let _ = std::io::stdout().flush();
        }
        // Sound, graphics, physics and control frames render as tags here
        _ => {
            let kind = serde_json::to_string(&message.kind).unwrap_or_default();
            println!("[{}] {}", kind.trim_matches('"'), message.content);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cfg = Arc::new(match &Args::parse().config {
        Some(path) => Config::load(path)?,
        None => Config::from_env(),
    });
    if cfg.secrets.insecure {
        tracing::warn!("running with the insecure fallback token secret");
    }

    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(Registry::new(
        cfg.clone(),
        store.clone(),
        store,
        Arc::new(ConsoleSink),
        Arc::new(OfflineChatBackend),
        Arc::new(ScriptedEngine),
    ));
    registry.clone().spawn_sweeper();
    seed_demo_users(&registry).await;

    let session_id = registry.create_guest("127.0.0.1");
    tracing::info!(%session_id, "console session ready");
    println!("retroterm console. Type 'help' to get started, Ctrl+D to quit.");
    print_message(&shell_prompt(&registry, &session_id));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        for message in execute_with_context(&registry, &session_id, &line).await {
            print_message(&message);
        }
        if registry.get_input_mode(&session_id) == Some(retroterm::InputMode::OsShell) {
            print_message(&shell_prompt(&registry, &session_id));
        }
    }

    registry.cleanup_session_resources(&session_id).await;
    Ok(())
}

/// The temporary demo user has to exist for `login dyson ...` to work.
async fn seed_demo_users(registry: &Arc<Registry>) {
    for username in &registry.config.temporary_users {
        let _ = registry
            .services
            .auth
            .register(username, "dyson", "127.0.0.1")
            .await;
    }
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, prelude::*};

    color_eyre::install().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("retroterm=info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();
}
