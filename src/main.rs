use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

mod config;
mod models;
mod pipeline;
mod qr;
mod server;
mod session;
mod settings;
mod storage;
mod store;
mod timer;

use config::{AppConfig, CliOverrides};
use models::GeminiClient;
use pipeline::{ReplyPipeline, ReplyTexts};
use storage::{KeyValueStore, MemoryKeyValueStore, SqliteKeyValueStore};
use store::EntityStore;
use timer::QrRefreshTimer;

#[derive(Debug, Parser)]
#[command(name = "channel_autopilot")]
#[command(about = "Simulated WhatsApp bot channels with AI persona replies", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the dashboard API.
    Start {
        #[arg(long, default_value = "127.0.0.1:7272")]
        listen: String,
        #[arg(long)]
        database_url: Option<String>,
        /// Default completion model for profiles with a blank model name.
        #[arg(long)]
        model: Option<String>,
        /// Keep state in memory only.
        #[arg(long)]
        ephemeral: bool,
    },
    /// Print channel and message counts from the stored state.
    Status {
        #[arg(long)]
        database_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start { listen, database_url, model, ephemeral } => {
            let addr: SocketAddr = listen.parse()?;
            let cfg = AppConfig::from_env()?.with_overrides(CliOverrides { database_url, model });
            if cfg.api_key.is_none() {
                tracing::warn!("no GEMINI_API_KEY/API_KEY set, replies will report missing configuration");
            }

            let kv: Arc<dyn KeyValueStore> = if ephemeral {
                Arc::new(MemoryKeyValueStore::new())
            } else {
                Arc::new(SqliteKeyValueStore::initialize(cfg.database_url.clone()).await?)
            };
            let store = Arc::new(EntityStore::load(kv).await);
            spawn_change_logger(&store);

            let pipeline = ReplyPipeline::new(store.clone(), Arc::new(GeminiClient::from_config(&cfg)))
                .with_defaults(cfg.defaults.clone())
                .with_texts(reply_texts(&cfg));
            let metrics = match PrometheusBuilder::new().install_recorder() {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::warn!(error = %e, "metrics recorder not installed");
                    None
                }
            };
            let state = server::AppState {
                store,
                pipeline,
                qr: Arc::new(QrRefreshTimer::new(cfg.qr_refresh)),
                metrics,
            };
            server::serve(addr, state).await?;
        }
        Commands::Status { database_url } => {
            let cfg = AppConfig::from_env()?.with_overrides(CliOverrides { database_url, model: None });
            let kv = Arc::new(SqliteKeyValueStore::initialize(cfg.database_url).await?);
            let store = EntityStore::inspect(kv).await;
            let stats = store.stats().await;
            println!("channels:  {}", stats.channels);
            println!("connected: {}", stats.connected);
            println!("messages:  {}", stats.messages);
            for p in store.snapshot().await.profiles {
                println!("profile {} ({}, model {:?}, temperature {})", p.id, p.name, p.model_name, p.temperature);
            }
            for ch in store.channels().await {
                println!("  {:<12} {:<13} {} ({} messages)", ch.id, ch.status.as_str(), ch.bridge_key, ch.messages.len());
            }
        }
    }
    Ok(())
}

fn reply_texts(cfg: &AppConfig) -> ReplyTexts {
    let mut texts = ReplyTexts::default();
    if let Some(name) = &cfg.assistant_name {
        texts.assistant_name = name.clone();
    }
    texts
}

fn spawn_change_logger(store: &Arc<EntityStore>) {
    let mut rx = store.subscribe();
    let store = store.clone();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let stats = store.stats().await;
            tracing::debug!(
                revision = stats.revision,
                channels = stats.channels,
                messages = stats.messages,
                "state changed"
            );
        }
    });
}
