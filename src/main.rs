//! mailflow: event-driven email automation engine
//!
//! Maintains a local searchable mirror of a single IMAP mailbox, observes
//! new mail via IDLE, and dispatches each observed event to declarative
//! listener rule files through a capability-object context.
//!
//! # Architecture
//!
//! - [`config`]: environment-driven account/engine configuration
//! - [`errors`]: application error model with HTTP status mapping
//! - [`store`]: durable, indexed mailbox mirror (C1)
//! - [`imap`]: connection lifecycle, session commands, IDLE loop (C2)
//! - [`mime`]: RFC822 parsing, recipient/snippet/thread extraction
//! - [`sync`]: incremental/filtered sync pipeline (C3)
//! - [`listeners`]: rule-file registry, hot reload (C4)
//! - [`dispatcher`]: event dispatch and the listener capability context (C5)
//! - [`agent`]: LLM structured-output sub-agent gateway (C6)
//! - [`notification`]: listener notification sink
//! - [`http`]: HTTP/WebSocket surface for the UI collaborator

mod agent;
mod config;
mod dispatcher;
mod errors;
mod http;
mod imap;
mod listeners;
mod mime;
mod notification;
mod store;
mod sync;

use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use agent::AgentGateway;
use config::EngineConfig;
use dispatcher::{ContextFactory, Dispatcher};
use imap::{ImapClient, IdleEvent};
use listeners::ListenerRegistry;
use notification::BroadcastNotificationSink;
use store::MailStore;
use sync::SyncService;

/// mailflow: IMAP IDLE monitoring, local mail store, and declarative
/// listener rule dispatch
#[derive(Debug, Parser)]
#[command(name = "mailflow")]
struct Cli {
    /// Run one sync pass against INBOX and exit, skipping IDLE monitoring
    /// and the HTTP surface entirely. Useful for cron-driven deployments
    /// and for exercising the pipeline without a long-lived process.
    #[arg(long)]
    sync_once: bool,

    /// Folder to monitor via IDLE and to sync in --sync-once mode
    #[arg(long, default_value = "INBOX")]
    folder: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load_from_env()?;

    let store = Arc::new(MailStore::open(&config.db_path)?);
    let imap_client = Arc::new(ImapClient::new(config.clone()));
    let notifications = Arc::new(BroadcastNotificationSink::new(256));
    let agent_gateway = Arc::new(AgentGateway::new(
        config.llm_api_key.clone(),
        config.llm_call_timeout_ms,
    ));

    let registry = Arc::new(ListenerRegistry::new(config.listeners_dir.clone()));
    registry.load_all()?;

    let context_factory = Arc::new(ContextFactory::new(
        store.clone(),
        imap_client.clone(),
        notifications.clone() as Arc<dyn notification::NotificationSink>,
        agent_gateway,
    ));
    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), context_factory));
    let sync_service = Arc::new(SyncService::new(store.clone(), imap_client.clone(), dispatcher));

    if cli.sync_once {
        let report = sync_service
            .sync(
                &sync::SyncOptions {
                    folder: Some(cli.folder),
                    ..Default::default()
                },
                store::SyncType::Manual,
            )
            .await?;
        info!(
            synced = report.synced,
            skipped = report.skipped,
            errors = report.errors,
            "sync-once complete"
        );
        return Ok(());
    }

    let (reload_tx, mut reload_rx) = mpsc::channel(16);
    let _watcher = listeners::spawn_watcher(registry.clone(), reload_tx)?;
    tokio::spawn(async move {
        while let Some(configs) = reload_rx.recv().await {
            info!(count = configs.len(), "listeners_update broadcast");
        }
    });

    let keepalive_client = imap_client.clone();
    let keepalive_interval = std::time::Duration::from_millis(config.keepalive_interval_ms);
    tokio::spawn(async move {
        imap::run_keepalive_loop(&keepalive_client, keepalive_interval).await;
    });

    let (idle_tx, mut idle_rx) = mpsc::channel(16);
    let idle_client = imap_client.clone();
    let idle_folder = cli.folder.clone();
    tokio::spawn(async move {
        imap::run_idle_loop(&idle_client, &idle_folder, idle_tx).await;
    });

    let idle_sync_service = sync_service.clone();
    let idle_folder_for_sync = cli.folder.clone();
    tokio::spawn(async move {
        let mut pending_changes: u32 = 0;
        while let Some(event) = idle_rx.recv().await {
            match event {
                IdleEvent::MailboxChanged => {
                    pending_changes += 1;
                    match idle_sync_service
                        .sync_after_idle(&idle_folder_for_sync, pending_changes)
                        .await
                    {
                        Ok(report) => {
                            info!(synced = report.synced, "idle-triggered sync complete");
                            pending_changes = 0;
                        }
                        Err(err) => warn!(error = %err, "idle-triggered sync failed"),
                    }
                }
                IdleEvent::StateChanged(state) => {
                    info!(state = ?state, "idle state changed");
                }
            }
        }
    });

    let state = http::AppState {
        store,
        sync_service,
        registry,
        notifications,
    };
    let app = http::router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port)).await?;
    info!(port = config.http_port, "http surface listening");

    if let Err(err) = axum::serve(listener, app).await {
        error!(error = %err, "http server exited");
    }

    Ok(())
}
