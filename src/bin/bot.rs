//! Bot entrypoint
//!
//! Runs the query frontend: the bot session serving search commands, the
//! bot HTTP API (file relay + message queue), and the relay-queue drain
//! that forwards ingestor notifications to the owner.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tg_archive::access::AccessController;
use tg_archive::auth::{AuthLayer, JwtAuth};
use tg_archive::bot_api::{self, BotApiState};
use tg_archive::config::Config;
use tg_archive::frontend::{BotFrontend, SharedBotClient};
use tg_archive::message_store::MessageStore;
use tg_archive::privacy::PrivacyManager;
use tg_archive::querylog::QueryLogDb;
use tg_archive::search_client::SearchHttpClient;
use tg_archive::session::ClientSession;
use tg_archive::storage::MemoryStateStore;
use tg_archive::sync_client::SyncHttpClient;
use tg_archive::{init_logging, shutdown_signal};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tg-archive-bot")]
#[command(about = "Search bot frontend for the message archive")]
#[command(version)]
struct Args {
    /// Path to config file
    #[arg(short = 'c', long, default_value = "config.json")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    info!("Starting tg-archive bot, reading config {:?}", args.config);
    let config = Config::from_file(&args.config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    let owner_id = config.telegram.owner_id;

    let session_file = config.telegram.session_dir.join("bot.session");
    let session = Arc::new(
        ClientSession::new(
            &session_file,
            "bot".to_string(),
            config.telegram.app_id,
            &config.telegram.app_hash,
            config.telegram.proxy.clone(),
        )
        .await?,
    );

    let search_auth = JwtAuth::from_config(&config.auth, "bot", "search")?.map(Arc::new);
    let sync_auth = JwtAuth::from_config(&config.auth, "bot", "userbot")?.map(Arc::new);
    let server_auth = JwtAuth::from_config(&config.auth, "bot", "bot")?.map(Arc::new);

    let search = Arc::new(SearchHttpClient::new(
        &config.services.search.base_url,
        config.search_engine.http.timeout,
        config.search_engine.http.max_retries,
        search_auth,
    )?);
    if !search.health().await {
        warn!("Search engine is not answering health checks yet");
    }

    let sync = Arc::new(SyncHttpClient::new(
        &config.services.userbot.base_url,
        30,
        sync_auth,
    )?);
    if !sync.health().await {
        warn!("Ingestor sync API is not reachable yet");
    }

    let access = Arc::new(AccessController::from_config(&config.bot, owner_id)?);
    let privacy = Arc::new(PrivacyManager::new(&config.privacy.storage_file)?);
    let querylog = if config.database.enabled {
        Some(Arc::new(QueryLogDb::open(&config.database.path)?))
    } else {
        None
    };

    let shared_client = SharedBotClient::new();
    let frontend = Arc::new(BotFrontend::new(
        "bot",
        session,
        shared_client.clone(),
        search,
        sync,
        access,
        privacy,
        querylog,
        Arc::new(MemoryStateStore::new()),
        &config.telegram.bot_token,
    ));

    // Bot HTTP API: file relay from the ingestor plus the message queue.
    let store_path = config.database.path.with_file_name("message_queue.db");
    let store = Arc::new(MessageStore::open(&store_path)?);
    let api_state = BotApiState {
        sender: Arc::new(shared_client.clone()),
        store: store.clone(),
        owner_id,
    };
    let addr: SocketAddr = format!("{}:{}", config.http.listen, config.http.bot_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid http.listen / bot_port: {}", e))?;
    let auth_layer = AuthLayer::new(server_auth, &["userbot"]);
    tokio::spawn(async move {
        if let Err(e) = bot_api::serve(api_state, auth_layer, addr).await {
            error!("Bot API exited: {}", e);
        }
    });

    // Drain the relay queue: ingestor notifications become owner messages.
    {
        let frontend = frontend.clone();
        let store = store.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(30)).await;
                let batch = match store.dequeue("bot", None, 10) {
                    Ok((items, _)) => items,
                    Err(e) => {
                        warn!("relay queue read failed: {}", e);
                        continue;
                    }
                };
                for item in batch {
                    let text = match item.kind.as_str() {
                        "sync_completed" => format!(
                            "✅ History sync finished for chat {} ({} messages)",
                            item.payload["chat_id"], item.payload["synced_count"]
                        ),
                        other => format!("ℹ️ {}: {}", other, item.payload),
                    };
                    if frontend.send_plain(owner_id, &text).await.is_ok() {
                        if let Err(e) = store.acknowledge(&item.id) {
                            warn!("relay ack failed: {}", e);
                        }
                    } else {
                        debug!("owner notify deferred, keeping message queued");
                    }
                }
                if let Err(e) = store.cleanup_old_messages(24) {
                    warn!("relay cleanup failed: {}", e);
                }
            }
        });
    }

    let run_task = {
        let frontend = frontend.clone();
        tokio::spawn(async move {
            if let Err(e) = frontend.run(owner_id).await {
                error!("Bot event loop error: {}", e);
            }
        })
    };

    info!("Initialization complete. Press Ctrl+C to stop.");
    shutdown_signal().await;
    info!("Shutting down...");
    run_task.abort();
    Ok(())
}
