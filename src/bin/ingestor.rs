//! Ingestor entrypoint
//!
//! Attaches to the user-account session, streams live messages into the
//! buffered indexer, runs the resumable history sync worker, and exposes
//! the Sync Control API for the bot.

use anyhow::Result;
use clap::Parser;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tg_archive::auth::{AuthLayer, JwtAuth};
use tg_archive::bot_client::BotHttpClient;
use tg_archive::buffered::{BatchSink, BufferedIndexer};
use tg_archive::config::Config;
use tg_archive::ingest::{IngestorBot, TelegramHistorySource};
use tg_archive::search_client::SearchHttpClient;
use tg_archive::session::ClientSession;
use tg_archive::sync::{SyncManager, SyncStatus};
use tg_archive::sync_api::{self, SyncApiState};
use tg_archive::{init_logging, shutdown_signal};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tg-archive-ingestor")]
#[command(about = "Telegram account ingestor feeding the search engine")]
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

    info!("Starting tg-archive ingestor, reading config {:?}", args.config);
    let config = Config::from_file(&args.config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    // Session: interactive login on first run, silent afterwards.
    let session_file = config.telegram.session_dir.join("ingestor.session");
    let session = Arc::new(
        ClientSession::new(
            &session_file,
            "ingestor".to_string(),
            config.telegram.app_id,
            &config.telegram.app_hash,
            config.telegram.proxy.clone(),
        )
        .await?,
    );
    session.start_user(None).await?;
    session.populate_access_hashes().await?;

    // One shared keypair, distinct issuer/audience pairs per direction.
    let search_auth = JwtAuth::from_config(&config.auth, "userbot", "search")?.map(Arc::new);
    let server_auth = JwtAuth::from_config(&config.auth, "userbot", "userbot")?.map(Arc::new);
    let bot_auth = JwtAuth::from_config(&config.auth, "userbot", "bot")?.map(Arc::new);

    let search = Arc::new(SearchHttpClient::new(
        &config.services.search.base_url,
        config.search_engine.http.timeout,
        config.search_engine.http.max_retries,
        search_auth,
    )?);
    if search.health().await {
        info!("Connected to search engine");
    } else {
        warn!("Search engine is not answering health checks yet");
    }

    // Buffered indexer; disabling batching degenerates to per-message
    // flushes through the same path.
    let batch_size = if config.search_engine.batch.enabled {
        config.search_engine.batch.size
    } else {
        1
    };
    let sink: Arc<dyn BatchSink> = search.clone();
    let indexer = BufferedIndexer::new(
        sink.clone(),
        batch_size,
        config.search_engine.batch.flush_interval,
    );

    // Never index the paired bot's own dialog (its replies would echo
    // every search result back into the index). Bot tokens are "<id>:<secret>".
    let mut excluded_chats = HashSet::new();
    if let Some(bot_id) = config
        .telegram
        .bot_token
        .split(':')
        .next()
        .and_then(|s| s.parse::<i64>().ok())
    {
        excluded_chats.insert(bot_id);
    }

    let ingestor = Arc::new(IngestorBot::new(
        session.clone(),
        indexer.clone(),
        search.clone(),
        excluded_chats,
    ));

    // Sync manager over the same account client and indexer.
    let source = Arc::new(TelegramHistorySource::new(ingestor.clone()));
    let sync_manager = Arc::new(SyncManager::new(
        source,
        sink,
        Some(indexer.clone()),
        config.sync.clone(),
    ));
    sync_manager.load_checkpoint().await?;
    if config.sync.enabled {
        sync_manager.start_worker();
    } else {
        info!("History sync disabled by config");
    }

    // Sync Control API for the bot.
    let addr: SocketAddr = format!("{}:{}", config.http.listen, config.http.userbot_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid http.listen / userbot_port: {}", e))?;
    let api_state = SyncApiState {
        manager: sync_manager.clone(),
    };
    let auth_layer = AuthLayer::new(server_auth, &["bot"]);
    tokio::spawn(async move {
        if let Err(e) = sync_api::serve(api_state, auth_layer, addr).await {
            error!("Sync control API exited: {}", e);
        }
    });

    // Relay sync completions to the bot's message queue so the owner hears
    // about them.
    let bot_client = Arc::new(BotHttpClient::new(
        &config.services.bot.base_url,
        30,
        bot_auth,
    )?);
    {
        let bot_client = bot_client.clone();
        let manager = sync_manager.clone();
        tokio::spawn(async move {
            let mut notified: HashSet<i64> = HashSet::new();
            loop {
                tokio::time::sleep(Duration::from_secs(30)).await;
                for progress in manager.get_all_progress().await {
                    if progress.status == SyncStatus::Completed
                        && notified.insert(progress.chat_id)
                    {
                        let payload = serde_json::json!({
                            "chat_id": progress.chat_id,
                            "synced_count": progress.synced_count,
                            "completed_at": progress.completed_at,
                        });
                        if let Err(e) =
                            bot_client.enqueue_message("sync_completed", payload).await
                        {
                            debug!("sync completion relay failed: {}", e);
                            notified.remove(&progress.chat_id);
                        }
                    }
                }
            }
        });
    }

    // Live event loop.
    let ingest_task = {
        let ingestor = ingestor.clone();
        tokio::spawn(async move {
            if let Err(e) = ingestor.run().await {
                error!("Ingestor event loop error: {}", e);
            }
        })
    };

    info!("Initialization complete. Press Ctrl+C to stop.");
    shutdown_signal().await;
    info!("Shutting down...");

    // Order matters: stop pulling history, then drain the buffer.
    sync_manager.stop_worker().await;
    if let Err(e) = indexer.shutdown().await {
        error!("Indexer shutdown flush failed: {}", e);
    }

    // Best-effort: relay the final checkpoint to the owner for inspection.
    if config.sync.checkpoint_file.exists()
        && let Ok(data) = tokio::fs::read(&config.sync.checkpoint_file).await
        && let Err(e) = bot_client
            .send_file("sync_checkpoint.json", &data, "Final sync state", None)
            .await
    {
        debug!("checkpoint relay skipped: {}", e);
    }

    ingest_task.abort();
    Ok(())
}
