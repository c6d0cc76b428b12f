//! tg-archive - Telegram message indexing and search platform
//!
//! Three cooperating processes: an ingestor attached to a user-account
//! session feeding a remote search engine, a bot frontend serving search
//! commands, and the external engine itself. This crate implements the
//! ingestor and the bot; the engine is consumed through its REST contract.

pub mod access;
pub mod auth;
pub mod bot_api;
pub mod bot_client;
pub mod buffered;
pub mod config;
pub mod document;
pub mod frontend;
pub mod ingest;
pub mod message_store;
pub mod privacy;
pub mod query;
pub mod querylog;
pub mod search_client;
pub mod session;
pub mod storage;
pub mod sync;
pub mod sync_api;
pub mod sync_client;
pub mod types;
pub mod utils;

/// Initialize tracing for a service binary.
///
/// Third-party targets are kept at warn unless debug logging is requested.
pub fn init_logging(debug: bool) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let default_filter = "grammers_mtsender=warn,grammers_mtproto=warn,grammers_client=warn,\
                          grammers_session=warn,hyper=warn,reqwest=warn";
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new(format!("info,{}", default_filter))
    };

    let stdout_layer = fmt::layer();

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .init();
}

/// Resolve when the process receives SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
