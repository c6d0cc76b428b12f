//! Telegram session management
//!
//! Shared by both processes: SQLite-backed session storage, interactive
//! login for the user account, token sign-in for the bot, and a dialog
//! sweep that primes access hashes and the chat-name cache.

use crate::types::{Error, Result};
use crate::utils::get_share_id;
use dashmap::DashMap;
use grammers_client::{Client, SignInError};
use grammers_mtsender::{ConnectionParams, SenderPool};
use grammers_session::storages::SqliteSession;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub struct ClientSession {
    /// Session name for logging
    name: String,

    session_storage: Arc<SqliteSession>,

    api_id: i32,

    api_hash: String,

    /// SOCKS5 proxy URL, validated at construction
    proxy: Option<String>,

    /// Chat ID to name cache, populated by the dialog sweep
    chat_cache: Arc<DashMap<i64, String>>,
}

impl ClientSession {
    pub async fn new(
        session_file: &Path,
        name: String,
        api_id: i32,
        api_hash: &str,
        proxy: Option<String>,
    ) -> Result<Self> {
        info!("Creating session: {}", name);

        if let Some(parent) = session_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let session_storage = Arc::new(
            SqliteSession::open(session_file)
                .map_err(|e| Error::Config(format!("Failed to open session: {}", e)))?,
        );

        // grammers only speaks SOCKS5; reject HTTP proxies early.
        if let Some(url) = &proxy
            && url.starts_with("http")
        {
            return Err(Error::Config(format!(
                "HTTP proxy is not supported, use SOCKS5 instead: {}",
                url
            )));
        }
        if let Some(url) = &proxy {
            info!("Using proxy: {}", url);
        }

        Ok(Self {
            name,
            session_storage,
            api_id,
            api_hash: api_hash.to_string(),
            proxy,
            chat_cache: Arc::new(DashMap::new()),
        })
    }

    /// Create a sender pool honoring the proxy configuration.
    pub fn create_pool(&self) -> SenderPool {
        if let Some(proxy_url) = &self.proxy {
            let params = ConnectionParams {
                proxy_url: Some(proxy_url.clone()),
                ..Default::default()
            };
            SenderPool::with_configuration(Arc::clone(&self.session_storage), self.api_id, params)
        } else {
            SenderPool::new(Arc::clone(&self.session_storage), self.api_id)
        }
    }

    /// Interactive user-account login. Prompts on stderr for the phone
    /// number (when not given), the login code and the 2FA password.
    pub async fn start_user(&self, phone: Option<&str>) -> Result<()> {
        info!("Authenticating session: {}", self.name);

        let pool = self.create_pool();
        let client = Client::new(&pool);
        let SenderPool { runner, .. } = pool;
        let runner_task = tokio::spawn(runner.run());

        if client
            .is_authorized()
            .await
            .map_err(|e| Error::Telegram(format!("Failed to check authorization: {}", e)))?
        {
            info!("Session {} is already authorized", self.name);
            drop(client);
            runner_task.abort();
            return Ok(());
        }

        info!("Session {} needs authentication", self.name);

        let phone = match phone {
            Some(p) => p.to_string(),
            None => prompt_stdin("Enter the phone number for the account: ")?,
        };

        let token = client
            .request_login_code(&phone, &self.api_hash)
            .await
            .map_err(|e| Error::Telegram(format!("Failed to request login code: {}", e)))?;

        let code = prompt_stdin(&format!("Enter the verification code sent to {}: ", phone))?;

        match client.sign_in(&token, code.trim()).await {
            Ok(_) => {
                info!("Signed in successfully");
            }
            Err(SignInError::PasswordRequired(password_token)) => {
                let hint = password_token.hint().unwrap_or("None");
                let password = rpassword::prompt_password(format!(
                    "Enter your 2FA password (hint: {}): ",
                    hint
                ))
                .map_err(Error::Io)?;

                client
                    .check_password(password_token, password.trim())
                    .await
                    .map_err(|e| {
                        Error::Telegram(format!("Password authentication failed: {}", e))
                    })?;

                info!("Signed in successfully with 2FA");
            }
            Err(e) => {
                return Err(Error::Telegram(format!("Sign in failed: {}", e)));
            }
        }

        drop(client);
        runner_task.abort();
        Ok(())
    }

    /// Bot sign-in with the configured token. No-op when already authorized.
    pub async fn sign_in_bot(&self, client: &Client, bot_token: &str) -> Result<()> {
        if client.is_authorized().await.map_err(|e| {
            Error::Telegram(format!("Failed to check bot authorization: {}", e))
        })? {
            info!("Bot session {} is already authorized", self.name);
            return Ok(());
        }

        info!("Bot signing in with token");
        client
            .bot_sign_in(bot_token, &self.api_hash)
            .await
            .map_err(|e| Error::Telegram(format!("Bot sign in failed: {}", e)))?;
        Ok(())
    }

    /// Populate access hashes and the chat-name cache by walking all
    /// dialogs. Needed so later peer lookups by id succeed.
    pub async fn populate_access_hashes(&self) -> Result<usize> {
        info!(
            "Populating access hashes and chat cache for session: {}",
            self.name
        );

        let pool = self.create_pool();
        let client = Client::new(&pool);
        let SenderPool { runner, .. } = pool;
        let runner_task = tokio::spawn(runner.run());

        let mut dialog_count = 0;
        let mut dialogs = client.iter_dialogs();
        while let Some(dialog) = dialogs
            .next()
            .await
            .map_err(|e| Error::Telegram(format!("Failed to iterate dialogs: {}", e)))?
        {
            dialog_count += 1;

            let peer = dialog.peer();
            let chat_id = peer.id().bot_api_dialog_id();
            let share_id = get_share_id(chat_id);
            if let Some(name) = peer.name() {
                self.chat_cache.insert(share_id, name.to_string());
            }
        }

        info!(
            "Populated access hashes and {} chat names for session {}",
            self.chat_cache.len(),
            self.name
        );

        drop(client);
        runner_task.abort();
        Ok(dialog_count)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn api_hash(&self) -> &str {
        &self.api_hash
    }

    /// Chat name by bot-api dialog id, from the dialog-sweep cache.
    pub fn chat_name(&self, chat_id: i64) -> Option<String> {
        self.chat_cache
            .get(&get_share_id(chat_id))
            .map(|v| v.clone())
    }

    pub fn chat_cache(&self) -> Arc<DashMap<i64, String>> {
        Arc::clone(&self.chat_cache)
    }
}

fn prompt_stdin(prompt: &str) -> Result<String> {
    eprint!("{}", prompt);
    std::io::stderr().flush().map_err(Error::Io)?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line).map_err(Error::Io)?;
    Ok(line.trim().to_string())
}
