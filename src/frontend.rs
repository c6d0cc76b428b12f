//! Bot frontend for user interaction
//!
//! Handles user commands, runs the search pipeline (access check, parse,
//! scope, privacy filter, render, paginate), and manages auto-deleting
//! paginated responses in group chats.

use crate::access::{AccessController, SearchScope};
use crate::document::{ChatType, MessageDocument};
use crate::privacy::PrivacyManager;
use crate::query::{
    MAX_PAGE, PAGE_SIZE, ParsedQuery, parse_query, rewrite_chat_type_shortcut, validate_page,
};
use crate::querylog::{QueryLogDb, QueryLogEntry};
use crate::search_client::{SearchHttpClient, SearchRequest, SearchResponse, UserStatsRequest};
use crate::session::ClientSession;
use crate::storage::{JsonState, StateStore};
use crate::sync_client::SyncHttpClient;
use crate::types::{Error, Result};
use crate::utils::{
    chat_deep_link, escape_markdown, format_display_time, message_link, parse_time_window,
    remove_first_word,
};
use async_trait::async_trait;
use dashmap::DashMap;
use grammers_client::client::UpdatesConfiguration;
use grammers_client::types::update::{CallbackQuery, Update};
use grammers_client::{Client, InputMessage, button, reply_markup};
use grammers_mtsender::SenderPool;
use grammers_session::defs::PeerId;
use grammers_tl_types as tl;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Telegram message length ceiling; longer responses go out as a file.
const MESSAGE_LENGTH_LIMIT: usize = 4096;

/// Paginated group responses are deleted after this many seconds.
const AUTO_DELETE_SECS: u64 = 120;

/// Bot client shared with the HTTP API server; set once during `run`.
#[derive(Clone, Default)]
pub struct SharedBotClient {
    inner: Arc<OnceLock<Client>>,
}

impl SharedBotClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, client: Client) {
        let _ = self.inner.set(client);
    }

    pub fn get(&self) -> Result<&Client> {
        self.inner
            .get()
            .ok_or_else(|| Error::Config("Bot client not initialized".into()))
    }
}

#[async_trait]
impl crate::bot_api::FileSender for SharedBotClient {
    async fn send_document(
        &self,
        recipient_id: i64,
        file_name: &str,
        data: Vec<u8>,
        caption: &str,
    ) -> Result<i32> {
        let client = self.get()?;
        BotFrontend::send_document_with_client(client, recipient_id, file_name, data, caption)
            .await
    }
}

/// Query state stored per response message so pagination callbacks can
/// re-run the search.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredQuery {
    query: ParsedQuery,
    invoker_id: i64,
    chat_id: i64,
    chat_type: ChatType,
}

pub struct BotFrontend {
    id: String,
    session: Arc<ClientSession>,
    client: SharedBotClient,
    search: Arc<SearchHttpClient>,
    sync: Arc<SyncHttpClient>,
    access: Arc<AccessController>,
    privacy: Arc<PrivacyManager>,
    querylog: Option<Arc<QueryLogDb>>,
    storage: Arc<dyn StateStore>,
    /// Pending auto-delete tasks keyed by (chat, message).
    delete_tasks: Arc<DashMap<(i64, i32), tokio::task::AbortHandle>>,
    bot_token: String,
}

impl BotFrontend {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        frontend_id: &str,
        session: Arc<ClientSession>,
        client: SharedBotClient,
        search: Arc<SearchHttpClient>,
        sync: Arc<SyncHttpClient>,
        access: Arc<AccessController>,
        privacy: Arc<PrivacyManager>,
        querylog: Option<Arc<QueryLogDb>>,
        storage: Arc<dyn StateStore>,
        bot_token: &str,
    ) -> Self {
        info!("Creating bot frontend: {}", frontend_id);
        Self {
            id: frontend_id.to_string(),
            session,
            client,
            search,
            sync,
            access,
            privacy,
            querylog,
            storage,
            delete_tasks: Arc::new(DashMap::new()),
            bot_token: bot_token.to_string(),
        }
    }

    /// Run the bot event loop: sign in, greet the owner, process updates.
    pub async fn run(self: Arc<Self>, owner_id: i64) -> Result<()> {
        let pool = self.session.create_pool();
        let client = Client::new(&pool);
        let SenderPool {
            runner, updates, ..
        } = pool;
        tokio::spawn(runner.run());

        self.session.sign_in_bot(&client, &self.bot_token).await?;

        let me = client
            .get_me()
            .await
            .map_err(|e| Error::Telegram(format!("Failed to get bot info: {}", e)))?;
        let username = me
            .username()
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("bot_{}", self.id));
        info!("Bot authenticated, username: {}", username);

        self.client.set(client.clone());

        let engine_line = match self.search.ping().await {
            Ok(ping) => format!(
                "engine: {} ({} documents)",
                ping.engine, ping.total_documents
            ),
            Err(e) => {
                warn!("search engine ping failed during startup: {}", e);
                "engine: unreachable".to_string()
            }
        };
        let greeting = format!("Search bot @{} is online\n{}", username, engine_line);
        if let Err(e) = self.send_message(owner_id, &greeting, None).await {
            warn!("Failed to send greeting to owner: {}", e);
        }

        let mut updates = client.stream_updates(
            updates,
            UpdatesConfiguration {
                catch_up: true,
                ..Default::default()
            },
        );

        loop {
            match updates.next().await {
                Ok(update) => match update {
                    Update::NewMessage(message) if !message.outgoing() => {
                        if let Err(e) = self.handle_update_message(&message).await {
                            error!("Error handling bot message: {}", e);
                        }
                    }
                    Update::CallbackQuery(query) => {
                        if let Err(e) = self.handle_update_callback(query).await {
                            error!("Error handling bot callback: {}", e);
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error getting bot update: {}", e);
                    break;
                }
            }
        }

        warn!("Bot '{}' event loop exited", self.id);
        Ok(())
    }

    /// Route one incoming message through access control and the command
    /// dispatcher, surfacing user errors as chat replies.
    async fn handle_update_message(
        &self,
        message: &grammers_client::types::update::Message,
    ) -> Result<()> {
        let text = message.text().trim().to_string();
        if text.is_empty() {
            return Ok(());
        }

        // Project once: the converter also classifies the chat.
        let chat_id = message.peer_id().bot_api_dialog_id();
        let doc = MessageDocument::from_update(message, None);
        let chat_type = doc.chat.kind;
        let sender_id = doc.from_user.id;
        if sender_id == 0 {
            warn!("Message without sender, ignoring");
            return Ok(());
        }
        let sender_username = doc.from_user.username.clone();

        // Access check. Denials reply in private chats and stay silent in
        // groups to avoid spam.
        if let Err(reason) = self.access.check(sender_id, chat_id, chat_type) {
            warn!(sender_id, chat_id, %reason, "access denied");
            if !chat_type.is_group_like() {
                self.send_message(chat_id, &format!("❌ {}", reason), None)
                    .await?;
            }
            return Ok(());
        }

        let inv = InvocationOwned {
            chat_id,
            chat_type,
            sender_id,
            sender_username,
            sender_first_name: doc.from_user.first_name.clone(),
        };

        let result = self.dispatch(&inv, &text).await;
        if let Err(e) = result {
            let reply = match &e {
                Error::UserInput(msg) => format!("❌ {}", msg),
                Error::EntityNotFound(entity) => format!("❌ Not found: {}", entity),
                _ => {
                    error!("Error handling command: {}", e);
                    format!("❌ Error: {}", e)
                }
            };
            if let Err(send_err) = self.send_message(chat_id, &reply, None).await {
                error!("Failed to send error reply: {}", send_err);
            }
        }
        Ok(())
    }

    async fn dispatch(&self, inv: &InvocationOwned, text: &str) -> Result<()> {
        // Chat-type shortcuts rewrite into flag form first.
        if let Some(rewritten) = rewrite_chat_type_shortcut(text)? {
            return self.handle_search(inv, &rewritten).await;
        }

        if text.starts_with("/start") {
            let reply = "Hello, I'm a message search bot.\nUse /search <keyword> or just type a keyword.";
            return self.send_message(inv.chat_id, reply, None).await.map(|_| ());
        }
        if text.starts_with("/help") {
            return self
                .send_message(inv.chat_id, HELP_TEXT, None)
                .await
                .map(|_| ());
        }
        if text.starts_with("/ping") {
            self.require_owner(inv.sender_id)?;
            return self.handle_ping(inv.chat_id).await;
        }
        if text.starts_with("/dedup") {
            self.require_owner(inv.sender_id)?;
            return self.handle_dedup(inv.chat_id).await;
        }
        if text.starts_with("/delete_chat") {
            self.require_owner(inv.sender_id)?;
            return self.handle_delete_chat(inv.chat_id, text).await;
        }
        if text.starts_with("/clean_commands") {
            self.require_owner(inv.sender_id)?;
            let deleted = self.search.delete_commands().await?;
            let reply = format!("Removed {} indexed bot commands", deleted);
            return self.send_message(inv.chat_id, &reply, None).await.map(|_| ());
        }
        if text.starts_with("/sync_status") {
            self.require_owner(inv.sender_id)?;
            return self.handle_sync_status(inv.chat_id, text).await;
        }
        if text.starts_with("/sync_pause") {
            self.require_owner(inv.sender_id)?;
            return self.handle_sync_pause_resume(inv.chat_id, text, true).await;
        }
        if text.starts_with("/sync_resume") {
            self.require_owner(inv.sender_id)?;
            return self.handle_sync_pause_resume(inv.chat_id, text, false).await;
        }
        if text.starts_with("/sync") {
            self.require_owner(inv.sender_id)?;
            return self.handle_sync(inv, text).await;
        }
        if text.starts_with("/block_me") {
            return self.handle_block_me(inv).await;
        }
        if text.starts_with("/unblock_me") {
            return self.handle_unblock_me(inv).await;
        }
        if text.starts_with("/privacy_status") {
            let reply = if self.privacy.is_blocked(inv.sender_id) {
                "You are opted out: your messages are hidden from search results."
            } else {
                "You are visible in search results. Use /block_me to opt out."
            };
            return self.send_message(inv.chat_id, reply, None).await.map(|_| ());
        }
        if text.starts_with("/mystats") {
            return self.handle_mystats(inv, text).await;
        }
        if text.starts_with("/search") {
            return self.handle_search(inv, text).await;
        }
        if text.starts_with('/') {
            let cmd = text.split_whitespace().next().unwrap_or("");
            warn!("Unknown command: {}", cmd);
            if !inv.chat_type.is_group_like() {
                let reply = format!("❌ Unknown command: {}", cmd);
                self.send_message(inv.chat_id, &reply, None).await?;
            }
            return Ok(());
        }

        // Plain text searches only work in direct chats; groups require the
        // explicit /search form.
        if !inv.chat_type.is_group_like() {
            return self.handle_search(inv, text).await;
        }
        Ok(())
    }

    fn require_owner(&self, sender_id: i64) -> Result<()> {
        if !self.access.is_owner(sender_id) {
            return Err(Error::UserInput(
                "This command is only available to the bot owner.".to_string(),
            ));
        }
        Ok(())
    }

    // ── Search pipeline ─────────────────────────────────────────────────

    async fn handle_search(&self, inv: &InvocationOwned, text: &str) -> Result<()> {
        let parsed = parse_query(text)?;
        let stored = StoredQuery {
            query: parsed,
            invoker_id: inv.sender_id,
            chat_id: inv.chat_id,
            chat_type: inv.chat_type,
        };

        let started = Instant::now();
        let (body, buttons, response) = self.run_search(&stored, 1).await?;
        self.log_query(inv, &stored.query, &response, 1, started.elapsed());

        if body.len() > MESSAGE_LENGTH_LIMIT {
            warn!("Search response too long, sending as file");
            self.send_message(
                inv.chat_id,
                "Your search result is too long, sending as file instead",
                None,
            )
            .await?;
            let client = self.client.get()?;
            Self::send_document_with_client(
                client,
                inv.chat_id,
                "search_result.txt",
                body.into_bytes(),
                "",
            )
            .await?;
            return Ok(());
        }

        let has_buttons = buttons.is_some();
        let sent_id = self.send_message(inv.chat_id, &body, buttons).await?;
        info!(
            chat_id = inv.chat_id,
            hits = response.total_hits,
            "sent search results"
        );

        // Keep state for pagination and arm the group auto-delete timer.
        JsonState::put(
            self.storage.as_ref(),
            &self.query_key(inv.chat_id, sent_id),
            &stored,
        )
        .await?;
        if inv.chat_type.is_group_like() && has_buttons {
            self.schedule_delete(inv.chat_id, sent_id);
        }
        Ok(())
    }

    /// The scope/filter/search/post-filter/render pipeline shared by fresh
    /// searches and pagination callbacks.
    async fn run_search(
        &self,
        stored: &StoredQuery,
        page: u32,
    ) -> Result<(String, Option<Vec<Vec<(String, String)>>>, SearchResponse)> {
        validate_page(page)?;

        let scope = self
            .access
            .search_scope(stored.invoker_id, stored.chat_id, stored.chat_type);

        // Owner searching in a private chat sees the unfiltered index.
        let owner_private = self.access.is_owner(stored.invoker_id)
            && !stored.chat_type.is_group_like();
        let blocked_users = if owner_private {
            Vec::new()
        } else {
            self.privacy.blocked_users()
        };

        let request = SearchRequest {
            keyword: stored.query.keyword.clone(),
            page,
            page_size: PAGE_SIZE,
            exact_match: stored.query.exact,
            chat_type: stored.query.chat_type.map(|t| t.as_str().to_string()),
            username: stored.query.user.clone(),
            chat_id: match &scope {
                SearchScope::Chat(id) => Some(*id),
                _ => None,
            },
            blocked_users: if blocked_users.is_empty() {
                None
            } else {
                Some(blocked_users)
            },
            include_deleted: false,
        };

        debug!(keyword = %request.keyword, page, ?scope, "issuing search");
        let mut response = self.search.search(&request).await?;

        // Defense in depth: the engine already received blocked_users, but
        // the response is filtered again locally.
        if !owner_private {
            self.privacy.filter_results(&mut response);
        }

        // Regular users are contained to their allowed groups client-side.
        if let SearchScope::Groups(allowed) = &scope {
            apply_group_scope(&mut response, allowed);
        }

        let body = render_results(&response);
        let buttons = navigation_rows(page, response.total_pages);
        Ok((body, buttons, response))
    }

    fn log_query(
        &self,
        inv: &InvocationOwned,
        query: &ParsedQuery,
        response: &SearchResponse,
        page: u32,
        elapsed: Duration,
    ) {
        let Some(db) = &self.querylog else { return };
        let entry = QueryLogEntry {
            user_id: inv.sender_id,
            username: if inv.sender_username.is_empty() {
                None
            } else {
                Some(inv.sender_username.clone())
            },
            first_name: if inv.sender_first_name.is_empty() {
                None
            } else {
                Some(inv.sender_first_name.clone())
            },
            chat_id: inv.chat_id,
            chat_type: inv.chat_type.as_str().to_string(),
            query: query.keyword.clone(),
            search_type: query.chat_type.map(|t| t.as_str().to_string()),
            search_user: query.user.clone(),
            search_mode: if query.exact {
                Some("e".to_string())
            } else {
                None
            },
            results_count: response.total_hits as i64,
            page_number: page,
            processing_time_ms: elapsed.as_millis() as u64,
        };
        if let Err(e) = db.log_query(&entry) {
            warn!("failed to log query: {}", e);
        }
    }

    // ── Pagination callbacks ────────────────────────────────────────────

    async fn handle_update_callback(&self, query: CallbackQuery) -> Result<()> {
        let data = query.data();
        if data.is_empty() {
            return Ok(());
        }
        let data_str = String::from_utf8_lossy(data).to_string();

        let (chat_id, message_id) = match &query.raw {
            tl::enums::Update::BotCallbackQuery(update) => {
                let peer_id: PeerId = update.peer.clone().into();
                (peer_id.bot_api_dialog_id(), update.msg_id)
            }
            _ => {
                warn!("Callback query not from bot");
                return Ok(());
            }
        };
        debug!(chat_id, message_id, data = %data_str, "callback query");

        // Interaction cancels any pending deletion for this message.
        self.cancel_delete(chat_id, message_id);

        match self.handle_page_turn(chat_id, message_id, &data_str).await {
            Ok(()) => {
                if let Err(e) = query.answer().send().await {
                    warn!("Failed to answer callback query: {}", e);
                }
            }
            Err(e) => {
                // Degrade gracefully: surface the problem on the callback
                // itself instead of editing the message.
                warn!("Page turn failed: {}", e);
                let alert = match &e {
                    Error::UserInput(msg) => format!("❌ {}", msg),
                    _ => "❌ Could not load that page".to_string(),
                };
                if let Err(answer_err) = query.answer().alert(alert).send().await {
                    warn!("Failed to alert callback query: {}", answer_err);
                }
            }
        }
        Ok(())
    }

    async fn handle_page_turn(&self, chat_id: i64, message_id: i32, data: &str) -> Result<()> {
        let (direction, page_str) = data
            .split_once('|')
            .ok_or_else(|| Error::UserInput("Invalid callback data".to_string()))?;
        let page: u32 = page_str
            .parse()
            .map_err(|_| Error::UserInput("Invalid callback data".to_string()))?;
        let new_page = match direction {
            "n" => page + 1,
            "p" => page.saturating_sub(1).max(1),
            _ => return Err(Error::UserInput("Invalid callback data".to_string())),
        };

        let key = self.query_key(chat_id, message_id);
        let Some(stored) =
            JsonState::get::<StoredQuery>(self.storage.as_ref(), &key).await?
        else {
            debug!(chat_id, message_id, "no stored query for callback");
            return Ok(());
        };

        info!(
            keyword = %stored.query.keyword,
            new_page,
            "query turned to new page"
        );
        let (body, buttons, _response) = self.run_search(&stored, new_page).await?;
        self.edit_message(chat_id, message_id, &body, buttons).await?;

        // A fresh timer replaces the cancelled one in groups.
        if stored.chat_type.is_group_like() {
            self.schedule_delete(chat_id, message_id);
        }
        Ok(())
    }

    fn query_key(&self, chat_id: i64, message_id: i32) -> String {
        format!("{}:query:{}:{}", self.id, chat_id, message_id)
    }

    // ── Auto-delete of paginated group responses ────────────────────────

    /// Arm (or re-arm) the deletion timer for a message. Rescheduling under
    /// the same key cancels any prior task.
    fn schedule_delete(&self, chat_id: i64, message_id: i32) {
        self.cancel_delete(chat_id, message_id);

        let client = self.client.clone();
        let tasks = Arc::clone(&self.delete_tasks);
        let storage = Arc::clone(&self.storage);
        let key = (chat_id, message_id);
        let state_key = self.query_key(chat_id, message_id);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(AUTO_DELETE_SECS)).await;
            if let Ok(client) = client.get() {
                let peer = BotFrontend::chat_id_to_input_peer(chat_id);
                if let Err(e) = client.delete_messages(peer, &[message_id]).await {
                    warn!(chat_id, message_id, "auto-delete failed: {}", e);
                } else {
                    debug!(chat_id, message_id, "auto-deleted paginated response");
                }
            }
            let _ = storage.remove(&state_key).await;
            tasks.remove(&key);
        })
        .abort_handle();

        self.delete_tasks.insert(key, handle);
    }

    fn cancel_delete(&self, chat_id: i64, message_id: i32) {
        if let Some((_, handle)) = self.delete_tasks.remove(&(chat_id, message_id)) {
            handle.abort();
        }
    }

    // ── Operator and privacy commands ───────────────────────────────────

    async fn handle_ping(&self, chat_id: i64) -> Result<()> {
        let ping = self.search.ping().await?;
        let reply = format!(
            "status: {}\nengine: {}\ntotal documents: {}",
            ping.status, ping.engine, ping.total_documents
        );
        self.send_message(chat_id, &reply, None).await?;
        Ok(())
    }

    async fn handle_dedup(&self, chat_id: i64) -> Result<()> {
        let progress_id = self
            .send_message(chat_id, "Deduplicating index, this may take a while...", None)
            .await?;
        let result = self.search.dedup().await?;
        let reply = format!(
            "Dedup finished: {} duplicates found, {} removed",
            result.duplicates_found, result.duplicates_removed
        );
        self.edit_message(chat_id, progress_id, &reply, None).await?;
        Ok(())
    }

    async fn handle_delete_chat(&self, chat_id: i64, text: &str) -> Result<()> {
        let arg = remove_first_word(text).trim();
        let target: i64 = arg
            .parse()
            .map_err(|_| Error::UserInput("Usage: /delete_chat <chat_id>".to_string()))?;
        let deleted = self.search.delete_chat(target).await?;
        let reply = format!("Deleted {} messages from chat {}", deleted, target);
        self.send_message(chat_id, &reply, None).await?;
        Ok(())
    }

    async fn handle_block_me(&self, inv: &InvocationOwned) -> Result<()> {
        let newly = self.privacy.block_user(inv.sender_id)?;
        let reply = if newly {
            "Done. Your messages are now hidden from search results."
        } else {
            "You are already opted out of search results."
        };
        self.send_message(inv.chat_id, reply, None).await?;
        Ok(())
    }

    async fn handle_unblock_me(&self, inv: &InvocationOwned) -> Result<()> {
        let was_blocked = self.privacy.unblock_user(inv.sender_id)?;
        let reply = if was_blocked {
            "Done. Your messages are visible in search results again."
        } else {
            "You were not opted out."
        };
        self.send_message(inv.chat_id, reply, None).await?;
        Ok(())
    }

    async fn handle_mystats(&self, inv: &InvocationOwned, text: &str) -> Result<()> {
        if !inv.chat_type.is_group_like() {
            return Err(Error::UserInput(
                "/mystats works inside a group chat".to_string(),
            ));
        }

        let mut window = "30d".to_string();
        let mut include_mentions = false;
        for arg in text.split_whitespace().skip(1) {
            if arg.eq_ignore_ascii_case("at") || arg == "@" {
                include_mentions = true;
            } else {
                window = arg.to_string();
            }
        }
        let (from_ts, to_ts) = parse_time_window(&window)?;

        let stats = self
            .search
            .user_stats(&UserStatsRequest {
                group_id: inv.chat_id,
                user_id: inv.sender_id,
                from_timestamp: from_ts,
                to_timestamp: to_ts,
                include_mentions,
                include_deleted: false,
            })
            .await?;

        let mut reply = format!(
            "Your activity over {}:\n{} messages of {} in this group ({:.2}%)",
            window,
            stats.user_message_count,
            stats.group_message_total,
            stats.user_ratio * 100.0
        );
        if include_mentions {
            reply.push_str(&format!(
                "\nmentions sent: {}, mentions received: {}",
                stats.mentions_out.unwrap_or(0),
                stats.mentions_in.unwrap_or(0)
            ));
        }
        self.send_message(inv.chat_id, &reply, None).await?;
        Ok(())
    }

    // ── Sync control commands (forwarded to the ingestor) ───────────────

    async fn handle_sync(&self, inv: &InvocationOwned, text: &str) -> Result<()> {
        let arg = remove_first_word(text).trim();
        let target: i64 = arg
            .parse()
            .map_err(|_| Error::UserInput("Usage: /sync <chat_id>".to_string()))?;

        let response = self.sync.add_sync(target, Some(inv.sender_id)).await?;
        let reply = if response.success {
            format!("✅ {}", response.message)
        } else {
            format!("⚠️ {}", response.message)
        };
        self.send_message(inv.chat_id, &reply, None).await?;
        Ok(())
    }

    async fn handle_sync_status(&self, chat_id: i64, text: &str) -> Result<()> {
        let arg = remove_first_word(text).trim();
        let filter: Option<i64> = if arg.is_empty() { None } else { arg.parse().ok() };

        let status = self.sync.sync_status(filter).await?;
        if status.chats.is_empty() {
            self.send_message(chat_id, "Sync queue is empty", None).await?;
            return Ok(());
        }

        let mut lines = Vec::new();
        for progress in &status.chats {
            lines.push(format!(
                "{}: {} {}/{} ({:.1}%){}",
                progress.chat_id,
                progress.status.as_str(),
                progress.synced_count,
                progress.total_count,
                progress.progress_percent,
                progress
                    .last_error
                    .as_deref()
                    .map(|e| format!(" - {}", e))
                    .unwrap_or_default()
            ));
        }
        self.send_message(chat_id, &lines.join("\n"), None).await?;
        Ok(())
    }

    async fn handle_sync_pause_resume(&self, chat_id: i64, text: &str, pause: bool) -> Result<()> {
        let arg = remove_first_word(text).trim();
        let target: i64 = arg.parse().map_err(|_| {
            Error::UserInput(format!(
                "Usage: /sync_{} <chat_id>",
                if pause { "pause" } else { "resume" }
            ))
        })?;

        let response = if pause {
            self.sync.pause_sync(target).await?
        } else {
            self.sync.resume_sync(target).await?
        };
        let reply = if response.success {
            format!("✅ {}", response.message)
        } else {
            format!("⚠️ {}", response.message)
        };
        self.send_message(chat_id, &reply, None).await?;
        Ok(())
    }

    // ── Message sending helpers ─────────────────────────────────────────

    /// Bots can address peers with a zero access hash once the peer has
    /// interacted with them.
    fn chat_id_to_input_peer(chat_id: i64) -> tl::enums::InputPeer {
        use crate::utils::get_share_id;

        if chat_id > 0 {
            tl::enums::InputPeer::User(tl::types::InputPeerUser {
                user_id: chat_id,
                access_hash: 0,
            })
        } else {
            let channel_id = get_share_id(chat_id);
            tl::enums::InputPeer::Channel(tl::types::InputPeerChannel {
                channel_id,
                access_hash: 0,
            })
        }
    }

    fn build_reply_markup(rows: Vec<Vec<(String, String)>>) -> reply_markup::Inline {
        let rows: Vec<Vec<button::Inline>> = rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|(label, data)| button::inline(label, data.as_bytes()))
                    .collect()
            })
            .collect();
        reply_markup::inline(rows)
    }

    async fn send_message_with_client(
        client: &Client,
        chat_id: i64,
        text: &str,
        buttons: Option<Vec<Vec<(String, String)>>>,
    ) -> Result<i32> {
        let peer = Self::chat_id_to_input_peer(chat_id);
        let mut message = InputMessage::new().markdown(text);
        if let Some(rows) = buttons {
            let markup = Self::build_reply_markup(rows);
            message = message.reply_markup(&markup);
        }
        let sent = client
            .send_message(peer, message)
            .await
            .map_err(|e| Error::Telegram(format!("Failed to send message: {}", e)))?;
        Ok(sent.id())
    }

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        buttons: Option<Vec<Vec<(String, String)>>>,
    ) -> Result<i32> {
        let client = self.client.get()?;
        Self::send_message_with_client(client, chat_id, text, buttons).await
    }

    /// Plain-text send for out-of-band notifications (relay queue drain,
    /// startup messages).
    pub async fn send_plain(&self, chat_id: i64, text: &str) -> Result<i32> {
        self.send_message(chat_id, text, None).await
    }

    async fn edit_message_with_client(
        client: &Client,
        chat_id: i64,
        message_id: i32,
        text: &str,
        buttons: Option<Vec<Vec<(String, String)>>>,
    ) -> Result<()> {
        let peer = Self::chat_id_to_input_peer(chat_id);
        let mut message = InputMessage::new().markdown(text);
        if let Some(rows) = buttons {
            let markup = Self::build_reply_markup(rows);
            message = message.reply_markup(&markup);
        }
        client
            .edit_message(peer, message_id, message)
            .await
            .map_err(|e| Error::Telegram(format!("Failed to edit message: {}", e)))?;
        Ok(())
    }

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i32,
        text: &str,
        buttons: Option<Vec<Vec<(String, String)>>>,
    ) -> Result<()> {
        let client = self.client.get()?;
        Self::edit_message_with_client(client, chat_id, message_id, text, buttons).await
    }

    async fn send_document_with_client(
        client: &Client,
        chat_id: i64,
        file_name: &str,
        data: Vec<u8>,
        caption: &str,
    ) -> Result<i32> {
        let peer = Self::chat_id_to_input_peer(chat_id);
        let size = data.len();
        let mut stream = std::io::Cursor::new(data);
        let uploaded = client
            .upload_stream(&mut stream, size, file_name.to_string())
            .await
            .map_err(|e| Error::Telegram(format!("Failed to upload file: {}", e)))?;

        let message = InputMessage::new().markdown(caption).file(uploaded);
        let sent = client
            .send_message(peer, message)
            .await
            .map_err(|e| Error::Telegram(format!("Failed to send document: {}", e)))?;
        Ok(sent.id())
    }
}

/// Owned invocation context (sender names cloned out of the update).
#[derive(Debug, Clone)]
struct InvocationOwned {
    chat_id: i64,
    chat_type: ChatType,
    sender_id: i64,
    sender_username: String,
    sender_first_name: String,
}

const HELP_TEXT: &str = "\
Search commands:
/search <keyword> - search indexed messages
\"quoted text\" or -m=e - exact match
-t=<TYPE> - filter by chat type (BOT, CHANNEL, GROUP, PRIVATE, SUPERGROUP)
-u=<user> - filter by sender
/<type> [user] <keyword> - shortcut for the above
/mystats [window] [at] - your activity in this group

Privacy:
/block_me - hide your messages from search
/unblock_me - undo
/privacy_status - check your state";

/// Render a response page as markdown, one line per hit.
fn render_results(response: &SearchResponse) -> String {
    let mut lines = Vec::new();
    for hit in &response.hits {
        if let Some(line) = render_hit_line(hit) {
            lines.push(line);
        }
    }
    if lines.is_empty() {
        return "No results found".to_string();
    }
    format!("Total Hits: {}\n{}", response.total_hits, lines.join("\n"))
}

/// One result line:
/// `sender -> [chat](deep_link) on <date>: text [👀](message_link)`
fn render_hit_line(hit: &MessageDocument) -> Option<String> {
    let text = hit.display_text();
    if text.is_empty() {
        return None;
    }

    let sender = escape_markdown(&hit.from_user.display_name());
    let chat_name = escape_markdown(&hit.chat_name());
    let deep_link = chat_deep_link(&hit.chat.username, hit.from_user.id, hit.chat.id);
    let link = message_link(&hit.chat.username, hit.chat.id, hit.message_id);
    let date = format_display_time(hit.timestamp);

    Some(format!(
        "{} -> [{}]({}) on {}: {} [👀]({})",
        sender,
        chat_name,
        deep_link,
        date,
        escape_markdown(text),
        link
    ))
}

/// Client-side permission containment: every hit surviving this filter has
/// its chat id in the user's allowed set. Totals are recomputed; the
/// requested page is left as-is.
fn apply_group_scope(response: &mut SearchResponse, allowed: &std::collections::HashSet<i64>) {
    let before = response.hits.len() as u64;
    response.hits.retain(|hit| allowed.contains(&hit.chat.id));
    let removed = before - response.hits.len() as u64;
    if removed > 0 {
        response.total_hits = response.total_hits.saturating_sub(removed);
        let per_page = response.hits_per_page.max(1) as u64;
        response.total_pages = response.total_hits.div_ceil(per_page) as u32;
    }
}

/// Pagination keyboard per page position; `None` when a single page.
fn navigation_rows(page: u32, total_pages: u32) -> Option<Vec<Vec<(String, String)>>> {
    if total_pages <= 1 {
        return None;
    }
    let last_page = total_pages.min(MAX_PAGE);

    let mut row = Vec::new();
    if page > 1 {
        row.push(("Previous Page".to_string(), format!("p|{}", page)));
    }
    if page < last_page {
        row.push(("Next Page".to_string(), format!("n|{}", page)));
    }
    if row.is_empty() {
        return None;
    }
    Some(vec![row])
}
