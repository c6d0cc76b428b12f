//! Live message ingestion
//!
//! The ingestor process attaches to the user-account session, projects
//! every incoming, outgoing and edited message into a document and hands it
//! to the buffered indexer. Deletions become soft-deletes in the engine.
//! The same client backs the sync manager's history source.

use crate::buffered::BufferedIndexer;
use crate::document::MessageDocument;
use crate::search_client::SearchHttpClient;
use crate::session::ClientSession;
use crate::sync::HistorySource;
use crate::types::{Error, Result};
use crate::utils::{brief_content, get_share_id};
use async_trait::async_trait;
use grammers_client::Client;
use grammers_client::client::UpdatesConfiguration;
use grammers_client::types::update::Message as UpdateMessage;
use grammers_client::types::update::{MessageDeletion, Update};
use grammers_mtsender::{InvocationError, SenderPool};
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, info, warn};

/// Translate an RPC failure into the domain error space. Rate limits carry
/// the server-requested wait; permission problems are permanent.
pub fn map_invocation_error(e: InvocationError) -> Error {
    if let InvocationError::Rpc(rpc) = &e {
        if rpc.name.starts_with("FLOOD_WAIT") {
            return Error::RateLimited {
                wait_seconds: rpc.value.unwrap_or(60) as u64,
            };
        }
        if rpc.name == "CHANNEL_PRIVATE" {
            return Error::PermissionDenied("Channel is private or not accessible".into());
        }
        if rpc.name == "CHAT_ADMIN_REQUIRED" {
            return Error::PermissionDenied("Admin rights required".into());
        }
    }
    Error::Telegram(e.to_string())
}

/// Live-event consumer feeding the buffered indexer.
pub struct IngestorBot {
    session: Arc<ClientSession>,
    client: OnceLock<Client>,
    indexer: BufferedIndexer,
    search: Arc<SearchHttpClient>,
    /// Chats never indexed (the paired bot's id belongs here).
    excluded_chats: HashSet<i64>,
}

impl IngestorBot {
    pub fn new(
        session: Arc<ClientSession>,
        indexer: BufferedIndexer,
        search: Arc<SearchHttpClient>,
        excluded_chats: HashSet<i64>,
    ) -> Self {
        Self {
            session,
            client: OnceLock::new(),
            indexer,
            search,
            excluded_chats: excluded_chats.into_iter().map(get_share_id).collect(),
        }
    }

    fn get_client(&self) -> Result<&Client> {
        self.client.get().ok_or_else(|| {
            Error::Config("Ingestor client not initialized. Make sure run() is called first.".into())
        })
    }

    fn should_index(&self, chat_id: i64) -> bool {
        !self.excluded_chats.contains(&get_share_id(chat_id))
    }

    /// Run the update loop. Sets up the sender pool, stores the client for
    /// the history source, and processes updates until the stream ends.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!("Starting ingestor event loop");

        let pool = self.session.create_pool();
        let client = Client::new(&pool);
        let SenderPool {
            runner, updates, ..
        } = pool;

        self.client
            .set(client.clone())
            .map_err(|_| Error::Config("Client already initialized".into()))?;

        tokio::spawn(runner.run());

        let mut updates = client.stream_updates(
            updates,
            UpdatesConfiguration {
                // Only index events from now on; history is the sync
                // manager's job.
                catch_up: false,
                ..Default::default()
            },
        );

        info!("Ingestor streaming updates, waiting for messages...");
        loop {
            match updates.next().await {
                Ok(update) => match update {
                    Update::NewMessage(message) => {
                        if let Err(e) = self.handle_message(&message).await {
                            error!("Error handling new message: {}", e);
                        }
                    }
                    Update::MessageEdited(message) => {
                        if let Err(e) = self.handle_message(&message).await {
                            error!("Error handling edited message: {}", e);
                        }
                    }
                    Update::MessageDeleted(deletion) => {
                        if let Err(e) = self.handle_deletion(&deletion).await {
                            error!("Error handling deleted message: {}", e);
                        }
                    }
                    _ => {
                        debug!("Ignoring other update type");
                    }
                },
                Err(e) => {
                    error!("Error getting update: {}", e);
                    break;
                }
            }
        }

        warn!("Ingestor event loop exited");
        Ok(())
    }

    /// New and edited messages share one path: project and upsert. Edits
    /// overwrite by composite id.
    async fn handle_message(&self, message: &UpdateMessage) -> Result<()> {
        let chat_id = message.peer_id().bot_api_dialog_id();
        if !self.should_index(chat_id) {
            return Ok(());
        }

        let chat_title = self.session.chat_name(chat_id);
        let doc = MessageDocument::from_update(message, chat_title.as_deref());
        if doc.display_text().is_empty() {
            return Ok(());
        }

        let brief = brief_content(doc.display_text(), 20);
        debug!(id = %doc.id, text = %brief, "indexing message");
        self.indexer.upsert(doc).await;
        Ok(())
    }

    /// Deletions arrive with a channel id only for channel chats; other
    /// deletions cannot be attributed to a chat and are skipped.
    async fn handle_deletion(&self, deletion: &MessageDeletion) -> Result<()> {
        if let Some(channel_id) = deletion.channel_id() {
            if !self.should_index(channel_id) {
                return Ok(());
            }
            let chat_id = channel_id;
            for &msg_id in deletion.messages() {
                if let Err(e) = self.search.soft_delete(chat_id, msg_id).await {
                    error!(chat_id, msg_id, "soft-delete failed: {}", e);
                }
            }
            info!(
                chat_id,
                count = deletion.messages().len(),
                "soft-deleted channel messages"
            );
        } else {
            warn!("Received deletion for non-channel chat, cannot attribute");
        }
        Ok(())
    }

    /// Resolve a peer by bot-api dialog id through the dialog list.
    async fn find_peer(&self, chat_id: i64) -> Result<grammers_client::types::Peer> {
        let client = self.get_client()?;
        let share_id = get_share_id(chat_id);
        let mut dialogs = client.iter_dialogs();

        while let Some(dialog) = dialogs.next().await.map_err(map_invocation_error)? {
            let peer = dialog.peer();
            if get_share_id(peer.id().bot_api_dialog_id()) == share_id {
                return Ok(peer.clone());
            }
        }

        Err(Error::EntityNotFound(format!(
            "Chat {} not found in dialogs. Make sure the account has access to it.",
            chat_id
        )))
    }
}

/// History source over the live user-account client.
pub struct TelegramHistorySource {
    ingestor: Arc<IngestorBot>,
}

impl TelegramHistorySource {
    pub fn new(ingestor: Arc<IngestorBot>) -> Self {
        Self { ingestor }
    }
}

#[async_trait]
impl HistorySource for TelegramHistorySource {
    async fn message_count(&self, chat_id: i64) -> Result<u64> {
        let peer = self.ingestor.find_peer(chat_id).await?;
        let client = self.ingestor.get_client()?;
        let total = client
            .iter_messages(&peer)
            .total()
            .await
            .map_err(map_invocation_error)?;
        Ok(total as u64)
    }

    async fn fetch_older(
        &self,
        chat_id: i64,
        offset_id: i32,
        limit: usize,
    ) -> Result<Vec<MessageDocument>> {
        let peer = self.ingestor.find_peer(chat_id).await?;
        let client = self.ingestor.get_client()?;
        let chat_title = self.ingestor.session.chat_name(chat_id);

        let mut iter = client.iter_messages(&peer).offset_id(offset_id);
        let mut page = Vec::with_capacity(limit);

        while page.len() < limit {
            let Some(message) = iter.next().await.map_err(map_invocation_error)? else {
                break;
            };
            page.push(MessageDocument::from_update(&message, chat_title.as_deref()));
        }

        debug!(
            chat_id,
            offset_id,
            fetched = page.len(),
            "history page fetched"
        );
        Ok(page)
    }
}
