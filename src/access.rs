//! Access control for the query frontend
//!
//! Built once from config at startup and never mutated. Three privilege
//! tiers: the owner (full scope, operator commands), admins (full search
//! scope), and allowed users (scope limited to their configured groups).

use crate::config::BotConfig;
use crate::document::ChatType;
use crate::types::{Error, Result};
use std::collections::{HashMap, HashSet};
use tracing::info;

/// Bot access modes; the configured value is a set drawn from these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Private,
    Group,
    Public,
}

impl AccessMode {
    fn parse(s: &str) -> Option<AccessMode> {
        match s {
            "private" => Some(AccessMode::Private),
            "group" => Some(AccessMode::Group),
            "public" => Some(AccessMode::Public),
            _ => None,
        }
    }
}

/// Why a message was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    Owner,
    Public,
    AllowedUser,
    AllowedGroup,
}

/// Chat scope attached to a search on behalf of a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchScope {
    /// Group invocations are always scoped to the invoking chat.
    Chat(i64),
    /// Owner and admins search everything.
    Unrestricted,
    /// Regular users get a client-side post-filter over these chat ids.
    Groups(HashSet<i64>),
}

pub struct AccessController {
    modes: HashSet<AccessMode>,
    owner_id: i64,
    admins: HashSet<i64>,
    allowed_groups: HashSet<i64>,
    allowed_users: HashSet<i64>,
    user_group_permissions: HashMap<i64, HashSet<i64>>,
}

impl AccessController {
    pub fn from_config(bot: &BotConfig, owner_id: i64) -> Result<Self> {
        let mut modes = HashSet::new();
        for raw in bot.mode.values() {
            let mode = AccessMode::parse(&raw)
                .ok_or_else(|| Error::Config(format!("unknown bot.mode value: {}", raw)))?;
            modes.insert(mode);
        }
        if modes.is_empty() {
            modes.insert(AccessMode::Private);
        }

        let mut allowed_users: HashSet<i64> = bot.allowed_users.iter().copied().collect();
        allowed_users.insert(owner_id);

        let user_group_permissions = bot
            .user_group_permissions
            .iter()
            .filter_map(|(k, v)| {
                k.parse::<i64>()
                    .ok()
                    .map(|uid| (uid, v.iter().copied().collect()))
            })
            .collect();

        info!(owner_id, ?modes, "access control initialized");

        Ok(Self {
            modes,
            owner_id,
            admins: bot.admins.iter().copied().collect(),
            allowed_groups: bot.allowed_groups.iter().copied().collect(),
            allowed_users,
            user_group_permissions,
        })
    }

    pub fn is_owner(&self, user_id: i64) -> bool {
        user_id == self.owner_id
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        user_id == self.owner_id || self.admins.contains(&user_id)
    }

    pub fn is_allowed_user(&self, user_id: i64) -> bool {
        self.allowed_users.contains(&user_id)
    }

    pub fn is_allowed_group(&self, chat_id: i64) -> bool {
        self.allowed_groups.contains(&chat_id)
    }

    /// Check whether a message may be served. `Err` carries the
    /// user-visible denial reason.
    pub fn check(
        &self,
        user_id: i64,
        chat_id: i64,
        chat_type: ChatType,
    ) -> std::result::Result<Grant, String> {
        if self.is_owner(user_id) {
            return Ok(Grant::Owner);
        }
        if self.modes.contains(&AccessMode::Public) {
            return Ok(Grant::Public);
        }

        match chat_type {
            ChatType::Private | ChatType::Bot => {
                if !self.modes.contains(&AccessMode::Private)
                    && !self.modes.contains(&AccessMode::Group)
                {
                    return Err("Bot is not enabled for private messages.".to_string());
                }
                // Sole private mode means owner only; otherwise the
                // allowed-users whitelist applies.
                if self.modes.contains(&AccessMode::Private)
                    && self.modes.len() == 1
                    && !self.modes.contains(&AccessMode::Group)
                {
                    return Err("Bot is in private mode. Only owner can use it.".to_string());
                }
                if self.is_allowed_user(user_id) {
                    Ok(Grant::AllowedUser)
                } else {
                    Err("You are not authorized to use this bot in private messages.".to_string())
                }
            }
            ChatType::Group | ChatType::Supergroup => {
                if !self.modes.contains(&AccessMode::Group) {
                    return Err("This bot is not enabled for groups.".to_string());
                }
                if self.is_allowed_group(chat_id) {
                    Ok(Grant::AllowedGroup)
                } else {
                    Err("This bot is not enabled for this group.".to_string())
                }
            }
            ChatType::Channel => Err("Unknown chat type or not authorized.".to_string()),
        }
    }

    /// Search scope for an accepted invocation.
    ///
    /// Group invocations are pinned to that chat. Owner and admins search
    /// globally. Everyone else is limited to their configured group set; an
    /// empty set means effectively no access.
    pub fn search_scope(&self, user_id: i64, chat_id: i64, chat_type: ChatType) -> SearchScope {
        if chat_type.is_group_like() {
            return SearchScope::Chat(chat_id);
        }
        if self.is_admin(user_id) {
            return SearchScope::Unrestricted;
        }
        let groups = self
            .user_group_permissions
            .get(&user_id)
            .cloned()
            .unwrap_or_default();
        SearchScope::Groups(groups)
    }
}
