//! Search command parsing
//!
//! Turns raw command text into a typed query. Recognized forms (parsing is
//! positional and case-insensitive for flags and chat types):
//!
//! - free text: fuzzy global search
//! - `"quoted text"` or `-m=e <kw>`: exact match
//! - `-t=<CHATTYPE> <kw>`: chat-type filter
//! - `-u=<user> <kw>`: sender filter
//! - `/search <kw>`: explicit command form (required in groups)
//! - `/<chattype> [user] <kw>`: shortcut, rewritten to flags

use crate::document::ChatType;
use crate::types::{Error, Result};
use serde::{Deserialize, Serialize};

/// Hard ceiling on the requested page.
pub const MAX_PAGE: u32 = 100;

/// Fixed page size of the search pipeline.
pub const PAGE_SIZE: u32 = 10;

/// A parsed search query, independent of where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedQuery {
    pub keyword: String,
    pub chat_type: Option<ChatType>,
    pub user: Option<String>,
    pub exact: bool,
}

/// Reject pages outside `1..=MAX_PAGE` with a user-visible error.
pub fn validate_page(page: u32) -> Result<()> {
    if page < 1 || page > MAX_PAGE {
        return Err(Error::UserInput(format!(
            "Page must be between 1 and {}",
            MAX_PAGE
        )));
    }
    Ok(())
}

/// Parse command text into a query.
///
/// The leading `/search` is stripped when present; `/<chattype>` shortcuts
/// must be rewritten by the caller (see [`rewrite_chat_type_shortcut`]).
pub fn parse_query(text: &str) -> Result<ParsedQuery> {
    let mut remainder = text.trim();
    if let Some(rest) = remainder.strip_prefix("/search") {
        remainder = rest.trim_start();
    }
    if remainder.is_empty() {
        return Err(Error::UserInput("Keyword cannot be empty".to_string()));
    }

    // A fully quoted phrase is an exact-match search for the inner text.
    let mut exact = false;
    let flagless = strip_flags_prefix(remainder);
    if flagless.len() >= 2 && flagless.starts_with('"') && flagless.ends_with('"') {
        exact = true;
    }

    let tokens = shell_words::split(remainder)
        .map_err(|e| Error::UserInput(format!("Cannot parse command: {}", e)))?;

    let mut chat_type = None;
    let mut user = None;
    let mut keyword_parts: Vec<String> = Vec::new();

    for token in tokens {
        if let Some(value) = flag_value(&token, "-t") {
            let parsed = ChatType::parse(value).ok_or_else(|| {
                Error::UserInput(format!(
                    "Unknown chat type: {} (expected BOT, CHANNEL, GROUP, PRIVATE or SUPERGROUP)",
                    value
                ))
            })?;
            chat_type = Some(parsed);
        } else if let Some(value) = flag_value(&token, "-u") {
            if value.is_empty() {
                return Err(Error::UserInput("User filter cannot be empty".to_string()));
            }
            user = Some(value.trim_start_matches('@').to_string());
        } else if let Some(value) = flag_value(&token, "-m") {
            exact = exact || value.eq_ignore_ascii_case("e");
        } else {
            keyword_parts.push(token);
        }
    }

    let keyword = keyword_parts.join(" ");
    if keyword.is_empty() {
        return Err(Error::UserInput("Keyword cannot be empty".to_string()));
    }

    Ok(ParsedQuery {
        keyword,
        chat_type,
        user,
        exact,
    })
}

/// Rewrite `/<chattype> [user] <kw>` into flag form.
///
/// Returns `None` when the command is not a chat-type shortcut, and a
/// user-visible usage error when the shortcut has no keyword.
pub fn rewrite_chat_type_shortcut(text: &str) -> Result<Option<String>> {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix('/') else {
        return Ok(None);
    };

    let mut parts = rest.splitn(3, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let Some(chat_type) = ChatType::parse(command) else {
        return Ok(None);
    };

    let second = parts.next().map(str::trim).unwrap_or_default();
    let third = parts.next().map(str::trim).unwrap_or_default();

    if second.is_empty() {
        return Err(Error::UserInput(format!(
            "/{} [user] keyword",
            command.to_lowercase()
        )));
    }

    let rewritten = if third.is_empty() {
        format!("-t={} {}", chat_type.as_str(), second)
    } else {
        format!("-t={} -u={} {}", chat_type.as_str(), second, third)
    };
    Ok(Some(rewritten))
}

/// Flag values accept `-t=x`, case-insensitive on the flag name.
fn flag_value<'a>(token: &'a str, flag: &str) -> Option<&'a str> {
    let (head, value) = token.split_once('=')?;
    if head.eq_ignore_ascii_case(flag) {
        Some(value)
    } else {
        None
    }
}

/// Skip past leading `-x=value` flags to find the keyword portion.
fn strip_flags_prefix(text: &str) -> &str {
    let mut rest = text;
    loop {
        let trimmed = rest.trim_start();
        if trimmed.starts_with('-')
            && let Some(end) = trimmed.find(char::is_whitespace)
        {
            if trimmed[..end].contains('=') {
                rest = &trimmed[end..];
                continue;
            }
        }
        return trimmed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_text_is_fuzzy() {
        let q = parse_query("hello world").unwrap();
        assert_eq!(q.keyword, "hello world");
        assert!(!q.exact);
        assert!(q.chat_type.is_none());
        assert!(q.user.is_none());
    }

    #[test]
    fn test_search_command_form() {
        let q = parse_query("/search hello world").unwrap();
        assert_eq!(q.keyword, "hello world");
    }

    #[test]
    fn test_quoted_text_is_exact() {
        let q = parse_query("\"hello world\"").unwrap();
        assert_eq!(q.keyword, "hello world");
        assert!(q.exact);
    }

    #[test]
    fn test_mode_flag_is_exact() {
        let q = parse_query("-m=e hello").unwrap();
        assert_eq!(q.keyword, "hello");
        assert!(q.exact);

        let q = parse_query("-m=f hello").unwrap();
        assert!(!q.exact);
    }

    #[test]
    fn test_chat_type_flag() {
        let q = parse_query("-t=supergroup rust").unwrap();
        assert_eq!(q.chat_type, Some(ChatType::Supergroup));
        assert_eq!(q.keyword, "rust");

        // Case-insensitive values.
        let q = parse_query("-T=BOT rust").unwrap();
        assert_eq!(q.chat_type, Some(ChatType::Bot));
    }

    #[test]
    fn test_user_flag() {
        let q = parse_query("-u=@alice rust").unwrap();
        assert_eq!(q.user.as_deref(), Some("alice"));

        let q = parse_query("-u=12345 rust").unwrap();
        assert_eq!(q.user.as_deref(), Some("12345"));
    }

    #[test]
    fn test_combined_flags() {
        let q = parse_query("-t=group -u=alice -m=e release notes").unwrap();
        assert_eq!(q.chat_type, Some(ChatType::Group));
        assert_eq!(q.user.as_deref(), Some("alice"));
        assert!(q.exact);
        assert_eq!(q.keyword, "release notes");
    }

    #[test]
    fn test_quoted_after_flags_is_exact() {
        let q = parse_query("-t=group \"release notes\"").unwrap();
        assert!(q.exact);
        assert_eq!(q.keyword, "release notes");
    }

    #[test]
    fn test_unknown_chat_type_rejected() {
        let err = parse_query("-t=blog rust").unwrap_err();
        assert!(err.to_string().contains("Unknown chat type"));
    }

    #[test]
    fn test_empty_keyword_rejected() {
        assert!(parse_query("").is_err());
        assert!(parse_query("/search").is_err());
        assert!(parse_query("-t=group").is_err());
    }

    #[test]
    fn test_page_bounds() {
        assert!(validate_page(0).is_err());
        assert!(validate_page(1).is_ok());
        assert!(validate_page(MAX_PAGE).is_ok());
        assert!(validate_page(MAX_PAGE + 1).is_err());
    }

    #[test]
    fn test_shortcut_rewrite_keyword_only() {
        let rewritten = rewrite_chat_type_shortcut("/supergroup rust").unwrap().unwrap();
        assert_eq!(rewritten, "-t=SUPERGROUP rust");
        let q = parse_query(&rewritten).unwrap();
        assert_eq!(q.chat_type, Some(ChatType::Supergroup));
        assert_eq!(q.keyword, "rust");
    }

    #[test]
    fn test_shortcut_rewrite_with_user() {
        let rewritten = rewrite_chat_type_shortcut("/channel alice rust news")
            .unwrap()
            .unwrap();
        assert_eq!(rewritten, "-t=CHANNEL -u=alice rust news");
        let q = parse_query(&rewritten).unwrap();
        assert_eq!(q.user.as_deref(), Some("alice"));
        assert_eq!(q.keyword, "rust news");
    }

    #[test]
    fn test_shortcut_usage_error_without_keyword() {
        let err = rewrite_chat_type_shortcut("/group").unwrap_err();
        assert!(err.to_string().contains("/group"));
    }

    #[test]
    fn test_non_shortcut_commands_pass_through() {
        assert!(rewrite_chat_type_shortcut("/search rust").unwrap().is_none());
        assert!(rewrite_chat_type_shortcut("plain text").unwrap().is_none());
        assert!(rewrite_chat_type_shortcut("/stats").unwrap().is_none());
    }
}
