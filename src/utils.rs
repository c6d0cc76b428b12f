//! Utility functions for tg-archive

use crate::types::{Error, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, SecondsFormat, TimeZone, Utc};

/// Display offset for rendered timestamps (UTC+8).
const DISPLAY_OFFSET_SECS: i32 = 8 * 3600;

/// Escape characters that are significant in Telegram markdown.
pub fn escape_markdown(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for c in content.chars() {
        match c {
            '_' | '*' | '[' | ']' | '(' | ')' | '`' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push(' '),
            _ => out.push(c),
        }
    }
    out
}

/// Get a brief version of content for logging
pub fn brief_content(content: &str, trim_len: usize) -> String {
    if content.chars().count() < trim_len {
        content.to_string()
    } else {
        let head: String = content.chars().take(trim_len.saturating_sub(4)).collect();
        let tail: String = content
            .chars()
            .rev()
            .take(2)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("{}…{}", head, tail)
    }
}

/// Remove the first word from text (used for command parsing)
pub fn remove_first_word(text: &str) -> &str {
    match text.find(' ') {
        Some(pos) => &text[pos + 1..],
        None => "",
    }
}

/// Get normalized share ID from Telegram chat ID
///
/// Telegram uses different ID formats for different chat types.
/// This function normalizes them to the share ID format used in URLs:
/// channels/megagroups carry a -100 prefix on the bot-api dialog id.
pub fn get_share_id(chat_id: i64) -> i64 {
    if chat_id < 0 {
        let abs_id = chat_id.abs();
        if abs_id > 1_000_000_000_000 {
            abs_id - 1_000_000_000_000
        } else {
            abs_id
        }
    } else {
        chat_id
    }
}

/// Format a Unix timestamp as RFC3339 in the display timezone (UTC+8).
pub fn format_display_time(timestamp: i64) -> String {
    let offset = FixedOffset::east_opt(DISPLAY_OFFSET_SECS).unwrap();
    let utc = DateTime::<Utc>::from_timestamp(timestamp, 0).unwrap_or_else(Utc::now);
    utc.with_timezone(&offset)
        .to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Deep link to a chat: prefer the public username, fall back to the sender
/// id, last resort a private-post link built from the normalized chat id.
pub fn chat_deep_link(chat_username: &str, sender_id: i64, chat_id: i64) -> String {
    if !chat_username.is_empty() {
        format!("tg://resolve?domain={}", chat_username)
    } else if sender_id != 0 {
        format!("tg://user?id={}", sender_id)
    } else {
        format!("https://t.me/c/{}/1", get_share_id(chat_id))
    }
}

/// Link to a specific message, public when the chat has a username.
pub fn message_link(chat_username: &str, chat_id: i64, message_id: i32) -> String {
    if !chat_username.is_empty() {
        format!("https://t.me/{}/{}", chat_username, message_id)
    } else {
        format!("https://t.me/c/{}/{}", get_share_id(chat_id), message_id)
    }
}

/// Parse a stats time window into `(from_timestamp, to_timestamp)`.
///
/// Accepts relative windows (`7d`, `30d`, `1y`) and absolute ranges
/// (`2025-01-01..2025-12-31`, end clamped to 23:59:59).
pub fn parse_time_window(window: &str) -> Result<(i64, i64)> {
    let window = window.trim();

    if let Some((from_s, to_s)) = window.split_once("..") {
        let from = parse_date(from_s.trim())?;
        let to = parse_date(to_s.trim())?;
        let from_ts = from.and_hms_opt(0, 0, 0).unwrap();
        let to_ts = to.and_hms_opt(23, 59, 59).unwrap();
        if from_ts > to_ts {
            return Err(Error::UserInput("Start date must be before end date".into()));
        }
        return Ok((
            Utc.from_utc_datetime(&from_ts).timestamp(),
            Utc.from_utc_datetime(&to_ts).timestamp(),
        ));
    }

    let lower = window.to_lowercase();
    let (amount_s, unit) = lower.split_at(lower.len().saturating_sub(1));
    let amount: i64 = amount_s.parse().map_err(|_| invalid_window())?;
    let days = match unit {
        "d" => amount,
        "y" => amount * 365,
        _ => return Err(invalid_window()),
    };
    let now = Utc::now().timestamp();
    Ok((now - days * 86_400, now))
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| Error::UserInput("Invalid date format. Use: YYYY-MM-DD".into()))
}

fn invalid_window() -> Error {
    Error::UserInput("Invalid time window format. Use: 7d, 30d, 1y, or 2025-01-01..2025-12-31".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_markdown() {
        assert_eq!(escape_markdown("a_b*c"), "a\\_b\\*c");
        assert_eq!(escape_markdown("[x](y)"), "\\[x\\]\\(y\\)");
        assert_eq!(escape_markdown("line1\nline2"), "line1 line2");
    }

    #[test]
    fn test_brief_content() {
        let long_text = "a".repeat(100);
        let brief = brief_content(&long_text, 20);
        assert!(brief.contains('…'));
        assert!(brief.chars().count() <= 20);
    }

    #[test]
    fn test_remove_first_word() {
        assert_eq!(remove_first_word("/command arg1 arg2"), "arg1 arg2");
        assert_eq!(remove_first_word("/command"), "");
        assert_eq!(remove_first_word("single"), "");
    }

    #[test]
    fn test_get_share_id() {
        // Channel/megagroup ID
        assert_eq!(get_share_id(-1001234567890), 1234567890);

        // Regular negative chat ID
        assert_eq!(get_share_id(-123456), 123456);

        // Positive ID
        assert_eq!(get_share_id(123456), 123456);
    }

    #[test]
    fn test_format_display_time_is_utc8() {
        // 2021-01-01T00:00:00Z == 2021-01-01T08:00:00+08:00
        assert_eq!(format_display_time(1609459200), "2021-01-01T08:00:00+08:00");
    }

    #[test]
    fn test_chat_deep_link_preference() {
        assert_eq!(chat_deep_link("tuna", 1, -100123), "tg://resolve?domain=tuna");
        assert_eq!(chat_deep_link("", 42, -100123), "tg://user?id=42");
        assert_eq!(
            chat_deep_link("", 0, -1001234567890),
            "https://t.me/c/1234567890/1"
        );
    }

    #[test]
    fn test_message_link() {
        assert_eq!(message_link("tuna", -100123, 7), "https://t.me/tuna/7");
        assert_eq!(
            message_link("", -1001234567890, 7),
            "https://t.me/c/1234567890/7"
        );
    }

    #[test]
    fn test_parse_time_window_relative() {
        let (from, to) = parse_time_window("7d").unwrap();
        assert_eq!(to - from, 7 * 86_400);

        let (from, to) = parse_time_window("1y").unwrap();
        assert_eq!(to - from, 365 * 86_400);
    }

    #[test]
    fn test_parse_time_window_range() {
        let (from, to) = parse_time_window("2025-01-01..2025-01-31").unwrap();
        assert!(to > from);
        // End of day clamp: range covers 30 days plus 23:59:59
        assert_eq!(to - from, 30 * 86_400 + 86_399);
    }

    #[test]
    fn test_parse_time_window_rejects_garbage() {
        assert!(parse_time_window("tomorrow").is_err());
        assert!(parse_time_window("2025-13-01..2025-01-02").is_err());
        assert!(parse_time_window("2025-02-02..2025-01-02").is_err());
    }
}
