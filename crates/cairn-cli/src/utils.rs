//! Shared utilities

use cairn_agent::{UiMessage, message::UiKind};

/// Truncate a string to `max` characters, appending "..." if truncated.
/// Operates on Unicode char boundaries, not bytes.
pub fn truncate_chars(s: &str, max: usize) -> String {
    let mut chars = s.chars();
    let truncated: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}

/// Millisecond epoch timestamp as local-independent UTC text
pub fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// `say:text` / `ask:tool` style label for a UI message
pub fn kind_label(message: &UiMessage) -> String {
    let (prefix, kind) = match message.kind {
        UiKind::Say { say } => ("say", serde_json::to_value(say)),
        UiKind::Ask { ask } => ("ask", serde_json::to_value(ask)),
    };
    let name = kind
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    format!("{}:{}", prefix, name)
}

/// One-line preview of a message body
pub fn preview(text: Option<&str>, max: usize) -> String {
    truncate_chars(text.unwrap_or_default(), max).replace('\n', " ")
}
