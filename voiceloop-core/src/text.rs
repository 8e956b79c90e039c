use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

use crate::types::ChatEntry;

pub const DENIED_RESULT: &str = "User denied the request to use this tool.";
pub const SYSTEM_NOTIFICATION_PREFIX: &str = "System Notification: ";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProjectNameError {
    #[error("project name is empty")]
    Empty,
    #[error("project name contains only unsupported characters: {0}")]
    Unsupported(String),
}

fn unsafe_name_chars_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Keep names portable across filesystems.
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9 _.\-]").expect("valid project name regex"))
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s{2,}").expect("valid whitespace regex"))
}

pub fn system_notification(message: &str) -> String {
    format!("{SYSTEM_NOTIFICATION_PREFIX}{message}")
}

/// Builds the one-time notice sent to the backend right after a reconnect.
pub fn reconnect_context(history: &[ChatEntry]) -> String {
    let mut out = system_notification(
        "Connection was lost and just re-established. Here is the recent chat history to help you resume seamlessly:\n\n",
    );
    for entry in history {
        let sender = if entry.sender.trim().is_empty() {
            "Unknown"
        } else {
            entry.sender.as_str()
        };
        out.push_str(&format!("[{sender}]: {}\n", entry.text));
    }
    out.push_str(
        "\nPlease acknowledge the reconnection to the user (e.g. 'I lost connection for a moment, but I'm back...') and resume what you were doing.",
    );
    out
}

pub fn sanitize_project_name(raw: &str) -> Result<String, ProjectNameError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ProjectNameError::Empty);
    }

    let cleaned = unsafe_name_chars_re().replace_all(trimmed, "");
    let cleaned = whitespace_re().replace_all(&cleaned, " ");
    let cleaned = cleaned.trim().trim_matches('.').trim();
    if cleaned.is_empty() {
        return Err(ProjectNameError::Unsupported(trimmed.to_string()));
    }
    Ok(cleaned.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_context_lists_history_in_order() {
        let history = vec![
            ChatEntry::new("User", "make me a cube"),
            ChatEntry::new("Assistant", "Generating it now."),
            ChatEntry::new("", "orphan"),
        ];
        let msg = reconnect_context(&history);
        assert!(msg.starts_with("System Notification: Connection was lost"));
        let user = msg.find("[User]: make me a cube").unwrap();
        let asst = msg.find("[Assistant]: Generating it now.").unwrap();
        assert!(user < asst);
        assert!(msg.contains("[Unknown]: orphan"));
        assert!(msg.trim_end().ends_with("resume what you were doing."));
    }

    #[test]
    fn sanitizes_project_names() {
        assert_eq!(sanitize_project_name("  Desk  Lamp "), Ok("Desk Lamp".into()));
        assert_eq!(sanitize_project_name("../etc/passwd"), Ok("etcpasswd".into()));
        assert_eq!(sanitize_project_name("   "), Err(ProjectNameError::Empty));
        assert!(matches!(
            sanitize_project_name("///"),
            Err(ProjectNameError::Unsupported(_))
        ));
    }
}
