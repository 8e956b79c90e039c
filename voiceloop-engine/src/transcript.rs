use voiceloop_core::types::{ChatEntry, Speaker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Input,
    Output,
}

/// Turns cumulative transcript snapshots into appended deltas, per channel.
#[derive(Debug, Default)]
pub struct TranscriptTracker {
    last_input: String,
    last_output: String,
}

impl TranscriptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the text appended since the previous snapshot on `channel`.
    ///
    /// A snapshot that does not extend the previous one (a correction or a
    /// non-cumulative fragment) is returned whole. A repeated snapshot yields
    /// an empty delta.
    pub fn delta(&mut self, channel: Channel, snapshot: &str) -> String {
        let last = match channel {
            Channel::Input => &mut self.last_input,
            Channel::Output => &mut self.last_output,
        };

        if snapshot == last.as_str() {
            return String::new();
        }

        let delta = match snapshot.strip_prefix(last.as_str()) {
            Some(rest) => rest.to_string(),
            None => snapshot.to_string(),
        };
        *last = snapshot.to_string();
        delta
    }

    /// Called at turn boundaries.
    pub fn reset(&mut self) {
        self.last_input.clear();
        self.last_output.clear();
    }
}

/// Accumulates the text of whoever is currently speaking.
///
/// `sender` is set whenever `text` is non-empty.
#[derive(Debug, Default)]
pub struct ChatTurnBuffer {
    sender: Option<Speaker>,
    text: String,
}

impl ChatTurnBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `delta` for `speaker`. When the speaker changes, the previous
    /// turn is returned so the caller can persist it.
    pub fn push(&mut self, speaker: Speaker, delta: &str) -> Option<ChatEntry> {
        if self.sender == Some(speaker) {
            self.text.push_str(delta);
            return None;
        }

        let flushed = self.take();
        self.sender = Some(speaker);
        self.text = delta.to_string();
        flushed
    }

    /// Ends the current turn. Whitespace-only turns are dropped.
    pub fn take(&mut self) -> Option<ChatEntry> {
        let sender = self.sender.take()?;
        let text = std::mem::take(&mut self.text);
        if text.trim().is_empty() {
            return None;
        }
        Some(ChatEntry::new(sender.label(), text))
    }
}
