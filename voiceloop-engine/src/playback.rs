use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;

/// Unbounded FIFO of assistant audio waiting to be played.
///
/// Producers never block; `clear` drops everything not yet handed out
/// (barge-in).
#[derive(Default)]
pub struct PlaybackQueue {
    frames: Mutex<VecDeque<Vec<u8>>>,
    ready: Notify,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, pcm_s16le: Vec<u8>) {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(pcm_s16le);
        self.ready.notify_one();
    }

    /// Returns how many frames were discarded.
    pub fn clear(&self) -> usize {
        let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        let n = frames.len();
        frames.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn try_pop(&self) -> Option<Vec<u8>> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Waits for the next frame.
    pub async fn pop(&self) -> Vec<u8> {
        loop {
            if let Some(frame) = self.try_pop() {
                return frame;
            }
            // `notify_one` stores a permit, so a push between the check and
            // this await is not lost.
            self.ready.notified().await;
        }
    }
}
