use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use voiceloop_core::types::ImagePayload;

use crate::traits::FrameSource;

const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Grabs a frame every `interval` and overwrites the latest-frame slot.
///
/// Skips captures while paused. Returns on stop, or on the first capture
/// error (the source is then considered gone for this run).
pub async fn pump_frames(
    source: Arc<dyn FrameSource>,
    interval: Duration,
    paused: Arc<AtomicBool>,
    slot: &watch::Sender<Option<ImagePayload>>,
    stop: CancellationToken,
) {
    loop {
        if paused.load(Ordering::Relaxed) {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(PAUSE_POLL) => continue,
            }
        }

        let src = Arc::clone(&source);
        let captured = tokio::task::spawn_blocking(move || src.capture()).await;
        match captured {
            Ok(Ok(Some(jpeg))) => {
                slot.send_replace(Some(ImagePayload::jpeg(&jpeg)));
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => {
                log::warn!("frame capture stopped: {e:#}");
                return;
            }
            Err(e) => {
                log::warn!("frame capture task failed: {e}");
                return;
            }
        }

        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct Counter {
        calls: AtomicUsize,
        fail_after: Option<usize>,
    }

    impl FrameSource for Counter {
        fn capture(&self) -> anyhow::Result<Option<Vec<u8>>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_after.is_some_and(|max| n > max) {
                anyhow::bail!("camera unplugged");
            }
            Ok(Some(format!("frame-{n}").into_bytes()))
        }
    }

    fn counter(fail_after: Option<usize>) -> Arc<Counter> {
        Arc::new(Counter {
            calls: AtomicUsize::new(0),
            fail_after,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_only_the_latest_frame() {
        let source = counter(None);
        let (tx, rx) = watch::channel(None);
        let stop = CancellationToken::new();
        let task = tokio::spawn({
            let (source, stop) = (source.clone(), stop.clone());
            async move {
                let paused = Arc::new(AtomicBool::new(false));
                pump_frames(source, Duration::from_secs(1), paused, &tx, stop).await;
            }
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        stop.cancel();
        task.await.unwrap();

        let calls = source.calls.load(Ordering::SeqCst);
        assert!(calls >= 3, "only {calls} captures");
        let latest = rx.borrow().clone().unwrap();
        assert_eq!(latest, ImagePayload::jpeg(format!("frame-{calls}").as_bytes()));
    }

    #[tokio::test(start_paused = true)]
    async fn paused_capture_grabs_nothing() {
        let source = counter(None);
        let (tx, rx) = watch::channel(None);
        let stop = CancellationToken::new();
        let task = tokio::spawn({
            let (source, stop) = (source.clone(), stop.clone());
            async move {
                let paused = Arc::new(AtomicBool::new(true));
                pump_frames(source, Duration::from_secs(1), paused, &tx, stop).await;
            }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        stop.cancel();
        task.await.unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        assert!(rx.borrow().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn capture_error_ends_the_pump_and_keeps_the_last_frame() {
        let source = counter(Some(2));
        let (tx, rx) = watch::channel(None);

        pump_frames(
            source.clone(),
            Duration::from_secs(1),
            Arc::new(AtomicBool::new(false)),
            &tx,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(*rx.borrow(), Some(ImagePayload::jpeg(b"frame-2")));
    }
}
