use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use anyhow::Context;
use voiceloop_engine::traits::FrameSource;

/// Longest edge of a captured frame after downscaling.
pub const MAX_FRAME_EDGE: u32 = 1024;

/// Camera frames from a JPEG that an external grabber keeps overwriting.
///
/// The file is re-read only when its modification time changes. A missing
/// file means the camera has not produced anything yet.
pub struct SnapshotFile {
    path: PathBuf,
    seen: Mutex<Option<SystemTime>>,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            seen: Mutex::new(None),
        }
    }
}

impl FrameSource for SnapshotFile {
    fn capture(&self) -> anyhow::Result<Option<Vec<u8>>> {
        let modified = match fs::metadata(&self.path) {
            Ok(meta) => meta.modified().ok(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("failed to stat {}", self.path.display())));
            }
        };

        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        if modified.is_some() && *seen == modified {
            return Ok(None);
        }
        let jpeg = fs::read(&self.path)
            .with_context(|| format!("failed to read snapshot: {}", self.path.display()))?;
        if jpeg.is_empty() {
            return Ok(None);
        }
        *seen = modified;
        Ok(Some(jpeg))
    }
}

/// Primary-display grabs, downscaled and JPEG-encoded.
#[cfg(feature = "screen")]
pub struct ScreenCapture {
    quality: u8,
}

#[cfg(feature = "screen")]
impl ScreenCapture {
    pub fn new() -> Self {
        Self { quality: 80 }
    }
}

#[cfg(feature = "screen")]
impl Default for ScreenCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "screen")]
impl FrameSource for ScreenCapture {
    fn capture(&self) -> anyhow::Result<Option<Vec<u8>>> {
        let screens = screenshots::Screen::all().context("failed to enumerate displays")?;
        let Some(screen) = screens
            .iter()
            .find(|s| s.display_info.is_primary)
            .or_else(|| screens.first())
        else {
            anyhow::bail!("no display to capture");
        };
        let rgba = screen.capture().context("screen capture failed")?;
        let frame = image::DynamicImage::ImageRgba8(rgba)
            .thumbnail(MAX_FRAME_EDGE, MAX_FRAME_EDGE)
            .to_rgb8();

        let mut jpeg = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(frame)
            .write_to(&mut jpeg, image::ImageOutputFormat::Jpeg(self.quality))
            .context("failed to encode screen frame")?;
        Ok(Some(jpeg.into_inner()))
    }
}
