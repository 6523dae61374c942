use std::sync::atomic::{AtomicU64, Ordering};

use crate::alert::video::MediaArtifact;
use crate::error::DeliveryError;
use crate::store::Subscriber;

/// Outbound notification channel.
///
/// Calls are made one at a time by the dispatcher (and by the bot for
/// command replies); implementations still need to be shareable across
/// threads.
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    fn send_text(&self, subscriber: &Subscriber, text: &str) -> Result<(), DeliveryError>;

    fn send_photo(
        &self,
        subscriber: &Subscriber,
        jpeg: &[u8],
        caption: &str,
    ) -> Result<(), DeliveryError>;

    fn send_video(
        &self,
        subscriber: &Subscriber,
        video: &MediaArtifact,
        caption: &str,
    ) -> Result<(), DeliveryError>;
}

/// Notifier that only logs. Used for dry runs and when no bot token is set.
#[derive(Debug, Default)]
pub struct LogNotifier {
    sent: AtomicU64,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    fn send_text(&self, subscriber: &Subscriber, text: &str) -> Result<(), DeliveryError> {
        log::info!("[notify] text to {}: {}", subscriber, text);
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn send_photo(
        &self,
        subscriber: &Subscriber,
        jpeg: &[u8],
        caption: &str,
    ) -> Result<(), DeliveryError> {
        log::info!(
            "[notify] photo to {} ({} bytes): {}",
            subscriber,
            jpeg.len(),
            caption
        );
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn send_video(
        &self,
        subscriber: &Subscriber,
        video: &MediaArtifact,
        caption: &str,
    ) -> Result<(), DeliveryError> {
        log::info!(
            "[notify] video to {} ({}): {}",
            subscriber,
            video.path().display(),
            caption
        );
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
