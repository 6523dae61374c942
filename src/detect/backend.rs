use anyhow::Result;
use image::RgbImage;

use crate::detect::result::Detection;

/// Detector backend trait.
///
/// Backends are not assumed to be thread-safe; the pipeline only ever calls
/// one through the `InferenceGate`, which hands out exclusive access.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame at the working resolution.
    ///
    /// Returned boxes are in the pixel coordinates of `image`.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, run once before the first camera starts.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
