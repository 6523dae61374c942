pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

use anyhow::Result;

use crate::config::{BackendKind, ModelSettings};
use crate::detect::backend::DetectorBackend;

pub use stub::StubBackend;

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;

/// Build the configured detector backend.
pub fn backend_from_config(settings: &ModelSettings) -> Result<Box<dyn DetectorBackend>> {
    match settings.backend {
        BackendKind::Stub => Ok(Box::new(StubBackend::new())),
        #[cfg(feature = "backend-tract")]
        BackendKind::Tract => {
            let path = settings
                .path
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("model.path is required for the tract backend"))?;
            Ok(Box::new(TractBackend::new(
                path,
                settings.input_width,
                settings.input_height,
            )?))
        }
        #[cfg(not(feature = "backend-tract"))]
        BackendKind::Tract => anyhow::bail!("the tract backend requires the backend-tract feature"),
    }
}
