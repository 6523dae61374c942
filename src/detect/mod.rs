mod backend;
mod backends;
mod gate;
mod result;

pub use backend::DetectorBackend;
pub use backends::{backend_from_config, StubBackend};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use gate::{InferenceGate, InferenceSettings, DEFAULT_CONFIDENCE_THRESHOLD};
pub use result::{suppress_overlaps, BoundingBox, Detection, ObjectClass};
