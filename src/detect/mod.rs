mod backend;
mod backends;
mod engine;
mod postprocess;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::{CpuBackend, StubBackend};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use engine::{DetectionEngine, DEFAULT_MAX_DETECTIONS};
pub use postprocess::{decode_yolov8, letterbox_ratio, non_max_suppression};
pub use registry::{select_backend, BackendKind, BackendSettings};
pub use result::{BoundingBox, Detection, ObjectClass};
