use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Result};

use super::backend::DetectorBackend;
use super::backends::CpuBackend;

/// Which inference backend a deployment asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// YOLOv8 ONNX through tract when available, cpu otherwise.
    Auto,
    Cpu,
    Tract,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "auto" => Ok(BackendKind::Auto),
            "cpu" => Ok(BackendKind::Cpu),
            "tract" => Ok(BackendKind::Tract),
            other => Err(anyhow!(
                "unknown detector backend '{}' (expected auto, cpu or tract)",
                other
            )),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Auto => "auto",
            BackendKind::Cpu => "cpu",
            BackendKind::Tract => "tract",
        })
    }
}

/// Initialization-time backend parameters.
#[derive(Clone, Debug)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub model_path: Option<PathBuf>,
    /// Square model input side in pixels.
    pub input_size: u32,
    /// IoU above which overlapping boxes of one class are suppressed.
    pub iou_threshold: f32,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            kind: BackendKind::Auto,
            model_path: None,
            input_size: 640,
            iou_threshold: 0.45,
        }
    }
}

/// Build the backend a deployment asked for, falling back to `cpu` when the model
/// backend cannot be used. The chosen backend is warmed up before it is returned.
///
/// Callers never see which execution path was picked beyond `DetectorBackend::name`.
pub fn select_backend(settings: &BackendSettings) -> Result<Box<dyn DetectorBackend>> {
    let mut backend: Box<dyn DetectorBackend> = match settings.kind {
        BackendKind::Cpu => Box::new(CpuBackend::new()),
        BackendKind::Auto | BackendKind::Tract => match load_model_backend(settings) {
            Ok(backend) => backend,
            Err(err) => {
                log::warn!("model backend unavailable ({}); falling back to cpu", err);
                Box::new(CpuBackend::new())
            }
        },
    };

    if let Err(err) = backend.warm_up() {
        log::warn!("{} backend warm-up failed: {}", backend.name(), err);
    }
    log::info!("detector backend: {}", backend.name());
    Ok(backend)
}

#[cfg(feature = "backend-tract")]
fn load_model_backend(settings: &BackendSettings) -> Result<Box<dyn DetectorBackend>> {
    let path = settings
        .model_path
        .as_ref()
        .ok_or_else(|| anyhow!("no model_path configured"))?;
    let backend = super::backends::TractBackend::new(
        path,
        settings.input_size,
        settings.iou_threshold,
    )?;
    Ok(Box::new(backend))
}

#[cfg(not(feature = "backend-tract"))]
fn load_model_backend(_settings: &BackendSettings) -> Result<Box<dyn DetectorBackend>> {
    Err(anyhow!("built without the backend-tract feature"))
}
