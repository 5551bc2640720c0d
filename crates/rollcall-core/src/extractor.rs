//! Face embedding extraction via ONNX Runtime.
//!
//! Resizes a captured RGB frame to 256x256 (nearest neighbour), normalizes it
//! according to the configured convention and runs the model's forward pass.
//! The flattened output tensor is the embedding.

use crate::types::Embedding;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::OnceCell;

// --- Named constants ---
pub const INPUT_SIZE: usize = 256;
const INPUT_CHANNELS: usize = 3;
const SYMMETRIC_SCALE: f32 = 127.5;
const UNIT_SCALE: f32 = 255.0;
const DEFAULT_INTRA_THREADS: usize = 2;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("no embedding model could be loaded ({0})")]
    ModelUnavailable(String),
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("model produced no usable output, no face detected")]
    NoFaceDetected,
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Pixel normalization applied before inference. Must match the convention
/// the deployed model was trained with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    /// `p / 127.5 - 1.0`, mapping [0, 255] to [-1, 1].
    #[default]
    Symmetric,
    /// `p / 255.0`, mapping [0, 255] to [0, 1].
    Unit,
}

impl Normalization {
    pub fn apply(self, pixel: f32) -> f32 {
        match self {
            Normalization::Symmetric => pixel / SYMMETRIC_SCALE - 1.0,
            Normalization::Unit => pixel / UNIT_SCALE,
        }
    }
}

impl FromStr for Normalization {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "symmetric" => Ok(Normalization::Symmetric),
            "unit" => Ok(Normalization::Unit),
            other => Err(format!("unknown normalization mode: {other} (expected symmetric or unit)")),
        }
    }
}

/// Packaging of a model artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    /// Standard ONNX protobuf (`.onnx`).
    Onnx,
    /// ONNX Runtime's pre-optimized flatbuffer format (`.ort`).
    Ort,
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelFormat::Onnx => f.write_str("onnx"),
            ModelFormat::Ort => f.write_str("ort"),
        }
    }
}

/// One candidate location for the embedding model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSource {
    pub format: ModelFormat,
    pub path: PathBuf,
}

impl ModelSource {
    pub fn new(format: ModelFormat, path: impl Into<PathBuf>) -> Self {
        Self {
            format,
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// Model candidates, tried in order; the first that loads is used.
    pub sources: Vec<ModelSource>,
    pub normalization: Normalization,
    /// Tag stored alongside every embedding this extractor produces.
    pub model_version: Option<String>,
}

/// A loaded model able to run a forward pass on a `[1, 256, 256, 3]` tensor.
pub trait EmbeddingModel: Send {
    fn forward(&mut self, input: &Array4<f32>) -> Result<Vec<f32>, ExtractorError>;
}

/// Turns a [`ModelSource`] into a runnable model.
pub trait ModelLoader: Send + Sync {
    fn load(&self, source: &ModelSource) -> Result<Box<dyn EmbeddingModel>, ExtractorError>;
}

/// Loads models through ONNX Runtime.
pub struct OrtLoader {
    intra_threads: usize,
}

impl OrtLoader {
    pub fn new(intra_threads: usize) -> Self {
        Self { intra_threads }
    }
}

impl Default for OrtLoader {
    fn default() -> Self {
        Self::new(DEFAULT_INTRA_THREADS)
    }
}

impl ModelLoader for OrtLoader {
    fn load(&self, source: &ModelSource) -> Result<Box<dyn EmbeddingModel>, ExtractorError> {
        if !source.path.exists() {
            return Err(ExtractorError::ModelNotFound(
                source.path.display().to_string(),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(self.intra_threads)?
            .commit_from_file(&source.path)?;

        tracing::info!(
            path = %source.path.display(),
            format = %source.format,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Box::new(OrtModel { session }))
    }
}

struct OrtModel {
    session: Session,
}

impl EmbeddingModel for OrtModel {
    fn forward(&mut self, input: &Array4<f32>) -> Result<Vec<f32>, ExtractorError> {
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractorError::InferenceFailed(format!("embedding extraction: {e}")))?;

        Ok(raw.to_vec())
    }
}

struct LoadedModel {
    source: ModelSource,
    model: Mutex<Box<dyn EmbeddingModel>>,
}

/// Owns the embedding model handle.
///
/// The model is loaded on first use. Concurrent callers share a single
/// in-flight load; a failed load leaves the extractor unloaded so a later
/// call retries.
pub struct EmbeddingExtractor {
    config: ExtractorConfig,
    loader: Arc<dyn ModelLoader>,
    model: OnceCell<Arc<LoadedModel>>,
}

impl EmbeddingExtractor {
    /// Extractor backed by ONNX Runtime.
    pub fn new(config: ExtractorConfig, intra_threads: usize) -> Self {
        Self::with_loader(config, Arc::new(OrtLoader::new(intra_threads)))
    }

    pub fn with_loader(config: ExtractorConfig, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            config,
            loader,
            model: OnceCell::new(),
        }
    }

    pub fn normalization(&self) -> Normalization {
        self.config.normalization
    }

    pub fn is_loaded(&self) -> bool {
        self.model.initialized()
    }

    /// The source the model was loaded from, once loaded.
    pub fn loaded_source(&self) -> Option<&ModelSource> {
        self.model.get().map(|m| &m.source)
    }

    /// Load the model if needed, returning the source that succeeded.
    pub async fn load(&self) -> Result<&ModelSource, ExtractorError> {
        Ok(&self.loaded().await?.source)
    }

    async fn loaded(&self) -> Result<&Arc<LoadedModel>, ExtractorError> {
        self.model
            .get_or_try_init(|| async {
                let loader = Arc::clone(&self.loader);
                let sources = self.config.sources.clone();
                match tokio::task::spawn_blocking(move || load_first(loader.as_ref(), &sources))
                    .await
                {
                    Ok(result) => result.map(Arc::new),
                    Err(e) => Err(ExtractorError::ModelUnavailable(format!(
                        "load task failed: {e}"
                    ))),
                }
            })
            .await
    }

    /// Compute the embedding for a captured frame.
    ///
    /// Fails with [`ExtractorError::ModelUnavailable`] when no model source
    /// loads and [`ExtractorError::NoFaceDetected`] when the model output is empty.
    /// Preprocessing and the forward pass run on the blocking pool.
    pub async fn extract(&self, image: &RgbImage) -> Result<Embedding, ExtractorError> {
        let loaded = Arc::clone(self.loaded().await?);

        if image.width() == 0 || image.height() == 0 {
            return Err(ExtractorError::InvalidImage(format!(
                "{}x{} frame",
                image.width(),
                image.height()
            )));
        }

        let image = image.clone();
        let normalization = self.config.normalization;
        let raw = tokio::task::spawn_blocking(move || {
            let input = preprocess(&image, normalization);
            let mut model = loaded
                .model
                .lock()
                .map_err(|_| ExtractorError::InferenceFailed("model lock poisoned".into()))?;
            model.forward(&input)
        })
        .await
        .map_err(|e| ExtractorError::InferenceFailed(format!("inference task failed: {e}")))??;

        if raw.is_empty() {
            return Err(ExtractorError::NoFaceDetected);
        }

        Ok(Embedding {
            values: raw,
            model_version: self.config.model_version.clone(),
        })
    }
}

/// Try each source in order, returning the first model that loads.
fn load_first(
    loader: &dyn ModelLoader,
    sources: &[ModelSource],
) -> Result<LoadedModel, ExtractorError> {
    if sources.is_empty() {
        return Err(ExtractorError::ModelUnavailable(
            "no model sources configured".into(),
        ));
    }

    let mut failures = Vec::with_capacity(sources.len());
    for source in sources {
        tracing::info!(path = %source.path.display(), format = %source.format, "attempting model load");
        match loader.load(source) {
            Ok(model) => {
                tracing::info!(path = %source.path.display(), "embedding model ready");
                return Ok(LoadedModel {
                    source: source.clone(),
                    model: Mutex::new(model),
                });
            }
            Err(e) => {
                tracing::warn!(path = %source.path.display(), error = %e, "model load failed");
                failures.push(format!("{} ({}): {e}", source.path.display(), source.format));
            }
        }
    }

    Err(ExtractorError::ModelUnavailable(format!(
        "tried {}",
        failures.join("; ")
    )))
}

/// Resize to 256x256 with nearest-neighbour sampling and normalize into a NHWC tensor.
///
/// Source pixel for output `(x, y)` is `(floor(x * w / 256), floor(y * h / 256))`.
pub fn preprocess(image: &RgbImage, normalization: Normalization) -> Array4<f32> {
    let size = INPUT_SIZE;
    let src_w = image.width() as usize;
    let src_h = image.height() as usize;
    let mut tensor = Array4::<f32>::zeros((1, size, size, INPUT_CHANNELS));

    for y in 0..size {
        let src_y = (y * src_h / size).min(src_h.saturating_sub(1));
        for x in 0..size {
            let src_x = (x * src_w / size).min(src_w.saturating_sub(1));
            let pixel = image.get_pixel(src_x as u32, src_y as u32);
            for c in 0..INPUT_CHANNELS {
                tensor[[0, y, x, c]] = normalization.apply(pixel[c] as f32);
            }
        }
    }

    tensor
}
