//! Face classification into embeddings.
//!
//! [`ArcFaceClassifier`] runs the w600k_r50 ArcFace model on ONNX Runtime
//! over padded RGB face crops resized to 112x112.

use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // NOT 128.0 — ArcFace uses symmetric normalization
const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face image has no pixels")]
    EmptyImage,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns a face image into a fixed-length embedding.
pub trait FaceClassifier: Send {
    fn classify(&mut self, face: &RgbImage) -> Result<Vec<f32>, ClassifierError>;
}

/// ArcFace-based face classifier. Embeddings are returned unnormalized.
pub struct ArcFaceClassifier {
    session: Session,
}

impl ArcFaceClassifier {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, ClassifierError> {
        if !Path::new(model_path).exists() {
            return Err(ClassifierError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Resize a face crop to 112x112 and normalize it into a NCHW tensor.
    fn preprocess(face: &RgbImage) -> Result<Array4<f32>, ClassifierError> {
        if face.width() == 0 || face.height() == 0 {
            return Err(ClassifierError::EmptyImage);
        }

        let resized = image::imageops::resize(
            face,
            ARCFACE_INPUT_SIZE,
            ARCFACE_INPUT_SIZE,
            FilterType::Triangle,
        );

        let size = ARCFACE_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }
        Ok(tensor)
    }
}

impl FaceClassifier for ArcFaceClassifier {
    fn classify(&mut self, face: &RgbImage) -> Result<Vec<f32>, ClassifierError> {
        let input = Self::preprocess(face)?;

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(ClassifierError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(raw.to_vec())
    }
}
