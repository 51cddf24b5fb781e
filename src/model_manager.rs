use std::sync::Mutex;

use candle_core::{Device, Tensor};
use pylate_rs::ColBERT;

use crate::{
    embedding::{Embedder, EmbedderSpec, l2_normalize},
    error::{Error, Result},
};

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

fn embedding_error(e: impl std::fmt::Display) -> Error {
    Error::Embedding(e.to_string())
}

/// Dense single-vector embeddings from a ColBERT model, obtained by
/// mean-pooling its per-token document embeddings.
pub struct ColbertEmbedder {
    model: Mutex<ColBERT>,
    model_id: String,
    dimension: usize,
}

impl ColbertEmbedder {
    /// Load `model_id` from a local directory or the HuggingFace Hub.
    ///
    /// The output dimension is measured by encoding a probe text once.
    pub fn load(model_id: &str) -> Result<Self> {
        let mut colbert: ColBERT = ColBERT::from(model_id)
            .with_device(default_device())
            .try_into()
            .map_err(embedding_error)?;

        let probe = pooled(&mut colbert, "dimension probe")?;
        tracing::info!(model = model_id, dimension = probe.len(), "loaded ColBERT model");

        Ok(Self {
            model: Mutex::new(colbert),
            model_id: model_id.to_string(),
            dimension: probe.len(),
        })
    }
}

/// Encode one document and average its token embeddings: `[1, T, D] -> [D]`.
fn pooled(model: &mut ColBERT, text: &str) -> Result<Vec<f32>> {
    let tokens: Tensor = model
        .encode(&[text.to_string()], false)
        .map_err(embedding_error)?;
    tokens
        .squeeze(0)
        .and_then(|t| t.mean(0))
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(embedding_error)
}

impl Embedder for ColbertEmbedder {
    fn model_id(&self) -> String {
        format!("colbert-mean-{}", self.model_id)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut model = self
            .model
            .lock()
            .map_err(|_| Error::Embedding("model lock poisoned".to_string()))?;
        let mut vector = pooled(&mut model, text)?;
        l2_normalize(&mut vector);
        Ok(vector)
    }

    fn spec(&self) -> EmbedderSpec {
        EmbedderSpec::Colbert {
            model: self.model_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_local_model_is_embedding_error() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("no-such-model");
        let result = ColbertEmbedder::load(&missing.to_string_lossy());
        assert!(matches!(result, Err(Error::Embedding(_))));
    }
}
