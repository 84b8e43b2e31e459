use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::Config as BertConfig;
use tokenizers::{
    EncodeInput,
    PaddingParams,
    PaddingStrategy,
    Tokenizer,
    TruncationParams,
};
use tracing::info;

use crate::error::{Error, Result};

pub const DEFAULT_EMBED_MODEL_ID: &str = "intfloat/multilingual-e5-small";
pub const DEFAULT_RERANK_MODEL_ID: &str =
    "cross-encoder/ms-marco-MiniLM-L-6-v2";
pub const MODEL_ENV_VAR: &str = "BOOKSEARCH_MODEL";
pub const RERANK_MODEL_ENV_VAR: &str = "BOOKSEARCH_RERANK_MODEL";

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
pub fn default_device() -> Device {
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

/// Resolve a model ID from an explicit value, then `env_var`, then
/// `default`.
pub fn resolve_model_id(
    explicit: Option<&str>,
    env_var: &str,
    default: &str,
) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var(env_var).ok())
        .unwrap_or_else(|| default.to_string())
}

/// Paths of the three files a BERT-style checkpoint needs.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: PathBuf,
}

impl ModelFiles {
    /// Use `model_id` as a local directory when one exists, otherwise fetch
    /// the files from the HuggingFace Hub (cached after the first download).
    pub fn resolve(model_id: &str) -> Result<Self> {
        let local = Path::new(model_id);
        if local.is_dir() {
            let files = Self {
                config: local.join("config.json"),
                tokenizer: local.join("tokenizer.json"),
                weights: local.join("model.safetensors"),
            };
            for path in [&files.config, &files.tokenizer, &files.weights] {
                if !path.is_file() {
                    return Err(Error::Model(format!(
                        "model file missing: {}",
                        path.display()
                    )));
                }
            }
            return Ok(files);
        }

        let api = hf_hub::api::sync::Api::new()?;
        let repo = api.model(model_id.to_string());
        Ok(Self {
            config: repo.get("config.json")?,
            tokenizer: repo.get("tokenizer.json")?,
            weights: repo.get("model.safetensors")?,
        })
    }
}

/// A tokenized, padded batch ready for a BERT forward pass.
pub struct TokenBatch {
    pub input_ids: Tensor,
    pub token_type_ids: Tensor,
    pub attention_mask: Tensor,
}

/// Config and padding/truncating tokenizer of a BERT-architecture model.
pub struct ModelAssets {
    pub model_id: String,
    pub config: BertConfig,
    pub tokenizer: Tokenizer,
    pub device: Device,
}

impl ModelAssets {
    /// Load assets for `model_id`, truncating inputs to `max_seq_len`
    /// tokens. The returned `VarBuilder` maps the checkpoint weights; callers
    /// build their model heads from it.
    pub fn load(
        model_id: &str,
        max_seq_len: usize,
    ) -> Result<(Self, VarBuilder<'static>)> {
        let files = ModelFiles::resolve(model_id)?;
        let device = default_device();

        let config: BertConfig =
            serde_json::from_str(&std::fs::read_to_string(&files.config)?)?;

        let mut tokenizer = Tokenizer::from_file(&files.tokenizer)?;
        let padding = match tokenizer.get_padding() {
            Some(existing) => PaddingParams {
                strategy: PaddingStrategy::BatchLongest,
                ..existing.clone()
            },
            None => PaddingParams::default(),
        };
        tokenizer.with_padding(Some(padding));
        tokenizer.with_truncation(Some(TruncationParams {
            max_length: max_seq_len,
            ..Default::default()
        }))?;

        // SAFETY: the weights file is opened read-only and is not modified
        // while the model holds the mapping.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(
                &[files.weights],
                DType::F32,
                &device,
            )?
        };

        info!(model = model_id, device = ?device, "loaded model");

        let assets = Self {
            model_id: model_id.to_string(),
            config,
            tokenizer,
            device,
        };
        Ok((assets, vb))
    }

    /// Tokenize single texts or (query, document) pairs into tensors.
    pub fn tokenize<'s, E>(&self, inputs: Vec<E>) -> Result<TokenBatch>
    where
        E: Into<EncodeInput<'s>> + Send,
    {
        let encodings = self.tokenizer.encode_batch(inputs, true)?;
        let batch = encodings.len();
        let seq_len = encodings.first().map_or(0, |e| e.get_ids().len());

        let mut ids = Vec::with_capacity(batch * seq_len);
        let mut type_ids = Vec::with_capacity(batch * seq_len);
        let mut mask = Vec::with_capacity(batch * seq_len);
        for encoding in &encodings {
            if encoding.get_ids().len() != seq_len {
                return Err(Error::Model(
                    "tokenizer produced ragged batch despite padding".into(),
                ));
            }
            ids.extend_from_slice(encoding.get_ids());
            type_ids.extend_from_slice(encoding.get_type_ids());
            mask.extend_from_slice(encoding.get_attention_mask());
        }

        let shape = (batch, seq_len);
        Ok(TokenBatch {
            input_ids: Tensor::from_vec(ids, shape, &self.device)?,
            token_type_ids: Tensor::from_vec(type_ids, shape, &self.device)?,
            attention_mask: Tensor::from_vec(mask, shape, &self.device)?,
        })
    }
}
