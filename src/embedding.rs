use std::sync::OnceLock;

use candle_core::DType;
use candle_transformers::models::bert::BertModel;

use crate::{
    config::DEFAULT_MAX_SEQ_LEN,
    error::{Error, Result},
    model_manager::{DEFAULT_EMBED_MODEL_ID, ModelAssets},
    normalizer::{Passage, Query},
};

/// Turns passages and queries into fixed-dimension vectors.
///
/// Passages and queries have distinct types so the instruction prefix the
/// model expects can't be mixed up. A call either returns one vector per
/// input or fails as a whole.
pub trait Embedder: Send + Sync {
    /// Identifier of the underlying model, recorded alongside a built store.
    fn model_id(&self) -> &str;

    fn embed_passages(&self, passages: &[Passage]) -> Result<Vec<Vec<f32>>>;

    fn embed_query(&self, query: &Query) -> Result<Vec<f32>>;
}

/// Scale `v` to unit length in place. Zero vectors are left unchanged.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

struct E5Model {
    assets: ModelAssets,
    bert: BertModel,
}

/// E5-family sentence embedder: BERT encoder, mean pooling over the
/// attention mask, then L2 normalization.
///
/// The model is loaded on first use.
pub struct E5Embedder {
    model_id: String,
    max_seq_len: usize,
    model: OnceLock<E5Model>,
}

impl Default for E5Embedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBED_MODEL_ID.to_string())
    }
}

impl E5Embedder {
    pub fn new(model_id: String) -> Self {
        Self {
            model_id,
            max_seq_len: DEFAULT_MAX_SEQ_LEN,
            model: OnceLock::new(),
        }
    }

    pub fn with_max_seq_len(mut self, max_seq_len: usize) -> Self {
        self.max_seq_len = max_seq_len;
        self
    }

    pub fn is_loaded(&self) -> bool {
        self.model.get().is_some()
    }

    fn ensure_loaded(&self) -> Result<&E5Model> {
        if let Some(model) = self.model.get() {
            return Ok(model);
        }
        let (assets, vb) = ModelAssets::load(&self.model_id, self.max_seq_len)?;
        let bert = BertModel::load(vb, &assets.config)?;
        // A concurrent loader may have won the race; either copy is fine.
        let _ = self.model.set(E5Model { assets, bert });
        self.model
            .get()
            .ok_or_else(|| Error::Model("model failed to initialize".into()))
    }

    fn encode(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.ensure_loaded()?;
        let batch = model.assets.tokenize(texts)?;

        let hidden = model.bert.forward(
            &batch.input_ids,
            &batch.token_type_ids,
            Some(&batch.attention_mask),
        )?;

        // Mean over real tokens only: [B, L, H] * [B, L, 1] summed over L.
        let mask = batch.attention_mask.to_dtype(DType::F32)?.unsqueeze(2)?;
        let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
        let counts = mask.sum(1)?;
        let pooled = summed.broadcast_div(&counts)?;

        let mut vectors = pooled.to_vec2::<f32>()?;
        vectors.iter_mut().for_each(|v| l2_normalize(v));
        Ok(vectors)
    }
}

impl Embedder for E5Embedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed_passages(&self, passages: &[Passage]) -> Result<Vec<Vec<f32>>> {
        self.encode(passages.iter().map(|p| p.as_str().to_string()).collect())
    }

    fn embed_query(&self, query: &Query) -> Result<Vec<f32>> {
        self.encode(vec![query.as_str().to_string()])?
            .pop()
            .ok_or_else(|| Error::Embedding("model returned no vector".into()))
    }
}

pub const DEFAULT_HASHING_DIMENSION: usize = 384;
/// Model id recorded for stores built with [`HashingEmbedder`].
pub const HASHING_MODEL_ID: &str = "hashing";

/// Model-free embedder using signed feature hashing of lowercased word
/// tokens.
///
/// Only lexical overlap is captured, but it is deterministic, instant and
/// needs no download, which makes it suitable for offline builds and tests.
/// The instruction prefixes are not hashed.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASHING_DIMENSION)
    }
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            let h = fnv1a(token.as_bytes());
            let bucket = (h % self.dimension as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        l2_normalize(&mut v);
        v
    }
}

impl Embedder for HashingEmbedder {
    fn model_id(&self) -> &str {
        HASHING_MODEL_ID
    }

    fn embed_passages(&self, passages: &[Passage]) -> Result<Vec<Vec<f32>>> {
        Ok(passages.iter().map(|p| self.embed_text(p.body())).collect())
    }

    fn embed_query(&self, query: &Query) -> Result<Vec<f32>> {
        Ok(self.embed_text(query.body()))
    }
}

/// Lowercased alphanumeric runs.
pub(crate) fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes.iter().fold(OFFSET, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(PRIME)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dataset::CatalogRecord, normalizer::Normalizer};

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    fn passage(title: &str, description: &str) -> Passage {
        Normalizer::default().passage(&CatalogRecord {
            row_id: 0,
            title: title.into(),
            author: None,
            description: Some(description.into()),
            isbn: None,
            publisher: None,
        })
    }

    #[test]
    fn l2_normalize_unit_length() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn l2_normalize_leaves_zero_vector() {
        let mut v = vec![0.0; 4];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0; 4]);
    }

    #[test]
    fn hashing_vectors_are_unit_length() {
        let e = HashingEmbedder::default();
        let vs = e
            .embed_passages(&[passage("Dune", "desert planet spice")])
            .unwrap();
        assert_eq!(vs.len(), 1);
        assert_eq!(vs[0].len(), DEFAULT_HASHING_DIMENSION);
        assert!((dot(&vs[0], &vs[0]) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hashing_is_deterministic() {
        let e = HashingEmbedder::default();
        let q = Query::new("desert spice").unwrap();
        assert_eq!(e.embed_query(&q).unwrap(), e.embed_query(&q).unwrap());
    }

    #[test]
    fn hashing_prefers_lexical_overlap() {
        let e = HashingEmbedder::default();
        let docs = e
            .embed_passages(&[passage("A", "dogs"), passage("B", "cats")])
            .unwrap();
        let q = e.embed_query(&Query::new("dogs").unwrap()).unwrap();
        assert!(dot(&q, &docs[0]) > dot(&q, &docs[1]));
    }

    #[test]
    fn tokenize_lowercases_and_splits() {
        let tokens: Vec<String> = tokenize("Hello, World! 제목: 책").collect();
        assert_eq!(tokens, vec!["hello", "world", "제목", "책"]);
    }

    #[test]
    fn fnv1a_known_values() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn e5_embedder_is_lazy() {
        let e = E5Embedder::new("custom/model".into());
        assert_eq!(e.model_id(), "custom/model");
        assert!(!e.is_loaded());
    }
}
