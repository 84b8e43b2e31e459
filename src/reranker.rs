//! Optional second-stage re-scoring of retrieved candidates.
//!
//! A reranker scores `(query, document)` pairs jointly. The retriever's
//! similarity scores are kept; the reranker's score is added alongside
//! and decides the final order.

use std::{collections::HashSet, sync::OnceLock};

use candle_core::Tensor;
use candle_nn::{Linear, Module};
use candle_transformers::models::bert::BertModel;
use tracing::debug;

use crate::{
    embedding::tokenize,
    error::{Error, Result},
    model_manager::{DEFAULT_RERANK_MODEL_ID, ModelAssets},
    retriever::RetrievalResult,
};

/// Token budget for a (query, document) pair.
pub const CROSS_ENCODER_MAX_LEN: usize = 512;
/// Pairs scored per forward pass.
const SCORE_BATCH: usize = 16;
/// Upper bound on candidates fetched for reranking.
pub const MAX_CANDIDATE_POOL: usize = 50;

/// Scores query/document pairs; higher is more relevant.
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    /// One score per document, in input order.
    fn score_pairs(&self, query: &str, documents: &[&str]) -> Result<Vec<f32>>;
}

/// Number of first-stage candidates to fetch when the final list will be
/// reranked down to `top_k`.
pub fn candidate_pool(top_k: usize) -> usize {
    top_k.saturating_mul(4).min(MAX_CANDIDATE_POOL).max(top_k)
}

/// Text a candidate is judged by: its description, or the title when it
/// has none.
fn document_text(result: &RetrievalResult) -> &str {
    match result.description.as_deref() {
        Some(d) if !d.trim().is_empty() => d,
        _ => &result.title,
    }
}

/// Re-score `candidates` against `query`, sort by the new score and keep
/// the best `top_k`. Ties keep their similarity order.
pub fn rerank(
    reranker: &dyn Reranker,
    query: &str,
    mut candidates: Vec<RetrievalResult>,
    top_k: usize,
) -> Result<Vec<RetrievalResult>> {
    if candidates.is_empty() || top_k == 0 {
        return Ok(Vec::new());
    }

    let documents: Vec<&str> = candidates.iter().map(document_text).collect();
    let scores = reranker.score_pairs(query, &documents)?;
    if scores.len() != candidates.len() {
        return Err(Error::Model(format!(
            "reranker returned {} scores for {} candidates",
            scores.len(),
            candidates.len()
        )));
    }

    for (candidate, score) in candidates.iter_mut().zip(scores) {
        candidate.rerank_score = Some(score);
    }
    candidates.sort_by(|a, b| {
        let a = a.rerank_score.unwrap_or(f32::NEG_INFINITY);
        let b = b.rerank_score.unwrap_or(f32::NEG_INFINITY);
        b.total_cmp(&a)
    });
    candidates.truncate(top_k);

    debug!(reranker = reranker.name(), kept = candidates.len(), "reranked");
    Ok(candidates)
}

struct CrossEncoderModel {
    assets: ModelAssets,
    bert: BertModel,
    pooler: Linear,
    classifier: Linear,
}

/// BERT cross-encoder with a single-logit classification head, such as
/// the MS MARCO MiniLM rerankers.
///
/// The model is loaded on first use.
pub struct CrossEncoderReranker {
    model_id: String,
    max_len: usize,
    model: OnceLock<CrossEncoderModel>,
}

impl Default for CrossEncoderReranker {
    fn default() -> Self {
        Self::new(DEFAULT_RERANK_MODEL_ID.to_string())
    }
}

impl CrossEncoderReranker {
    pub fn new(model_id: String) -> Self {
        Self {
            model_id,
            max_len: CROSS_ENCODER_MAX_LEN,
            model: OnceLock::new(),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    fn ensure_loaded(&self) -> Result<&CrossEncoderModel> {
        if let Some(model) = self.model.get() {
            return Ok(model);
        }
        let (assets, vb) = ModelAssets::load(&self.model_id, self.max_len)?;
        let hidden = assets.config.hidden_size;
        let prefix = assets.config.model_type.as_deref().unwrap_or("bert");

        let bert = BertModel::load(vb.clone(), &assets.config)?;
        let pooler = candle_nn::linear(
            hidden,
            hidden,
            vb.pp(format!("{prefix}.pooler.dense")),
        )?;
        let classifier = candle_nn::linear(hidden, 1, vb.pp("classifier"))?;

        let _ = self.model.set(CrossEncoderModel {
            assets,
            bert,
            pooler,
            classifier,
        });
        self.model
            .get()
            .ok_or_else(|| Error::Model("reranker failed to initialize".into()))
    }

    fn score_batch(
        &self,
        model: &CrossEncoderModel,
        pairs: Vec<(String, String)>,
    ) -> Result<Vec<f32>> {
        let batch = model.assets.tokenize(pairs)?;
        let hidden = model.bert.forward(
            &batch.input_ids,
            &batch.token_type_ids,
            Some(&batch.attention_mask),
        )?;
        // [CLS] token -> pooler (dense + tanh) -> one logit per pair.
        let cls: Tensor = hidden.narrow(1, 0, 1)?.squeeze(1)?;
        let pooled = model.pooler.forward(&cls)?.tanh()?;
        let logits = model.classifier.forward(&pooled)?.squeeze(1)?;
        Ok(logits.to_vec1::<f32>()?)
    }
}

impl Reranker for CrossEncoderReranker {
    fn name(&self) -> &str {
        &self.model_id
    }

    fn score_pairs(&self, query: &str, documents: &[&str]) -> Result<Vec<f32>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.ensure_loaded()?;
        let mut scores = Vec::with_capacity(documents.len());
        for chunk in documents.chunks(SCORE_BATCH) {
            let pairs = chunk
                .iter()
                .map(|d| (query.to_string(), d.to_string()))
                .collect();
            scores.extend(self.score_batch(model, pairs)?);
        }
        Ok(scores)
    }
}

/// Model-free reranker: fraction of query terms found in the document.
#[derive(Debug, Clone, Copy, Default)]
pub struct TermOverlapReranker;

impl Reranker for TermOverlapReranker {
    fn name(&self) -> &str {
        "term-overlap"
    }

    fn score_pairs(&self, query: &str, documents: &[&str]) -> Result<Vec<f32>> {
        let query_terms: HashSet<String> = tokenize(query).collect();
        let denom = query_terms.len().max(1) as f32;
        Ok(documents
            .iter()
            .map(|doc| {
                let doc_terms: HashSet<String> = tokenize(doc).collect();
                query_terms.intersection(&doc_terms).count() as f32 / denom
            })
            .collect())
    }
}
