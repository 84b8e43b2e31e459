use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    embedding::Embedder,
    error::Result,
    normalizer::Query,
    scoring,
    store::IndexStore,
};

/// One ranked catalog entry with its scores.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub row_id: u64,
    pub title: String,
    pub author: Option<String>,
    pub description: Option<String>,
    pub isbn: Option<String>,
    pub publisher: Option<String>,
    /// 1-based position by similarity.
    pub rank: usize,
    /// Squared L2 distance between query and row vectors.
    pub raw_distance: f32,
    pub cosine_similarity: f32,
    pub similarity_percent: u8,
    /// Position within this result set, `10..=100`.
    pub set_relative_percent: u8,
    pub star_rating: f32,
    /// Set when a reranker has re-scored the result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
}

/// Answers top-k queries against a loaded store.
#[derive(Clone)]
pub struct Retriever {
    store: Arc<IndexStore>,
    embedder: Arc<dyn Embedder>,
}

impl Retriever {
    pub fn new(store: Arc<IndexStore>, embedder: Arc<dyn Embedder>) -> Self {
        if let Some(info) = store.info()
            && info.model_id != embedder.model_id()
        {
            warn!(
                store_model = %info.model_id,
                query_model = embedder.model_id(),
                "store was built with a different embedding model"
            );
        }
        Self { store, embedder }
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    /// The `top_k` most similar records, best first.
    ///
    /// An empty query or `top_k == 0` yields no results. Embedding failures
    /// and a query vector of the wrong dimension are errors.
    pub fn retrieve(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>> {
        let Some(query) = Query::new(query) else {
            return Ok(Vec::new());
        };
        if top_k == 0 || self.store.is_empty() {
            return Ok(Vec::new());
        }

        let vector = self.embedder.embed_query(&query)?;
        let neighbors = self.store.search(&vector, top_k)?;

        let mut results: Vec<RetrievalResult> = neighbors
            .into_iter()
            .filter_map(|n| {
                let record = self.store.record(n.row_id)?;
                let cosine = scoring::cosine_from_squared_l2(n.distance);
                Some(RetrievalResult {
                    row_id: n.row_id,
                    title: record.title.clone(),
                    author: record.author.clone(),
                    description: record.description.clone(),
                    isbn: record.isbn.clone(),
                    publisher: record.publisher.clone(),
                    rank: 0,
                    raw_distance: n.distance,
                    cosine_similarity: cosine,
                    similarity_percent: scoring::similarity_percent(cosine),
                    set_relative_percent: 0,
                    star_rating: scoring::star_rating(cosine),
                    rerank_score: None,
                })
            })
            .collect();

        // Stable sort keeps the row-id tie-break of the search.
        results.sort_by(|a, b| {
            b.cosine_similarity.total_cmp(&a.cosine_similarity)
        });

        let cosines: Vec<f32> =
            results.iter().map(|r| r.cosine_similarity).collect();
        for (i, (r, rel)) in results
            .iter_mut()
            .zip(scoring::set_relative_percents(&cosines))
            .enumerate()
        {
            r.rank = i + 1;
            r.set_relative_percent = rel;
        }

        debug!(query = query.body(), hits = results.len(), "retrieved");
        Ok(results)
    }
}

impl std::fmt::Debug for Retriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retriever")
            .field("store", &self.store)
            .field("model", &self.embedder.model_id())
            .finish()
    }
}
