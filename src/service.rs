//! Query entry point for long-running callers.
//!
//! A [`RetrievalService`] starts empty. Queries are rejected with
//! [`Error::StoreUnavailable`] until a retriever is installed, and a
//! retriever can be installed exactly once. After that the service is
//! read-only and can be shared across threads and tasks freely.

use std::sync::{Arc, OnceLock};

use serde::Serialize;
use tracing::info;

use crate::{
    error::{Error, Result},
    reranker::Reranker,
    retriever::{RetrievalResult, Retriever},
    search::{SearchParams, execute_search},
    summarize::{
        Summarizer,
        SummaryPolicy,
        SummaryRequest,
        summarize_best_effort,
    },
};

/// Results for one request plus the optional summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub query: String,
    pub results: Vec<RetrievalResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Default)]
pub struct RetrievalService {
    retriever: OnceLock<Retriever>,
    reranker: Option<Arc<dyn Reranker>>,
}

impl RetrievalService {
    pub fn new() -> Self {
        Self::default()
    }

    /// A service whose queries are reranked by `reranker`.
    pub fn with_reranker(reranker: Arc<dyn Reranker>) -> Self {
        Self {
            retriever: OnceLock::new(),
            reranker: Some(reranker),
        }
    }

    /// Install the retriever that serves all further queries.
    pub fn install(&self, retriever: Retriever) -> Result<()> {
        let rows = retriever.store().len();
        let layout = retriever.store().layout();
        self.retriever
            .set(retriever)
            .map_err(|_| Error::StoreAlreadyInstalled)?;
        info!(rows, %layout, "index store installed");
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.retriever.get().is_some()
    }

    pub fn retriever(&self) -> Result<&Retriever> {
        self.retriever.get().ok_or(Error::StoreUnavailable)
    }

    /// Ranked results for `query`. `top_k` above the maximum is clamped;
    /// zero yields an empty list.
    pub fn retrieve(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>> {
        let retriever = self.retriever()?;
        let params = SearchParams {
            query: query.to_string(),
            count: top_k,
        };
        execute_search(&params, retriever, self.reranker.as_deref())
    }

    /// [`retrieve`](Self::retrieve) on the blocking thread pool.
    pub async fn retrieve_async(
        &self,
        query: String,
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>> {
        let retriever = self.retriever()?.clone();
        let reranker = self.reranker.clone();
        tokio::task::spawn_blocking(move || {
            let params = SearchParams { query, count: top_k };
            execute_search(&params, &retriever, reranker.as_deref())
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }

    /// Retrieve, then summarize the leading results when a summarizer is
    /// given. A failed summary leaves `summary` empty.
    pub async fn recommend<S: Summarizer>(
        &self,
        query: String,
        top_k: usize,
        summarizer: Option<&S>,
        policy: &SummaryPolicy,
    ) -> Result<Recommendation> {
        let results = self.retrieve_async(query.clone(), top_k).await?;
        let summary = match summarizer {
            Some(summarizer) if !results.is_empty() => {
                let request = SummaryRequest::new(&query, &results);
                summarize_best_effort(summarizer, &request, policy).await
            }
            _ => None,
        };
        Ok(Recommendation {
            query,
            results,
            summary,
        })
    }
}

impl std::fmt::Debug for RetrievalService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalService")
            .field("retriever", &self.retriever.get())
            .field("reranker", &self.reranker.as_ref().map(|r| r.name()))
            .finish()
    }
}
