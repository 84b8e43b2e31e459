use serde::Serialize;

use crate::{
    config::MAX_TOP_K,
    error::Result,
    reranker::{self, Reranker},
    retriever::{RetrievalResult, Retriever},
    text_util::{DEFAULT_SNIPPET_MAX_CHARS, snippet},
};

/// Parameters for one search request.
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub query: String,
    /// Requested result count, clamped to `1..=MAX_TOP_K`.
    pub count: usize,
}

/// Execute the full search pipeline.
///
/// 1. Exact nearest-neighbour retrieval with calibrated scores
/// 2. Cross-encoder reranking over a wider candidate pool (when a reranker
///    is given)
/// 3. Limit to `count` results
pub fn execute_search(
    params: &SearchParams,
    retriever: &Retriever,
    reranker: Option<&dyn Reranker>,
) -> Result<Vec<RetrievalResult>> {
    let count = params.count.min(MAX_TOP_K);
    if count == 0 {
        return Ok(Vec::new());
    }

    match reranker {
        Some(reranker) => {
            let pool = reranker::candidate_pool(count);
            let candidates = retriever.retrieve(&params.query, pool)?;
            reranker::rerank(reranker, &params.query, candidates, count)
        }
        None => retriever.retrieve(&params.query, count),
    }
}

/// Render results for human-readable terminal output.
pub fn format_human(results: &[RetrievalResult]) -> String {
    if results.is_empty() {
        return "No results found.\n".to_string();
    }

    let mut out = String::new();
    for r in results {
        out.push_str(&format!(
            "{:>3}. [{:.3}] {} {}\n",
            r.rank,
            r.cosine_similarity,
            stars(r.star_rating),
            r.title
        ));
        let mut details = Vec::new();
        if let Some(author) = r.author.as_deref().filter(|a| !a.is_empty()) {
            details.push(author.to_string());
        }
        if let Some(publisher) =
            r.publisher.as_deref().filter(|p| !p.is_empty())
        {
            details.push(publisher.to_string());
        }
        details.push(format!(
            "{}% match, {}% within results",
            r.similarity_percent, r.set_relative_percent
        ));
        if let Some(score) = r.rerank_score {
            details.push(format!("rerank {score:.3}"));
        }
        out.push_str(&format!("     {}\n", details.join(" | ")));
        if let Some(description) =
            r.description.as_deref().filter(|d| !d.is_empty())
        {
            out.push_str(&format!(
                "     {}\n",
                snippet(description, DEFAULT_SNIPPET_MAX_CHARS)
            ));
        }
    }
    out.push_str(&format!("\n{} result(s)\n", results.len()));
    out
}

#[derive(Serialize)]
struct JsonOutput<'a> {
    query: &'a str,
    result_count: usize,
    results: &'a [RetrievalResult],
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<&'a str>,
}

/// Render results (and an optional summary) as a JSON document.
pub fn format_json(
    results: &[RetrievalResult],
    query: &str,
    summary: Option<&str>,
) -> Result<String> {
    Ok(serde_json::to_string_pretty(&JsonOutput {
        query,
        result_count: results.len(),
        results,
        summary,
    })?)
}

/// `★★★½` style rendering of a half-step rating.
fn stars(rating: f32) -> String {
    let halves = (rating * 2.0).round() as usize;
    let mut s = "★".repeat(halves / 2);
    if halves % 2 == 1 {
        s.push('½');
    }
    s
}
