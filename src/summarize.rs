//! Optional natural-language summary of a result list.
//!
//! Summaries are best-effort: a slow or failing backend only ever costs the
//! caller the summary, never the retrieval results.

use std::{future::Future, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    config::env_usize,
    error::{Error, Result},
    retriever::RetrievalResult,
    text_util::{DEFAULT_SNIPPET_MAX_CHARS, snippet},
};

pub const SUMMARY_URL_ENV_VAR: &str = "BOOKSEARCH_SUMMARY_URL";
pub const SUMMARY_API_KEY_ENV_VAR: &str = "BOOKSEARCH_SUMMARY_API_KEY";
pub const SUMMARY_MODEL_ENV_VAR: &str = "BOOKSEARCH_SUMMARY_MODEL";
pub const SUMMARY_TIMEOUT_ENV_VAR: &str = "BOOKSEARCH_SUMMARY_TIMEOUT";

pub const DEFAULT_SUMMARY_MODEL: &str = "deepseek-chat";
pub const DEFAULT_SUMMARY_TIMEOUT: Duration = Duration::from_secs(8);
pub const DEFAULT_SUMMARY_ATTEMPTS: usize = 2;
pub const DEFAULT_SUMMARY_BACKOFF: Duration = Duration::from_millis(500);

/// Results included in a summary prompt.
pub const SUMMARY_RESULT_LIMIT: usize = 5;

const SYSTEM_PROMPT: &str = "You are a librarian. Recommend books from the \
numbered list to the reader in a short paragraph. Only mention books from the \
list and never invent titles or authors.";

/// Time box and retry schedule for one summary call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryPolicy {
    /// Limit per attempt.
    pub timeout: Duration,
    pub max_attempts: usize,
    /// Fixed pause between attempts.
    pub backoff: Duration,
}

impl Default for SummaryPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SUMMARY_TIMEOUT,
            max_attempts: DEFAULT_SUMMARY_ATTEMPTS,
            backoff: DEFAULT_SUMMARY_BACKOFF,
        }
    }
}

impl SummaryPolicy {
    /// Defaults with the timeout taken from `BOOKSEARCH_SUMMARY_TIMEOUT`
    /// (whole seconds) when set.
    pub fn from_env() -> Result<Self> {
        let secs = env_usize(
            SUMMARY_TIMEOUT_ENV_VAR,
            DEFAULT_SUMMARY_TIMEOUT.as_secs() as usize,
        )?;
        if secs == 0 {
            return Err(Error::Config(format!(
                "{SUMMARY_TIMEOUT_ENV_VAR} must be at least 1 second"
            )));
        }
        Ok(Self {
            timeout: Duration::from_secs(secs as u64),
            ..Self::default()
        })
    }
}

/// A query and the leading results it produced.
#[derive(Debug, Clone, Copy)]
pub struct SummaryRequest<'a> {
    pub query: &'a str,
    pub results: &'a [RetrievalResult],
}

impl<'a> SummaryRequest<'a> {
    /// Keeps at most [`SUMMARY_RESULT_LIMIT`] results.
    pub fn new(query: &'a str, results: &'a [RetrievalResult]) -> Self {
        let keep = results.len().min(SUMMARY_RESULT_LIMIT);
        Self {
            query,
            results: &results[..keep],
        }
    }

    /// User prompt listing each result with a clipped description snippet.
    pub fn prompt(&self) -> String {
        let mut out = format!(
            "Reader's request: {}\n\nCandidate books:\n",
            self.query.trim()
        );
        for (i, r) in self.results.iter().enumerate() {
            out.push_str(&format!("{}. {}", i + 1, r.title));
            if let Some(author) = r.author.as_deref().filter(|a| !a.is_empty())
            {
                out.push_str(&format!(" / {author}"));
            }
            out.push_str(&format!(
                " (similarity {:.3})\n",
                r.cosine_similarity
            ));
            if let Some(description) =
                r.description.as_deref().filter(|d| !d.trim().is_empty())
            {
                out.push_str(&format!(
                    "   {}\n",
                    snippet(description, DEFAULT_SNIPPET_MAX_CHARS)
                ));
            }
        }
        out
    }
}

/// Produces a summary for a request.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, request: &SummaryRequest<'_>)
    -> impl Future<Output = Result<String>> + Send;
}

/// Run `summarizer` under `policy`. Failures and timeouts are logged and
/// retried; when every attempt fails the result is `None`.
pub async fn summarize_best_effort<S: Summarizer>(
    summarizer: &S,
    request: &SummaryRequest<'_>,
    policy: &SummaryPolicy,
) -> Option<String> {
    if request.results.is_empty() {
        return None;
    }

    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        let call = summarizer.summarize(request);
        match tokio::time::timeout(policy.timeout, call).await {
            Ok(Ok(summary)) => {
                debug!(
                    attempt,
                    chars = summary.chars().count(),
                    "summary ready"
                );
                return Some(summary);
            }
            Ok(Err(e)) => {
                warn!(attempt, attempts, error = %e, "summary attempt failed")
            }
            Err(_) => warn!(
                attempt,
                attempts,
                timeout_ms = policy.timeout.as_millis() as u64,
                "summary attempt timed out"
            ),
        }
        if attempt < attempts {
            tokio::time::sleep(policy.backoff).await;
        }
    }
    None
}

/// Client for an OpenAI-compatible chat completions endpoint.
#[derive(Clone)]
pub struct ChatSummarizer {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
}

impl ChatSummarizer {
    /// `base_url` may be the API root or the full `/chat/completions` URL.
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        model: String,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            url: completions_url(base_url),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            model,
        })
    }

    /// Configured from `BOOKSEARCH_SUMMARY_*`; `None` when no endpoint is
    /// set.
    pub fn from_env() -> Result<Option<Self>> {
        let Some(url) = std::env::var(SUMMARY_URL_ENV_VAR)
            .ok()
            .filter(|u| !u.trim().is_empty())
        else {
            return Ok(None);
        };
        let model = std::env::var(SUMMARY_MODEL_ENV_VAR)
            .ok()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SUMMARY_MODEL.to_string());
        let api_key = std::env::var(SUMMARY_API_KEY_ENV_VAR).ok();
        Self::new(&url, api_key, model).map(Some)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl Summarizer for ChatSummarizer {
    async fn summarize(&self, request: &SummaryRequest<'_>) -> Result<String> {
        let prompt = request.prompt();
        let body = ChatRequest {
            model: &self.model,
            temperature: 0.3,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
        };

        let mut call = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key.trim());
        }
        let response = call.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(Error::Summary(format!(
                "endpoint returned {status}: {text}"
            )));
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                Error::Summary("completion contained no text".into())
            })
    }
}

fn completions_url(base: &str) -> String {
    let base = base.trim().trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else {
        format!("{base}/chat/completions")
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Deserialize)]
struct AssistantMessage {
    content: String,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn result(
        rank: usize,
        title: &str,
        description: Option<&str>,
    ) -> RetrievalResult {
        RetrievalResult {
            row_id: rank as u64 - 1,
            title: title.into(),
            author: Some("Someone".into()),
            description: description.map(Into::into),
            isbn: None,
            publisher: None,
            rank,
            raw_distance: 0.5,
            cosine_similarity: 0.75,
            similarity_percent: 75,
            set_relative_percent: 100,
            star_rating: 4.0,
            rerank_score: None,
        }
    }

    /// Fails its first `failures` calls, each after `delay`.
    struct Scripted {
        failures: usize,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(failures: usize, delay: Duration) -> Self {
            Self {
                failures,
                delay,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Summarizer for Scripted {
        async fn summarize(
            &self,
            request: &SummaryRequest<'_>,
        ) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if n < self.failures {
                Err(Error::Summary("backend down".into()))
            } else {
                Ok(format!("picks for {}", request.query))
            }
        }
    }

    fn fast_policy() -> SummaryPolicy {
        SummaryPolicy {
            timeout: Duration::from_millis(50),
            max_attempts: 2,
            backoff: Duration::from_millis(1),
        }
    }

    async fn ask(s: &Scripted, results: &[RetrievalResult]) -> Option<String> {
        let request = SummaryRequest::new("sand", results);
        summarize_best_effort(s, &request, &fast_policy()).await
    }

    #[test]
    fn request_keeps_top_five() {
        let results: Vec<_> =
            (1..=8).map(|i| result(i, "Book", None)).collect();
        assert_eq!(SummaryRequest::new("q", &results).results.len(), 5);
        assert_eq!(SummaryRequest::new("q", &results[..2]).results.len(), 2);
    }

    #[test]
    fn prompt_lists_snippets_and_scores() {
        let long = "word ".repeat(100);
        let results =
            vec![result(1, "Dune", Some(&long)), result(2, "Emma", None)];
        let prompt = SummaryRequest::new("  desert  ", &results).prompt();
        assert!(prompt.starts_with("Reader's request: desert\n"));
        assert!(prompt.contains("1. Dune / Someone (similarity 0.750)\n"));
        assert!(prompt.contains("2. Emma / Someone (similarity 0.750)\n"));
        let snippet_line = prompt
            .lines()
            .find(|l| l.starts_with("   word"))
            .unwrap();
        assert!(snippet_line.ends_with("..."));
        assert_eq!(snippet_line.trim_start().chars().count(), 143);
    }

    #[test]
    fn default_policy() {
        let p = SummaryPolicy::default();
        assert_eq!(p.timeout, Duration::from_secs(8));
        assert_eq!(p.max_attempts, 2);
        assert_eq!(p.backoff, Duration::from_millis(500));
    }

    #[test]
    fn completions_url_is_normalized() {
        assert_eq!(
            completions_url("https://api.example.com/v1/"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            completions_url("https://api.example.com/v1/chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn chat_summarizer_drops_blank_key() {
        let s = ChatSummarizer::new(
            "http://localhost:1",
            Some("  ".into()),
            "m".into(),
        )
        .unwrap();
        assert!(s.api_key.is_none());
        assert_eq!(s.url(), "http://localhost:1/chat/completions");
        assert_eq!(s.model(), "m");
    }

    #[tokio::test]
    async fn first_success_is_returned() {
        let results = vec![result(1, "Dune", None)];
        let s = Scripted::new(0, Duration::ZERO);
        let out = ask(&s, &results).await;
        assert_eq!(out.as_deref(), Some("picks for sand"));
        assert_eq!(s.calls(), 1);
    }

    #[tokio::test]
    async fn failure_is_retried_once() {
        let results = vec![result(1, "Dune", None)];
        let s = Scripted::new(1, Duration::ZERO);
        let out = ask(&s, &results).await;
        assert!(out.is_some());
        assert_eq!(s.calls(), 2);
    }

    #[tokio::test]
    async fn exhausted_attempts_degrade_to_none() {
        let results = vec![result(1, "Dune", None)];
        let s = Scripted::new(10, Duration::ZERO);
        let out = ask(&s, &results).await;
        assert!(out.is_none());
        assert_eq!(s.calls(), 2);
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let results = vec![result(1, "Dune", None)];
        let s = Scripted::new(0, Duration::from_secs(5));
        let out = ask(&s, &results).await;
        assert!(out.is_none());
        assert_eq!(s.calls(), 2);
    }

    #[tokio::test]
    async fn no_results_skip_the_backend() {
        let s = Scripted::new(0, Duration::ZERO);
        let out = ask(&s, &[]).await;
        assert!(out.is_none());
        assert_eq!(s.calls(), 0);
    }
}
