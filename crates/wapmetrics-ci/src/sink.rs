//! Reporting sinks: the sticky PR comment and the check-run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use wapmetrics_core::{Result, WapmError};

/// GitHub API base URL.
pub const GITHUB_API_URL: &str = "https://api.github.com";

/// Check-run summaries are capped by the API.
const CHECK_SUMMARY_LIMIT: usize = 65_000;

/// Pull request a run reports to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRef {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

/// A check-run as recorded by a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRun {
    pub sha: String,
    pub title: String,
    pub summary: String,
    pub success: bool,
}

#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Update the comment containing `marker`, or create one. Returns the
    /// comment id.
    async fn upsert_comment(&self, pr: &PullRequestRef, marker: &str, body: &str) -> Result<u64>;

    async fn set_check(&self, pr: &PullRequestRef, check: &CheckRun) -> Result<()>;
}

fn truncate_summary(summary: &str) -> String {
    if summary.len() <= CHECK_SUMMARY_LIMIT {
        return summary.to_string();
    }
    let mut end = CHECK_SUMMARY_LIMIT;
    while !summary.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n\n_(truncated)_", &summary[..end])
}

// ---------------------------------------------------------------------------
// In-memory sink
// ---------------------------------------------------------------------------

/// Comment stored by [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredComment {
    pub id: u64,
    pub pr: PullRequestRef,
    pub body: String,
}

/// Sink that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    comments: Mutex<Vec<StoredComment>>,
    checks: Mutex<Vec<CheckRun>>,
    next_id: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn comments(&self) -> Vec<StoredComment> {
        self.comments.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn checks(&self) -> Vec<CheckRun> {
        self.checks.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ReportSink for MemorySink {
    async fn upsert_comment(&self, pr: &PullRequestRef, marker: &str, body: &str) -> Result<u64> {
        let mut comments = self
            .comments
            .lock()
            .map_err(|e| WapmError::Sink(e.to_string()))?;
        if let Some(existing) = comments
            .iter_mut()
            .find(|c| &c.pr == pr && c.body.contains(marker))
        {
            existing.body = body.to_string();
            return Ok(existing.id);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        comments.push(StoredComment {
            id,
            pr: pr.clone(),
            body: body.to_string(),
        });
        Ok(id)
    }

    async fn set_check(&self, _pr: &PullRequestRef, check: &CheckRun) -> Result<()> {
        self.checks
            .lock()
            .map_err(|e| WapmError::Sink(e.to_string()))?
            .push(CheckRun {
                summary: truncate_summary(&check.summary),
                ..check.clone()
            });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GitHub sink
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct IssueComment {
    id: u64,
    #[serde(default)]
    body: Option<String>,
}

/// Reports through the GitHub REST API.
pub struct GithubSink {
    api_url: String,
    token: String,
    http_client: reqwest::Client,
}

impl GithubSink {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Self::with_api_url(GITHUB_API_URL, token)
    }

    /// Point at a GitHub Enterprise (or test) API root.
    pub fn with_api_url(api_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("wapmetrics/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| WapmError::Sink(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            http_client,
        })
    }

    fn comments_url(&self, pr: &PullRequestRef) -> String {
        format!(
            "{}/repos/{}/{}/issues/{}/comments",
            self.api_url, pr.owner, pr.repo, pr.number
        )
    }

    fn comment_url(&self, pr: &PullRequestRef, id: u64) -> String {
        format!("{}/repos/{}/{}/issues/comments/{}", self.api_url, pr.owner, pr.repo, id)
    }

    fn check_runs_url(&self, pr: &PullRequestRef) -> String {
        format!("{}/repos/{}/{}/check-runs", self.api_url, pr.owner, pr.repo)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http_client
            .request(method, url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
    }

    async fn send(&self, builder: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        builder
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| WapmError::Sink(format!("{}: {}", what, e)))
    }
}

#[async_trait]
impl ReportSink for GithubSink {
    async fn upsert_comment(&self, pr: &PullRequestRef, marker: &str, body: &str) -> Result<u64> {
        let list = self
            .request(reqwest::Method::GET, &self.comments_url(pr))
            .query(&[("per_page", "100")]);
        let comments: Vec<IssueComment> = self
            .send(list, "listing comments")
            .await?
            .json()
            .await
            .map_err(|e| WapmError::Sink(format!("decoding comments: {}", e)))?;

        let existing = comments
            .iter()
            .find(|c| c.body.as_deref().map(|b| b.contains(marker)).unwrap_or(false));

        let response = match existing {
            Some(comment) => {
                debug!(comment_id = comment.id, "Updating sticky comment");
                let patch = self
                    .request(reqwest::Method::PATCH, &self.comment_url(pr, comment.id))
                    .json(&json!({ "body": body }));
                self.send(patch, "updating comment").await?
            }
            None => {
                debug!(pr = pr.number, "Creating sticky comment");
                let post = self
                    .request(reqwest::Method::POST, &self.comments_url(pr))
                    .json(&json!({ "body": body }));
                self.send(post, "creating comment").await?
            }
        };

        let saved: IssueComment = response
            .json()
            .await
            .map_err(|e| WapmError::Sink(format!("decoding comment: {}", e)))?;
        info!(comment_id = saved.id, pr = pr.number, "Status comment published");
        Ok(saved.id)
    }

    async fn set_check(&self, pr: &PullRequestRef, check: &CheckRun) -> Result<()> {
        let conclusion = if check.success { "success" } else { "failure" };
        let post = self
            .request(reqwest::Method::POST, &self.check_runs_url(pr))
            .json(&json!({
                "name": check.title,
                "head_sha": check.sha,
                "status": "completed",
                "conclusion": conclusion,
                "output": {
                    "title": check.title,
                    "summary": truncate_summary(&check.summary),
                },
            }));
        self.send(post, "creating check-run").await?;
        info!(sha = %check.sha, conclusion, "Check-run published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wapmetrics_core::STICKY_MARKER;

    fn pr() -> PullRequestRef {
        PullRequestRef {
            owner: "acme".to_string(),
            repo: "site".to_string(),
            number: 42,
        }
    }

    #[tokio::test]
    async fn test_memory_sink_upsert_is_idempotent() {
        let sink = MemorySink::new();
        let first = format!("{}\nfirst", STICKY_MARKER);
        let second = format!("{}\nsecond", STICKY_MARKER);

        let a = sink.upsert_comment(&pr(), STICKY_MARKER, &first).await.unwrap();
        let b = sink.upsert_comment(&pr(), STICKY_MARKER, &second).await.unwrap();

        assert_eq!(a, b);
        let comments = sink.comments();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].body, second);
    }

    #[tokio::test]
    async fn test_memory_sink_separates_prs() {
        let sink = MemorySink::new();
        let other = PullRequestRef { number: 7, ..pr() };
        sink.upsert_comment(&pr(), STICKY_MARKER, STICKY_MARKER).await.unwrap();
        sink.upsert_comment(&other, STICKY_MARKER, STICKY_MARKER).await.unwrap();
        assert_eq!(sink.comments().len(), 2);
    }

    #[tokio::test]
    async fn test_memory_sink_records_checks() {
        let sink = MemorySink::new();
        let check = CheckRun {
            sha: "abc123".to_string(),
            title: "Web Quality".to_string(),
            summary: "ok".to_string(),
            success: true,
        };
        sink.set_check(&pr(), &check).await.unwrap();
        assert_eq!(sink.checks(), vec![check]);
    }

    #[test]
    fn test_github_urls() {
        let sink = GithubSink::with_api_url("https://ghe.example.com/api/v3/", "t").unwrap();
        assert_eq!(
            sink.comments_url(&pr()),
            "https://ghe.example.com/api/v3/repos/acme/site/issues/42/comments"
        );
        assert_eq!(
            sink.comment_url(&pr(), 9),
            "https://ghe.example.com/api/v3/repos/acme/site/issues/comments/9"
        );
        assert_eq!(
            sink.check_runs_url(&pr()),
            "https://ghe.example.com/api/v3/repos/acme/site/check-runs"
        );
    }

    #[test]
    fn test_truncate_summary_respects_char_boundary() {
        let long = "é".repeat(CHECK_SUMMARY_LIMIT);
        let truncated = truncate_summary(&long);
        assert!(truncated.ends_with("_(truncated)_"));
        assert!(truncated.len() < long.len());
        assert_eq!(truncate_summary("short"), "short");
    }
}
