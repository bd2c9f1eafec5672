// GitHub remote client over the REST contents API.
//
// Each file is written with `PUT /repos/{owner}/{repo}/contents/{path}`,
// which creates one commit per file. A 409/422 on a path that already
// exists means an earlier attempt landed; the file's latest commit is
// looked up and reported as applied.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, RETRY_AFTER};
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

use super::error::CommitError;
use super::remote::{CommitReceipt, CommitRequest, FileChange, FileOutcome, RemoteRepositoryClient};
use super::target::TargetSpec;
use crate::config::GithubConfig;

const API_VERSION: &str = "2022-11-28";
const CLIENT_USER_AGENT: &str = concat!("chatlogd/", env!("CARGO_PKG_VERSION"));
const MAX_REASON_CHARS: usize = 200;

#[derive(Debug, Deserialize)]
struct PutContentsResponse {
    commit: CommitRef,
}

#[derive(Debug, Deserialize)]
struct CommitRef {
    sha: String,
}

#[derive(Debug, Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    api_url: Url,
    token: Option<String>,
}

impl GithubClient {
    pub fn new(api_url: &str, token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let api_url = Url::parse(api_url).with_context(|| format!("invalid GitHub API url `{api_url}`"))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(CLIENT_USER_AGENT)
            .build()
            .context("failed to build GitHub HTTP client")?;
        Ok(Self { http, api_url, token })
    }

    /// Build from config, reading the token from the configured env var.
    pub fn from_config(config: &GithubConfig, timeout: Duration) -> anyhow::Result<Self> {
        let token = std::env::var(&config.token_env).ok().filter(|t| !t.trim().is_empty());
        if token.is_none() {
            warn!(
                token_env = %config.token_env,
                "no GitHub token in environment; commits will fail with auth errors"
            );
        }
        Self::new(&config.api_url, token, timeout)
    }

    async fn commit_files(
        &self,
        target: &TargetSpec,
        request: CommitRequest,
    ) -> Result<CommitReceipt, CommitError> {
        if request.files.is_empty() {
            return Err(CommitError::Fatal { reason: "commit request has no files".into() });
        }

        let mut outcomes = BTreeMap::new();
        let mut last_commit: Option<String> = None;
        let mut first_error: Option<CommitError> = None;
        let mut halted: Option<String> = None;

        for file in &request.files {
            if let Some(reason) = &halted {
                outcomes.insert(
                    file.path.clone(),
                    FileOutcome::Failed {
                        error: CommitError::Transient { reason: format!("not attempted: {reason}") },
                    },
                );
                continue;
            }

            match self.put_file(target, file, &request.message, &request.idempotency_key).await {
                Ok(commit_id) => {
                    outcomes.insert(file.path.clone(), FileOutcome::Applied { commit_id: commit_id.clone() });
                    last_commit = Some(commit_id);
                }
                Err(error) => {
                    outcomes.insert(file.path.clone(), FileOutcome::Failed { error: error.clone() });
                    // Later files would hit the same wall.
                    if matches!(
                        error,
                        CommitError::Auth { .. } | CommitError::Fatal { .. } | CommitError::RateLimited { .. }
                    ) {
                        halted = Some(error.to_string());
                    }
                    first_error.get_or_insert(error);
                }
            }
        }

        match (last_commit, first_error) {
            (Some(commit_id), _) => Ok(CommitReceipt { commit_id, files: outcomes }),
            (None, Some(error)) => Err(error),
            (None, None) => Err(CommitError::Fatal { reason: "no file outcome recorded".into() }),
        }
    }

    async fn put_file(
        &self,
        target: &TargetSpec,
        file: &FileChange,
        message: &str,
        idempotency_key: &str,
    ) -> Result<String, CommitError> {
        let mut segments = vec!["repos", target.owner.as_str(), target.repo.as_str(), "contents"];
        segments.extend(file.path.split('/'));
        let url = self.endpoint(&segments)?;

        let body = json!({
            "message": message,
            "content": STANDARD.encode(file.content.as_bytes()),
            "branch": target.branch,
        });
        let response = self
            .authorized(self.http.put(url))
            .header("Idempotency-Key", idempotency_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            let parsed: PutContentsResponse = response.json().await.map_err(|error| {
                CommitError::Ambiguous { reason: format!("unreadable commit response: {error}") }
            })?;
            debug!(path = %file.path, commit_id = %parsed.commit.sha, "file committed");
            return Ok(parsed.commit.sha);
        }

        let headers = response.headers().clone();
        let text = response.text().await.unwrap_or_default();
        if matches!(status, StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY) {
            if let Some(commit_id) = self.latest_commit_for(target, &file.path).await? {
                info!(
                    repo = %target.full_name(),
                    path = %file.path,
                    commit_id = %commit_id,
                    "file already present on remote; treating as applied"
                );
                return Ok(commit_id);
            }
            if status == StatusCode::CONFLICT {
                return Err(CommitError::Transient { reason: format!("409 Conflict: {}", truncate(&text)) });
            }
        }
        Err(classify_status(status, &headers, &text))
    }

    /// Most recent commit on the target branch touching `path`, if any.
    async fn latest_commit_for(
        &self,
        target: &TargetSpec,
        path: &str,
    ) -> Result<Option<String>, CommitError> {
        let mut url = self.endpoint(&["repos", target.owner.as_str(), target.repo.as_str(), "commits"])?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("sha", &target.branch)
            .append_pair("per_page", "1");

        let response = self.authorized(self.http.get(url)).send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &headers, &text));
        }
        let commits: Vec<CommitRef> = response.json().await.map_err(|error| CommitError::Transient {
            reason: format!("unreadable commit listing: {error}"),
        })?;
        Ok(commits.into_iter().next().map(|c| c.sha))
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, CommitError> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|()| CommitError::Fatal { reason: format!("unusable API url `{}`", self.api_url) })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION);
        match &self.token {
            Some(token) => builder.header(AUTHORIZATION, format!("Bearer {token}")),
            None => builder,
        }
    }
}

impl RemoteRepositoryClient for GithubClient {
    fn commit(
        &self,
        target: &TargetSpec,
        request: CommitRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CommitReceipt, CommitError>> + Send>> {
        let client = self.clone();
        let target = target.clone();
        Box::pin(async move { client.commit_files(&target, request).await })
    }
}

// ── Classification ──────────────────────────────────────────────────

/// Map a non-success response onto the commit error taxonomy.
pub fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> CommitError {
    let reason = format!("{status}: {}", truncate(body));
    let rate_limited = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "0")
        || headers.contains_key(RETRY_AFTER);

    match status {
        StatusCode::TOO_MANY_REQUESTS => CommitError::RateLimited { retry_after: retry_after(headers) },
        StatusCode::FORBIDDEN if rate_limited => {
            CommitError::RateLimited { retry_after: retry_after(headers) }
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CommitError::Auth { reason },
        StatusCode::NOT_FOUND => CommitError::Fatal { reason },
        StatusCode::REQUEST_TIMEOUT => CommitError::Transient { reason },
        s if s.is_server_error() => CommitError::Transient { reason },
        _ => CommitError::Fatal { reason },
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    if let Some(secs) = headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        return Some(Duration::from_secs(secs));
    }
    let reset = headers
        .get("x-ratelimit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())?;
    let wait = reset - chrono::Utc::now().timestamp();
    u64::try_from(wait).ok().map(Duration::from_secs)
}

fn transport_error(error: reqwest::Error) -> CommitError {
    let reason = error.to_string();
    if error.is_timeout() {
        CommitError::Ambiguous { reason }
    } else if error.is_connect() {
        CommitError::Transient { reason }
    } else if error.is_builder() {
        CommitError::Fatal { reason }
    } else {
        // The request may have reached the remote before the failure.
        CommitError::Ambiguous { reason }
    }
}

fn truncate(body: &str) -> String {
    let mut preview: String = body.chars().take(MAX_REASON_CHARS).collect();
    if body.chars().count() > MAX_REASON_CHARS {
        preview.push_str("...");
    }
    preview
}
