//! GitHub Issues backend.
//!
//! Talks to the REST API with an async `reqwest` client driven from a
//! private runtime, so callers stay synchronous.

use anyhow::Context;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::{Value, json};
use url::Url;

use crate::error::TrackingError;

use super::backend::{IssueBackend, IssueDraft, IssueHandle};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

const PAGE_SIZE: usize = 100;
const MAX_SEARCH_PAGES: usize = 10;

pub struct GithubIssueBackend {
    issues_url: Url,
    token: Option<String>,
    client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
}

impl GithubIssueBackend {
    /// `repository` is `owner/repo`.
    pub fn new(api_url: &str, repository: &str, token: Option<String>) -> anyhow::Result<Self> {
        let (owner, repo) = parse_repository(repository)?;
        let issues_url = issues_url(api_url, &owner, &repo)?;

        let client = reqwest::Client::builder()
            .user_agent(concat!("relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        let runtime = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;

        Ok(Self {
            issues_url,
            token,
            client,
            runtime,
        })
    }

    fn issue_url(&self, id: &str) -> Result<Url, TrackingError> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
            return Err(TrackingError::UnknownIssue(id.to_string()));
        }
        let mut url = self.issues_url.clone();
        url.path_segments_mut()
            .map_err(|_| TrackingError::State(format!("invalid issues URL {}", self.issues_url)))?
            .push(id);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(request: RequestBuilder) -> Result<Value, TrackingError> {
        let response = request
            .send()
            .await
            .map_err(|e| TrackingError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(TrackingError::Unavailable(format!("HTTP {status}")));
        }
        if status == StatusCode::NOT_FOUND {
            return Err(TrackingError::Rejected(format!(
                "HTTP {status}; check the repository name and token scope"
            )));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TrackingError::Rejected(format!("HTTP {status}: {text}")));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| TrackingError::Unavailable(format!("unreadable response: {e}")))
    }
}

impl IssueBackend for GithubIssueBackend {
    fn create(&self, draft: &IssueDraft) -> Result<IssueHandle, TrackingError> {
        let request = self.request(Method::POST, self.issues_url.clone()).json(&json!({
            "title": draft.title,
            "body": draft.body,
            "labels": draft.labels,
        }));
        let created = self.runtime.block_on(Self::send(request))?;

        let number = created
            .get("number")
            .and_then(Value::as_u64)
            .ok_or_else(|| TrackingError::Unavailable("response has no issue number".into()))?;

        Ok(IssueHandle {
            id: number.to_string(),
            url: created
                .get("html_url")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    fn update(&self, id: &str, draft: &IssueDraft) -> Result<(), TrackingError> {
        let request = self.request(Method::PATCH, self.issue_url(id)?).json(&json!({
            "title": draft.title,
            "body": draft.body,
        }));
        self.runtime.block_on(Self::send(request)).map(|_| ())
    }

    fn is_open(&self, id: &str) -> Result<bool, TrackingError> {
        let request = self.request(Method::GET, self.issue_url(id)?);
        let issue = self.runtime.block_on(Self::send(request))?;
        Ok(issue.get("state").and_then(Value::as_str) == Some("open"))
    }

    fn close(&self, id: &str) -> Result<(), TrackingError> {
        let request = self
            .request(Method::PATCH, self.issue_url(id)?)
            .json(&json!({ "state": "closed" }));
        self.runtime.block_on(Self::send(request)).map(|_| ())
    }

    fn find_open(&self, title: &str) -> Result<Option<IssueHandle>, TrackingError> {
        for page in 1..=MAX_SEARCH_PAGES {
            let mut url = self.issues_url.clone();
            url.query_pairs_mut()
                .append_pair("state", "open")
                .append_pair("per_page", &PAGE_SIZE.to_string())
                .append_pair("page", &page.to_string());
            let listed = self
                .runtime
                .block_on(Self::send(self.request(Method::GET, url)))?;
            let issues = listed.as_array().cloned().unwrap_or_default();

            if let Some(handle) = issues.iter().find_map(|issue| open_issue_titled(issue, title)) {
                return Ok(Some(handle));
            }
            if issues.len() < PAGE_SIZE {
                break;
            }
        }
        Ok(None)
    }
}

// The issues endpoint also lists pull requests
fn open_issue_titled(issue: &Value, title: &str) -> Option<IssueHandle> {
    if issue.get("pull_request").is_some()
        || issue.get("title").and_then(Value::as_str) != Some(title)
    {
        return None;
    }
    let number = issue.get("number").and_then(Value::as_u64)?;
    Some(IssueHandle {
        id: number.to_string(),
        url: issue
            .get("html_url")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// Parse `owner/repo`.
fn parse_repository(repository: &str) -> anyhow::Result<(String, String)> {
    let parts: Vec<&str> = repository.trim().split('/').collect();
    if parts.len() != 2 || parts.iter().any(|p| p.is_empty()) {
        anyhow::bail!("Invalid GitHub repository '{}': expected owner/repo", repository);
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

fn issues_url(api_url: &str, owner: &str, repo: &str) -> anyhow::Result<Url> {
    let mut base =
        Url::parse(api_url).with_context(|| format!("Invalid GitHub API URL: {}", api_url))?;

    // `join` replaces the last segment unless the base ends with a slash
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }

    base.join(&format!("repos/{}/{}/issues", owner, repo))
        .with_context(|| format!("Invalid GitHub API URL: {}", api_url))
}
