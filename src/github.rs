//! GitHub REST client for issue and pull-request operations.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

const USER_AGENT: &str = concat!("overseer/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Deserialize)]
pub struct Issue {
    pub number: i64,
    pub title: String,
    #[serde(default)]
    pub labels: Vec<Label>,
    pub state: String,
}

impl Issue {
    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|l| l.name == name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Label {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub number: i64,
    pub title: String,
    pub state: String,
    #[serde(default)]
    pub draft: bool,
}

/// Issue-tracker operations the engine and reconciler depend on. Split out
/// as a trait so tests can run against a scripted tracker instead of the
/// network.
#[async_trait]
pub trait IssueClient: Send + Sync {
    async fn get_issue(&self, repo: &str, number: i64) -> Result<Issue>;

    /// Open issues carrying the given label, oldest first.
    async fn list_open_issues_with_label(&self, repo: &str, label: &str) -> Result<Vec<Issue>>;

    async fn add_label(&self, repo: &str, number: i64, label: &str) -> Result<()>;

    async fn remove_label(&self, repo: &str, number: i64, label: &str) -> Result<()>;

    async fn post_comment(&self, repo: &str, number: i64, body: &str) -> Result<()>;

    async fn close_issue(&self, repo: &str, number: i64) -> Result<()>;

    /// The open pull request whose head is the given branch, if any.
    async fn find_pull_request(&self, repo: &str, branch: &str) -> Result<Option<PullRequest>>;

    async fn merge_pull_request(&self, repo: &str, number: i64) -> Result<()>;
}

pub struct GitHubClient {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

impl GitHubClient {
    pub fn new(api_url: String, token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_url, path))
            .bearer_auth(&self.token)
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json")
    }
}

#[async_trait]
impl IssueClient for GitHubClient {
    async fn get_issue(&self, repo: &str, number: i64) -> Result<Issue> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/repos/{}/issues/{}", repo, number))
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}#{}", repo, number))?
            .error_for_status()
            .with_context(|| format!("GitHub rejected fetch of {}#{}", repo, number))?;
        resp.json().await.context("Failed to parse issue response")
    }

    async fn list_open_issues_with_label(&self, repo: &str, label: &str) -> Result<Vec<Issue>> {
        let mut issues = Vec::new();
        let mut page = 1u32;
        loop {
            let batch: Vec<Issue> = self
                .request(reqwest::Method::GET, &format!("/repos/{}/issues", repo))
                .query(&[
                    ("state", "open"),
                    ("labels", label),
                    ("sort", "created"),
                    ("direction", "asc"),
                    ("per_page", "100"),
                    ("page", &page.to_string()),
                ])
                .send()
                .await
                .with_context(|| format!("Failed to list issues for {}", repo))?
                .error_for_status()
                .with_context(|| format!("GitHub rejected issue list for {}", repo))?
                .json()
                .await
                .context("Failed to parse issue list")?;

            let done = batch.len() < 100;
            issues.extend(batch);
            if done {
                break;
            }
            page += 1;
        }
        Ok(issues)
    }

    async fn add_label(&self, repo: &str, number: i64, label: &str) -> Result<()> {
        self.request(
            reqwest::Method::POST,
            &format!("/repos/{}/issues/{}/labels", repo, number),
        )
        .json(&json!({ "labels": [label] }))
        .send()
        .await
        .with_context(|| format!("Failed to add label {} to {}#{}", label, repo, number))?
        .error_for_status()
        .with_context(|| format!("GitHub rejected label add on {}#{}", repo, number))?;
        Ok(())
    }

    async fn remove_label(&self, repo: &str, number: i64, label: &str) -> Result<()> {
        let resp = self
            .request(
                reqwest::Method::DELETE,
                &format!("/repos/{}/issues/{}/labels/{}", repo, number, label),
            )
            .send()
            .await
            .with_context(|| format!("Failed to remove label {} from {}#{}", label, repo, number))?;
        // Removing a label that is already gone is not an error.
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        resp.error_for_status()
            .with_context(|| format!("GitHub rejected label removal on {}#{}", repo, number))?;
        Ok(())
    }

    async fn post_comment(&self, repo: &str, number: i64, body: &str) -> Result<()> {
        self.request(
            reqwest::Method::POST,
            &format!("/repos/{}/issues/{}/comments", repo, number),
        )
        .json(&json!({ "body": body }))
        .send()
        .await
        .with_context(|| format!("Failed to comment on {}#{}", repo, number))?
        .error_for_status()
        .with_context(|| format!("GitHub rejected comment on {}#{}", repo, number))?;
        Ok(())
    }

    async fn close_issue(&self, repo: &str, number: i64) -> Result<()> {
        self.request(
            reqwest::Method::PATCH,
            &format!("/repos/{}/issues/{}", repo, number),
        )
        .json(&json!({ "state": "closed" }))
        .send()
        .await
        .with_context(|| format!("Failed to close {}#{}", repo, number))?
        .error_for_status()
        .with_context(|| format!("GitHub rejected closing {}#{}", repo, number))?;
        Ok(())
    }

    async fn find_pull_request(&self, repo: &str, branch: &str) -> Result<Option<PullRequest>> {
        let owner = repo.split('/').next().unwrap_or(repo);
        let mut prs: Vec<PullRequest> = self
            .request(reqwest::Method::GET, &format!("/repos/{}/pulls", repo))
            .query(&[("state", "open"), ("head", &format!("{}:{}", owner, branch))])
            .send()
            .await
            .with_context(|| format!("Failed to list pull requests for {}", repo))?
            .error_for_status()
            .with_context(|| format!("GitHub rejected pull request list for {}", repo))?
            .json()
            .await
            .context("Failed to parse pull request list")?;
        Ok(if prs.is_empty() { None } else { Some(prs.remove(0)) })
    }

    async fn merge_pull_request(&self, repo: &str, number: i64) -> Result<()> {
        self.request(
            reqwest::Method::PUT,
            &format!("/repos/{}/pulls/{}/merge", repo, number),
        )
        .json(&json!({ "merge_method": "squash" }))
        .send()
        .await
        .with_context(|| format!("Failed to merge {}#{}", repo, number))?
        .error_for_status()
        .with_context(|| format!("GitHub rejected merge of {}#{}", repo, number))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_label_lookup() {
        let issue: Issue = serde_json::from_value(serde_json::json!({
            "number": 7,
            "title": "Fix the widget",
            "state": "open",
            "labels": [{"name": "plan"}, {"name": "bug"}],
        }))
        .unwrap();
        assert!(issue.has_label("plan"));
        assert!(!issue.has_label("blocked"));
    }

    #[test]
    fn test_issue_parses_without_labels() {
        let issue: Issue = serde_json::from_value(serde_json::json!({
            "number": 3,
            "title": "No labels yet",
            "state": "open",
        }))
        .unwrap();
        assert!(issue.labels.is_empty());
    }

    #[test]
    fn test_api_url_trailing_slash_is_normalized() {
        let client = GitHubClient::new("https://api.github.com/".to_string(), "t".to_string());
        assert_eq!(client.api_url, "https://api.github.com");
    }
}
