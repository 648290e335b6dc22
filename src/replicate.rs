//! Best-effort remote backup of flushed documents.
//!
//! A push reads the file's current revision (`sha`) on the remote and then
//! submits a create-or-update carrying the new content and that revision.
//! Failures are reported, never retried.

use anyhow::Result;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

use crate::config::GithubConfig;
use crate::logging::ts_now;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{detail}")]
pub struct PushError {
    pub status: Option<u16>,
    pub detail: String,
}

impl PushError {
    fn network(err: reqwest::Error) -> Self {
        Self { status: err.status().map(|s| s.as_u16()), detail: err.to_string() }
    }
}

/// Outcome of the latest push for a document, annexed to write responses.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationReport {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: String,
}

impl ReplicationReport {
    pub fn from_result(result: &std::result::Result<Option<String>, PushError>) -> Self {
        match result {
            Ok(commit) => Self {
                ok: true,
                status: None,
                commit: commit.clone(),
                error: None,
                at: ts_now(),
            },
            Err(e) => Self {
                ok: false,
                status: e.status,
                commit: None,
                error: Some(e.detail.clone()),
                at: ts_now(),
            },
        }
    }
}

#[async_trait]
pub trait Replicator: Send + Sync {
    /// Push `content` as the backup of document `doc`. Returns the remote
    /// commit id when the backend reports one.
    async fn push(&self, doc: &str, content: &str)
        -> std::result::Result<Option<String>, PushError>;
}

/// GitHub contents API (`/repos/{repo}/contents/{path}`).
pub struct GithubReplicator {
    client: Client,
    api_base: String,
    repo: String,
    branch: String,
    path_prefix: String,
    token: String,
}

#[derive(Deserialize, Debug)]
struct ContentsEntry {
    sha: String,
}

#[derive(Deserialize, Debug)]
struct PutResponse {
    commit: Option<CommitRef>,
}

#[derive(Deserialize, Debug)]
struct CommitRef {
    sha: String,
}

impl GithubReplicator {
    /// `None` unless backup is enabled and fully configured.
    pub fn from_config(cfg: &GithubConfig) -> Result<Option<Self>> {
        let (Some(token), Some(repo)) = (cfg.token.clone(), cfg.repo.clone()) else {
            return Ok(None);
        };
        if !cfg.enabled {
            return Ok(None);
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(concat!("worldrelay/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Some(Self {
            client,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            repo,
            branch: cfg.branch.clone(),
            path_prefix: cfg.path_prefix.trim_matches('/').to_string(),
            token,
        }))
    }

    fn remote_path(&self, doc: &str) -> String {
        if self.path_prefix.is_empty() {
            format!("{}.json", doc)
        } else {
            format!("{}/{}.json", self.path_prefix, doc)
        }
    }

    fn contents_url(&self, doc: &str) -> String {
        format!("{}/repos/{}/contents/{}", self.api_base, self.repo, self.remote_path(doc))
    }

    async fn current_sha(&self, url: &str) -> std::result::Result<Option<String>, PushError> {
        let resp = self
            .client
            .get(url)
            .query(&[("ref", self.branch.as_str())])
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(PushError::network)?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let entry: ContentsEntry = resp.json().await.map_err(PushError::network)?;
                Ok(Some(entry.sha))
            }
            s => Err(PushError {
                status: Some(s.as_u16()),
                detail: format!("revision lookup failed: {}", s),
            }),
        }
    }
}

#[async_trait]
impl Replicator for GithubReplicator {
    async fn push(
        &self,
        doc: &str,
        content: &str,
    ) -> std::result::Result<Option<String>, PushError> {
        let url = self.contents_url(doc);
        let sha = self.current_sha(&url).await?;

        let mut body = json!({
            "message": format!("backup {} at {}", self.remote_path(doc), ts_now()),
            "content": STANDARD.encode(content.as_bytes()),
            "branch": self.branch,
        });
        if let Some(sha) = sha {
            body["sha"] = json!(sha);
        }

        let resp = self
            .client
            .put(&url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .await
            .map_err(PushError::network)?;
        let status = resp.status();
        if !status.is_success() {
            let detail = match status {
                StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
                    "revision conflict".to_string()
                }
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => "not authorized".to_string(),
                s => format!("update failed: {}", s),
            };
            return Err(PushError { status: Some(status.as_u16()), detail });
        }
        let parsed: PutResponse = resp.json().await.map_err(PushError::network)?;
        Ok(parsed.commit.map(|c| c.sha))
    }
}
