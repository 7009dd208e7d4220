//! Remote model registry client.
//!
//! `Registry` is the seam the resolver and the search endpoint talk to; the
//! production implementation speaks the Hugging Face Hub HTTP API.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::quantization::{display_name, extract_quantization, is_split_shard, shard_set};
use crate::error::{GatewayError, Result};

/// One file in a repository listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub path: String,
    pub size: Option<u64>,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoListing {
    /// Repository id with the registry's own casing
    pub repo: String,
    pub gated: bool,
    pub files: Vec<RemoteFile>,
}

impl RepoListing {
    pub fn gguf_files(&self) -> impl Iterator<Item = &RemoteFile> {
        self.files
            .iter()
            .filter(|f| f.path.to_ascii_lowercase().contains(".gguf"))
    }
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub text: String,
    pub limit: usize,
    pub include_restricted: bool,
}

/// One downloadable file surfaced by search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    /// Suggested identifier, `repo:file`
    pub id: String,
    pub name: String,
    pub repo: String,
    pub file: String,
    pub quantization: Option<String>,
    pub size_bytes: Option<u64>,
    pub size_gb: Option<f64>,
    pub requires_auth: bool,
    pub downloads: u64,
    pub likes: u64,
    pub tags: Vec<String>,
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Files in `repo`; `NotFound` when the registry does not know it
    async fn list_files(&self, repo: &str) -> Result<RepoListing>;

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ModelSummary>>;

    /// Direct download URL of `path` inside `repo`
    fn download_url(&self, repo: &str, path: &str) -> String;
}

pub struct HuggingFaceRegistry {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HubModel {
    id: String,
    #[serde(default)]
    gated: serde_json::Value,
    #[serde(default)]
    downloads: u64,
    #[serde(default)]
    likes: u64,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    siblings: Vec<HubSibling>,
}

#[derive(Debug, Deserialize)]
struct HubSibling {
    rfilename: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    lfs: Option<HubLfs>,
}

#[derive(Debug, Deserialize)]
struct HubLfs {
    sha256: Option<String>,
    size: Option<u64>,
}

impl HubSibling {
    fn size(&self) -> Option<u64> {
        self.lfs.as_ref().and_then(|l| l.size).or(self.size)
    }
}

/// Size of the model `sibling` opens. `None` when a split file is not the
/// first shard of a fully listed set.
fn loadable_size(siblings: &[HubSibling], sibling: &HubSibling) -> Option<Option<u64>> {
    if !is_split_shard(&sibling.rfilename) {
        return Some(sibling.size());
    }
    let shards = shard_set(&sibling.rfilename)?
        .iter()
        .map(|name| siblings.iter().find(|s| s.rfilename.eq_ignore_ascii_case(name)))
        .collect::<Option<Vec<_>>>()?;
    Some(shards.iter().map(|s| s.size()).sum())
}

fn is_gated(value: &serde_json::Value) -> bool {
    !matches!(value, serde_json::Value::Null | serde_json::Value::Bool(false))
}

impl HuggingFaceRegistry {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("modelgate/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl Registry for HuggingFaceRegistry {
    async fn list_files(&self, repo: &str) -> Result<RepoListing> {
        let url = format!("{}/api/models/{}?blobs=true", self.base_url, repo);
        debug!("Listing files for {} via {}", repo, url);

        let resp = self.authorize(self.client.get(&url)).send().await?;
        match resp.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => return Err(GatewayError::NotFound(repo.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(GatewayError::NotFound(format!(
                    "{} (repository requires authentication)",
                    repo
                )))
            }
            s => {
                let body = resp.text().await.unwrap_or_default();
                return Err(GatewayError::Upstream(format!(
                    "registry returned {} for {}: {}",
                    s, repo, body
                )));
            }
        }

        let model: HubModel = resp
            .json()
            .await
            .map_err(|e| GatewayError::Upstream(format!("malformed listing for {}: {}", repo, e)))?;

        let files = model
            .siblings
            .into_iter()
            .map(|s| {
                let (sha256, lfs_size) = match s.lfs {
                    Some(lfs) => (lfs.sha256, lfs.size),
                    None => (None, None),
                };
                RemoteFile {
                    path: s.rfilename,
                    size: lfs_size.or(s.size),
                    sha256,
                }
            })
            .collect();

        Ok(RepoListing {
            repo: model.id,
            gated: is_gated(&model.gated),
            files,
        })
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ModelSummary>> {
        let limit = query.limit.to_string();
        let mut params = vec![
            ("search", query.text.as_str()),
            ("limit", limit.as_str()),
            ("filter", "gguf"),
            ("full", "true"),
        ];
        if query.include_restricted && self.token.is_some() {
            params.push(("include_gated", "true"));
        }

        let url = format!("{}/api/models", self.base_url);
        let resp = self
            .authorize(self.client.get(&url).query(&params))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!("Registry search failed ({}): {}", status, body);
            return Err(GatewayError::Upstream(format!(
                "registry search returned {}",
                status
            )));
        }

        let models: Vec<HubModel> = resp
            .json()
            .await
            .map_err(|e| GatewayError::Upstream(format!("malformed search response: {}", e)))?;

        let mut results = Vec::new();
        for model in models {
            let gated = is_gated(&model.gated);
            if gated && !query.include_restricted {
                continue;
            }
            for sibling in &model.siblings {
                let path = &sibling.rfilename;
                if !path.to_ascii_lowercase().ends_with(".gguf") {
                    continue;
                }
                let size = match loadable_size(&model.siblings, sibling) {
                    Some(size) => size,
                    None => continue,
                };
                results.push(ModelSummary {
                    id: format!("{}:{}", model.id, path),
                    name: display_name(&model.id, path),
                    repo: model.id.clone(),
                    file: path.clone(),
                    quantization: extract_quantization(path),
                    size_bytes: size,
                    size_gb: size.map(|b| (b as f64 / 1_073_741_824.0 * 100.0).round() / 100.0),
                    requires_auth: gated,
                    downloads: model.downloads,
                    likes: model.likes,
                    tags: model.tags.clone(),
                });
            }
        }
        results.truncate(query.limit);
        Ok(results)
    }

    fn download_url(&self, repo: &str, path: &str) -> String {
        format!("{}/{}/resolve/main/{}", self.base_url, repo, path)
    }
}
