//! Identifier → artifact resolution with a read-through listing cache.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::future::Cache;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::identifier::{FileSelector, ModelIdentifier};
use super::quantization::{
    extract_quantization, is_split_shard, matches_quantization, quantization_variants, shard_set,
};
use super::registry::{ModelSummary, Registry, RemoteFile, RepoListing, SearchQuery};
use crate::error::{GatewayError, Result};

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub download_dir: PathBuf,
    pub cache_ttl: Duration,
    pub default_quantization: String,
    pub max_identifier_len: usize,
}

/// Concrete artifact an identifier resolved to. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    /// `repo:file` in canonical lower case
    pub resolved_id: String,
    pub repo: String,
    pub file: String,
    pub quantization: Option<String>,
    pub size_bytes: Option<u64>,
    pub sha256: Option<String>,
    pub source_url: String,
    /// Where the artifact lives once downloaded
    pub destination: PathBuf,
    /// Set when the artifact already existed at resolution time
    pub local_path: Option<PathBuf>,
    pub resolved_at: DateTime<Utc>,
    /// Remaining shards of a split model, kept in the same directory as
    /// `destination`. Empty for single-file models.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub companions: Vec<CatalogEntry>,
}

impl CatalogEntry {
    /// Same artifact stored at `destination`; shards follow it into the new
    /// directory under their own names.
    pub fn with_destination(&self, destination: PathBuf) -> Self {
        let dir = destination.parent().map(Path::to_path_buf).unwrap_or_default();
        let companions = self
            .companions
            .iter()
            .map(|shard| {
                let name = Path::new(&shard.file)
                    .file_name()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(&shard.file));
                shard.with_destination(dir.join(name))
            })
            .collect();
        let local_path = destination.is_file().then(|| destination.clone());
        Self {
            destination,
            local_path,
            companions,
            ..self.clone()
        }
    }

    pub fn is_split(&self) -> bool {
        !self.companions.is_empty()
    }

    /// Bytes across every shard, when the registry reported them all
    pub fn total_size(&self) -> Option<u64> {
        std::iter::once(self)
            .chain(&self.companions)
            .map(|e| e.size_bytes)
            .sum()
    }
}

/// Directory that holds every file of `repo`
pub fn repo_dir(download_dir: &Path, repo: &str) -> PathBuf {
    download_dir.join(repo.replace('/', "_"))
}

pub struct Resolver {
    registry: Arc<dyn Registry>,
    listings: Cache<String, Arc<RepoListing>>,
    preferred: DashMap<String, String>,
    config: ResolverConfig,
}

impl Resolver {
    pub fn new(registry: Arc<dyn Registry>, config: ResolverConfig) -> Self {
        let listings = Cache::builder()
            .max_capacity(1024)
            .time_to_live(config.cache_ttl)
            .build();
        Self {
            registry,
            listings,
            preferred: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Boundary validation only; never touches the network.
    pub fn parse(&self, raw: &str) -> Result<ModelIdentifier> {
        ModelIdentifier::parse(raw, self.config.max_identifier_len)
    }

    pub async fn resolve(&self, raw: &str) -> Result<Arc<CatalogEntry>> {
        let identifier = self.parse(raw)?;
        self.resolve_identifier(&identifier).await
    }

    pub async fn resolve_identifier(&self, identifier: &ModelIdentifier) -> Result<Arc<CatalogEntry>> {
        let repo = identifier.repo().to_string();
        let registry = self.registry.clone();
        let lookup = self
            .listings
            .try_get_with(repo.clone(), async move {
                registry.list_files(&repo).await.map(Arc::new)
            })
            .await;

        let listing = match lookup {
            Ok(listing) => listing,
            Err(err) => {
                let err = (*err).clone();
                if matches!(err, GatewayError::Upstream(_) | GatewayError::RequestTimeout(_)) {
                    if let Some(entry) = self.resolve_local(identifier) {
                        warn!(
                            "Registry unavailable ({}), using local copy of {}",
                            err, entry.resolved_id
                        );
                        return Ok(Arc::new(entry));
                    }
                }
                return Err(err);
            }
        };

        let preferred = self.preferred.get(identifier.repo()).map(|q| q.value().clone());
        let file = select_file(
            &listing,
            identifier.selector(),
            preferred.as_deref(),
            &self.config.default_quantization,
        )
        .ok_or_else(|| GatewayError::NotFound(format!("no matching GGUF file for {}", identifier)))?;

        let entry = self.entry_for(&listing, file);
        debug!("Resolved {} -> {}", identifier, entry.resolved_id);
        Ok(Arc::new(entry))
    }

    /// Record the quantization that was actually served for `repo`, so a later
    /// bare `repo` identifier keeps resolving to the same file.
    pub fn remember_quantization(&self, repo: &str, quantization: &str) {
        let repo = repo.to_ascii_lowercase();
        let quantization = quantization.to_ascii_lowercase();
        if self.preferred.get(&repo).map(|q| *q == quantization).unwrap_or(false) {
            return;
        }
        info!("Preferring {} for {}", quantization, repo);
        self.preferred.insert(repo, quantization);
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<ModelSummary>> {
        debug!("Searching registry for {:?} (limit {})", query.text, query.limit);
        self.registry.search(query).await
    }

    pub async fn invalidate(&self, repo: &str) {
        self.listings.invalidate(&repo.to_ascii_lowercase()).await;
    }

    fn entry_for(&self, listing: &RepoListing, file: &RemoteFile) -> CatalogEntry {
        let companions = shard_set(&file.path)
            .map(|names| {
                names
                    .iter()
                    .skip(1)
                    .filter_map(|name| listing.files.iter().find(|f| f.path.eq_ignore_ascii_case(name)))
                    .map(|shard| self.file_entry(&listing.repo, shard, Vec::new()))
                    .collect()
            })
            .unwrap_or_default();
        self.file_entry(&listing.repo, file, companions)
    }

    fn file_entry(&self, repo: &str, file: &RemoteFile, companions: Vec<CatalogEntry>) -> CatalogEntry {
        let destination = repo_dir(&self.config.download_dir, repo).join(&file.path);
        let local_path = destination.is_file().then(|| destination.clone());
        CatalogEntry {
            resolved_id: format!("{}:{}", repo, file.path).to_ascii_lowercase(),
            repo: repo.to_string(),
            file: file.path.clone(),
            quantization: extract_quantization(&file.path),
            size_bytes: file.size,
            sha256: file.sha256.clone(),
            source_url: self.registry.download_url(repo, &file.path),
            destination,
            local_path,
            resolved_at: Utc::now(),
            companions,
        }
    }

    /// Offline fallback for exact-file identifiers already on disk. A split
    /// model qualifies only when every shard is present.
    fn resolve_local(&self, identifier: &ModelIdentifier) -> Option<CatalogEntry> {
        let file = match identifier.selector() {
            Some(FileSelector::File(file)) => file,
            _ => return None,
        };
        let dir = find_case_insensitive(&self.config.download_dir, &identifier.repo().replace('/', "_"))?;
        let path = file
            .split('/')
            .try_fold(dir, |parent, segment| find_case_insensitive(&parent, segment))?;

        let companions = match shard_set(file) {
            Some(names) => {
                let parent = path.parent()?;
                names
                    .iter()
                    .skip(1)
                    .map(|name| {
                        let shard_name = name.rsplit('/').next().unwrap_or(name);
                        let shard_path = find_case_insensitive(parent, shard_name)?;
                        let id = format!("{}:{}", identifier.repo(), name).to_ascii_lowercase();
                        self.local_entry(identifier.repo(), name, id, shard_path, Vec::new())
                    })
                    .collect::<Option<Vec<_>>>()?
            }
            None if is_split_shard(file) => return None,
            None => Vec::new(),
        };
        self.local_entry(identifier.repo(), file, identifier.to_string(), path, companions)
    }

    fn local_entry(
        &self,
        repo: &str,
        file: &str,
        resolved_id: String,
        path: PathBuf,
        companions: Vec<CatalogEntry>,
    ) -> Option<CatalogEntry> {
        let size = std::fs::metadata(&path).ok()?.len();
        Some(CatalogEntry {
            resolved_id,
            repo: repo.to_string(),
            file: file.to_string(),
            quantization: extract_quantization(file),
            size_bytes: Some(size),
            sha256: None,
            source_url: self.registry.download_url(repo, file),
            destination: path.clone(),
            local_path: Some(path),
            resolved_at: Utc::now(),
            companions,
        })
    }
}

fn find_case_insensitive(parent: &Path, name: &str) -> Option<PathBuf> {
    let exact = parent.join(name);
    if exact.exists() {
        return Some(exact);
    }
    std::fs::read_dir(parent)
        .ok()?
        .flatten()
        .find(|e| e.file_name().to_string_lossy().eq_ignore_ascii_case(name))
        .map(|e| e.path())
}

/// Deterministic file choice for a listing.
///
/// Exact paths match case-insensitively, falling back to the bare file name.
/// Quantization tags try their `_m`/`_s`/`_l` variants. With no selector the
/// repo's preferred quantization wins, then the default quantization, then the
/// first GGUF by path. Single files beat split sets at every step; a split
/// model is chosen by its first shard and only when every shard is listed.
pub fn select_file<'a>(
    listing: &'a RepoListing,
    selector: Option<&FileSelector>,
    preferred: Option<&str>,
    default_quantization: &str,
) -> Option<&'a RemoteFile> {
    let mut candidates: Vec<&RemoteFile> = listing
        .gguf_files()
        .filter(|f| f.path.to_ascii_lowercase().ends_with(".gguf"))
        .collect();
    candidates.sort_by(|a, b| a.path.cmp(&b.path));

    let loadable = |wanted: &dyn Fn(&RemoteFile) -> bool| -> Option<&'a RemoteFile> {
        candidates
            .iter()
            .copied()
            .find(|f| !is_split_shard(&f.path) && wanted(*f))
            .or_else(|| {
                candidates
                    .iter()
                    .copied()
                    .find(|f| wanted(*f) && is_complete_set(&candidates, *f))
            })
    };
    let by_tag = |tag: &str| -> Option<&'a RemoteFile> {
        quantization_variants(tag)
            .iter()
            .find_map(|variant| loadable(&|f| matches_quantization(&f.path, variant)))
    };

    let selected = match selector {
        Some(FileSelector::File(file)) => candidates
            .iter()
            .copied()
            .find(|f| f.path.eq_ignore_ascii_case(file))
            .or_else(|| {
                candidates.iter().copied().find(|f| {
                    f.path
                        .rsplit('/')
                        .next()
                        .map(|name| name.eq_ignore_ascii_case(file))
                        .unwrap_or(false)
                })
            }),
        Some(FileSelector::Quantization(tag)) => by_tag(tag),
        None => preferred
            .and_then(|tag| by_tag(tag))
            .or_else(|| by_tag(default_quantization))
            .or_else(|| loadable(&|_| true)),
    };
    selected.filter(|f| !is_split_shard(&f.path) || is_complete_set(&candidates, f))
}

fn is_complete_set(candidates: &[&RemoteFile], first: &RemoteFile) -> bool {
    match shard_set(&first.path) {
        Some(names) => names
            .iter()
            .all(|name| candidates.iter().any(|f| f.path.eq_ignore_ascii_case(name))),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRegistry;

    fn listing(files: &[&str]) -> RepoListing {
        RepoListing {
            repo: "Org/Model-GGUF".into(),
            gated: false,
            files: files
                .iter()
                .map(|p| RemoteFile {
                    path: p.to_string(),
                    size: Some(100),
                    sha256: None,
                })
                .collect(),
        }
    }

    fn config(dir: &Path) -> ResolverConfig {
        ResolverConfig {
            download_dir: dir.to_path_buf(),
            cache_ttl: Duration::from_secs(60),
            default_quantization: "q4_k_m".into(),
            max_identifier_len: 256,
        }
    }

    // ===== File selection =====

    #[test]
    fn test_select_exact_file_case_insensitive() {
        let l = listing(&["model.Q4_K_M.gguf", "model.Q8_0.gguf"]);
        let sel = FileSelector::File("model.q8_0.gguf".into());
        assert_eq!(select_file(&l, Some(&sel), None, "q4_k_m").unwrap().path, "model.Q8_0.gguf");
    }

    #[test]
    fn test_select_by_tag_variant() {
        let l = listing(&["model.Q4_K_S.gguf", "model.Q5_K_M.gguf"]);
        let sel = FileSelector::Quantization("q5_k".into());
        assert_eq!(select_file(&l, Some(&sel), None, "q4_k_m").unwrap().path, "model.Q5_K_M.gguf");
    }

    #[test]
    fn test_default_selection_order() {
        let l = listing(&["b.Q8_0.gguf", "a.Q4_K_M.gguf", "c.F16.gguf"]);
        assert_eq!(select_file(&l, None, None, "q4_k_m").unwrap().path, "a.Q4_K_M.gguf");
        assert_eq!(select_file(&l, None, Some("q8_0"), "q4_k_m").unwrap().path, "b.Q8_0.gguf");
        assert_eq!(select_file(&l, None, None, "iq2_xs").unwrap().path, "a.Q4_K_M.gguf");
    }

    #[test]
    fn test_split_set_selected_by_first_shard() {
        let l = listing(&["big-Q4_K_M-00002-of-00002.gguf", "big-Q4_K_M-00001-of-00002.gguf"]);
        let sel = FileSelector::Quantization("q4_k_m".into());
        let first = "big-Q4_K_M-00001-of-00002.gguf";
        assert_eq!(select_file(&l, Some(&sel), None, "q4_k_m").unwrap().path, first);
        assert_eq!(select_file(&l, None, None, "q8_0").unwrap().path, first);

        let later = FileSelector::File("big-Q4_K_M-00002-of-00002.gguf".into());
        assert!(select_file(&l, Some(&later), None, "q4_k_m").is_none());
    }

    #[test]
    fn test_incomplete_split_set_is_never_selected() {
        let l = listing(&["big-Q4_K_M-00001-of-00003.gguf", "big-Q4_K_M-00002-of-00003.gguf"]);
        let sel = FileSelector::File("big-Q4_K_M-00001-of-00003.gguf".into());
        assert!(select_file(&l, Some(&sel), None, "q4_k_m").is_none());
        assert!(select_file(&l, None, None, "q4_k_m").is_none());
    }

    #[test]
    fn test_single_file_beats_split_set() {
        let l = listing(&[
            "a-Q4_K_M-00001-of-00002.gguf",
            "a-Q4_K_M-00002-of-00002.gguf",
            "z.Q4_K_M.gguf",
        ]);
        assert_eq!(select_file(&l, None, None, "q4_k_m").unwrap().path, "z.Q4_K_M.gguf");
    }

    #[test]
    fn test_selection_is_deterministic() {
        let a = listing(&["z.Q4_K_M.gguf", "a.Q4_K_M.gguf"]);
        let b = listing(&["a.Q4_K_M.gguf", "z.Q4_K_M.gguf"]);
        assert_eq!(
            select_file(&a, None, None, "q4_k_m").unwrap().path,
            select_file(&b, None, None, "q4_k_m").unwrap().path
        );
    }

    // ===== Resolver =====

    #[tokio::test]
    async fn test_resolve_builds_entry_and_caches_listing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(FakeRegistry::new("http://registry.test"));
        registry.add_repo("Org/Model-GGUF", &[("model.Q4_K_M.gguf", 100)]);
        let resolver = Resolver::new(registry.clone(), config(dir.path()));

        let entry = resolver.resolve("org/model-gguf").await.unwrap();
        assert_eq!(entry.resolved_id, "org/model-gguf:model.q4_k_m.gguf");
        assert_eq!(entry.quantization.as_deref(), Some("Q4_K_M"));
        assert_eq!(entry.size_bytes, Some(100));
        assert_eq!(
            entry.source_url,
            "http://registry.test/Org/Model-GGUF/resolve/main/model.Q4_K_M.gguf"
        );
        assert_eq!(
            entry.destination,
            dir.path().join("Org_Model-GGUF").join("model.Q4_K_M.gguf")
        );
        assert!(entry.local_path.is_none());

        resolver.resolve("Org/Model-GGUF:Q4_K_M").await.unwrap();
        assert_eq!(registry.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_identifier_skips_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(FakeRegistry::new("http://registry.test"));
        let resolver = Resolver::new(registry.clone(), config(dir.path()));

        let err = resolver.resolve("not-a-repo").await.unwrap_err();
        assert_eq!(err.kind(), "invalid_identifier");
        assert_eq!(registry.list_calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_repo_and_missing_file_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(FakeRegistry::new("http://registry.test"));
        registry.add_repo("org/model", &[("model.Q8_0.gguf", 10)]);
        let resolver = Resolver::new(registry, config(dir.path()));

        assert_eq!(resolver.resolve("org/other").await.unwrap_err().kind(), "not_found");
        assert_eq!(
            resolver.resolve("org/model:q2_k").await.unwrap_err().kind(),
            "not_found"
        );
    }

    #[tokio::test]
    async fn test_remembered_quantization_wins() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(FakeRegistry::new("http://registry.test"));
        registry.add_repo("org/model", &[("m.Q4_K_M.gguf", 10), ("m.Q8_0.gguf", 20)]);
        let resolver = Resolver::new(registry, config(dir.path()));

        assert_eq!(resolver.resolve("org/model").await.unwrap().file, "m.Q4_K_M.gguf");
        resolver.remember_quantization("org/model", "Q8_0");
        assert_eq!(resolver.resolve("org/model").await.unwrap().file, "m.Q8_0.gguf");
    }

    #[tokio::test]
    async fn test_local_fallback_when_registry_down() {
        let dir = tempfile::tempdir().unwrap();
        let repo_path = dir.path().join("Org_Model");
        std::fs::create_dir_all(&repo_path).unwrap();
        std::fs::write(repo_path.join("Model.Q4_0.gguf"), vec![0u8; 32]).unwrap();

        let registry = Arc::new(FakeRegistry::new("http://registry.test"));
        registry.set_unavailable(true);
        let resolver = Resolver::new(registry, config(dir.path()));

        let entry = resolver.resolve("org/model:model.q4_0.gguf").await.unwrap();
        assert_eq!(entry.size_bytes, Some(32));
        assert_eq!(entry.local_path.as_deref(), Some(repo_path.join("Model.Q4_0.gguf").as_path()));

        let err = resolver.resolve("org/model").await.unwrap_err();
        assert_eq!(err.kind(), "upstream_error");
    }

    // ===== Split models =====

    #[tokio::test]
    async fn test_split_entry_carries_companion_shards() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(FakeRegistry::new("http://registry.test"));
        registry.add_repo(
            "org/big",
            &[
                ("q4/big-Q4_K_M-00001-of-00003.gguf", 300),
                ("q4/big-Q4_K_M-00002-of-00003.gguf", 200),
                ("q4/big-Q4_K_M-00003-of-00003.gguf", 100),
            ],
        );
        let resolver = Resolver::new(registry, config(dir.path()));

        let entry = resolver.resolve("org/big:q4_k_m").await.unwrap();
        assert_eq!(entry.file, "q4/big-Q4_K_M-00001-of-00003.gguf");
        assert!(entry.is_split());
        assert_eq!(entry.total_size(), Some(600));
        let shards: Vec<_> = entry.companions.iter().map(|c| c.file.as_str()).collect();
        assert_eq!(
            shards,
            vec!["q4/big-Q4_K_M-00002-of-00003.gguf", "q4/big-Q4_K_M-00003-of-00003.gguf"]
        );
        for shard in &entry.companions {
            assert_eq!(shard.destination.parent(), entry.destination.parent());
            assert!(shard.source_url.ends_with(&shard.file));
        }

        let moved = entry.with_destination(dir.path().join("custom").join("big-Q4_K_M-00001-of-00003.gguf"));
        assert_eq!(
            moved.companions[1].destination,
            dir.path().join("custom").join("big-Q4_K_M-00003-of-00003.gguf")
        );
    }

    #[tokio::test]
    async fn test_local_fallback_needs_every_shard() {
        let dir = tempfile::tempdir().unwrap();
        let repo_path = dir.path().join("org_big");
        std::fs::create_dir_all(&repo_path).unwrap();
        std::fs::write(repo_path.join("big-00001-of-00002.gguf"), vec![0u8; 8]).unwrap();

        let registry = Arc::new(FakeRegistry::new("http://registry.test"));
        registry.set_unavailable(true);
        let resolver = Resolver::new(registry, config(dir.path()));

        let err = resolver.resolve("org/big:big-00001-of-00002.gguf").await.unwrap_err();
        assert_eq!(err.kind(), "upstream_error");

        std::fs::write(repo_path.join("big-00002-of-00002.gguf"), vec![0u8; 4]).unwrap();
        let entry = resolver.resolve("org/big:big-00001-of-00002.gguf").await.unwrap();
        assert_eq!(entry.companions.len(), 1);
        assert_eq!(entry.total_size(), Some(12));
    }
}
