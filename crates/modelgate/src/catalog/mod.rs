//! Model catalog: identifier validation, registry access and resolution.

pub mod identifier;
pub mod quantization;
pub mod registry;
pub mod resolver;

pub use identifier::{FileSelector, ModelIdentifier, DEFAULT_MAX_IDENTIFIER_LEN};
pub use registry::{HuggingFaceRegistry, ModelSummary, Registry, RemoteFile, RepoListing, SearchQuery};
pub use resolver::{repo_dir, CatalogEntry, Resolver, ResolverConfig};

use crate::error::{GatewayError, Result};

pub const MAX_SEARCH_LIMIT: usize = 100;

/// Validates a search request before it reaches the registry.
pub fn search_query(text: &str, limit: Option<usize>, include_restricted: bool) -> Result<SearchQuery> {
    let text = text.trim();
    if text.is_empty() {
        return Err(GatewayError::InvalidRequest("search query cannot be empty".into()));
    }
    Ok(SearchQuery {
        text: text.to_string(),
        limit: limit.unwrap_or(20).clamp(1, MAX_SEARCH_LIMIT),
        include_restricted,
    })
}
