//! Model identifier parsing and boundary validation.
//!
//! Canonical form is `owner/name[:file]` in lower case. The file part is
//! either an exact `.gguf` path or a quantization tag such as `q4_k_m`.
//! Everything here is pure; nothing touches the network or the disk.

use std::fmt;
use std::str::FromStr;

use crate::error::{GatewayError, Result};

pub const DEFAULT_MAX_IDENTIFIER_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileSelector {
    /// Exact file path inside the repository
    File(String),
    /// Quantization tag, resolved against the repository listing
    Quantization(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelIdentifier {
    repo: String,
    selector: Option<FileSelector>,
}

impl ModelIdentifier {
    pub fn parse(raw: &str, max_len: usize) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(GatewayError::invalid_identifier(raw, "identifier is empty"));
        }
        if trimmed.len() > max_len {
            return Err(GatewayError::invalid_identifier(
                truncate_for_display(trimmed),
                format!("longer than {} characters", max_len),
            ));
        }
        if let Some(bad) = trimmed
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':')))
        {
            return Err(GatewayError::invalid_identifier(
                trimmed,
                format!("invalid character {:?}", bad),
            ));
        }

        let normalized = trimmed.to_ascii_lowercase();
        let (repo, file) = match normalized.split_once(':') {
            Some((repo, file)) => (repo, Some(file)),
            None => (normalized.as_str(), None),
        };

        validate_repo(trimmed, repo)?;

        let selector = match file {
            None => None,
            Some(file) => Some(parse_selector(trimmed, file)?),
        };

        Ok(Self {
            repo: repo.to_string(),
            selector,
        })
    }

    pub fn new(repo: &str, selector: Option<FileSelector>) -> Self {
        Self {
            repo: repo.to_ascii_lowercase(),
            selector,
        }
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn selector(&self) -> Option<&FileSelector> {
        self.selector.as_ref()
    }
}

impl fmt::Display for ModelIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.selector {
            None => write!(f, "{}", self.repo),
            Some(FileSelector::File(file)) => write!(f, "{}:{}", self.repo, file),
            Some(FileSelector::Quantization(tag)) => write!(f, "{}:{}", self.repo, tag),
        }
    }
}

impl FromStr for ModelIdentifier {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s, DEFAULT_MAX_IDENTIFIER_LEN)
    }
}

fn validate_repo(raw: &str, repo: &str) -> Result<()> {
    let mut parts = repo.split('/');
    let (owner, name) = match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(name), None) => (owner, name),
        _ => {
            return Err(GatewayError::invalid_identifier(
                raw,
                "repository must have the form owner/name",
            ))
        }
    };
    for segment in [owner, name] {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(GatewayError::invalid_identifier(
                raw,
                "repository must have the form owner/name",
            ));
        }
    }
    Ok(())
}

fn parse_selector(raw: &str, file: &str) -> Result<FileSelector> {
    if file.is_empty() {
        return Err(GatewayError::invalid_identifier(raw, "empty file part after ':'"));
    }
    if file.contains(':') {
        return Err(GatewayError::invalid_identifier(raw, "more than one ':' separator"));
    }

    if file.ends_with(".gguf") {
        for segment in file.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(GatewayError::invalid_identifier(
                    raw,
                    "file path contains an empty or relative segment",
                ));
            }
        }
        return Ok(FileSelector::File(file.to_string()));
    }

    if file.contains('/') || file.contains('.') {
        return Err(GatewayError::invalid_identifier(
            raw,
            "file part must be a .gguf path or a quantization tag",
        ));
    }
    Ok(FileSelector::Quantization(file.to_string()))
}

fn truncate_for_display(s: &str) -> String {
    s.chars().take(64).collect::<String>() + "..."
}
