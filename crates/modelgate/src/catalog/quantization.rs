use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref QUANT_RE: Regex = Regex::new(
        r"(?i)(?:^|[^A-Za-z0-9])(IQ\d+_[A-Z]+|Q\d+_K_[A-Z]+|Q\d+_K|Q\d+_\d|BF16|F16|F32)(?:[^A-Za-z0-9]|$)"
    )
    .expect("quantization pattern is valid");
    static ref SPLIT_RE: Regex = Regex::new(
        r"(?i)(-\d{5}-of-\d{5}\.gguf$|-part-\d{5}-of-\d{5}\.gguf$|\.split-\d{5}-of-\d{5}\.gguf$|\.gguf\.part\d+of\d+$)"
    )
    .expect("split pattern is valid");
    static ref SHARD_RE: Regex =
        Regex::new(r"(?i)^(.*)-(\d{5})-of-(\d{5})\.gguf$").expect("shard pattern is valid");
}

/// Quantization tag embedded in a GGUF file name, upper-cased (`Q4_K_M`).
pub fn extract_quantization(file: &str) -> Option<String> {
    let name = file.rsplit('/').next().unwrap_or(file);
    QUANT_RE
        .captures(name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_ascii_uppercase())
}

/// True for every shard of a multi-file GGUF upload.
pub fn is_split_shard(file: &str) -> bool {
    SPLIT_RE.is_match(file)
}

/// Every file of the llama.cpp split set that `file` opens, in load order.
///
/// Only the first shard (`-00001-of-000NN.gguf`) opens a set; the engine reads
/// the remaining shards from the same directory. Byte-split uploads
/// (`.gguf.part1of2`) are not loadable and never form a set.
pub fn shard_set(file: &str) -> Option<Vec<String>> {
    let caps = SHARD_RE.captures(file)?;
    let index: u32 = caps[2].parse().ok()?;
    let count: u32 = caps[3].parse().ok()?;
    if index != 1 || count == 0 {
        return None;
    }
    let prefix = &caps[1];
    let extension = &file[file.len() - ".gguf".len()..];
    Some(
        (1..=count)
            .map(|i| format!("{}-{:05}-of-{:05}{}", prefix, i, count, extension))
            .collect(),
    )
}

/// Tags tried, in order, when matching a requested quantization.
/// `q4_k` also matches files published as `Q4_K_M`, `Q4_K_S` or `Q4_K_L`.
pub fn quantization_variants(tag: &str) -> Vec<String> {
    let tag = tag.to_ascii_lowercase();
    let suffixes = ["_m", "_s", "_l"];
    if suffixes.iter().any(|s| tag.ends_with(s)) {
        return vec![tag];
    }
    let mut variants = vec![tag.clone()];
    variants.extend(suffixes.iter().map(|s| format!("{}{}", tag, s)));
    variants
}

pub fn matches_quantization(file: &str, tag: &str) -> bool {
    extract_quantization(file)
        .map(|q| q.eq_ignore_ascii_case(tag))
        .unwrap_or(false)
}

/// Human readable name for a search result.
pub fn display_name(repo: &str, file: &str) -> String {
    let base = repo.rsplit('/').next().unwrap_or(repo);
    let base = base
        .trim_end_matches("-GGUF")
        .trim_end_matches("-gguf")
        .trim_end_matches("_GGUF")
        .trim_end_matches("_gguf");
    let words = base.replace(['-', '_'], " ");
    match extract_quantization(file) {
        Some(q) => format!("{} ({})", words, q),
        None => words,
    }
}
