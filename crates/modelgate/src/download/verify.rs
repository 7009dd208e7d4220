use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Marker written next to a verified artifact so later checks can skip hashing.
pub fn checksum_marker(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".sha256");
    PathBuf::from(name)
}

pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}

/// Size check first, then SHA-256 when one is expected. Returns the reason on
/// mismatch.
pub async fn verify_artifact(
    path: &Path,
    expected_size: Option<u64>,
    expected_sha256: Option<&str>,
) -> Result<(), String> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| format!("cannot stat artifact: {}", e))?;

    if let Some(expected) = expected_size {
        if metadata.len() != expected {
            return Err(format!(
                "size mismatch: expected {} bytes, found {}",
                expected,
                metadata.len()
            ));
        }
    }

    if let Some(expected) = expected_sha256 {
        let expected = expected.to_ascii_lowercase();
        let marker = checksum_marker(path);
        if let Ok(recorded) = tokio::fs::read_to_string(&marker).await {
            if recorded.trim() == expected {
                debug!("Checksum marker matches for {}", path.display());
                return Ok(());
            }
        }

        let actual = sha256_file(path)
            .await
            .map_err(|e| format!("cannot hash artifact: {}", e))?;
        if actual != expected {
            return Err(format!("sha256 mismatch: expected {}, found {}", expected, actual));
        }
    }
    Ok(())
}
