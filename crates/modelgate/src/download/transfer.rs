//! Single HTTP transfer attempt with resume and stall detection.

use futures_util::StreamExt;
use reqwest::{header, StatusCode};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::job::DownloadJob;
use crate::error::GatewayError;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub(crate) enum TransferError {
    /// Worth another attempt after backoff
    Transient(String),
    /// Retrying cannot help
    Permanent(GatewayError),
    Canceled,
    /// Stopped by a pause; `part` holds everything received so far
    Paused,
}

/// `base * 1.5^(attempt-1)`, capped at `max`
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1.5f64.powi(attempt.saturating_sub(1) as i32);
    let delay = base.as_secs_f64() * factor;
    Duration::from_secs_f64(delay.min(max.as_secs_f64()))
}

/// Up to 10% random jitter on top of `delay`
pub fn with_jitter(delay: Duration) -> Duration {
    use rand::Rng;
    let jitter = rand::thread_rng().gen_range(0.0..=0.1);
    delay.mul_f64(1.0 + jitter)
}

/// Fetch `job.url` into `part`, resuming from whatever `part` already holds.
/// `stop` interrupts the attempt for a pause.
pub(crate) async fn fetch(
    client: &reqwest::Client,
    job: &DownloadJob,
    part: &Path,
    stall_timeout: Duration,
    token: Option<&str>,
    stop: &CancellationToken,
) -> Result<(), TransferError> {
    let mut offset = tokio::fs::metadata(part).await.map(|m| m.len()).unwrap_or(0);
    if let Some(expected) = job.expected_size {
        if offset == expected && expected > 0 {
            debug!("Partial file for {} already complete", job.model_id);
            return Ok(());
        }
        if offset > expected {
            offset = 0;
        }
    }

    let mut request = client.get(&job.url);
    if offset > 0 {
        request = request.header(header::RANGE, format!("bytes={}-", offset));
    }
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }

    let cancel = job.cancel_token();
    let response = tokio::select! {
        r = request.send() => r.map_err(|e| TransferError::Transient(format!("request failed: {}", e)))?,
        _ = cancel.cancelled() => return Err(TransferError::Canceled),
        _ = stop.cancelled() => return Err(TransferError::Paused),
    };

    let status = response.status();
    match status {
        s if s.is_success() => {}
        StatusCode::NOT_FOUND => {
            return Err(TransferError::Permanent(GatewayError::NotFound(job.url.clone())))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            return Err(TransferError::Permanent(GatewayError::DownloadFailed(format!(
                "access denied ({}) for {}",
                status, job.url
            ))))
        }
        StatusCode::RANGE_NOT_SATISFIABLE => {
            let _ = tokio::fs::remove_file(part).await;
            return Err(TransferError::Transient("server rejected resume offset".into()));
        }
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            return Err(TransferError::Transient(format!("server returned {}", s)))
        }
        s => {
            return Err(TransferError::Permanent(GatewayError::DownloadFailed(format!(
                "unexpected status {} for {}",
                s, job.url
            ))))
        }
    }

    let resumed = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
    if offset > 0 && !resumed {
        info!("Server ignored range request for {}, restarting", job.model_id);
        offset = 0;
    } else if resumed {
        info!("Resuming {} from byte {}", job.model_id, offset);
    }

    let total = response
        .content_length()
        .map(|len| len + offset)
        .or(job.expected_size);

    let mut file = if resumed {
        OpenOptions::new().append(true).open(part).await
    } else {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(part)
            .await
    }
    .map_err(|e| TransferError::Permanent(GatewayError::DownloadFailed(format!("cannot open {}: {}", part.display(), e))))?;

    job.update(|p| {
        p.downloaded_bytes = offset;
        p.total_bytes = total;
    });

    let mut written = offset;
    let mut window_start = Instant::now();
    let mut window_bytes = 0u64;
    let mut stream = response.bytes_stream();

    loop {
        let next = tokio::select! {
            n = tokio::time::timeout(stall_timeout, stream.next()) => n,
            _ = cancel.cancelled() => {
                let _ = file.flush().await;
                return Err(TransferError::Canceled);
            }
            _ = stop.cancelled() => {
                let _ = file.flush().await;
                job.update(|p| p.downloaded_bytes = written);
                return Err(TransferError::Paused);
            }
        };

        let chunk = match next {
            Err(_) => {
                let _ = file.flush().await;
                return Err(TransferError::Transient(format!(
                    "stalled: no data for {}s",
                    stall_timeout.as_secs()
                )));
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                let _ = file.flush().await;
                return Err(TransferError::Transient(format!("read error: {}", e)));
            }
            Ok(Some(Ok(chunk))) => chunk,
        };

        file.write_all(&chunk).await.map_err(|e| {
            TransferError::Permanent(GatewayError::DownloadFailed(format!("write failed: {}", e)))
        })?;
        written += chunk.len() as u64;
        window_bytes += chunk.len() as u64;

        let elapsed = window_start.elapsed();
        if elapsed >= PROGRESS_INTERVAL {
            let speed = (window_bytes as f64 / elapsed.as_secs_f64()) as u64;
            job.update(|p| {
                p.downloaded_bytes = written;
                p.speed_bytes_per_sec = speed;
            });
            window_start = Instant::now();
            window_bytes = 0;
        }
    }

    file.flush()
        .await
        .map_err(|e| TransferError::Permanent(GatewayError::DownloadFailed(format!("flush failed: {}", e))))?;
    job.update(|p| p.downloaded_bytes = written);

    if let Some(total) = total {
        if written < total {
            return Err(TransferError::Transient(format!(
                "connection closed at {} of {} bytes",
                written, total
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(300);
        assert_eq!(backoff_delay(1, base, max), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, base, max), Duration::from_secs(3));
        assert!(backoff_delay(5, base, max) > backoff_delay(4, base, max));
        assert_eq!(backoff_delay(40, base, max), max);
    }

    #[tokio::test]
    async fn test_stopped_fetch_keeps_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("m.gguf.part");
        std::fs::write(&part, b"hel").unwrap();
        let job = DownloadJob::new(
            "org/m:m.gguf",
            "http://127.0.0.1:9/m.gguf",
            &dir.path().join("m.gguf"),
            Some(5),
            None,
        );
        let stop = CancellationToken::new();
        stop.cancel();

        let result = fetch(
            &reqwest::Client::new(),
            &job,
            &part,
            Duration::from_secs(5),
            None,
            &stop,
        )
        .await;
        assert!(matches!(result, Err(TransferError::Paused)));
        assert_eq!(std::fs::read(&part).unwrap(), b"hel");
    }

    #[test]
    fn test_jitter_bounded() {
        let d = Duration::from_secs(10);
        for _ in 0..50 {
            let j = with_jitter(d);
            assert!(j >= d && j <= Duration::from_millis(11_001));
        }
    }
}
