//! Download Manager
//!
//! Fetches model artifacts into local storage. There is at most one active
//! job per destination path; concurrent callers attach to it and the
//! transfer is canceled only when the last of them lets go. A semaphore
//! bounds simultaneous transfers and hands out permits in arrival order.

pub mod job;
pub mod transfer;
pub mod verify;

pub use job::{DownloadInfo, DownloadJob, DownloadProgress, DownloadStatus, DownloadTicket};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::catalog::CatalogEntry;
use crate::error::{GatewayError, Result};
use crate::metrics;
use transfer::TransferError;

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub stall_timeout: Duration,
    pub verify_checksums: bool,
    /// How long finished jobs stay visible in the status API
    pub retention: Duration,
    pub token: Option<String>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_retries: 5,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(300),
            stall_timeout: Duration::from_secs(60),
            verify_checksums: true,
            retention: Duration::from_secs(30 * 60),
            token: None,
        }
    }
}

/// `<dest>.part`, where bytes accumulate until verification
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

enum Drive {
    Complete,
    Paused,
}

pub struct DownloadManager {
    client: reqwest::Client,
    config: DownloadConfig,
    active: DashMap<PathBuf, Arc<DownloadJob>>,
    jobs: DashMap<String, Arc<DownloadJob>>,
    permits: Arc<Semaphore>,
}

impl DownloadManager {
    pub fn new(config: DownloadConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("modelgate/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            config,
            active: DashMap::new(),
            jobs: DashMap::new(),
        })
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Make `entry` available locally.
    ///
    /// Returns a ready ticket when the artifact is already on disk and passes
    /// the integrity check; otherwise joins or starts the job for its
    /// destination path.
    pub async fn ensure_local(self: &Arc<Self>, entry: &CatalogEntry) -> Result<DownloadTicket> {
        let destination = entry.destination.clone();

        if let Some(job) = self.active.get(&destination).map(|j| j.value().clone()) {
            if job.attach() {
                info!("Attaching to in-flight download {} for {}", job.id, entry.resolved_id);
                if job.is_paused() {
                    // A caller that needs the artifact now outranks the pause.
                    let _ = job.resume();
                }
                return Ok(DownloadTicket::attached(job));
            }
        }

        if let Some(size) = self.existing_artifact(entry).await? {
            let job = Arc::new(DownloadJob::completed(&entry.resolved_id, &destination, size));
            return Ok(DownloadTicket::ready(job));
        }

        let job = match self.active.entry(destination.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().attach() {
                    return Ok(DownloadTicket::attached(occupied.get().clone()));
                }
                let job = self.new_job(entry);
                occupied.insert(job.clone());
                job
            }
            Entry::Vacant(vacant) => {
                let job = self.new_job(entry);
                vacant.insert(job.clone());
                job
            }
        };

        info!(
            "Queued download {} of {} ({})",
            job.id,
            entry.resolved_id,
            entry
                .size_bytes
                .map(format_bytes)
                .unwrap_or_else(|| "unknown size".into())
        );
        let manager = self.clone();
        let worker_job = job.clone();
        tokio::spawn(async move { manager.run_job(worker_job).await });

        Ok(DownloadTicket::attached(job))
    }

    fn new_job(&self, entry: &CatalogEntry) -> Arc<DownloadJob> {
        let sha256 = if self.config.verify_checksums {
            entry.sha256.clone()
        } else {
            None
        };
        let job = Arc::new(DownloadJob::new(
            &entry.resolved_id,
            &entry.source_url,
            &entry.destination,
            entry.size_bytes,
            sha256,
        ));
        let attached = job.attach();
        debug_assert!(attached);
        self.jobs.insert(job.id.clone(), job.clone());
        job
    }

    /// Size of an on-disk artifact that passes integrity, if any. A corrupt
    /// artifact is removed so it gets fetched again.
    async fn existing_artifact(&self, entry: &CatalogEntry) -> Result<Option<u64>> {
        let destination = &entry.destination;
        let metadata = match tokio::fs::metadata(destination).await {
            Ok(m) if m.is_file() => m,
            _ => return Ok(None),
        };
        let sha256 = if self.config.verify_checksums {
            entry.sha256.as_deref()
        } else {
            None
        };
        match verify::verify_artifact(destination, entry.size_bytes, sha256).await {
            Ok(()) => Ok(Some(metadata.len())),
            Err(reason) => {
                warn!(
                    "Existing artifact {} failed integrity ({}), downloading again",
                    destination.display(),
                    reason
                );
                tokio::fs::remove_file(destination).await?;
                let _ = tokio::fs::remove_file(verify::checksum_marker(destination)).await;
                Ok(None)
            }
        }
    }

    async fn run_job(self: Arc<Self>, job: Arc<DownloadJob>) {
        let result = loop {
            match self.drive(&job).await {
                Ok(Drive::Complete) => break Ok(()),
                Ok(Drive::Paused) => {
                    job.mark_paused();
                    info!("Download {} paused", job.id);
                    if !job.wait_for_resume().await {
                        break Err(GatewayError::Canceled(format!(
                            "download of {} canceled",
                            job.model_id
                        )));
                    }
                }
                Err(e) => break Err(e),
            }
        };
        match &result {
            Ok(()) => {
                info!("Download {} complete: {}", job.id, job.destination.display());
                metrics::inc_download("complete");
            }
            Err(GatewayError::Canceled(_)) => {
                info!("Download {} canceled", job.id);
                metrics::inc_download("canceled");
            }
            Err(e) => {
                error!("Download {} failed: {}", job.id, e);
                metrics::inc_download("failed");
            }
        }
        job.finish(&result);
        self.active
            .remove_if(&job.destination, |_, current| Arc::ptr_eq(current, &job));
    }

    /// One run of a job, from waiting for a slot to the verified artifact.
    /// A pause ends the run early and gives the slot back.
    async fn drive(&self, job: &DownloadJob) -> Result<Drive> {
        let canceled = || GatewayError::Canceled(format!("download of {} canceled", job.model_id));
        let stop = job.stop_token();

        let _permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => permit
                .map_err(|_| GatewayError::Internal("download queue closed".into()))?,
            _ = job.cancel_token().cancelled() => return Err(canceled()),
            _ = stop.cancelled() => return Ok(Drive::Paused),
        };
        job.set_running_status(DownloadStatus::InProgress);

        if let Some(parent) = job.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = partial_path(&job.destination);

        let mut attempt = 0u32;
        loop {
            match transfer::fetch(
                &self.client,
                job,
                &part,
                self.config.stall_timeout,
                self.config.token.as_deref(),
                &stop,
            )
            .await
            {
                Ok(()) => break,
                Err(TransferError::Canceled) => return Err(canceled()),
                Err(TransferError::Paused) => return Ok(Drive::Paused),
                Err(TransferError::Permanent(e)) => return Err(e),
                Err(TransferError::Transient(reason)) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return Err(GatewayError::DownloadFailed(format!(
                            "{} after {} attempts: {}",
                            job.model_id, attempt, reason
                        )));
                    }
                    let delay = transfer::with_jitter(transfer::backoff_delay(
                        attempt,
                        self.config.backoff_base,
                        self.config.backoff_max,
                    ));
                    warn!(
                        "Download {} attempt {} failed ({}), retrying in {:.1}s",
                        job.id,
                        attempt,
                        reason,
                        delay.as_secs_f64()
                    );
                    job.update(|p| {
                        p.retry_count = attempt;
                        p.speed_bytes_per_sec = 0;
                    });
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = job.cancel_token().cancelled() => return Err(canceled()),
                        _ = stop.cancelled() => return Ok(Drive::Paused),
                    }
                }
            }
        }

        job.update(|p| p.status = DownloadStatus::Verifying);
        if let Err(reason) =
            verify::verify_artifact(&part, job.expected_size, job.sha256.as_deref()).await
        {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(GatewayError::Integrity {
                path: job.destination.display().to_string(),
                reason,
            });
        }

        tokio::fs::rename(&part, &job.destination).await?;
        if let Some(sha) = &job.sha256 {
            let _ = tokio::fs::write(verify::checksum_marker(&job.destination), sha).await;
        }
        Ok(Drive::Complete)
    }

    pub fn get(&self, id: &str) -> Option<DownloadInfo> {
        self.jobs.get(id).map(|j| j.info())
    }

    pub fn list(&self) -> Vec<DownloadInfo> {
        let mut all: Vec<DownloadInfo> = self.jobs.iter().map(|j| j.info()).collect();
        all.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        all
    }

    /// Active job for `destination`, if any
    pub fn active_job(&self, destination: &Path) -> Option<Arc<DownloadJob>> {
        self.active.get(destination).map(|j| j.value().clone())
    }

    pub fn cancel(&self, id: &str) -> Result<()> {
        let job = self.job(id)?;
        if job.snapshot().status.is_terminal() {
            return Err(GatewayError::InvalidRequest(format!(
                "download {} already finished",
                id
            )));
        }
        job.cancel();
        Ok(())
    }

    fn job(&self, id: &str) -> Result<Arc<DownloadJob>> {
        self.jobs
            .get(id)
            .map(|j| j.value().clone())
            .ok_or_else(|| GatewayError::NotFound(format!("download {}", id)))
    }

    /// Stop a transfer, keeping its partial file for [`resume`](Self::resume).
    pub fn pause(&self, id: &str) -> Result<DownloadInfo> {
        let job = self.job(id)?;
        job.pause()?;
        Ok(job.info())
    }

    pub fn resume(&self, id: &str) -> Result<DownloadInfo> {
        let job = self.job(id)?;
        job.resume()?;
        Ok(job.info())
    }

    /// Forget finished jobs older than the retention window.
    pub fn prune_finished(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention).unwrap_or_else(|_| chrono::Duration::zero());
        let before = self.jobs.len();
        self.jobs.retain(|_, job| {
            let p = job.snapshot();
            !(p.status.is_terminal() && p.completed_at.map(|t| t < cutoff).unwrap_or(false))
        });
        before - self.jobs.len()
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::catalog_entry;
    use std::time::Duration;

    fn fast_config() -> DownloadConfig {
        DownloadConfig {
            max_concurrent: 2,
            max_retries: 2,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(50),
            stall_timeout: Duration::from_secs(5),
            verify_checksums: true,
            retention: Duration::from_secs(60),
            token: None,
        }
    }

    fn manager(config: DownloadConfig) -> Arc<DownloadManager> {
        Arc::new(DownloadManager::new(config).unwrap())
    }

    #[tokio::test]
    async fn test_downloads_and_verifies() {
        let mut server = mockito::Server::new_async().await;
        let body = b"hello".to_vec();
        let mock = server
            .mock("GET", "/org/m/resolve/main/m.gguf")
            .with_status(200)
            .with_body(&body)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut entry = catalog_entry(&server.url(), dir.path(), "org/m", "m.gguf", 5);
        entry.sha256 = Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824".into());

        let downloads = manager(fast_config());
        let mut ticket = downloads.ensure_local(&entry).await.unwrap();
        let path = ticket.wait().await.unwrap();

        mock.assert_async().await;
        assert_eq!(std::fs::read(&path).unwrap(), body);
        assert!(!partial_path(&path).exists());
        assert!(verify::checksum_marker(&path).exists());
        assert_eq!(downloads.get(ticket.id()).unwrap().status, DownloadStatus::Complete);
    }

    #[tokio::test]
    async fn test_existing_artifact_skips_network() {
        let dir = tempfile::tempdir().unwrap();
        let entry = catalog_entry("http://127.0.0.1:9", dir.path(), "org/m", "m.gguf", 4);
        std::fs::create_dir_all(entry.destination.parent().unwrap()).unwrap();
        std::fs::write(&entry.destination, b"abcd").unwrap();

        let downloads = manager(fast_config());
        let mut ticket = downloads.ensure_local(&entry).await.unwrap();
        assert_eq!(ticket.wait().await.unwrap(), entry.destination);
        assert!(downloads.list().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_transfer() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/org/m/resolve/main/m.gguf")
            .with_status(200)
            .with_body(vec![7u8; 4096])
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let entry = catalog_entry(&server.url(), dir.path(), "org/m", "m.gguf", 4096);
        let downloads = manager(DownloadConfig {
            max_concurrent: 1,
            ..fast_config()
        });
        let permit = downloads.permits.clone().acquire_owned().await.unwrap();

        let mut tickets = Vec::new();
        for _ in 0..8 {
            tickets.push(downloads.ensure_local(&entry).await.unwrap());
        }
        let first_id = tickets[0].id().to_string();
        assert!(tickets.iter().all(|t| t.id() == first_id));
        assert_eq!(tickets[0].job().interested_callers(), 8);
        drop(permit);

        for ticket in tickets.iter_mut() {
            ticket.wait().await.unwrap();
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_resumes_partial_file_with_range() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/org/m/resolve/main/m.gguf")
            .match_header("range", "bytes=3-")
            .with_status(206)
            .with_body(b"lo")
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let entry = catalog_entry(&server.url(), dir.path(), "org/m", "m.gguf", 5);
        std::fs::create_dir_all(entry.destination.parent().unwrap()).unwrap();
        std::fs::write(partial_path(&entry.destination), b"hel").unwrap();

        let downloads = manager(fast_config());
        let path = downloads.ensure_local(&entry).await.unwrap().wait().await.unwrap();

        mock.assert_async().await;
        assert_eq!(std::fs::read(path).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_size_mismatch_fails_and_removes_partial() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/org/m/resolve/main/m.gguf")
            .with_status(200)
            .with_body(b"hello")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut entry = catalog_entry(&server.url(), dir.path(), "org/m", "m.gguf", 5);
        entry.sha256 = Some("0".repeat(64));

        let downloads = manager(fast_config());
        let err = downloads.ensure_local(&entry).await.unwrap().wait().await.unwrap_err();

        assert_eq!(err.kind(), "integrity_error");
        assert!(!partial_path(&entry.destination).exists());
        assert!(!entry.destination.exists());
    }

    #[tokio::test]
    async fn test_not_found_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/org/m/resolve/main/m.gguf")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let entry = catalog_entry(&server.url(), dir.path(), "org/m", "m.gguf", 5);
        let downloads = manager(fast_config());
        let err = downloads.ensure_local(&entry).await.unwrap().wait().await.unwrap_err();

        assert_eq!(err.kind(), "not_found");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/org/m/resolve/main/m.gguf")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let entry = catalog_entry(&server.url(), dir.path(), "org/m", "m.gguf", 5);
        let downloads = manager(fast_config());
        let mut ticket = downloads.ensure_local(&entry).await.unwrap();
        let err = ticket.wait().await.unwrap_err();

        assert_eq!(err.kind(), "download_failed");
        assert_eq!(ticket.progress().retry_count, 2);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_dropping_last_ticket_cancels_queued_job() {
        let dir = tempfile::tempdir().unwrap();
        let entry = catalog_entry("http://127.0.0.1:9", dir.path(), "org/m", "m.gguf", 5);
        let downloads = manager(DownloadConfig {
            max_concurrent: 1,
            ..fast_config()
        });
        // Hold the only permit so the job stays queued.
        let permit = downloads.permits.clone().acquire_owned().await.unwrap();

        let a = downloads.ensure_local(&entry).await.unwrap();
        let b = downloads.ensure_local(&entry).await.unwrap();
        let job = a.job().clone();
        assert_eq!(job.interested_callers(), 2);

        drop(a);
        assert!(!job.cancel_token().is_cancelled());
        drop(b);
        assert!(job.cancel_token().is_cancelled());

        drop(permit);
        let mut rx = job.subscribe();
        while !rx.borrow_and_update().status.is_terminal() {
            rx.changed().await.unwrap();
        }
        assert_eq!(job.snapshot().status, DownloadStatus::Canceled);
        assert!(downloads.active_job(&entry.destination).is_none());
    }

    #[tokio::test]
    async fn test_operator_cancel_and_prune() {
        let dir = tempfile::tempdir().unwrap();
        let entry = catalog_entry("http://127.0.0.1:9", dir.path(), "org/m", "m.gguf", 5);
        let downloads = manager(DownloadConfig {
            max_concurrent: 1,
            retention: Duration::ZERO,
            ..fast_config()
        });
        let permit = downloads.permits.clone().acquire_owned().await.unwrap();

        let mut ticket = downloads.ensure_local(&entry).await.unwrap();
        let id = ticket.id().to_string();
        downloads.cancel(&id).unwrap();
        drop(permit);

        assert_eq!(ticket.wait().await.unwrap_err().kind(), "canceled");
        assert_eq!(downloads.cancel("missing").unwrap_err().kind(), "not_found");

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(downloads.prune_finished(), 1);
        assert!(downloads.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_pause_keeps_partial_and_resume_continues_from_it() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/org/m/resolve/main/m.gguf")
            .match_header("range", "bytes=3-")
            .with_status(206)
            .with_body(b"lo")
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let entry = catalog_entry(&server.url(), dir.path(), "org/m", "m.gguf", 5);
        let downloads = manager(DownloadConfig {
            max_concurrent: 1,
            ..fast_config()
        });
        let permit = downloads.permits.clone().acquire_owned().await.unwrap();

        let mut ticket = downloads.ensure_local(&entry).await.unwrap();
        let id = ticket.id().to_string();
        downloads.pause(&id).unwrap();
        let mut rx = ticket.job().subscribe();
        while rx.borrow_and_update().status != DownloadStatus::Paused {
            rx.changed().await.unwrap();
        }
        drop(permit);
        assert_eq!(downloads.get(&id).unwrap().status, DownloadStatus::Paused);

        // Bytes an earlier run left behind.
        std::fs::create_dir_all(entry.destination.parent().unwrap()).unwrap();
        std::fs::write(partial_path(&entry.destination), b"hel").unwrap();

        let info = downloads.resume(&id).unwrap();
        assert_eq!(info.status, DownloadStatus::Queued);
        let path = ticket.wait().await.unwrap();
        mock.assert_async().await;
        assert_eq!(std::fs::read(path).unwrap(), b"hello");
        assert_eq!(downloads.resume(&id).unwrap_err().kind(), "invalid_request");
        assert_eq!(downloads.pause("missing").unwrap_err().kind(), "not_found");
    }

    #[tokio::test]
    async fn test_new_caller_resumes_paused_download() {
        let dir = tempfile::tempdir().unwrap();
        let entry = catalog_entry("http://127.0.0.1:9", dir.path(), "org/m", "m.gguf", 5);
        let downloads = manager(DownloadConfig {
            max_concurrent: 1,
            ..fast_config()
        });
        let _permit = downloads.permits.clone().acquire_owned().await.unwrap();

        let first = downloads.ensure_local(&entry).await.unwrap();
        downloads.pause(first.id()).unwrap();
        assert!(first.job().is_paused());

        let second = downloads.ensure_local(&entry).await.unwrap();
        assert_eq!(second.id(), first.id());
        assert!(!first.job().is_paused());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.00 GB");
    }
}
