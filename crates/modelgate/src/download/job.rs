use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Queued,
    InProgress,
    /// Stopped on request; the partial file is kept for a later resume
    Paused,
    Verifying,
    Complete,
    Failed,
    Canceled,
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Complete | DownloadStatus::Failed | DownloadStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub status: DownloadStatus,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub speed_bytes_per_sec: u64,
    pub retry_count: u32,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub failure: Option<GatewayError>,
}

impl DownloadProgress {
    fn new(status: DownloadStatus) -> Self {
        Self {
            status,
            downloaded_bytes: 0,
            total_bytes: None,
            speed_bytes_per_sec: 0,
            retry_count: 0,
            error: None,
            completed_at: None,
            failure: None,
        }
    }

    /// Percentage in 0..=100, when the total is known
    pub fn percent(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => {
                Some((self.downloaded_bytes as f64 / total as f64 * 100.0).min(100.0))
            }
            _ if self.status == DownloadStatus::Complete => Some(100.0),
            _ => None,
        }
    }
}

/// Serializable view of a job for the status API
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadInfo {
    pub id: String,
    pub model_id: String,
    pub url: String,
    pub file_path: PathBuf,
    pub status: DownloadStatus,
    pub progress: Option<f64>,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub speed: u64,
    pub eta_seconds: Option<u64>,
    pub retry_count: u32,
    pub start_time: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct Interest {
    callers: usize,
    canceled: bool,
}

/// Pause state. `stop` fires to interrupt the running transfer and is
/// replaced on resume.
#[derive(Debug, Default)]
struct RunControl {
    paused: bool,
    stop: CancellationToken,
}

/// One transfer into one destination path
pub struct DownloadJob {
    pub id: String,
    pub model_id: String,
    pub url: String,
    pub destination: PathBuf,
    pub expected_size: Option<u64>,
    pub sha256: Option<String>,
    pub started_at: DateTime<Utc>,
    progress: watch::Sender<DownloadProgress>,
    interest: Mutex<Interest>,
    cancel: CancellationToken,
    control: Mutex<RunControl>,
    resumed: Notify,
}

impl DownloadJob {
    pub(crate) fn new(
        model_id: &str,
        url: &str,
        destination: &Path,
        expected_size: Option<u64>,
        sha256: Option<String>,
    ) -> Self {
        let (progress, _) = watch::channel(DownloadProgress::new(DownloadStatus::Queued));
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            model_id: model_id.to_string(),
            url: url.to_string(),
            destination: destination.to_path_buf(),
            expected_size,
            sha256,
            started_at: Utc::now(),
            progress,
            interest: Mutex::new(Interest::default()),
            cancel: CancellationToken::new(),
            control: Mutex::new(RunControl::default()),
            resumed: Notify::new(),
        }
    }

    /// A job that is already complete; used when the artifact is on disk.
    pub(crate) fn completed(model_id: &str, destination: &Path, size: u64) -> Self {
        let job = Self::new(model_id, "", destination, Some(size), None);
        job.update(|p| {
            p.status = DownloadStatus::Complete;
            p.downloaded_bytes = size;
            p.total_bytes = Some(size);
            p.completed_at = Some(Utc::now());
        });
        job
    }

    /// Register one more interested caller. Fails once the job was canceled
    /// so the caller can start a fresh one.
    pub(crate) fn attach(&self) -> bool {
        let mut interest = self.interest.lock().unwrap_or_else(|e| e.into_inner());
        if interest.canceled {
            return false;
        }
        interest.callers += 1;
        true
    }

    /// Drop one caller's interest; the transfer is canceled with the last one.
    pub(crate) fn detach(&self) {
        let mut interest = self.interest.lock().unwrap_or_else(|e| e.into_inner());
        interest.callers = interest.callers.saturating_sub(1);
        if interest.callers == 0 && !self.snapshot().status.is_terminal() {
            interest.canceled = true;
            debug!("No callers left for download {}, canceling", self.id);
            self.cancel.cancel();
        }
    }

    pub fn interested_callers(&self) -> usize {
        self.interest.lock().unwrap_or_else(|e| e.into_inner()).callers
    }

    /// Operator cancel, regardless of interested callers
    pub fn cancel(&self) {
        let mut interest = self.interest.lock().unwrap_or_else(|e| e.into_inner());
        interest.canceled = true;
        info!("Canceling download {} ({})", self.id, self.model_id);
        self.cancel.cancel();
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn control(&self) -> std::sync::MutexGuard<'_, RunControl> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stop transferring but keep the job and its partial file.
    pub fn pause(&self) -> Result<()> {
        if self.snapshot().status.is_terminal() || self.cancel.is_cancelled() {
            return Err(GatewayError::InvalidRequest(format!(
                "download {} already finished",
                self.id
            )));
        }
        let mut control = self.control();
        if !control.paused {
            info!("Pausing download {} ({})", self.id, self.model_id);
            control.paused = true;
            control.stop.cancel();
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let mut control = self.control();
        if !control.paused {
            return Err(GatewayError::InvalidRequest(format!(
                "download {} is not paused",
                self.id
            )));
        }
        info!("Resuming download {} ({})", self.id, self.model_id);
        control.paused = false;
        control.stop = CancellationToken::new();
        self.update(|p| p.status = DownloadStatus::Queued);
        self.resumed.notify_one();
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        self.control().paused
    }

    /// Fires when the current run should stop because of a pause
    pub(crate) fn stop_token(&self) -> CancellationToken {
        self.control().stop.clone()
    }

    /// Status changes that must not overwrite a pause made in the meantime
    pub(crate) fn set_running_status(&self, status: DownloadStatus) {
        let control = self.control();
        if !control.paused {
            self.update(|p| p.status = status);
        }
    }

    pub(crate) fn mark_paused(&self) {
        let control = self.control();
        if control.paused {
            self.update(|p| {
                p.status = DownloadStatus::Paused;
                p.speed_bytes_per_sec = 0;
            });
        }
    }

    /// Wait until resumed. False when the job was canceled instead.
    pub(crate) async fn wait_for_resume(&self) -> bool {
        loop {
            if !self.is_paused() {
                return true;
            }
            tokio::select! {
                _ = self.resumed.notified() => {}
                _ = self.cancel.cancelled() => return false,
            }
        }
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut DownloadProgress)) {
        self.progress.send_modify(f);
    }

    pub(crate) fn finish(&self, result: &Result<()>) {
        self.update(|p| {
            p.completed_at = Some(Utc::now());
            p.speed_bytes_per_sec = 0;
            match result {
                Ok(()) => {
                    p.status = DownloadStatus::Complete;
                    if let Some(total) = p.total_bytes {
                        p.downloaded_bytes = total;
                    }
                }
                Err(GatewayError::Canceled(_)) => p.status = DownloadStatus::Canceled,
                Err(e) => {
                    p.status = DownloadStatus::Failed;
                    p.error = Some(e.to_string());
                    p.failure = Some(e.clone());
                }
            }
        });
    }

    pub fn snapshot(&self) -> DownloadProgress {
        self.progress.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DownloadProgress> {
        self.progress.subscribe()
    }

    pub fn info(&self) -> DownloadInfo {
        let p = self.snapshot();
        let eta_seconds = match (p.total_bytes, p.speed_bytes_per_sec) {
            (Some(total), speed) if speed > 0 && total > p.downloaded_bytes => {
                Some((total - p.downloaded_bytes) / speed)
            }
            _ => None,
        };
        DownloadInfo {
            id: self.id.clone(),
            model_id: self.model_id.clone(),
            url: self.url.clone(),
            file_path: self.destination.clone(),
            status: p.status,
            progress: p.percent(),
            downloaded_bytes: p.downloaded_bytes,
            total_bytes: p.total_bytes,
            speed: p.speed_bytes_per_sec,
            eta_seconds,
            retry_count: p.retry_count,
            start_time: self.started_at,
            error: p.error,
        }
    }
}

/// One caller's interest in a job. Dropping the ticket withdraws it.
pub struct DownloadTicket {
    job: Arc<DownloadJob>,
    rx: watch::Receiver<DownloadProgress>,
    attached: bool,
}

impl DownloadTicket {
    pub(crate) fn attached(job: Arc<DownloadJob>) -> Self {
        let rx = job.subscribe();
        Self {
            job,
            rx,
            attached: true,
        }
    }

    pub(crate) fn ready(job: Arc<DownloadJob>) -> Self {
        let rx = job.subscribe();
        Self {
            job,
            rx,
            attached: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.job.id
    }

    pub fn job(&self) -> &Arc<DownloadJob> {
        &self.job
    }

    pub fn progress(&self) -> DownloadProgress {
        self.rx.borrow().clone()
    }

    pub async fn wait(&mut self) -> Result<PathBuf> {
        self.wait_with_progress(|_| {}).await
    }

    /// Wait for a terminal state, reporting every progress change on the way.
    pub async fn wait_with_progress(
        &mut self,
        mut on_progress: impl FnMut(&DownloadProgress),
    ) -> Result<PathBuf> {
        loop {
            {
                let progress = self.rx.borrow_and_update();
                on_progress(&*progress);
                match progress.status {
                    DownloadStatus::Complete => return Ok(self.job.destination.clone()),
                    DownloadStatus::Failed => {
                        return Err(progress.failure.clone().unwrap_or_else(|| {
                            GatewayError::DownloadFailed(
                                progress.error.clone().unwrap_or_default(),
                            )
                        }))
                    }
                    DownloadStatus::Canceled => {
                        return Err(GatewayError::Canceled(format!(
                            "download of {} was canceled",
                            self.job.model_id
                        )))
                    }
                    _ => {}
                }
            }
            if self.rx.changed().await.is_err() {
                return Err(GatewayError::Internal("download job went away".into()));
            }
        }
    }

    /// Keep the transfer alive after the caller returns.
    pub fn keep_in_background(mut self) {
        tokio::spawn(async move {
            let _ = self.wait().await;
        });
    }
}

impl Drop for DownloadTicket {
    fn drop(&mut self) {
        if self.attached {
            self.job.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> DownloadJob {
        DownloadJob::new("org/m:f.gguf", "http://x/f.gguf", Path::new("/tmp/f.gguf"), Some(100), None)
    }

    #[test]
    fn test_last_detach_cancels() {
        let job = job();
        assert!(job.attach());
        assert!(job.attach());
        job.detach();
        assert!(!job.cancel_token().is_cancelled());
        job.detach();
        assert!(job.cancel_token().is_cancelled());
        assert!(!job.attach(), "canceled jobs refuse new callers");
    }

    #[test]
    fn test_detach_after_completion_does_not_cancel() {
        let job = job();
        assert!(job.attach());
        job.finish(&Ok(()));
        job.detach();
        assert!(!job.cancel_token().is_cancelled());
    }

    #[test]
    fn test_percent_and_info() {
        let job = job();
        job.update(|p| {
            p.status = DownloadStatus::InProgress;
            p.downloaded_bytes = 25;
            p.total_bytes = Some(100);
            p.speed_bytes_per_sec = 25;
        });
        let info = job.info();
        assert_eq!(info.progress, Some(25.0));
        assert_eq!(info.eta_seconds, Some(3));
        assert_eq!(info.status, DownloadStatus::InProgress);
    }

    #[tokio::test]
    async fn test_ticket_reports_failure() {
        let job = Arc::new(job());
        assert!(job.attach());
        let mut ticket = DownloadTicket::attached(job.clone());
        job.finish(&Err(GatewayError::Integrity {
            path: "f".into(),
            reason: "size".into(),
        }));
        let err = ticket.wait().await.unwrap_err();
        assert_eq!(err.kind(), "integrity_error");
    }

    #[test]
    fn test_pause_and_resume_swap_stop_token() {
        let job = job();
        let first = job.stop_token();
        assert_eq!(job.resume().unwrap_err().kind(), "invalid_request");

        job.pause().unwrap();
        job.pause().unwrap();
        assert!(job.is_paused());
        assert!(first.is_cancelled());
        job.mark_paused();
        assert_eq!(job.snapshot().status, DownloadStatus::Paused);
        job.set_running_status(DownloadStatus::InProgress);
        assert_eq!(job.snapshot().status, DownloadStatus::Paused);

        job.resume().unwrap();
        assert!(!job.is_paused());
        assert!(!job.stop_token().is_cancelled());
        assert_eq!(job.snapshot().status, DownloadStatus::Queued);
        assert!(!job.cancel_token().is_cancelled());
    }

    #[test]
    fn test_finished_job_cannot_pause() {
        let job = job();
        job.finish(&Ok(()));
        assert_eq!(job.pause().unwrap_err().kind(), "invalid_request");
    }

    #[tokio::test]
    async fn test_cancel_ends_wait_for_resume() {
        let job = Arc::new(job());
        job.pause().unwrap();
        let waiting = {
            let job = job.clone();
            tokio::spawn(async move { job.wait_for_resume().await })
        };
        job.cancel();
        assert!(!waiting.await.unwrap());
    }

    #[tokio::test]
    async fn test_completed_job_resolves_immediately() {
        let job = Arc::new(DownloadJob::completed("m", Path::new("/tmp/m.gguf"), 10));
        let mut ticket = DownloadTicket::ready(job);
        assert_eq!(ticket.wait().await.unwrap(), PathBuf::from("/tmp/m.gguf"));
    }
}
