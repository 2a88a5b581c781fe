//! Opportunistic reconciliation with the enrollment authority.
//!
//! A pull loop fetches the full enrollment set, merges it into the cache,
//! and persists the result. Every failure is contained to its own cycle:
//! the agent keeps matching against the last known-good snapshot and the
//! loop backs off exponentially until the authority answers again.

use crate::cache::{CacheError, EnrollmentCache, MergeStats};
use chrono::{DateTime, Utc};
use rand::Rng;
use sesame_core::EnrollmentRecord;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("cache: {0}")]
    Cache(#[from] CacheError),
}

/// Wire shape of `GET /agent/sync`.
#[derive(Debug, Deserialize)]
pub struct SyncPayload {
    pub version: u64,
    pub records: Vec<EnrollmentRecord>,
}

/// One access decision, pushed to `POST /agent/events`.
#[derive(Debug, Clone, Serialize)]
pub struct AccessEvent {
    pub identity_id: Option<String>,
    /// "granted" or "denied".
    pub status: &'static str,
    pub score: f32,
    pub device_id: String,
    pub occurred_at: DateTime<Utc>,
}

/// Shared view of sync health for logs and the status surface.
#[derive(Clone, Default)]
pub struct SyncStatus {
    last_success: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl SyncStatus {
    fn mark_success(&self) {
        *self.last_success.lock().unwrap_or_else(|p| p.into_inner()) = Some(Utc::now());
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        *self.last_success.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Seconds since the last successful cycle, if any.
    pub fn staleness_secs(&self) -> Option<i64> {
        self.last_success()
            .map(|at| (Utc::now() - at).num_seconds())
    }
}

pub struct SyncClient {
    http: reqwest::Client,
    base_url: String,
    device_id: String,
    token: Option<String>,
    cache: Arc<EnrollmentCache>,
    interval: Duration,
    max_backoff: Duration,
    status: SyncStatus,
}

impl SyncClient {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        device_id: &str,
        token: Option<String>,
        cache: Arc<EnrollmentCache>,
        interval: Duration,
        max_backoff: Duration,
    ) -> (Self, SyncStatus) {
        let status = SyncStatus::default();
        (
            Self {
                http,
                base_url: base_url.trim_end_matches('/').to_string(),
                device_id: device_id.to_string(),
                token,
                cache,
                interval,
                max_backoff,
                status: status.clone(),
            },
            status,
        )
    }

    /// Fetch, merge, persist. Cancelling mid-fetch never touches the cache.
    pub async fn run_cycle(&self) -> Result<MergeStats, SyncError> {
        let url = format!("{}/agent/sync", self.base_url);
        let mut request = self.http.get(&url).header("X-Device-Id", &self.device_id);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let payload: SyncPayload = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if payload.version == self.cache.snapshot().version {
            tracing::debug!(version = payload.version, "remote enrollment set unchanged");
        }

        let stats = self.cache.merge(payload.records, payload.version)?;
        self.cache.persist()?;
        self.status.mark_success();
        Ok(stats)
    }

    /// Run the reconciliation loop until the nudge channel closes or the
    /// task is aborted. `sync_now` requests an out-of-band cycle (D-Bus
    /// `SyncNow`); the first cycle runs immediately at startup.
    pub async fn run(self, mut sync_now: mpsc::Receiver<()>) {
        tracing::info!(
            base_url = %self.base_url,
            interval_secs = self.interval.as_secs(),
            "sync client started"
        );
        let mut delay = self.interval;

        loop {
            match self.run_cycle().await {
                Ok(stats) => {
                    tracing::info!(
                        added = stats.added,
                        updated = stats.updated,
                        removed = stats.removed,
                        version = self.cache.snapshot().version,
                        "sync cycle complete"
                    );
                    delay = self.interval;
                }
                Err(e) => {
                    match self.status.staleness_secs() {
                        Some(age) => tracing::warn!(
                            error = %e,
                            last_synced_secs_ago = age,
                            "sync cycle failed, operating on last known-good cache"
                        ),
                        None => tracing::warn!(
                            error = %e,
                            "sync cycle failed, no successful sync yet"
                        ),
                    }
                    delay = (delay * 2).min(self.max_backoff);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(jittered(delay)) => {}
                nudge = sync_now.recv() => {
                    if nudge.is_none() {
                        break;
                    }
                    tracing::info!("immediate sync requested");
                }
            }
        }
        tracing::info!("sync client stopped");
    }
}

/// Add up to 10% random jitter so a fleet of agents doesn't thunder at the
/// authority in lockstep.
fn jittered(delay: Duration) -> Duration {
    let tenth = (delay.as_millis() as u64 / 10).max(1);
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..tenth))
}

/// Fire-and-forget access-event reporting.
///
/// Decisions flow through a bounded queue to a posting task; a full queue
/// or a failed POST is logged and dropped so the frame loop never blocks
/// on the network.
#[derive(Clone)]
pub struct EventReporter {
    tx: mpsc::Sender<AccessEvent>,
}

const EVENT_QUEUE: usize = 64;

impl EventReporter {
    pub fn report(&self, event: AccessEvent) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::debug!(error = %e, "access event dropped");
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> (Self, mpsc::Receiver<AccessEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        (Self { tx }, rx)
    }
}

pub fn spawn_event_reporter(
    http: reqwest::Client,
    base_url: &str,
    device_id: &str,
    token: Option<String>,
) -> (EventReporter, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<AccessEvent>(EVENT_QUEUE);
    let url = format!("{}/agent/events", base_url.trim_end_matches('/'));
    let device_id = device_id.to_string();

    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let mut request = http.post(&url).header("X-Device-Id", &device_id);
            if let Some(token) = &token {
                request = request.bearer_auth(token);
            }
            match request.json(&event).send().await {
                Ok(response) => {
                    if let Err(e) = response.error_for_status() {
                        tracing::warn!(error = %e, "failed to push access event");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to push access event"),
            }
        }
    });

    (EventReporter { tx }, task)
}
