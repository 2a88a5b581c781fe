use crate::cache::EnrollmentCache;
use crate::sync::SyncStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// D-Bus surface of the access agent.
///
/// Bus name: org.sesame.Agent1
/// Object path: /org/sesame/Agent1
///
/// Observability only — nothing here can unlock the door.
pub struct AgentService {
    cache: Arc<EnrollmentCache>,
    sync_status: SyncStatus,
    sync_now: mpsc::Sender<()>,
    /// Age past which the agent reports itself degraded.
    stale_after: Duration,
}

#[zbus::interface(name = "org.sesame.Agent1")]
impl AgentService {
    /// Agent status as JSON: cache size/version, sync age, degraded flag.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let snapshot = self.cache.snapshot();
        let last_sync = self.sync_status.last_success();
        let age_secs = self.sync_status.staleness_secs();
        let degraded = match age_secs {
            Some(age) => age > self.stale_after.as_secs() as i64,
            None => true,
        };

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "enrolled": snapshot.len(),
            "cache_version": snapshot.version,
            "last_sync": last_sync.map(|t| t.to_rfc3339()),
            "last_sync_age_secs": age_secs,
            "degraded": degraded,
        })
        .to_string())
    }

    /// Enrolled identities as JSON, metadata only — embeddings never leave
    /// the agent.
    async fn list_enrollments(&self) -> zbus::fdo::Result<String> {
        let snapshot = self.cache.snapshot();
        let entries: Vec<_> = snapshot
            .records()
            .iter()
            .map(|r| {
                serde_json::json!({
                    "identity_id": r.identity_id,
                    "display_name": r.display_name,
                    "revision": r.revision,
                    "updated_at": r.updated_at.to_rfc3339(),
                })
            })
            .collect();
        Ok(serde_json::Value::Array(entries).to_string())
    }

    /// Nudge the sync loop to run a cycle now. Returns false if a nudge is
    /// already pending.
    async fn sync_now(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("sync_now requested over D-Bus");
        Ok(self.sync_now.try_send(()).is_ok())
    }
}

/// Register the service, preferring the system bus and falling back to the
/// session bus for development runs.
pub async fn serve(
    cache: Arc<EnrollmentCache>,
    sync_status: SyncStatus,
    sync_now: mpsc::Sender<()>,
    stale_after: Duration,
) -> zbus::Result<zbus::Connection> {
    let service = AgentService {
        cache,
        sync_status,
        sync_now,
        stale_after,
    };

    let builder = match zbus::connection::Builder::system() {
        Ok(builder) => builder,
        Err(e) => {
            tracing::warn!(error = %e, "system bus unavailable, trying session bus");
            zbus::connection::Builder::session()?
        }
    };

    let connection = builder
        .name("org.sesame.Agent1")?
        .serve_at("/org/sesame/Agent1", service)?
        .build()
        .await?;

    tracing::info!("D-Bus interface registered as org.sesame.Agent1");
    Ok(connection)
}
