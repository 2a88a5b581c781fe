//! Durable enrollment cache — the single source of truth for matching.
//!
//! Readers take immutable snapshots behind an `Arc`; a merge computes the
//! next snapshot off to the side and swaps the pointer, so the matcher can
//! never observe a half-applied sync cycle. Persistence is a whole-file
//! JSON snapshot replaced atomically (temp file, fsync, rename), so a crash
//! mid-write leaves the previous complete snapshot on disk.

use sesame_core::EnrollmentRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed cache file {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(
        "remote record {identity_id} has a {actual}-dim embedding, deployment expects {expected}"
    )]
    DimensionMismatch {
        identity_id: String,
        actual: usize,
        expected: usize,
    },
}

/// Immutable, internally consistent view of the enrolled set.
#[derive(Debug, Default)]
pub struct CacheSnapshot {
    /// Sorted by `identity_id`.
    records: Vec<EnrollmentRecord>,
    pub version: u64,
}

impl CacheSnapshot {
    pub fn records(&self) -> &[EnrollmentRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Outcome of one merge, for logs and the status surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeStats {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

/// On-disk form. Round-trips losslessly through serde_json.
#[derive(Serialize, Deserialize)]
struct PersistedCache {
    version: u64,
    records: Vec<EnrollmentRecord>,
}

pub struct EnrollmentCache {
    snapshot: RwLock<Arc<CacheSnapshot>>,
    path: PathBuf,
    expected_dim: usize,
}

impl EnrollmentCache {
    /// Load the persisted snapshot, or start empty when none exists.
    ///
    /// A malformed file is quarantined (renamed with a `.corrupt` suffix)
    /// and the agent starts empty rather than refusing to boot; the sync
    /// client will repopulate on the next successful cycle.
    pub fn load(path: &Path, expected_dim: usize) -> Self {
        let snapshot = match read_snapshot(path, expected_dim) {
            Ok(snapshot) => {
                tracing::info!(
                    path = %path.display(),
                    records = snapshot.len(),
                    version = snapshot.version,
                    "enrollment cache loaded"
                );
                snapshot
            }
            Err(CacheError::Malformed { path: p, source }) => {
                let quarantine = p.with_extension("json.corrupt");
                tracing::error!(
                    path = %p.display(),
                    quarantine = %quarantine.display(),
                    error = %source,
                    "persisted cache is malformed, quarantining and starting empty"
                );
                if let Err(e) = std::fs::rename(&p, &quarantine) {
                    tracing::warn!(error = %e, "failed to quarantine malformed cache");
                }
                CacheSnapshot::default()
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to read persisted cache, starting empty");
                CacheSnapshot::default()
            }
        };

        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            path: path.to_path_buf(),
            expected_dim,
        }
    }

    /// Current snapshot. The lock is held only to clone the `Arc`.
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the enrolled set with the merge of local and remote:
    /// remote-only records are added, records on both sides keep whichever
    /// has the higher `revision` (ties fall to the later `updated_at`, a
    /// full tie takes the remote copy), and local-only records are removed
    /// — the authority owns deletions.
    ///
    /// The whole merge is rejected, previous snapshot intact, if any remote
    /// record's dimensionality contradicts the deployment's.
    pub fn merge(
        &self,
        remote: Vec<EnrollmentRecord>,
        remote_version: u64,
    ) -> Result<MergeStats, CacheError> {
        for record in &remote {
            let actual = record.embedding.dim();
            if actual != self.expected_dim {
                return Err(CacheError::DimensionMismatch {
                    identity_id: record.identity_id.clone(),
                    actual,
                    expected: self.expected_dim,
                });
            }
        }

        let current = self.snapshot();
        let local: BTreeMap<&str, &EnrollmentRecord> = current
            .records()
            .iter()
            .map(|r| (r.identity_id.as_str(), r))
            .collect();

        let mut stats = MergeStats::default();
        let mut merged: BTreeMap<String, EnrollmentRecord> = BTreeMap::new();

        for remote_record in remote {
            match local.get(remote_record.identity_id.as_str()) {
                None => {
                    stats.added += 1;
                    merged.insert(remote_record.identity_id.clone(), remote_record);
                }
                Some(local_record) => {
                    let keep_local = local_record.revision > remote_record.revision
                        || (local_record.revision == remote_record.revision
                            && local_record.updated_at > remote_record.updated_at);
                    if keep_local {
                        merged.insert(
                            local_record.identity_id.clone(),
                            (*local_record).clone(),
                        );
                    } else {
                        if local_record.revision != remote_record.revision
                            || local_record.updated_at != remote_record.updated_at
                        {
                            stats.updated += 1;
                        }
                        merged.insert(remote_record.identity_id.clone(), remote_record);
                    }
                }
            }
        }

        stats.removed = local
            .keys()
            .filter(|id| !merged.contains_key(*id))
            .count();

        let next = Arc::new(CacheSnapshot {
            records: merged.into_values().collect(),
            version: remote_version,
        });

        // The only writer exclusion in the whole cache: one pointer swap.
        *self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = next;

        Ok(stats)
    }

    /// Write the current snapshot to disk atomically.
    pub fn persist(&self) -> Result<(), CacheError> {
        let snapshot = self.snapshot();
        let persisted = PersistedCache {
            version: snapshot.version,
            records: snapshot.records.clone(),
        };

        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(&mut tmp, &persisted).map_err(|source| {
            CacheError::Malformed {
                path: self.path.clone(),
                source,
            }
        })?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| CacheError::Io(e.error))?;

        tracing::debug!(
            path = %self.path.display(),
            records = snapshot.len(),
            version = snapshot.version,
            "enrollment cache persisted"
        );
        Ok(())
    }
}

fn read_snapshot(path: &Path, expected_dim: usize) -> Result<CacheSnapshot, CacheError> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no persisted cache, starting empty");
        return Ok(CacheSnapshot::default());
    }

    let raw = std::fs::read_to_string(path)?;
    let persisted: PersistedCache =
        serde_json::from_str(&raw).map_err(|source| CacheError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;

    // A deployment's dimensionality can legitimately change (extractor
    // swap); stale records would never match anyway, so drop them rather
    // than refuse to start.
    let mut records: Vec<EnrollmentRecord> = Vec::with_capacity(persisted.records.len());
    for record in persisted.records {
        if record.embedding.dim() == expected_dim {
            records.push(record);
        } else {
            tracing::warn!(
                identity_id = %record.identity_id,
                dim = record.embedding.dim(),
                expected = expected_dim,
                "dropping persisted record with stale dimensionality"
            );
        }
    }
    records.sort_by(|a, b| a.identity_id.cmp(&b.identity_id));

    Ok(CacheSnapshot {
        records,
        version: persisted.version,
    })
}
