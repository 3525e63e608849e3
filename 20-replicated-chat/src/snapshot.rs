//! Full-state snapshots on disk, one file per server identity.
//!
//! Each write replaces the previous snapshot wholesale: the state is
//! serialized to a temporary file next to the target and renamed over it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::{error::SnapshotError, state::ServerState};

/// What lands on disk: the server state plus when it was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(flatten)]
    pub state: ServerState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    /// A store for server `server_id` inside `dir`.
    pub fn new(dir: impl AsRef<Path>, server_id: u32) -> Self {
        Self {
            path: dir.as_ref().join(format!("server_{server_id}.json")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the last snapshot, or `None` if this server never wrote one.
    pub async fn load(&self) -> Result<Option<Snapshot>, SnapshotError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SnapshotError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let snapshot = serde_json::from_slice(&bytes).map_err(|source| SnapshotError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(snapshot))
    }

    /// Overwrites the snapshot with `state`, stamped with the current time.
    pub async fn save(&self, state: &ServerState) -> Result<(), SnapshotError> {
        let snapshot = Snapshot {
            state: state.clone(),
            timestamp: Utc::now(),
        };
        let encoded = serde_json::to_vec_pretty(&snapshot).map_err(SnapshotError::Encode)?;

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await.map_err(|source| self.io_error(source))?;
        }
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, &encoded)
            .await
            .map_err(|source| self.io_error(source))?;
        fs::rename(&staging, &self.path)
            .await
            .map_err(|source| self.io_error(source))?;

        debug!(path = %self.path.display(), bytes = encoded.len(), "snapshot written");
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> SnapshotError {
        SnapshotError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
