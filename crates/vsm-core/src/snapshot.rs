//! Restart-warmth persistence: periodically (or on explicit request) dumps
//! the store's current contents to `data_dir` so a restarted process can
//! rehydrate recent history instead of starting cold. Gated behind
//! `VsmConfig.data_dir` — when it's `None` this module is never invoked.

use std::path::Path;

use serde::{Deserialize, Serialize};
use vsm_types::NodeId;

use crate::clock::HlcTimestamp;
use crate::error::CoreError;
use crate::event::Event;

const SNAPSHOT_VERSION: u32 = 1;
const SNAPSHOT_FILE_NAME: &str = "vsm_store_snapshot.json";

/// On-disk representation of the store's state at `watermark_hlc` (spec's
/// Supplemented Features: "persisted restart-warmth StoreSnapshot").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub node_id: NodeId,
    pub watermark_hlc: HlcTimestamp,
    pub events: Vec<Event>,
}

impl StoreSnapshot {
    pub fn new(node_id: NodeId, watermark_hlc: HlcTimestamp, events: Vec<Event>) -> Self {
        Self { version: SNAPSHOT_VERSION, node_id, watermark_hlc, events }
    }

    fn path(dir: &Path) -> std::path::PathBuf {
        dir.join(SNAPSHOT_FILE_NAME)
    }

    /// Writes the snapshot to `dir`, creating it if necessary. Uses a
    /// temp-file-then-rename so a crash mid-write can't corrupt the
    /// previous snapshot (spec's error handling design: persistence should
    /// fail closed, not partially).
    pub async fn save(&self, dir: &Path) -> Result<(), CoreError> {
        tokio::fs::create_dir_all(dir).await?;
        let json = serde_json::to_vec(self)?;
        let final_path = Self::path(dir);
        let tmp_path = dir.join(format!("{SNAPSHOT_FILE_NAME}.tmp"));
        tokio::fs::write(&tmp_path, &json).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;
        tracing::info!(
            path = %final_path.display(),
            events = self.events.len(),
            watermark = %self.watermark_hlc,
            "store snapshot saved"
        );
        Ok(())
    }

    /// Loads the snapshot from `dir` if present. Returns `Ok(None)` if no
    /// snapshot file exists yet (first run), and rejects a version mismatch
    /// rather than attempting to interpret an incompatible layout.
    pub async fn load(dir: &Path) -> Result<Option<Self>, CoreError> {
        let path = Self::path(dir);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CoreError::Io(e)),
        };
        let snapshot: StoreSnapshot = serde_json::from_slice(&bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(CoreError::StoreCorrupt(format!(
                "snapshot version {} unsupported, expected {}",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }
        tracing::info!(
            path = %path.display(),
            events = snapshot.events.len(),
            watermark = %snapshot.watermark_hlc,
            "store snapshot loaded"
        );
        Ok(Some(snapshot))
    }
}
