//! # Checkpoint Store — Durable, Atomic, One-Per-Operation
//!
//! Persists `(operation_id → {type, state, artifacts})` with UPSERT
//! semantics: the state body lives in the `checkpoints` table as JSONB,
//! artifacts live on the shared filesystem under
//! `<CHECKPOINT_DIR>/<operation_id>/`.
//!
//! ## Atomic Writes
//!
//! Artifacts are written to a per-operation staging directory
//! (`<operation_id>.staging.<nonce>`), then the staging directory is
//! atomically renamed to the canonical path. The database row is written
//! only after the rename succeeds. On database failure the freshly-renamed
//! directory is removed best-effort; on filesystem failure the staging
//! directory is removed and the database is never touched. A crashed save
//! leaves a staging directory behind; [`CheckpointStore::sweep_staging`]
//! removes stale ones at startup.
//!
//! ## Integrity
//!
//! A `MANIFEST` file in the artifact directory records name, byte size and
//! SHA-256 per artifact. `load(…, load_artifacts = true)` verifies the
//! directory against the manifest and the manifest against the required
//! artifact set for the operation type; any mismatch surfaces as
//! `CheckpointCorrupted`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::{CheckpointRow, CheckpointSummary, Database};
use crate::error::{CoreError, CoreResult, WriteOrigin};
use crate::operation::OperationType;

/// Current checkpoint state schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Artifact file name for the manifest itself.
const MANIFEST_NAME: &str = "MANIFEST";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    Periodic,
    Cancellation,
    Failure,
    Shutdown,
}

impl CheckpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointType::Periodic => "periodic",
            CheckpointType::Cancellation => "cancellation",
            CheckpointType::Failure => "failure",
            CheckpointType::Shutdown => "shutdown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "periodic" => Some(CheckpointType::Periodic),
            "cancellation" => Some(CheckpointType::Cancellation),
            "failure" => Some(CheckpointType::Failure),
            "shutdown" => Some(CheckpointType::Shutdown),
            _ => None,
        }
    }
}

// ── State shapes ────────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TrainingHistory {
    pub loss: Vec<f64>,
    pub val_loss: Vec<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub avg_price: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub bar_index: u64,
    pub symbol: String,
    pub side: String,
    pub quantity: f64,
    pub price: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EquitySample {
    pub bar_index: u64,
    pub equity: f64,
}

/// Checkpoint state, one shape per operation type, tagged for dispatch.
/// The core routes on the tag and otherwise guarantees round-trip
/// preservation only.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "operation_type", rename_all = "snake_case")]
pub enum CheckpointState {
    Training {
        schema_version: u32,
        epoch: u64,
        train_loss: f64,
        val_loss: f64,
        learning_rate: f64,
        best_val_loss: f64,
        training_history: TrainingHistory,
        request_payload_ref: String,
    },
    Backtesting {
        schema_version: u32,
        bar_index: u64,
        current_date: String,
        cash: f64,
        positions: Vec<Position>,
        trades: Vec<Trade>,
        equity_samples: Vec<EquitySample>,
        request_payload_ref: String,
    },
}

impl CheckpointState {
    pub fn operation_type(&self) -> OperationType {
        match self {
            CheckpointState::Training { .. } => OperationType::Training,
            CheckpointState::Backtesting { .. } => OperationType::Backtesting,
        }
    }

    /// The point a resumed run continues from, surfaced in the resume
    /// response (`resumed_from.resume_point`).
    pub fn resume_point(&self) -> Value {
        match self {
            CheckpointState::Training { epoch, .. } => serde_json::json!({ "epoch": epoch }),
            CheckpointState::Backtesting { bar_index, .. } => {
                serde_json::json!({ "bar_index": bar_index })
            }
        }
    }

    /// Artifact names that must be present for this state to be resumable.
    pub fn required_artifacts(&self) -> &'static [&'static str] {
        match self {
            CheckpointState::Training { .. } => &["model.pt", "optimizer.pt"],
            CheckpointState::Backtesting { .. } => &[],
        }
    }
}

/// An artifact to persist alongside the checkpoint state.
#[derive(Clone, Debug)]
pub struct ArtifactFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl ArtifactFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        ArtifactFile {
            name: name.into(),
            bytes,
        }
    }
}

/// A checkpoint loaded back from the store.
#[derive(Clone, Debug)]
pub struct LoadedCheckpoint {
    pub checkpoint_type: CheckpointType,
    pub created_at: DateTime<Utc>,
    pub state: CheckpointState,
    /// Canonical artifact directory, present when artifacts were saved.
    pub artifact_dir: Option<PathBuf>,
    pub state_bytes: i64,
    pub artifact_bytes: i64,
}

// ── Manifest ────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct Manifest {
    artifacts: Vec<ManifestEntry>,
}

#[derive(Serialize, Deserialize)]
struct ManifestEntry {
    name: String,
    bytes: u64,
    sha256: String,
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Write an artifact set plus its manifest into `dir`. Returns total bytes.
fn write_artifact_set(dir: &Path, artifacts: &[ArtifactFile]) -> std::io::Result<u64> {
    fs::create_dir_all(dir)?;
    let mut entries = Vec::with_capacity(artifacts.len());
    let mut total = 0u64;
    for artifact in artifacts {
        fs::write(dir.join(&artifact.name), &artifact.bytes)?;
        total += artifact.bytes.len() as u64;
        entries.push(ManifestEntry {
            name: artifact.name.clone(),
            bytes: artifact.bytes.len() as u64,
            sha256: sha256_hex(&artifact.bytes),
        });
    }
    let manifest = Manifest { artifacts: entries };
    let manifest_json =
        serde_json::to_string_pretty(&manifest).expect("manifest serialization is infallible");
    fs::write(dir.join(MANIFEST_NAME), manifest_json)?;
    Ok(total)
}

/// Verify `dir` against its manifest and the required artifact names.
/// Checks presence, size, digest, and that the directory holds nothing
/// beyond the manifest's artifact set.
fn verify_artifact_set(dir: &Path, required: &[&str]) -> Result<(), String> {
    let manifest_raw = fs::read_to_string(dir.join(MANIFEST_NAME))
        .map_err(|e| format!("manifest unreadable: {}", e))?;
    let manifest: Manifest =
        serde_json::from_str(&manifest_raw).map_err(|e| format!("manifest unparseable: {}", e))?;

    for name in required {
        if !manifest.artifacts.iter().any(|a| a.name == *name) {
            return Err(format!("required artifact {} missing from manifest", name));
        }
    }

    for entry in &manifest.artifacts {
        let path = dir.join(&entry.name);
        let bytes = fs::read(&path)
            .map_err(|e| format!("artifact {} unreadable: {}", entry.name, e))?;
        if bytes.len() as u64 != entry.bytes {
            return Err(format!(
                "artifact {} size mismatch: manifest {} bytes, disk {} bytes",
                entry.name,
                entry.bytes,
                bytes.len()
            ));
        }
        let digest = sha256_hex(&bytes);
        if digest != entry.sha256 {
            return Err(format!("artifact {} digest mismatch", entry.name));
        }
    }

    for dirent in fs::read_dir(dir).map_err(|e| format!("artifact dir unreadable: {}", e))? {
        let dirent = dirent.map_err(|e| format!("artifact dir unreadable: {}", e))?;
        let name = dirent.file_name().to_string_lossy().to_string();
        if name != MANIFEST_NAME && !manifest.artifacts.iter().any(|a| a.name == name) {
            return Err(format!("unexpected file {} in artifact directory", name));
        }
    }
    Ok(())
}

// ── Store ───────────────────────────────────────────────────────

#[derive(Clone)]
pub struct CheckpointStore {
    base_dir: PathBuf,
    db: Database,
}

impl CheckpointStore {
    pub fn new(base_dir: impl Into<PathBuf>, db: Database) -> Self {
        CheckpointStore {
            base_dir: base_dir.into(),
            db,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn canonical_dir(&self, operation_id: &str) -> PathBuf {
        self.base_dir.join(operation_id)
    }

    /// Save a checkpoint, replacing any existing one. Artifacts first
    /// (staging + rename), database row second.
    pub async fn save(
        &self,
        operation_id: &str,
        checkpoint_type: CheckpointType,
        state: &CheckpointState,
        artifacts: &[ArtifactFile],
    ) -> CoreResult<()> {
        for name in state.required_artifacts() {
            if !artifacts.iter().any(|a| a.name == *name) {
                return Err(CoreError::CheckpointWrite {
                    operation_id: operation_id.to_string(),
                    origin: WriteOrigin::Filesystem,
                    source: anyhow::anyhow!("required artifact {} not supplied", name),
                });
            }
        }

        let state_json = serde_json::to_value(state).map_err(anyhow::Error::from)?;
        let state_bytes = serde_json::to_vec(&state_json)
            .map_err(anyhow::Error::from)?
            .len() as i64;

        let mut artifact_handle: Option<String> = None;
        let mut artifact_bytes: i64 = 0;
        if !artifacts.is_empty() {
            let canonical = self.canonical_dir(operation_id);
            let nonce = uuid::Uuid::new_v4().simple().to_string();
            let staging = self
                .base_dir
                .join(format!("{}.staging.{}", operation_id, nonce));

            let total = match write_artifact_set(&staging, artifacts) {
                Ok(total) => total,
                Err(e) => {
                    let _ = fs::remove_dir_all(&staging);
                    return Err(CoreError::CheckpointWrite {
                        operation_id: operation_id.to_string(),
                        origin: WriteOrigin::Filesystem,
                        source: e.into(),
                    });
                }
            };

            // rename(2) cannot replace a non-empty directory, so an existing
            // artifact set is moved aside first and restored on failure.
            let result = if canonical.exists() {
                let prev = self.base_dir.join(format!("{}.prev.{}", operation_id, nonce));
                fs::rename(&canonical, &prev)
                    .and_then(|_| {
                        fs::rename(&staging, &canonical).inspect_err(|_| {
                            let _ = fs::rename(&prev, &canonical);
                        })
                    })
                    .map(|_| {
                        let _ = fs::remove_dir_all(&prev);
                    })
            } else {
                fs::rename(&staging, &canonical)
            };
            if let Err(e) = result {
                let _ = fs::remove_dir_all(&staging);
                return Err(CoreError::CheckpointWrite {
                    operation_id: operation_id.to_string(),
                    origin: WriteOrigin::Filesystem,
                    source: e.into(),
                });
            }

            artifact_handle = Some(canonical.to_string_lossy().to_string());
            artifact_bytes = total as i64;
        }

        if let Err(e) = self
            .db
            .upsert_checkpoint(
                operation_id,
                checkpoint_type.as_str(),
                state.operation_type().as_str(),
                &state_json,
                artifact_handle.as_deref(),
                state_bytes,
                artifact_bytes,
            )
            .await
        {
            // One cleanup attempt, then surface. The caller either retries
            // on the next tick or accepts the checkpoint is lost.
            if artifact_handle.is_some() {
                let _ = fs::remove_dir_all(self.canonical_dir(operation_id));
            }
            return Err(CoreError::CheckpointWrite {
                operation_id: operation_id.to_string(),
                origin: WriteOrigin::Database,
                source: e,
            });
        }
        Ok(())
    }

    /// Load the checkpoint, or `None` when no row exists. With
    /// `load_artifacts` the artifact set is verified against the manifest.
    pub async fn load(
        &self,
        operation_id: &str,
        load_artifacts: bool,
    ) -> CoreResult<Option<LoadedCheckpoint>> {
        let Some(row) = self
            .db
            .get_checkpoint(operation_id)
            .await
            .map_err(CoreError::Other)?
        else {
            return Ok(None);
        };

        let state: CheckpointState =
            serde_json::from_value(row.state.clone()).map_err(|e| {
                CoreError::CheckpointCorrupted {
                    operation_id: operation_id.to_string(),
                    reason: format!("state body unparseable: {}", e),
                }
            })?;
        let checkpoint_type = CheckpointType::parse(&row.checkpoint_type).ok_or_else(|| {
            CoreError::CheckpointCorrupted {
                operation_id: operation_id.to_string(),
                reason: format!("unknown checkpoint type {}", row.checkpoint_type),
            }
        })?;

        let artifact_dir = row.artifact_handle.as_deref().map(PathBuf::from);
        if load_artifacts {
            if let Some(dir) = &artifact_dir {
                verify_artifact_set(dir, state.required_artifacts()).map_err(|reason| {
                    CoreError::CheckpointCorrupted {
                        operation_id: operation_id.to_string(),
                        reason,
                    }
                })?;
            } else if !state.required_artifacts().is_empty() {
                return Err(CoreError::CheckpointCorrupted {
                    operation_id: operation_id.to_string(),
                    reason: "state requires artifacts but none were saved".to_string(),
                });
            }
        }

        Ok(Some(LoadedCheckpoint {
            checkpoint_type,
            created_at: row.created_at,
            state,
            artifact_dir,
            state_bytes: row.state_bytes,
            artifact_bytes: row.artifact_bytes,
        }))
    }

    /// Raw row access for inspection endpoints (no artifact verification).
    pub async fn get_row(&self, operation_id: &str) -> CoreResult<Option<CheckpointRow>> {
        self.db
            .get_checkpoint(operation_id)
            .await
            .map_err(CoreError::Other)
    }

    /// Remove both row and artifact directory. Idempotent; returns whether
    /// anything was removed.
    pub async fn delete(&self, operation_id: &str) -> CoreResult<bool> {
        let row_removed = self
            .db
            .delete_checkpoint_row(operation_id)
            .await
            .map_err(CoreError::Other)?;
        let dir = self.canonical_dir(operation_id);
        let dir_removed = dir.exists();
        if dir_removed {
            fs::remove_dir_all(&dir).map_err(|e| CoreError::CheckpointWrite {
                operation_id: operation_id.to_string(),
                origin: WriteOrigin::Filesystem,
                source: e.into(),
            })?;
        }
        Ok(row_removed || dir_removed)
    }

    pub async fn list(
        &self,
        older_than_hours: Option<i64>,
        operation_type: Option<OperationType>,
    ) -> CoreResult<Vec<CheckpointSummary>> {
        self.db
            .list_checkpoints(older_than_hours, operation_type.map(|t| t.as_str()))
            .await
            .map_err(CoreError::Other)
    }

    /// Remove staging (and moved-aside) directories older than `max_age`.
    /// Crashed saves leave these behind; they are never the canonical set.
    pub fn sweep_staging(&self, max_age: Duration) -> std::io::Result<usize> {
        sweep_staging_dirs(&self.base_dir, max_age)
    }
}

/// Remove leftover `*.staging.*` / `*.prev.*` directories under `base_dir`
/// whose mtime is older than `max_age`.
pub fn sweep_staging_dirs(base_dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    let mut removed = 0;
    if !base_dir.exists() {
        return Ok(0);
    }
    for entry in fs::read_dir(base_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.contains(".staging.") && !name.contains(".prev.") {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok());
        if age.map(|a| a > max_age).unwrap_or(true) {
            fs::remove_dir_all(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Sample training state for tests and documentation.
pub fn sample_training_state(epoch: u64, payload_ref: &str) -> CheckpointState {
    CheckpointState::Training {
        schema_version: SCHEMA_VERSION,
        epoch,
        train_loss: 0.42,
        val_loss: 0.48,
        learning_rate: 1e-3,
        best_val_loss: 0.45,
        training_history: TrainingHistory {
            loss: vec![0.9, 0.6, 0.42],
            val_loss: vec![0.95, 0.7, 0.48],
        },
        request_payload_ref: payload_ref.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serde_tags_on_operation_type() {
        let state = sample_training_state(5, "op_A");
        let v = serde_json::to_value(&state).unwrap();
        assert_eq!(v["operation_type"], "training");
        assert_eq!(v["epoch"], 5);
        assert_eq!(v["schema_version"], SCHEMA_VERSION);
        let back: CheckpointState = serde_json::from_value(v).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn backtesting_state_roundtrips() {
        let state = CheckpointState::Backtesting {
            schema_version: SCHEMA_VERSION,
            bar_index: 40_000,
            current_date: "2024-06-01T00:00:00Z".to_string(),
            cash: 99_123.5,
            positions: vec![Position {
                symbol: "EURUSD".to_string(),
                quantity: 10_000.0,
                avg_price: 1.0832,
            }],
            trades: vec![Trade {
                bar_index: 39_990,
                symbol: "EURUSD".to_string(),
                side: "buy".to_string(),
                quantity: 10_000.0,
                price: 1.0832,
            }],
            equity_samples: vec![EquitySample {
                bar_index: 40_000,
                equity: 100_456.0,
            }],
            request_payload_ref: "op_F".to_string(),
        };
        let v = serde_json::to_value(&state).unwrap();
        assert_eq!(v["operation_type"], "backtesting");
        assert_eq!(v["bar_index"], 40_000);
        let back: CheckpointState = serde_json::from_value(v).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn resume_point_exposes_unit_index() {
        let t = sample_training_state(5, "op_A");
        assert_eq!(t.resume_point()["epoch"], 5);
    }

    #[test]
    fn required_artifacts_by_type() {
        let t = sample_training_state(1, "x");
        assert_eq!(t.required_artifacts(), &["model.pt", "optimizer.pt"]);
    }

    #[test]
    fn checkpoint_type_roundtrips() {
        for t in [
            CheckpointType::Periodic,
            CheckpointType::Cancellation,
            CheckpointType::Failure,
            CheckpointType::Shutdown,
        ] {
            assert_eq!(CheckpointType::parse(t.as_str()), Some(t));
        }
        assert_eq!(CheckpointType::parse("hourly"), None);
    }

    #[test]
    fn write_then_verify_artifact_set() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("op_A");
        let artifacts = vec![
            ArtifactFile::new("model.pt", vec![1u8; 128]),
            ArtifactFile::new("optimizer.pt", vec![2u8; 64]),
        ];
        let total = write_artifact_set(&target, &artifacts).unwrap();
        assert_eq!(total, 192);
        verify_artifact_set(&target, &["model.pt", "optimizer.pt"]).unwrap();
    }

    #[test]
    fn verify_detects_missing_required_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("op_A");
        let artifacts = vec![ArtifactFile::new("model.pt", vec![1u8; 16])];
        write_artifact_set(&target, &artifacts).unwrap();
        let err = verify_artifact_set(&target, &["model.pt", "optimizer.pt"]).unwrap_err();
        assert!(err.contains("optimizer.pt"));
    }

    #[test]
    fn verify_detects_tampered_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("op_A");
        let artifacts = vec![ArtifactFile::new("model.pt", vec![1u8; 16])];
        write_artifact_set(&target, &artifacts).unwrap();
        fs::write(target.join("model.pt"), vec![9u8; 16]).unwrap();
        let err = verify_artifact_set(&target, &["model.pt"]).unwrap_err();
        assert!(err.contains("digest mismatch"));
    }

    #[test]
    fn verify_detects_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("op_A");
        write_artifact_set(&target, &[ArtifactFile::new("model.pt", vec![1u8; 16])]).unwrap();
        fs::write(target.join("model.pt"), vec![1u8; 8]).unwrap();
        let err = verify_artifact_set(&target, &["model.pt"]).unwrap_err();
        assert!(err.contains("size mismatch"));
    }

    #[test]
    fn verify_detects_unexpected_extra_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("op_A");
        write_artifact_set(&target, &[ArtifactFile::new("model.pt", vec![1u8; 16])]).unwrap();
        fs::write(target.join("stray.bin"), b"junk").unwrap();
        let err = verify_artifact_set(&target, &["model.pt"]).unwrap_err();
        assert!(err.contains("unexpected file"));
    }

    #[test]
    fn sweep_removes_only_stale_staging_dirs() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("op_A.staging.deadbeef")).unwrap();
        fs::create_dir_all(dir.path().join("op_B.prev.cafe")).unwrap();
        fs::create_dir_all(dir.path().join("op_C")).unwrap();

        // Everything is younger than an hour — nothing removed.
        let removed = sweep_staging_dirs(dir.path(), Duration::from_secs(3600)).unwrap();
        assert_eq!(removed, 0);

        // Zero max-age treats all staging dirs as stale; canonical survives.
        let removed = sweep_staging_dirs(dir.path(), Duration::from_secs(0)).unwrap();
        assert_eq!(removed, 2);
        assert!(dir.path().join("op_C").exists());
    }

    #[test]
    fn verify_detects_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("op_A");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("model.pt"), vec![1u8; 16]).unwrap();
        let err = verify_artifact_set(&target, &["model.pt"]).unwrap_err();
        assert!(err.contains("manifest unreadable"));
    }
}
