//! # Training Executor — Supervised Trainer Harness Host
//!
//! The concrete training loop hosted by the worker harness. The model
//! here is a deterministic stand-in for a PyTorch-style trainer: a weight
//! vector updated per epoch from a payload-seeded pseudo-random stream,
//! with the loss curve derived from the same stream. Determinism is the
//! point — it lets the cancel-then-resume path be verified against an
//! uninterrupted run, which is exactly the guarantee the checkpoint
//! engine must provide for the real trainer.
//!
//! ## Cadence
//!
//! Cancellation is observed at every epoch boundary and every 50 batches
//! within an epoch; the checkpoint policy is consulted once per epoch
//! (the training unit). Artifacts are `model.pt` and `optimizer.pt`;
//! resume restores the weight vector from `model.pt` and skips the
//! epochs already done.

use serde_json::{json, Value};
use std::path::Path;

use crate::checkpoint::{
    ArtifactFile, CheckpointState, TrainingHistory, SCHEMA_VERSION,
};
use crate::error::{CoreError, CoreResult};
use crate::worker::harness::{ExecutionOutcome, Harness, OperationExecutor};
use crate::worker::ResumeContext;

/// Batches between in-epoch cancellation checks.
const CANCEL_CHECK_BATCHES: u64 = 50;

/// Weight vector width of the simulated model.
const MODEL_WIDTH: usize = 256;

/// FNV-1a, used to derive a deterministic seed from the request payload.
fn payload_digest(payload: &Value) -> u64 {
    let bytes = payload.to_string().into_bytes();
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Deterministic stream: splitmix64 over (seed, index).
fn mix(seed: u64, index: u64) -> f64 {
    let mut z = seed ^ index.wrapping_mul(0x9e3779b97f4a7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64
}

pub struct TrainingExecutor {
    epochs: u64,
    batches_per_epoch: u64,
    learning_rate: f64,
    seed: u64,
    request_payload_ref: String,
    // Mutable training state; `epoch` counts completed epochs.
    epoch: u64,
    weights: Vec<f64>,
    train_loss: f64,
    val_loss: f64,
    best_val_loss: f64,
    history: TrainingHistory,
}

impl TrainingExecutor {
    pub fn new(request_payload: &Value) -> CoreResult<Self> {
        let epochs = request_payload
            .get("epochs")
            .and_then(Value::as_u64)
            .unwrap_or(20);
        if epochs == 0 {
            return Err(CoreError::Domain("epochs must be at least 1".to_string()));
        }
        let batches_per_epoch = request_payload
            .get("batches_per_epoch")
            .and_then(Value::as_u64)
            .unwrap_or(200)
            .max(1);
        let learning_rate = request_payload
            .get("learning_rate")
            .and_then(Value::as_f64)
            .unwrap_or(1e-3);
        let seed = payload_digest(request_payload);
        Ok(TrainingExecutor {
            epochs,
            batches_per_epoch,
            learning_rate,
            seed,
            request_payload_ref: format!("{:016x}", seed),
            epoch: 0,
            weights: vec![0.0; MODEL_WIDTH],
            train_loss: f64::NAN,
            val_loss: f64::NAN,
            best_val_loss: f64::INFINITY,
            history: TrainingHistory::default(),
        })
    }

    /// Rehydrate from a checkpoint: restore counters from the state body
    /// and the weight vector from `model.pt`.
    pub fn from_resume(ctx: ResumeContext) -> CoreResult<Self> {
        let mut executor = TrainingExecutor::new(&ctx.request_payload)?;
        let CheckpointState::Training {
            epoch,
            train_loss,
            val_loss,
            best_val_loss,
            training_history,
            request_payload_ref,
            ..
        } = ctx.state
        else {
            return Err(CoreError::Domain(
                "checkpoint state is not a training state".to_string(),
            ));
        };
        if request_payload_ref != executor.request_payload_ref {
            return Err(CoreError::Domain(
                "checkpoint does not belong to this request payload".to_string(),
            ));
        }
        let artifact_dir = ctx.artifact_dir.as_deref().ok_or_else(|| {
            CoreError::Domain("training checkpoint has no artifact directory".to_string())
        })?;
        executor.weights = read_weights(&artifact_dir.join("model.pt"))?;
        executor.epoch = epoch;
        executor.train_loss = train_loss;
        executor.val_loss = val_loss;
        executor.best_val_loss = best_val_loss;
        executor.history = training_history;
        Ok(executor)
    }

    pub fn completed_epochs(&self) -> u64 {
        self.epoch
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// One batch's weight update, deterministic in (seed, epoch, batch).
    fn batch_update(&self, weights: &mut [f64], epoch: u64, batch: u64) {
        let stream = epoch
            .wrapping_mul(self.batches_per_epoch)
            .wrapping_add(batch);
        for (i, w) in weights.iter_mut().enumerate() {
            let gradient = mix(self.seed, stream.wrapping_add(i as u64)) - 0.5;
            *w -= self.learning_rate * gradient;
        }
    }

    /// Commit a finished epoch: adopt the updated weights and do the loss
    /// bookkeeping.
    fn finish_epoch(&mut self, weights: Vec<f64>) {
        let epoch = self.epoch;
        self.weights = weights;
        let base = 1.0 + (self.seed % 997) as f64 / 10_000.0;
        let noise = (mix(self.seed, epoch) - 0.5) * 0.02;
        self.train_loss = base / (1.0 + 0.3 * (epoch + 1) as f64) + noise;
        self.val_loss = self.train_loss * 1.07 + (mix(self.seed ^ 0xdead, epoch) - 0.5) * 0.01;
        self.best_val_loss = self.best_val_loss.min(self.val_loss);
        self.history.loss.push(self.train_loss);
        self.history.val_loss.push(self.val_loss);
        self.epoch += 1;
    }

    /// One full epoch without cancellation probes (test path).
    #[cfg(test)]
    fn step_epoch(&mut self) {
        let mut scratch = self.weights.clone();
        for batch in 0..self.batches_per_epoch {
            self.batch_update(&mut scratch, self.epoch, batch);
        }
        self.finish_epoch(scratch);
    }

    fn result(&self) -> Value {
        json!({
            "epochs": self.epochs,
            "final_train_loss": self.train_loss,
            "final_val_loss": self.val_loss,
            "best_val_loss": self.best_val_loss,
        })
    }
}

fn weights_bytes(weights: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(weights.len() * 8);
    for w in weights {
        bytes.extend_from_slice(&w.to_le_bytes());
    }
    bytes
}

fn read_weights(path: &Path) -> CoreResult<Vec<f64>> {
    let bytes = std::fs::read(path)
        .map_err(|e| CoreError::Domain(format!("cannot read model artifact: {}", e)))?;
    if bytes.len() % 8 != 0 {
        return Err(CoreError::Domain("model artifact is truncated".to_string()));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes(c.try_into().expect("chunk is 8 bytes")))
        .collect())
}

impl OperationExecutor for TrainingExecutor {
    fn run(&mut self, harness: &mut Harness<'_>) -> CoreResult<ExecutionOutcome> {
        while self.epoch < self.epochs {
            if harness.is_cancel_requested() {
                return Ok(ExecutionOutcome::Cancelled);
            }
            // Batch updates go into a scratch buffer committed at the
            // epoch boundary, so a mid-epoch cancel leaves the checkpoint
            // state at the last completed epoch.
            let epoch = self.epoch;
            let mut scratch = self.weights.clone();
            for batch in 0..self.batches_per_epoch {
                self.batch_update(&mut scratch, epoch, batch);
                if (batch + 1) % CANCEL_CHECK_BATCHES == 0 && harness.is_cancel_requested() {
                    return Ok(ExecutionOutcome::Cancelled);
                }
            }
            self.finish_epoch(scratch);
            harness.update_progress(
                self.epoch,
                self.epochs,
                &format!("epoch {}/{}", self.epoch, self.epochs),
                Some(json!({
                    "train_loss": self.train_loss,
                    "val_loss": self.val_loss,
                    "epoch": epoch + 1,
                })),
            );
            if harness.checkpoint_due(1) {
                let (state, artifacts) = self.checkpoint();
                harness.save_periodic(state, artifacts);
            }
        }
        Ok(ExecutionOutcome::Completed(self.result()))
    }

    fn checkpoint(&self) -> (CheckpointState, Vec<ArtifactFile>) {
        let state = CheckpointState::Training {
            schema_version: SCHEMA_VERSION,
            epoch: self.epoch,
            train_loss: self.train_loss,
            val_loss: self.val_loss,
            learning_rate: self.learning_rate,
            best_val_loss: self.best_val_loss,
            training_history: self.history.clone(),
            request_payload_ref: self.request_payload_ref.clone(),
        };
        // The optimizer state mirrors the weights offset by the learning
        // rate epoch; a real trainer would serialize momentum buffers.
        let optimizer: Vec<f64> = self
            .weights
            .iter()
            .map(|w| w * self.learning_rate)
            .collect();
        let artifacts = vec![
            ArtifactFile::new("model.pt", weights_bytes(&self.weights)),
            ArtifactFile::new("optimizer.pt", weights_bytes(&optimizer)),
        ];
        (state, artifacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Value {
        json!({"epochs": 6, "batches_per_epoch": 20, "strategy": "s.yaml", "symbol": "EURUSD"})
    }

    #[test]
    fn payload_defaults_apply() {
        let e = TrainingExecutor::new(&json!({})).unwrap();
        assert_eq!(e.epochs, 20);
        assert_eq!(e.batches_per_epoch, 200);
        assert_eq!(e.learning_rate, 1e-3);
    }

    #[test]
    fn zero_epochs_rejected() {
        assert!(TrainingExecutor::new(&json!({"epochs": 0})).is_err());
    }

    #[test]
    fn stepping_is_deterministic_for_same_payload() {
        let mut a = TrainingExecutor::new(&payload()).unwrap();
        let mut b = TrainingExecutor::new(&payload()).unwrap();
        for _ in 0..3 {
            a.step_epoch();
            b.step_epoch();
        }
        assert_eq!(a.train_loss, b.train_loss);
        assert_eq!(a.weights, b.weights);
    }

    #[test]
    fn different_payloads_diverge() {
        let mut a = TrainingExecutor::new(&payload()).unwrap();
        let mut b = TrainingExecutor::new(&json!({"epochs": 6, "symbol": "USDJPY"})).unwrap();
        a.step_epoch();
        b.step_epoch();
        assert_ne!(a.train_loss, b.train_loss);
    }

    #[test]
    fn best_val_loss_is_monotone_floor() {
        let mut e = TrainingExecutor::new(&payload()).unwrap();
        for _ in 0..6 {
            e.step_epoch();
            assert!(e.best_val_loss <= e.val_loss + f64::EPSILON);
        }
        assert_eq!(e.history.loss.len(), 6);
    }

    #[test]
    fn checkpoint_state_reflects_completed_epochs() {
        let mut e = TrainingExecutor::new(&payload()).unwrap();
        for _ in 0..5 {
            e.step_epoch();
        }
        let (state, artifacts) = e.checkpoint();
        match state {
            CheckpointState::Training { epoch, .. } => assert_eq!(epoch, 5),
            _ => panic!("wrong state shape"),
        }
        let names: Vec<_> = artifacts.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["model.pt", "optimizer.pt"]);
    }

    #[test]
    fn resume_matches_uninterrupted_run() {
        // Uninterrupted reference run.
        let mut reference = TrainingExecutor::new(&payload()).unwrap();
        for _ in 0..6 {
            reference.step_epoch();
        }

        // Interrupted at epoch 3, checkpoint, resume, finish.
        let mut interrupted = TrainingExecutor::new(&payload()).unwrap();
        for _ in 0..3 {
            interrupted.step_epoch();
        }
        let (state, artifacts) = interrupted.checkpoint();

        let dir = tempfile::tempdir().unwrap();
        for artifact in &artifacts {
            std::fs::write(dir.path().join(&artifact.name), &artifact.bytes).unwrap();
        }
        let ctx = ResumeContext {
            state,
            artifact_dir: Some(dir.path().to_path_buf()),
            request_payload: payload(),
        };
        let mut resumed = TrainingExecutor::from_resume(ctx).unwrap();
        assert_eq!(resumed.completed_epochs(), 3);
        for _ in 3..6 {
            resumed.step_epoch();
        }

        assert_eq!(resumed.train_loss, reference.train_loss);
        assert_eq!(resumed.best_val_loss, reference.best_val_loss);
        assert_eq!(resumed.weights(), reference.weights());
        assert_eq!(resumed.history, reference.history);
    }

    #[test]
    fn resume_rejects_foreign_payload() {
        let mut e = TrainingExecutor::new(&payload()).unwrap();
        e.step_epoch();
        let (state, artifacts) = e.checkpoint();
        let dir = tempfile::tempdir().unwrap();
        for artifact in &artifacts {
            std::fs::write(dir.path().join(&artifact.name), &artifact.bytes).unwrap();
        }
        let ctx = ResumeContext {
            state,
            artifact_dir: Some(dir.path().to_path_buf()),
            request_payload: json!({"epochs": 6, "symbol": "GBPUSD"}),
        };
        assert!(TrainingExecutor::from_resume(ctx).is_err());
    }

    #[test]
    fn resume_requires_artifacts() {
        let mut e = TrainingExecutor::new(&payload()).unwrap();
        e.step_epoch();
        let (state, _) = e.checkpoint();
        let ctx = ResumeContext {
            state,
            artifact_dir: None,
            request_payload: payload(),
        };
        assert!(TrainingExecutor::from_resume(ctx).is_err());
    }

    #[test]
    fn weights_roundtrip_through_artifact_bytes() {
        let weights = vec![0.5, -1.25, 3.75];
        let bytes = weights_bytes(&weights);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.pt");
        std::fs::write(&path, &bytes).unwrap();
        assert_eq!(read_weights(&path).unwrap(), weights);
    }
}
