//! # KTRDR Core — Coordination Substrate for Long-Running Computations
//!
//! KTRDR runs long-duration financial computations — model training and
//! historical strategy backtesting — across a fleet of worker processes
//! coordinated by a central backend. Operations run for hours; users
//! cancel them, processes crash, backends restart, networks partition.
//! This crate is the coordination core that turns that unreliable fleet
//! into a consistent, resumable system of record.
//!
//! ## Subsystems
//!
//! **Operation lifecycle** — durable records with a compare-and-set state
//! machine ([`operation`], [`db`]), debounced progress ([`progress`]).
//!
//! **Worker fleet** — self-registration, liveness, capability selection
//! ([`registry`]), and reconciliation of the three truth sources —
//! database, worker, checkpoint — after crashes and restarts
//! ([`reconciler`]).
//!
//! **Checkpoint & resume** — atomic one-per-operation capture of state
//! plus artifacts ([`checkpoint`]), and the worker-side harness that
//! writes them and rehydrates from them ([`worker`]).
//!
//! The coordinator HTTP surface lives in [`server`]; the two concrete
//! domain executors the platform ships are [`training`] and [`backtest`].
//!
//! ## Layered Truth
//!
//! No in-process cache is authoritative: the database arbitrates, workers
//! report what they are actually doing, and checkpoints outlive failures.
//! Every state transition is one conditional SQL statement, so losing a
//! race is always visible as a refused transition, never as corruption.

pub mod backtest;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod operation;
pub mod progress;
pub mod prom_metrics;
pub mod reconciler;
pub mod registry;
pub mod server;
pub mod telemetry;
pub mod training;
pub mod worker;

pub use error::{CoreError, CoreResult};
