//! # Backtesting Executor — Bar-by-Bar Portfolio Simulator
//!
//! The concrete backtesting loop hosted by the worker harness. Prices are
//! a deterministic function of the payload seed and the bar index, so the
//! simulator needs no market-data store and a cancelled-then-resumed run
//! can be verified to match an uninterrupted one — the guarantee the
//! checkpoint engine owes the real engine.
//!
//! ## Resume Semantics
//!
//! The moving-average indicator depends on a lookback window, so resume
//! does what the real engine does: replays the price series from the
//! start of the range to rebuild indicator state, seeks to the
//! checkpointed `bar_index`, restores the portfolio (cash, positions,
//! trades, equity curve) from the state body, and continues. Cancellation
//! is observed once per checkpoint-policy tick.

use serde_json::{json, Value};
use std::collections::VecDeque;

use crate::checkpoint::{
    ArtifactFile, CheckpointState, EquitySample, Position, Trade, SCHEMA_VERSION,
};
use crate::error::{CoreError, CoreResult};
use crate::worker::harness::{ExecutionOutcome, Harness, OperationExecutor};
use crate::worker::ResumeContext;

/// Bars between equity-curve samples.
const EQUITY_SAMPLE_INTERVAL: u64 = 1_000;

/// Bars between progress updates.
const PROGRESS_INTERVAL: u64 = 500;

fn payload_digest(payload: &Value) -> u64 {
    let bytes = payload.to_string().into_bytes();
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn mix(seed: u64, index: u64) -> f64 {
    let mut z = seed ^ index.wrapping_mul(0x9e3779b97f4a7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64
}

pub struct BacktestExecutor {
    total_bars: u64,
    lookback: u64,
    symbol: String,
    seed: u64,
    request_payload_ref: String,
    // Portfolio state.
    bar_index: u64,
    cash: f64,
    position: Option<Position>,
    trades: Vec<Trade>,
    equity_samples: Vec<EquitySample>,
    // Indicator state: rolling window over the last `lookback` prices.
    window: VecDeque<f64>,
    window_sum: f64,
}

impl BacktestExecutor {
    pub fn new(request_payload: &Value) -> CoreResult<Self> {
        let total_bars = request_payload
            .get("total_bars")
            .and_then(Value::as_u64)
            .unwrap_or(100_000);
        if total_bars == 0 {
            return Err(CoreError::Domain("total_bars must be at least 1".to_string()));
        }
        let lookback = request_payload
            .get("lookback")
            .and_then(Value::as_u64)
            .unwrap_or(20)
            .max(1);
        let symbol = request_payload
            .get("symbol")
            .and_then(Value::as_str)
            .unwrap_or("EURUSD")
            .to_string();
        let initial_cash = request_payload
            .get("initial_cash")
            .and_then(Value::as_f64)
            .unwrap_or(100_000.0);
        let seed = payload_digest(request_payload);
        Ok(BacktestExecutor {
            total_bars,
            lookback,
            symbol,
            seed,
            request_payload_ref: format!("{:016x}", seed),
            bar_index: 0,
            cash: initial_cash,
            position: None,
            trades: Vec::new(),
            equity_samples: Vec::new(),
            window: VecDeque::new(),
            window_sum: 0.0,
        })
    }

    /// Rehydrate: restore the portfolio from the state body, then replay
    /// the price series up to `bar_index` to rebuild the lookback window.
    pub fn from_resume(ctx: ResumeContext) -> CoreResult<Self> {
        let mut executor = BacktestExecutor::new(&ctx.request_payload)?;
        let CheckpointState::Backtesting {
            bar_index,
            cash,
            positions,
            trades,
            equity_samples,
            request_payload_ref,
            ..
        } = ctx.state
        else {
            return Err(CoreError::Domain(
                "checkpoint state is not a backtesting state".to_string(),
            ));
        };
        if request_payload_ref != executor.request_payload_ref {
            return Err(CoreError::Domain(
                "checkpoint does not belong to this request payload".to_string(),
            ));
        }
        if bar_index > executor.total_bars {
            return Err(CoreError::Domain(format!(
                "checkpoint bar_index {} beyond range end {}",
                bar_index, executor.total_bars
            )));
        }
        executor.cash = cash;
        executor.position = positions.into_iter().next();
        executor.trades = trades;
        executor.equity_samples = equity_samples;
        executor.replay_indicator_to(bar_index);
        executor.bar_index = bar_index;
        Ok(executor)
    }

    /// Deterministic synthetic price: drift, a slow cycle, and seeded
    /// noise. The same function the real engine would replace with data.
    fn price(&self, bar: u64) -> f64 {
        let drift = bar as f64 * 1e-7;
        let cycle = (bar as f64 * 0.001).sin() * 0.01;
        let noise = (mix(self.seed, bar) - 0.5) * 0.004;
        1.08 + drift + cycle + noise
    }

    /// Recompute the lookback window over `[0, upto)` by replay.
    fn replay_indicator_to(&mut self, upto: u64) {
        self.window.clear();
        self.window_sum = 0.0;
        let start = upto.saturating_sub(self.lookback);
        for bar in start..upto {
            let price = self.price(bar);
            self.window.push_back(price);
            self.window_sum += price;
        }
    }

    fn push_price(&mut self, price: f64) {
        self.window.push_back(price);
        self.window_sum += price;
        if self.window.len() as u64 > self.lookback {
            if let Some(old) = self.window.pop_front() {
                self.window_sum -= old;
            }
        }
    }

    fn sma(&self) -> Option<f64> {
        if self.window.len() as u64 == self.lookback {
            Some(self.window_sum / self.lookback as f64)
        } else {
            None
        }
    }

    fn equity(&self, price: f64) -> f64 {
        let position_value = self
            .position
            .as_ref()
            .map(|p| p.quantity * price)
            .unwrap_or(0.0);
        self.cash + position_value
    }

    fn current_date(&self) -> String {
        // One bar per minute from a fixed range start.
        let start = chrono::DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .expect("range start is valid")
            .with_timezone(&chrono::Utc);
        (start + chrono::Duration::minutes(self.bar_index as i64)).to_rfc3339()
    }

    /// Process one bar: indicator update, then the crossover strategy.
    fn process_bar(&mut self) {
        let bar = self.bar_index;
        let price = self.price(bar);
        let signal = self.sma();
        self.push_price(price);

        if let Some(sma) = signal {
            match (&self.position, price > sma) {
                (None, true) => {
                    let quantity = (self.cash / price).floor();
                    if quantity >= 1.0 {
                        self.cash -= quantity * price;
                        self.position = Some(Position {
                            symbol: self.symbol.clone(),
                            quantity,
                            avg_price: price,
                        });
                        self.trades.push(Trade {
                            bar_index: bar,
                            symbol: self.symbol.clone(),
                            side: "buy".to_string(),
                            quantity,
                            price,
                        });
                    }
                }
                (Some(position), false) => {
                    self.cash += position.quantity * price;
                    self.trades.push(Trade {
                        bar_index: bar,
                        symbol: self.symbol.clone(),
                        side: "sell".to_string(),
                        quantity: position.quantity,
                        price,
                    });
                    self.position = None;
                }
                _ => {}
            }
        }

        if bar % EQUITY_SAMPLE_INTERVAL == 0 {
            let equity = self.equity(price);
            self.equity_samples.push(EquitySample {
                bar_index: bar,
                equity,
            });
        }
        self.bar_index += 1;
    }

    pub fn processed_bars(&self) -> u64 {
        self.bar_index
    }

    fn result(&self) -> Value {
        let final_price = self.price(self.total_bars.saturating_sub(1));
        json!({
            "bars_processed": self.bar_index,
            "total_trades": self.trades.len(),
            "final_equity": self.equity(final_price),
            "final_cash": self.cash,
        })
    }
}

impl OperationExecutor for BacktestExecutor {
    fn run(&mut self, harness: &mut Harness<'_>) -> CoreResult<ExecutionOutcome> {
        while self.bar_index < self.total_bars {
            self.process_bar();

            if self.bar_index % PROGRESS_INTERVAL == 0 || self.bar_index == self.total_bars {
                harness.update_progress(
                    self.bar_index,
                    self.total_bars,
                    &format!("bar {}/{}", self.bar_index, self.total_bars),
                    Some(json!({
                        "trades": self.trades.len(),
                        "cash": self.cash,
                    })),
                );
            }

            // One checkpoint-policy tick per bar; cancellation is observed
            // at tick granularity, as the cadence contract requires.
            if harness.checkpoint_due(1) {
                let (state, artifacts) = self.checkpoint();
                harness.save_periodic(state, artifacts);
                if harness.is_cancel_requested() {
                    return Ok(ExecutionOutcome::Cancelled);
                }
            }
        }
        Ok(ExecutionOutcome::Completed(self.result()))
    }

    fn checkpoint(&self) -> (CheckpointState, Vec<ArtifactFile>) {
        let state = CheckpointState::Backtesting {
            schema_version: SCHEMA_VERSION,
            bar_index: self.bar_index,
            current_date: self.current_date(),
            cash: self.cash,
            positions: self.position.clone().into_iter().collect(),
            trades: self.trades.clone(),
            equity_samples: self.equity_samples.clone(),
            request_payload_ref: self.request_payload_ref.clone(),
        };
        (state, Vec::new())
    }
}
