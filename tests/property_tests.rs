//! Property-based tests for the coordination core's pure logic.
//!
//! These use `proptest` to drive the state-machine predicate, checkpoint
//! state serialization, and the progress debouncer across thousands of
//! generated inputs. No database or network access required.
//!
//! # How to run
//!
//! ```bash
//! cargo test --test property_tests
//! PROPTEST_CASES=10000 cargo test --test property_tests
//! ```

use proptest::prelude::*;

use ktrdr::checkpoint::{
    CheckpointState, EquitySample, Position, Trade, TrainingHistory, SCHEMA_VERSION,
};
use ktrdr::operation::OperationStatus;
use ktrdr::progress::ProgressDebouncer;

static ALL_STATUSES: [OperationStatus; 7] = [
    OperationStatus::Pending,
    OperationStatus::Running,
    OperationStatus::Completed,
    OperationStatus::Cancelled,
    OperationStatus::Failed,
    OperationStatus::Resuming,
    OperationStatus::PendingReconciliation,
];

static RESUMABLE_TERMINALS: [OperationStatus; 2] =
    [OperationStatus::Cancelled, OperationStatus::Failed];

fn any_status() -> impl Strategy<Value = OperationStatus> {
    prop::sample::select(ALL_STATUSES.as_slice())
}

// == State machine =============================================================

proptest! {
    /// COMPLETED is absorbing: no transition leaves it, checkpoint or not.
    #[test]
    fn prop_completed_is_absorbing(to in any_status(), has_checkpoint in any::<bool>()) {
        prop_assert!(!OperationStatus::Completed.can_transition(to, has_checkpoint));
    }

    /// The only exits from CANCELLED/FAILED lead to RESUMING, and only
    /// with a checkpoint present.
    #[test]
    fn prop_terminal_exits_only_via_resume(
        from in prop::sample::select(RESUMABLE_TERMINALS.as_slice()),
        to in any_status(),
        has_checkpoint in any::<bool>(),
    ) {
        let allowed = from.can_transition(to, has_checkpoint);
        if allowed {
            prop_assert_eq!(to, OperationStatus::Resuming);
            prop_assert!(has_checkpoint);
        }
    }

    /// RUNNING is entered only from PENDING, RESUMING, or
    /// PENDING_RECONCILIATION (each such entry advances the ownership
    /// epoch in the repository).
    #[test]
    fn prop_running_entered_from_three_states(from in any_status(), has_checkpoint in any::<bool>()) {
        if from.can_transition(OperationStatus::Running, has_checkpoint) {
            prop_assert!(matches!(
                from,
                OperationStatus::Pending
                    | OperationStatus::Resuming
                    | OperationStatus::PendingReconciliation
            ));
        }
    }

    /// A random walk through allowed transitions never escapes the status
    /// set, and once it reaches COMPLETED it stays there.
    #[test]
    fn prop_random_walk_respects_state_machine(
        steps in prop::collection::vec((any_status(), any::<bool>()), 1..40)
    ) {
        let mut status = OperationStatus::Pending;
        for (target, has_checkpoint) in steps {
            if status.can_transition(target, has_checkpoint) {
                status = target;
            }
            if status == OperationStatus::Completed {
                // Absorbing: verify and stop.
                for other in ALL_STATUSES {
                    prop_assert!(!status.can_transition(other, true));
                }
                break;
            }
        }
    }

    /// String round-trip over every status the walk can produce.
    #[test]
    fn prop_status_string_roundtrip(status in any_status()) {
        prop_assert_eq!(OperationStatus::parse(status.as_str()), Some(status));
    }
}

// == Checkpoint state shapes ===================================================

prop_compose! {
    fn arb_training_state()(
        epoch in 0u64..10_000,
        train_loss in 0.0f64..10.0,
        val_loss in 0.0f64..10.0,
        best_val_loss in 0.0f64..10.0,
        learning_rate in 1e-6f64..1.0,
        losses in prop::collection::vec(0.0f64..10.0, 0..32),
        payload_ref in "[a-f0-9]{16}",
    ) -> CheckpointState {
        CheckpointState::Training {
            schema_version: SCHEMA_VERSION,
            epoch,
            train_loss,
            val_loss,
            learning_rate,
            best_val_loss,
            training_history: TrainingHistory {
                loss: losses.clone(),
                val_loss: losses,
            },
            request_payload_ref: payload_ref,
        }
    }
}

prop_compose! {
    fn arb_backtest_state()(
        bar_index in 0u64..1_000_000,
        cash in 0.0f64..1e9,
        quantity in 1.0f64..1e6,
        price in 0.5f64..2.0,
        trade_count in 0usize..16,
        payload_ref in "[a-f0-9]{16}",
    ) -> CheckpointState {
        let trades = (0..trade_count)
            .map(|i| Trade {
                bar_index: i as u64 * 100,
                symbol: "EURUSD".to_string(),
                side: if i % 2 == 0 { "buy" } else { "sell" }.to_string(),
                quantity,
                price,
            })
            .collect();
        CheckpointState::Backtesting {
            schema_version: SCHEMA_VERSION,
            bar_index,
            current_date: "2024-06-01T00:00:00+00:00".to_string(),
            cash,
            positions: vec![Position {
                symbol: "EURUSD".to_string(),
                quantity,
                avg_price: price,
            }],
            trades,
            equity_samples: vec![EquitySample { bar_index, equity: cash }],
            request_payload_ref: payload_ref,
        }
    }
}

proptest! {
    /// Training states survive a JSON round trip byte-identically.
    #[test]
    fn prop_training_state_roundtrip(state in arb_training_state()) {
        let value = serde_json::to_value(&state).unwrap();
        prop_assert_eq!(value["operation_type"].as_str(), Some("training"));
        let back: CheckpointState = serde_json::from_value(value).unwrap();
        prop_assert_eq!(back, state);
    }

    /// Backtesting states survive a JSON round trip byte-identically.
    #[test]
    fn prop_backtest_state_roundtrip(state in arb_backtest_state()) {
        let value = serde_json::to_value(&state).unwrap();
        prop_assert_eq!(value["operation_type"].as_str(), Some("backtesting"));
        let back: CheckpointState = serde_json::from_value(value).unwrap();
        prop_assert_eq!(back, state);
    }
}

// == Progress debouncer ========================================================

proptest! {
    /// Within one epoch the visible percent never decreases, whatever
    /// order updates arrive in.
    #[test]
    fn prop_progress_monotonic_within_epoch(
        percents in prop::collection::vec(0.0f64..=100.0, 1..64)
    ) {
        let debouncer = ProgressDebouncer::new(std::time::Duration::ZERO);
        let mut high_water = f64::MIN;
        for percent in percents {
            debouncer.offer("op", 1, percent, "step", None);
            let visible = debouncer.snapshot("op").unwrap().percent;
            prop_assert!(visible >= high_water);
            high_water = visible;
        }
    }

    /// Across epochs the percent may drop, but the epoch itself never
    /// regresses and stale-epoch updates are invisible.
    #[test]
    fn prop_progress_epoch_never_regresses(
        updates in prop::collection::vec((1i64..5, 0.0f64..=100.0), 1..64)
    ) {
        let debouncer = ProgressDebouncer::new(std::time::Duration::ZERO);
        let mut current_epoch = i64::MIN;
        for (epoch, percent) in updates {
            debouncer.offer("op", epoch, percent, "step", None);
            let snapshot = debouncer.snapshot("op").unwrap();
            prop_assert!(snapshot.run_epoch >= current_epoch);
            current_epoch = snapshot.run_epoch;
        }
    }
}
