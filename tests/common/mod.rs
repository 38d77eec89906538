//! Shared test helpers for integration tests.

#![allow(dead_code)]

use std::sync::Once;

use ktrdr::config::Config;
use ktrdr::db::Database;
use ktrdr::server::AppState;

/// Returns the test database URL from the `TEST_DATABASE_URL` environment
/// variable. Panics if the variable is not set.
pub fn test_db_url() -> String {
    std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set for integration tests")
}

/// Returns true if the test database URL is configured.
pub fn has_test_db() -> bool {
    std::env::var("TEST_DATABASE_URL").is_ok()
}

/// One-time schema initialization.
static SCHEMA_INIT: Once = Once::new();

/// Ensure the test database schema is set up (runs migrations once per
/// test binary).
pub fn ensure_schema() {
    SCHEMA_INIT.call_once(|| {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let db = Database::connect(&test_db_url()).await.unwrap();
            db.run_migrations().await.unwrap();
        });
    });
}

/// Truncate all tables to ensure test isolation.
pub async fn truncate_all_tables(db: &Database) {
    sqlx::raw_sql("TRUNCATE TABLE system_logs, checkpoints, workers, operations CASCADE")
        .execute(db.pool())
        .await
        .unwrap();
}

/// Connect to the test database with a clean slate.
pub async fn setup_test_db() -> Database {
    ensure_schema();
    let db = Database::connect(&test_db_url())
        .await
        .expect("failed to connect to test database");
    truncate_all_tables(&db).await;
    db
}

/// Test configuration: per-process checkpoint directory under the system
/// temp dir, everything else defaults.
pub fn test_config() -> Config {
    let checkpoint_dir = std::env::temp_dir().join(format!(
        "ktrdr-test-checkpoints-{}",
        std::process::id()
    ));
    Config {
        database_url: test_db_url(),
        checkpoint_dir,
        ..Config::default()
    }
}

/// Build the coordinator state against a clean test database.
pub async fn build_test_state() -> std::sync::Arc<AppState> {
    let db = setup_test_db().await;
    AppState::new(db, test_config())
}

/// Build an Axum test router connected to the test database.
pub async fn build_test_app() -> axum::Router {
    ktrdr::server::build_router(build_test_state().await)
}
