use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::{str::FromStr, time::Duration};
use tracing::info;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open the agent registry database, creating and migrating it as needed.
///
/// The registry is a queryable index over state whose source of truth lives
/// on disk (route fragments and certificate material), and the control plane
/// is its only writer. WAL mode plus a short busy timeout covers the
/// background workers reading while the orchestrator writes.
pub async fn open_registry(url: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT)
        .create_if_missing(true);

    let mut pool = SqlitePoolOptions::new();
    if is_ephemeral(url) {
        // sqlite drops an in-memory database once its last connection closes,
        // so connections backing an ephemeral registry must never be retired.
        pool = pool.max_lifetime(None).idle_timeout(None);
    }
    let pool = pool.connect_with(options).await?;

    sqlx::migrate!().run(&pool).await?;
    info!("Agent registry ready ({url})");
    Ok(pool)
}

fn is_ephemeral(url: &str) -> bool {
    url.contains(":memory:")
}
