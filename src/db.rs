// Open connections to the SQLite database at the configured path. Create the
// `jobs` table, if it doesn't exist yet, which backs the durable at-least-
// once queue: rows move `queued -> running -> done|failed|retrying`, and a
// crash leaves a row `running` for `requeue_stale_jobs` to pick back up.
pub(crate) async fn init_db(database_url: &str) -> anyhow::Result<sqlx::sqlite::SqlitePool> {
    let db_opts = sqlx::sqlite::SqliteConnectOptions::new()
        .filename(database_url)
        .create_if_missing(true);

    let db_pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(db_opts)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS jobs (
            id TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            status TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            submission_json TEXT NOT NULL,
            phase TEXT,
            result_json TEXT,
            error TEXT
        ) STRICT;",
    )
    .execute(&db_pool)
    .await?;

    Ok(db_pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_db_is_idempotent() {
        let pool = init_db("file::memory:?cache=shared")
            .await
            .expect("first init succeeds");
        init_db("file::memory:?cache=shared")
            .await
            .expect("second init against the same pool path succeeds");
        pool.close().await;
    }
}
