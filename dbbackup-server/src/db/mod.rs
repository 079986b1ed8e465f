pub mod connection;
pub mod migrate;

use connection::DbPool;

/// Run a blocking closure against a pooled connection off the async runtime.
pub async fn with_conn<T, F>(pool: &DbPool, f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut rusqlite::Connection) -> anyhow::Result<T> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get()?;
        f(&mut conn)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))?
}
