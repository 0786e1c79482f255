use crate::error::AppError;
use crate::shell::CachedAsset;
use sqlx::{Row, SqlitePool};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

fn map_asset_row(row: &sqlx::sqlite::SqliteRow) -> Result<CachedAsset, AppError> {
    Ok(CachedAsset {
        url: row.try_get("url")?,
        content_type: row.try_get("content_type")?,
        body: row.try_get("body")?,
        cached_at_ms: row.try_get("cached_at_ms")?,
    })
}

pub async fn get_cached_asset(
    pool: &SqlitePool,
    cache_name: &str,
    url: &str,
) -> Result<Option<CachedAsset>, AppError> {
    let row = sqlx::query(
        "SELECT url, content_type, body, cached_at_ms FROM shell_asset_cache \
         WHERE cache_name = ? AND url = ?",
    )
    .bind(cache_name)
    .bind(url)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(map_asset_row).transpose()
}

pub async fn put_cached_asset(
    pool: &SqlitePool,
    cache_name: &str,
    asset: &CachedAsset,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO shell_asset_cache (cache_name, url, content_type, body, cached_at_ms) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(cache_name, url) DO UPDATE SET \
           content_type=excluded.content_type, \
           body=excluded.body, \
           cached_at_ms=excluded.cached_at_ms",
    )
    .bind(cache_name)
    .bind(&asset.url)
    .bind(&asset.content_type)
    .bind(&asset.body)
    .bind(asset.cached_at_ms)
    .execute(pool)
    .await?;

    Ok(())
}

/// Deletes every cache generation other than `current_cache_name`.
pub async fn purge_stale_caches(
    pool: &SqlitePool,
    current_cache_name: &str,
) -> Result<u64, AppError> {
    let result = sqlx::query("DELETE FROM shell_asset_cache WHERE cache_name != ?")
        .bind(current_cache_name)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

pub async fn cache_entry_count(pool: &SqlitePool, cache_name: &str) -> Result<i64, AppError> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM shell_asset_cache WHERE cache_name = ?",
    )
    .bind(cache_name)
    .fetch_one(pool)
    .await?;

    Ok(count)
}
