use std::str::FromStr;

use serde::{Serialize, de::DeserializeOwned};
use sqlx::{
    Sqlite, SqlitePool, Transaction,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};

use crate::{
    dto::cache::{CACHE_SCHEMA_VERSION, CacheMetadata, CacheSnapshot},
    error::SyncResult,
    models::{CanvasFile, CanvasImage, Entity, Note, Settings},
    telemetry::database::CacheQuery,
};

const SCHEMA: [&str; 6] = [
    r#"
    CREATE TABLE IF NOT EXISTS notes (
        namespace TEXT NOT NULL,
        id TEXT NOT NULL,
        position INTEGER NOT NULL,
        payload TEXT NOT NULL,
        PRIMARY KEY (namespace, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS images (
        namespace TEXT NOT NULL,
        id TEXT NOT NULL,
        position INTEGER NOT NULL,
        payload TEXT NOT NULL,
        PRIMARY KEY (namespace, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS files (
        namespace TEXT NOT NULL,
        id TEXT NOT NULL,
        position INTEGER NOT NULL,
        payload TEXT NOT NULL,
        PRIMARY KEY (namespace, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS settings (
        namespace TEXT PRIMARY KEY,
        payload TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cache_metadata (
        namespace TEXT PRIMARY KEY,
        note_count INTEGER NOT NULL,
        image_count INTEGER NOT NULL,
        file_count INTEGER NOT NULL,
        last_sync INTEGER NOT NULL,
        schema_version INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS image_blobs (
        id TEXT PRIMARY KEY,
        source_url TEXT NOT NULL,
        content BLOB NOT NULL,
        cached_at INTEGER NOT NULL
    )
    "#,
];

/// Opens (creating if needed) the large-capacity cache and makes sure the
/// schema exists.
pub async fn connect(url: &str) -> SyncResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    let in_memory = url.contains(":memory:");
    // Every connection to an in-memory database gets its own database.
    let pool = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?
    };
    ensure_schema(&pool).await?;
    Ok(pool)
}

pub async fn ensure_schema(pool: &SqlitePool) -> SyncResult<()> {
    for statement in SCHEMA {
        crate::cache_execute!("cache.ensure_schema", sqlx::query(statement).execute(pool))?;
    }
    Ok(())
}

/// Overwrites everything cached for `namespace` with `snapshot` in one
/// transaction.
pub async fn replace_namespace(
    pool: &SqlitePool,
    namespace: &str,
    snapshot: &CacheSnapshot,
    synced_at_ms: i64,
) -> SyncResult<()> {
    let mut tx = pool.begin().await?;

    replace_collection(&mut tx, namespace, &snapshot.notes).await?;
    replace_collection(&mut tx, namespace, &snapshot.images).await?;
    replace_collection(&mut tx, namespace, &snapshot.files).await?;

    let settings = serde_json::to_string(&snapshot.settings)?;
    crate::cache_execute!(
        CacheQuery::new("cache.upsert_settings")
            .namespace(namespace)
            .collection("settings"),
        sqlx::query(
            r#"
            INSERT INTO settings (namespace, payload)
            VALUES (?, ?)
            ON CONFLICT (namespace) DO UPDATE SET payload = excluded.payload
            "#,
        )
        .bind(namespace)
        .bind(settings)
        .execute(&mut *tx)
    )?;

    crate::cache_execute!(
        CacheQuery::new("cache.upsert_metadata").namespace(namespace),
        sqlx::query(
            r#"
            INSERT INTO cache_metadata
                (namespace, note_count, image_count, file_count, last_sync, schema_version)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (namespace) DO UPDATE SET
                note_count = excluded.note_count,
                image_count = excluded.image_count,
                file_count = excluded.file_count,
                last_sync = excluded.last_sync,
                schema_version = excluded.schema_version
            "#,
        )
        .bind(namespace)
        .bind(snapshot.notes.len() as i64)
        .bind(snapshot.images.len() as i64)
        .bind(snapshot.files.len() as i64)
        .bind(synced_at_ms)
        .bind(CACHE_SCHEMA_VERSION)
        .execute(&mut *tx)
    )?;

    tx.commit().await?;
    Ok(())
}

async fn replace_collection<T: Entity + Serialize>(
    tx: &mut Transaction<'_, Sqlite>,
    namespace: &str,
    items: &[T],
) -> SyncResult<()> {
    let delete = format!("DELETE FROM {} WHERE namespace = ?", T::COLLECTION);
    crate::cache_execute!(
        CacheQuery::new("cache.clear_collection")
            .namespace(namespace)
            .collection(T::COLLECTION),
        sqlx::query(&delete).bind(namespace).execute(&mut **tx)
    )?;

    let insert = format!(
        "INSERT INTO {} (namespace, id, position, payload) VALUES (?, ?, ?, ?)",
        T::COLLECTION
    );
    for (position, item) in items.iter().enumerate() {
        let payload = serde_json::to_string(item)?;
        crate::cache_execute!(
            CacheQuery::new("cache.insert_entity")
                .namespace(namespace)
                .collection(T::COLLECTION),
            sqlx::query(&insert)
                .bind(namespace)
                .bind(item.id())
                .bind(position as i64)
                .bind(payload)
                .execute(&mut **tx)
        )?;
    }
    Ok(())
}

async fn load_collection<T: Entity + DeserializeOwned>(
    pool: &SqlitePool,
    namespace: &str,
) -> SyncResult<Vec<T>> {
    let select = format!(
        "SELECT id, payload FROM {} WHERE namespace = ? ORDER BY position ASC",
        T::COLLECTION
    );
    let rows: Vec<(String, String)> = crate::cache_fetch_all!(
        CacheQuery::new("cache.load_collection")
            .namespace(namespace)
            .collection(T::COLLECTION),
        sqlx::query_as::<_, (String, String)>(&select)
            .bind(namespace)
            .fetch_all(pool)
    )?;

    let mut items = Vec::with_capacity(rows.len());
    for (id, payload) in rows {
        match serde_json::from_str::<T>(&payload) {
            Ok(item) => items.push(item),
            Err(error) => {
                tracing::warn!(
                    "Skipping unreadable cached {} record {} in {}: {}",
                    T::COLLECTION,
                    id,
                    namespace,
                    error
                );
            }
        }
    }
    Ok(items)
}

/// Reads back everything cached for `namespace`. `None` when the namespace was
/// never written.
pub async fn load_namespace(
    pool: &SqlitePool,
    namespace: &str,
) -> SyncResult<Option<CacheSnapshot>> {
    if load_metadata(pool, namespace).await?.is_none() {
        return Ok(None);
    }

    let notes = load_collection::<Note>(pool, namespace).await?;
    let images = load_collection::<CanvasImage>(pool, namespace).await?;
    let files = load_collection::<CanvasFile>(pool, namespace).await?;

    let settings_row: Option<(String,)> = crate::cache_fetch_optional!(
        CacheQuery::new("cache.load_settings")
            .namespace(namespace)
            .collection("settings"),
        sqlx::query_as::<_, (String,)>("SELECT payload FROM settings WHERE namespace = ?")
            .bind(namespace)
            .fetch_optional(pool)
    )?;
    let settings = settings_row
        .and_then(|(payload,)| serde_json::from_str::<Settings>(&payload).ok())
        .unwrap_or_default();

    Ok(Some(CacheSnapshot {
        notes,
        images,
        files,
        settings,
    }))
}

pub async fn load_metadata(
    pool: &SqlitePool,
    namespace: &str,
) -> SyncResult<Option<CacheMetadata>> {
    let row: Option<(String, i64, i64, i64, i64, i64)> = crate::cache_fetch_optional!(
        CacheQuery::new("cache.load_metadata").namespace(namespace),
        sqlx::query_as::<_, (String, i64, i64, i64, i64, i64)>(
            r#"
            SELECT namespace, note_count, image_count, file_count, last_sync, schema_version
            FROM cache_metadata
            WHERE namespace = ?
            "#,
        )
        .bind(namespace)
        .fetch_optional(pool)
    )?;

    Ok(row.map(
        |(namespace, note_count, image_count, file_count, last_sync, schema_version)| {
            CacheMetadata {
                namespace,
                note_count,
                image_count,
                file_count,
                last_sync,
                schema_version,
            }
        },
    ))
}

pub async fn put_image_blob(
    pool: &SqlitePool,
    image_id: &str,
    source_url: &str,
    content: &[u8],
    cached_at_ms: i64,
) -> SyncResult<()> {
    crate::cache_execute!(
        CacheQuery::new("cache.put_image_blob").collection("image_blobs"),
        sqlx::query(
            r#"
            INSERT INTO image_blobs (id, source_url, content, cached_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                source_url = excluded.source_url,
                content = excluded.content,
                cached_at = excluded.cached_at
            "#,
        )
        .bind(image_id)
        .bind(source_url)
        .bind(content)
        .bind(cached_at_ms)
        .execute(pool)
    )?;
    Ok(())
}

/// Returns the cached bytes for `image_id` when they were fetched from
/// `source_url`. A blob cached for a different URL is stale and gets dropped.
pub async fn get_image_blob(
    pool: &SqlitePool,
    image_id: &str,
    source_url: &str,
) -> SyncResult<Option<Vec<u8>>> {
    let row: Option<(String, Vec<u8>)> = crate::cache_fetch_optional!(
        CacheQuery::new("cache.get_image_blob").collection("image_blobs"),
        sqlx::query_as::<_, (String, Vec<u8>)>(
            "SELECT source_url, content FROM image_blobs WHERE id = ?",
        )
        .bind(image_id)
        .fetch_optional(pool)
    )?;

    match row {
        Some((cached_url, content)) if cached_url == source_url => Ok(Some(content)),
        Some(_) => {
            crate::cache_execute!(
                CacheQuery::new("cache.invalidate_image_blob").collection("image_blobs"),
                sqlx::query("DELETE FROM image_blobs WHERE id = ?")
                    .bind(image_id)
                    .execute(pool)
            )?;
            Ok(None)
        }
        None => Ok(None),
    }
}

pub async fn evict_image_blobs_before(pool: &SqlitePool, cutoff_ms: i64) -> SyncResult<u64> {
    let result = crate::cache_execute!(
        CacheQuery::new("cache.evict_image_blobs").collection("image_blobs"),
        sqlx::query("DELETE FROM image_blobs WHERE cached_at < ?")
            .bind(cutoff_ms)
            .execute(pool)
    )?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NoteDraft, Point};

    async fn memory_pool() -> SqlitePool {
        connect("sqlite::memory:").await.expect("pool")
    }

    fn snapshot_with_notes(count: i64) -> CacheSnapshot {
        CacheSnapshot {
            notes: (0..count)
                .map(|index| NoteDraft::at(Point::default(), index).into_note(format!("n{index}")))
                .collect(),
            ..CacheSnapshot::default()
        }
    }

    #[tokio::test]
    async fn unknown_namespace_loads_none() {
        let pool = memory_pool().await;
        assert!(load_namespace(&pool, "user:nobody").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn replace_overwrites_wholesale_and_keeps_order() {
        let pool = memory_pool().await;
        replace_namespace(&pool, "user:a", &snapshot_with_notes(3), 10)
            .await
            .expect("first write");
        let mut second = snapshot_with_notes(2);
        second.notes.reverse();
        second.settings.dark_mode = true;
        replace_namespace(&pool, "user:a", &second, 20)
            .await
            .expect("second write");

        let loaded = load_namespace(&pool, "user:a")
            .await
            .expect("load")
            .expect("present");
        assert_eq!(loaded, second);

        let metadata = load_metadata(&pool, "user:a")
            .await
            .expect("metadata")
            .expect("present");
        assert_eq!(metadata.note_count, 2);
        assert_eq!(metadata.last_sync, 20);
        assert_eq!(metadata.schema_version, CACHE_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn namespaces_do_not_mix() {
        let pool = memory_pool().await;
        replace_namespace(&pool, "user:a", &snapshot_with_notes(2), 1)
            .await
            .expect("write a");
        replace_namespace(&pool, "canvas:b", &snapshot_with_notes(1), 1)
            .await
            .expect("write b");
        let a = load_namespace(&pool, "user:a").await.expect("load").expect("a");
        let b = load_namespace(&pool, "canvas:b").await.expect("load").expect("b");
        assert_eq!(a.notes.len(), 2);
        assert_eq!(b.notes.len(), 1);
    }

    #[tokio::test]
    async fn image_blob_invalidated_when_url_changes() {
        let pool = memory_pool().await;
        put_image_blob(&pool, "img1", "https://cdn/a.png", b"abc", 100)
            .await
            .expect("put");
        assert_eq!(
            get_image_blob(&pool, "img1", "https://cdn/a.png").await.expect("get"),
            Some(b"abc".to_vec())
        );
        assert_eq!(
            get_image_blob(&pool, "img1", "https://cdn/b.png").await.expect("get"),
            None
        );
        assert_eq!(
            get_image_blob(&pool, "img1", "https://cdn/a.png").await.expect("get"),
            None
        );
    }

    #[tokio::test]
    async fn eviction_removes_only_old_blobs() {
        let pool = memory_pool().await;
        put_image_blob(&pool, "old", "u1", b"1", 100).await.expect("put");
        put_image_blob(&pool, "new", "u2", b"2", 1_000).await.expect("put");
        let removed = evict_image_blobs_before(&pool, 500).await.expect("evict");
        assert_eq!(removed, 1);
        assert!(get_image_blob(&pool, "new", "u2").await.expect("get").is_some());
    }
}
