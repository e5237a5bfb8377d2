//! Encrypted local cache over SQLite via sqlx.
//!
//! Holds the few opt-in persisted items: the device id, the per-device send
//! counter, MK-wrapped contact-secret blobs and media envelope metadata.
//! Nothing sensitive lands here in cleartext — wrapped blobs are sealed
//! before they reach this layer.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};

use sn_crypto::envelope::SealedEnvelope;

use crate::error::StoreError;

/// Central cache handle. Cheap to clone (pool is an Arc internally).
#[derive(Clone)]
pub struct LocalCache {
    pub pool: SqlitePool,
}

impl LocalCache {
    /// Open (or create) the cache database and run pending migrations.
    ///
    /// WAL journal mode is configured at connection time, not inside a
    /// migration — SQLite refuses `journal_mode` changes inside the
    /// transaction sqlx wraps migrations in.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        Ok(Self { pool })
    }

    /// In-memory cache for tests and ephemeral sessions. Pinned to a single
    /// connection — every pooled connection to `:memory:` would otherwise get
    /// its own empty database.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(true);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(Self { pool })
    }

    // ── Generic KV ───────────────────────────────────────────────────────

    pub async fn kv_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO local_kv (key, value, updated_at) VALUES (?, ?, datetime('now')) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT value FROM local_kv WHERE key = ? LIMIT 1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn kv_delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM local_kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Device identity & counters ───────────────────────────────────────

    pub async fn device_id(&self) -> Result<Option<String>, StoreError> {
        self.kv_get("device_id").await
    }

    pub async fn set_device_id(&self, device_id: &str) -> Result<(), StoreError> {
        self.kv_set("device_id", device_id).await
    }

    pub async fn device_counter(&self, device_id: &str) -> Result<u64, StoreError> {
        let raw = self.kv_get(&format!("device_counter::{device_id}")).await?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    pub async fn set_device_counter(&self, device_id: &str, counter: u64) -> Result<(), StoreError> {
        self.kv_set(&format!("device_counter::{device_id}"), &counter.to_string())
            .await
    }

    // ── Wrapped contact-secret blobs ─────────────────────────────────────

    pub async fn save_contact_blob(
        &self,
        account_digest: &str,
        blob: &SealedEnvelope,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(blob)?;
        self.kv_set(&format!("contactSecrets-v2:{account_digest}"), &json)
            .await
    }

    pub async fn load_contact_blob(
        &self,
        account_digest: &str,
    ) -> Result<Option<SealedEnvelope>, StoreError> {
        let raw = self
            .kv_get(&format!("contactSecrets-v2:{account_digest}"))
            .await?;
        Ok(raw.map(|json| serde_json::from_str(&json)).transpose()?)
    }

    // ── Media envelope metadata ──────────────────────────────────────────

    pub async fn put_media_envelope(
        &self,
        object_key: &str,
        meta: &serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO media_envelopes (object_key, meta_json, updated_at) VALUES (?, ?, datetime('now')) \
             ON CONFLICT(object_key) DO UPDATE SET meta_json = excluded.meta_json, updated_at = excluded.updated_at",
        )
        .bind(object_key)
        .bind(meta.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_media_envelope(
        &self,
        object_key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT meta_json FROM media_envelopes WHERE object_key = ? LIMIT 1")
                .bind(object_key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(raw.map(|json| serde_json::from_str(&json)).transpose()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sn_crypto::envelope::{self, INFO_BACKUP};

    #[tokio::test]
    async fn kv_and_device_counter_roundtrip() {
        let cache = LocalCache::open_in_memory().await.unwrap();
        assert!(cache.device_id().await.unwrap().is_none());

        cache.set_device_id("dev-1").await.unwrap();
        assert_eq!(cache.device_id().await.unwrap().as_deref(), Some("dev-1"));

        assert_eq!(cache.device_counter("dev-1").await.unwrap(), 0);
        cache.set_device_counter("dev-1", 41).await.unwrap();
        assert_eq!(cache.device_counter("dev-1").await.unwrap(), 41);
    }

    #[tokio::test]
    async fn contact_blob_roundtrip() {
        let cache = LocalCache::open_in_memory().await.unwrap();
        let mk = [1u8; 32];
        let env = envelope::encrypt(b"{\"v\":2,\"secrets\":[]}", &mk, INFO_BACKUP).unwrap();

        cache.save_contact_blob("DIGEST", &env).await.unwrap();
        let loaded = cache.load_contact_blob("DIGEST").await.unwrap().unwrap();
        let pt = envelope::decrypt(&loaded, &mk, &[INFO_BACKUP]).unwrap();
        assert_eq!(&*pt, b"{\"v\":2,\"secrets\":[]}");
    }

    #[tokio::test]
    async fn media_envelope_upsert() {
        let cache = LocalCache::open_in_memory().await.unwrap();
        let meta = serde_json::json!({ "iv": "AAAA", "size": 1024 });
        cache.put_media_envelope("obj-1", &meta).await.unwrap();
        cache
            .put_media_envelope("obj-1", &serde_json::json!({ "iv": "BBBB", "size": 2048 }))
            .await
            .unwrap();
        let got = cache.get_media_envelope("obj-1").await.unwrap().unwrap();
        assert_eq!(got["size"], 2048);
    }
}
