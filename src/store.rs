use log::info;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Config-table key carrying the shared-secret hash when the environment
/// does not provide it.
pub const CONFIG_KEY_SECRET_HASH: &str = "secret_hash";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("device already exists")]
    DeviceExists,
    #[error("device not found")]
    DeviceNotFound,
    #[error("config key not found")]
    ConfigNotFound,
    #[error("database error: {0}")]
    Db(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Db(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub device_id: String,
    pub pub_jwk_json: String,
    pub label: String,
    pub created_at: i64,
    pub last_seen: Option<i64>,
}

/// Durable device allowlist plus a small key/value config table. The only
/// persistent state in the system; no message or session rows ever exist.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!("device registry opened at {}", path);
        Ok(store)
    }

    /// In-memory registry for tests. A single connection keeps every query
    /// on the same database.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                device_id TEXT PRIMARY KEY,
                pub_jwk_json TEXT NOT NULL,
                label TEXT,
                created_at INTEGER NOT NULL,
                last_seen INTEGER
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn add_device(&self, device: &Device) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO devices (device_id, pub_jwk_json, label, created_at, last_seen) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&device.device_id)
        .bind(&device.pub_jwk_json)
        .bind(&device.label)
        .bind(device.created_at)
        .bind(device.last_seen)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db))
                if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation) =>
            {
                Err(StoreError::DeviceExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_device(&self, device_id: &str) -> Result<Device, StoreError> {
        let row = sqlx::query(
            "SELECT device_id, pub_jwk_json, label, created_at, last_seen \
             FROM devices WHERE device_id = ?1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Device {
                device_id: row.get("device_id"),
                pub_jwk_json: row.get("pub_jwk_json"),
                label: row.get::<Option<String>, _>("label").unwrap_or_default(),
                created_at: row.get("created_at"),
                last_seen: row.get("last_seen"),
            }),
            None => Err(StoreError::DeviceNotFound),
        }
    }

    /// Removing a device revokes it: the next challenge, login, or upgrade
    /// attempt fails enrollment.
    pub async fn delete_device(&self, device_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM devices WHERE device_id = ?1")
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::DeviceNotFound);
        }
        Ok(())
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        let rows = sqlx::query(
            "SELECT device_id, pub_jwk_json, label, created_at, last_seen \
             FROM devices ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Device {
                device_id: row.get("device_id"),
                pub_jwk_json: row.get("pub_jwk_json"),
                label: row.get::<Option<String>, _>("label").unwrap_or_default(),
                created_at: row.get("created_at"),
                last_seen: row.get("last_seen"),
            })
            .collect())
    }

    /// Soft bookkeeping only; device records are otherwise immutable.
    pub async fn touch_device_last_seen(
        &self,
        device_id: &str,
        at_ms: i64,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE devices SET last_seen = ?1 WHERE device_id = ?2")
            .bind(at_ms)
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_config(&self, key: &str) -> Result<String, StoreError> {
        let row = sqlx::query("SELECT value FROM config WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.get("value")),
            None => Err(StoreError::ConfigNotFound),
        }
    }

    pub async fn set_config(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO config (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_config(&self, key: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM config WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ConfigNotFound);
        }
        Ok(())
    }
}
