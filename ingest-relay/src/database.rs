use crate::config::DatabaseConfig;
use crate::errors::RelayError;
use crate::record::ActivityRecord;
use crate::sink::RecordSink;
use async_trait::async_trait;
use sqlx::MySqlPool;
use sqlx::mysql::MySqlPoolOptions;

const CREATE_ACTIVITY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS user_activity (
    activity_uuid VARCHAR(255) PRIMARY KEY,
    user_uid VARCHAR(255),
    organization_id VARCHAR(255),
    timestamp DATETIME,
    app_name VARCHAR(255),
    url VARCHAR(255),
    page_title VARCHAR(255),
    productivity_status VARCHAR(255),
    meridian VARCHAR(255),
    ip_address VARCHAR(255),
    mac_address VARCHAR(255),
    mouse_movement BOOLEAN,
    mouse_clicks INT,
    keys_clicks INT,
    status INT,
    cpu_usage VARCHAR(255),
    ram_usage VARCHAR(255),
    screenshot_uid VARCHAR(255),
    thumbnail_uid VARCHAR(255)
)"#;

const CREATE_OBJECTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS activity_objects (
    object_key VARCHAR(512) PRIMARY KEY,
    activity_uuid VARCHAR(255) NOT NULL,
    status VARCHAR(32) NOT NULL
)"#;

const INSERT_ACTIVITY: &str = r#"
INSERT INTO user_activity (activity_uuid, user_uid, organization_id, timestamp, app_name, url, page_title, productivity_status, meridian, ip_address, mac_address, mouse_movement, mouse_clicks, keys_clicks, status, cpu_usage, ram_usage, screenshot_uid, thumbnail_uid)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#;

// Housekeeping rows are keyed by object, so a retried upload lands on the same row
const INSERT_OBJECT: &str = r#"
INSERT INTO activity_objects (object_key, activity_uuid, status)
VALUES (?, ?, 'uploaded')
ON DUPLICATE KEY UPDATE activity_uuid = VALUES(activity_uuid), status = VALUES(status)"#;

const COUNT_ACTIVITY: &str = "SELECT COUNT(*) FROM user_activity";

/// Writes rewritten records into the `user_activity` table.
///
/// Rows are only ever inserted. A duplicate `activity_uuid` is rejected by the
/// primary key and reported as a persistence error.
pub struct MySqlStore {
    pool: MySqlPool,
    track_objects: bool,
}

impl MySqlStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, RelayError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        tracing::info!("Connected to the database");

        let store = Self {
            pool,
            track_objects: config.track_objects,
        };
        if config.create_table {
            store.create_tables().await?;
        }
        Ok(store)
    }

    pub async fn create_tables(&self) -> Result<(), RelayError> {
        sqlx::query(CREATE_ACTIVITY_TABLE)
            .execute(&self.pool)
            .await?;
        if self.track_objects {
            sqlx::query(CREATE_OBJECTS_TABLE)
                .execute(&self.pool)
                .await?;
        }
        tracing::info!("Ensured table 'user_activity' exists");
        Ok(())
    }

    /// Number of rows in `user_activity`.
    pub async fn count(&self) -> Result<i64, RelayError> {
        let count = sqlx::query_scalar::<_, i64>(COUNT_ACTIVITY)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl RecordSink for MySqlStore {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn publish(&self, record: &ActivityRecord) -> Result<(), RelayError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(INSERT_ACTIVITY)
            .bind(&record.activity_uuid)
            .bind(&record.user_uid)
            .bind(&record.organization_id)
            .bind(record.timestamp.map(|t| t.naive_utc()))
            .bind(&record.app_name)
            .bind(&record.url)
            .bind(&record.page_title)
            .bind(&record.productivity_status)
            .bind(&record.meridian)
            .bind(&record.ip_address)
            .bind(&record.mac_address)
            .bind(record.mouse_movement)
            .bind(record.mouse_clicks)
            .bind(record.keys_clicks)
            .bind(record.status)
            .bind(&record.cpu_usage)
            .bind(&record.ram_usage)
            .bind(&record.screenshot_uid)
            .bind(&record.thumbnail_uid)
            .execute(&mut *tx)
            .await?;

        if self.track_objects {
            for key in record.object_keys() {
                sqlx::query(INSERT_OBJECT)
                    .bind(key)
                    .bind(&record.activity_uuid)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        tracing::debug!(activity_uuid = %record.activity_uuid, "Inserted record");
        Ok(())
    }

    async fn after_batch(&self) {
        match self.count().await {
            Ok(count) => tracing::debug!(rows = count, "Rows in user_activity"),
            Err(e) => tracing::warn!(error = %e, "Failed to count user_activity rows"),
        }
    }
}
