//! libSQL backend: async `OrderStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::ParsedRecipient;
use crate::store::migrations;
use crate::store::model::{NewOrderRecord, OrderMode, OrderRecord, OrderStatus};
use crate::store::traits::OrderStore;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Fetch a single record by an arbitrary indexed column.
    async fn fetch_one(
        &self,
        column: &str,
        value: &str,
        op: &str,
    ) -> Result<Option<OrderRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE {column} = ?1 LIMIT 1"),
                params![value],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_order(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }

    /// Validate and apply a status write as a compare-and-set on the current status.
    async fn transition(
        &self,
        id: &str,
        next: OrderStatus,
        error_message: Option<&str>,
        provider_order_id: Option<&str>,
    ) -> Result<OrderRecord, DatabaseError> {
        let current = self.get(id).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "order".into(),
            id: id.to_string(),
        })?;

        if !current.status.can_transition_to(next) {
            return Err(DatabaseError::InvalidTransition {
                id: id.to_string(),
                from: current.status.to_string(),
                to: next.to_string(),
            });
        }

        let error_message = error_message.map(str::trim).filter(|s| !s.is_empty());
        match (next, error_message) {
            (OrderStatus::Failed, None) => {
                return Err(DatabaseError::Serialization(format!(
                    "order {id}: failed status requires an error message"
                )));
            }
            (OrderStatus::Failed, Some(_)) | (_, None) => {}
            (_, Some(_)) => {
                return Err(DatabaseError::Serialization(format!(
                    "order {id}: error message only allowed on failed status"
                )));
            }
        }

        let now = now_rfc3339();
        let changed = self
            .conn()
            .execute(
                "UPDATE orders
                    SET status = ?1,
                        error_message = ?2,
                        provider_order_id = COALESCE(?3, provider_order_id),
                        updated_at = ?4
                  WHERE id = ?5 AND status = ?6",
                params![
                    next.as_str(),
                    opt_text(error_message),
                    opt_text(provider_order_id),
                    now,
                    id,
                    current.status.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_status: {e}")))?;

        if changed == 0 {
            let latest = self.get(id).await?;
            return Err(DatabaseError::InvalidTransition {
                id: id.to_string(),
                from: latest
                    .map(|r| r.status.to_string())
                    .unwrap_or_else(|| "missing".into()),
                to: next.to_string(),
            });
        }

        debug!(id = id, from = %current.status, to = %next, "Order status updated");
        self.get(id).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "order".into(),
            id: id.to_string(),
        })
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Fixed-precision timestamp so lexical order matches time order.
fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const ORDER_COLUMNS: &str = "id, message_id, sender_email, recipient, provider_order_id, mode, forced_test_mode, status, error_message, created_at, updated_at";

/// Map a libsql Row to an OrderRecord (column order matches ORDER_COLUMNS).
fn row_to_order(row: &libsql::Row) -> Result<OrderRecord, DatabaseError> {
    let col = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));

    let recipient_json: Option<String> = row.get::<String>(3).ok();
    let recipient = recipient_json
        .as_deref()
        .map(serde_json::from_str::<ParsedRecipient>)
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("recipient snapshot: {e}")))?;

    let mode_str: String = row.get(5).map_err(col)?;
    let status_str: String = row.get(7).map_err(col)?;
    let created_str: String = row.get(9).map_err(col)?;
    let updated_str: String = row.get(10).map_err(col)?;

    Ok(OrderRecord {
        id: row.get(0).map_err(col)?,
        message_id: row.get(1).map_err(col)?,
        sender_email: row.get(2).map_err(col)?,
        recipient,
        provider_order_id: row.get::<String>(4).ok(),
        mode: mode_str
            .parse::<OrderMode>()
            .map_err(DatabaseError::Serialization)?,
        forced_test_mode: row.get::<i64>(6).map_err(col)? != 0,
        status: status_str
            .parse::<OrderStatus>()
            .map_err(DatabaseError::Serialization)?,
        error_message: row.get::<String>(8).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl OrderStore for LibSqlBackend {
    async fn is_processed(&self, message_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM orders WHERE message_id = ?1 LIMIT 1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("is_processed: {e}")))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(DatabaseError::Query(format!("is_processed: {e}"))),
        }
    }

    async fn insert(&self, record: &NewOrderRecord) -> Result<OrderRecord, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let recipient = record
            .recipient
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(format!("recipient snapshot: {e}")))?;

        let inserted = self
            .conn()
            .execute(
                "INSERT INTO orders (id, message_id, sender_email, recipient, provider_order_id,
                    mode, forced_test_mode, status, error_message, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6, 'processing', NULL, ?7, ?7)
                 ON CONFLICT(message_id) DO NOTHING",
                params![
                    id.clone(),
                    record.message_id.clone(),
                    record.sender_email.clone(),
                    opt_text(recipient.as_deref()),
                    record.mode.as_str(),
                    i64::from(record.forced_test_mode),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_order: {e}")))?;

        if inserted == 0 {
            return Err(DatabaseError::DuplicateKey {
                message_id: record.message_id.clone(),
            });
        }

        debug!(id = %id, message_id = %record.message_id, "Order inserted into DB");
        self.get(&id).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "order".into(),
            id,
        })
    }

    async fn update_status(
        &self,
        id: &str,
        status: OrderStatus,
        error_message: Option<&str>,
    ) -> Result<OrderRecord, DatabaseError> {
        self.transition(id, status, error_message, None).await
    }

    async fn mark_sent(
        &self,
        id: &str,
        provider_order_id: &str,
    ) -> Result<OrderRecord, DatabaseError> {
        self.transition(id, OrderStatus::Sent, None, Some(provider_order_id))
            .await
    }

    async fn set_recipient(
        &self,
        id: &str,
        recipient: &ParsedRecipient,
    ) -> Result<OrderRecord, DatabaseError> {
        let snapshot = serde_json::to_string(recipient)
            .map_err(|e| DatabaseError::Serialization(format!("recipient snapshot: {e}")))?;

        let changed = self
            .conn()
            .execute(
                "UPDATE orders SET recipient = ?1, updated_at = ?2
                  WHERE id = ?3 AND status = 'processing'",
                params![snapshot, now_rfc3339(), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_recipient: {e}")))?;

        let record = self.get(id).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "order".into(),
            id: id.to_string(),
        })?;
        if changed == 0 {
            return Err(DatabaseError::InvalidTransition {
                id: id.to_string(),
                from: record.status.to_string(),
                to: OrderStatus::Processing.to_string(),
            });
        }
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<Option<OrderRecord>, DatabaseError> {
        self.fetch_one("id", id, "get_order").await
    }

    async fn find_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<OrderRecord>, DatabaseError> {
        self.fetch_one("message_id", message_id, "find_by_message_id")
            .await
    }

    async fn find_by_provider_order_id(
        &self,
        provider_order_id: &str,
    ) -> Result<Option<OrderRecord>, DatabaseError> {
        self.fetch_one("provider_order_id", provider_order_id, "find_by_provider_order_id")
            .await
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<OrderRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ORDER_COLUMNS} FROM orders ORDER BY created_at DESC, rowid DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_recent: {e}")))?;

        let mut records = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_order(&row) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!("Skipping order row: {e}");
                }
            }
        }
        Ok(records)
    }
}
