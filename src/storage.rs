//! SQLite document store for the CAD console.
//!
//! Entities are kept as JSON documents grouped in collections, scoped by the
//! server namespace (`T1S1`, ...). The store offers the small contract the
//! console relies on:
//!
//! - read one document or a whole collection
//! - insert with a generated key, upsert with or without merge, update, delete
//! - append-to-array with union semantics, atomic within one transaction
//! - checked writes that validate the collection and write in one transaction
//! - a change feed that live queries listen to
//!
//! Plain writes are last-writer-wins. There is no version check and no retry.
//! Checked writes run one at a time, so a precondition they accept still
//! holds when their write commits.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use tokio::sync::{Mutex, broadcast};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::live::SubscriptionRegistry;

pub const INCIDENTS: &str = "incidents";
pub const UNITS: &str = "units";
pub const BOLOS: &str = "bolos";
pub const RADIO_MESSAGES: &str = "radioMessages";
pub const SHIFT_LOGS: &str = "shiftLogs";

/// Buffered change notifications per listener before it is reported as lagging.
const CHANGE_FEED_CAPACITY: usize = 256;

/// Top-level fields of a document.
pub type Fields = Map<String, Value>;

/// A committed mutation, published after the write succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub collection: String,
    pub id: String,
}

/// Document store handle. Cheap to clone; clones share the pool and change feed.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
    namespace: String,
    changes: broadcast::Sender<Change>,
    registry: Arc<SubscriptionRegistry>,
    checked_writes: Arc<Mutex<()>>,
}

impl Storage {
    /// Connect to the database and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:cad.db" or "sqlite::memory:")
    /// * `namespace` - server id every collection is scoped to
    pub async fn new(database_url: &str, namespace: &str) -> Result<Self> {
        let in_memory = database_url.contains(":memory:");

        // Each in-memory connection is a separate database, so tests and
        // throwaway runs pin a single connection that never expires.
        let options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = options.connect(database_url).await?;
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);

        let storage = Self {
            pool,
            namespace: namespace.to_string(),
            changes,
            registry: Arc::new(SubscriptionRegistry::default()),
            checked_writes: Arc::new(Mutex::new(())),
        };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    async fn initialize_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                namespace TEXT NOT NULL,
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_ts INTEGER NOT NULL,
                PRIMARY KEY (namespace, collection, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub(crate) fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Listen to committed changes in every collection of this namespace.
    pub fn changes(&self) -> broadcast::Receiver<Change> {
        self.changes.subscribe()
    }

    /// Read a document's raw fields, with `id` set to its key.
    pub async fn get_fields(&self, collection: &str, id: &str) -> Result<Option<Fields>> {
        let row = sqlx::query(
            r#"
            SELECT body FROM documents
            WHERE namespace = ? AND collection = ? AND id = ?
            "#,
        )
        .bind(&self.namespace)
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| decode_body(row.get("body"), id)).transpose()
    }

    /// Read and decode one document.
    pub async fn get<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Result<Option<T>> {
        match self.get_fields(collection, id).await? {
            Some(fields) => decode_document(collection, id, fields).map(Some),
            None => Ok(None),
        }
    }

    /// Read and decode one document, failing with `NotFound` when absent.
    pub async fn require<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Result<T> {
        self.get(collection, id)
            .await?
            .ok_or_else(|| Error::not_found(collection, id))
    }

    /// Read and decode every document of a collection.
    ///
    /// A document that does not match `T` fails the whole read.
    pub async fn list<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
        let rows = sqlx::query(
            r#"
            SELECT id, body FROM documents
            WHERE namespace = ? AND collection = ?
            "#,
        )
        .bind(&self.namespace)
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| decode_row(collection, row)).collect()
    }

    /// Insert a new document under a generated key and return the key.
    pub async fn insert(&self, collection: &str, fields: Fields) -> Result<String> {
        let id = Uuid::new_v4().simple().to_string();
        let mut tx = self.pool.begin().await?;
        self.write_body(&mut tx, collection, &id, fields).await?;
        tx.commit().await?;

        self.publish(collection, &id);
        Ok(id)
    }

    /// Write a document. With `merge` the given fields are laid over the
    /// existing document (creating it when absent); without it the document
    /// is replaced.
    pub async fn upsert(&self, collection: &str, id: &str, fields: Fields, merge: bool) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let body = if merge {
            let mut existing = self
                .read_body(&mut tx, collection, id)
                .await?
                .unwrap_or_default();
            existing.extend(fields);
            existing
        } else {
            fields
        };

        self.write_body(&mut tx, collection, id, body).await?;
        tx.commit().await?;

        self.publish(collection, id);
        Ok(())
    }

    /// Merge fields into an existing document. Fails with `NotFound` when the
    /// document does not exist.
    pub async fn update(&self, collection: &str, id: &str, fields: Fields) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let mut existing = self
            .read_body(&mut tx, collection, id)
            .await?
            .ok_or_else(|| Error::not_found(collection, id))?;
        existing.extend(fields);

        self.write_body(&mut tx, collection, id, existing).await?;
        tx.commit().await?;

        self.publish(collection, id);
        Ok(())
    }

    /// Append `values` to the array `field`, skipping values already present,
    /// and merge `also` into the document in the same write.
    pub async fn array_union(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        values: Vec<Value>,
        also: Fields,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.union_in(&mut tx, collection, id, field, values, also).await?;
        tx.commit().await?;

        self.publish(collection, id);
        Ok(())
    }

    /// Insert a new document if `check` accepts the current documents of
    /// `collection`. Returns the generated key.
    pub async fn insert_checked<T, F>(
        &self,
        collection: &str,
        fields: Fields,
        check: F,
    ) -> Result<String>
    where
        T: DeserializeOwned,
        F: FnOnce(&[T]) -> Result<()>,
    {
        let _serialized = self.checked_writes.lock().await;
        let mut tx = self.pool.begin().await?;

        let docs = self.read_collection::<T>(&mut tx, collection).await?;
        check(&docs)?;

        let id = Uuid::new_v4().simple().to_string();
        self.write_body(&mut tx, collection, &id, fields).await?;
        tx.commit().await?;

        self.publish(collection, &id);
        Ok(id)
    }

    /// [`Storage::array_union`] guarded by `check` over the current documents
    /// of `collection`. Nothing is written when `check` fails.
    pub async fn array_union_checked<T, F>(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        values: Vec<Value>,
        also: Fields,
        check: F,
    ) -> Result<()>
    where
        T: DeserializeOwned,
        F: FnOnce(&[T]) -> Result<()>,
    {
        let _serialized = self.checked_writes.lock().await;
        let mut tx = self.pool.begin().await?;

        let docs = self.read_collection::<T>(&mut tx, collection).await?;
        check(&docs)?;

        self.union_in(&mut tx, collection, id, field, values, also).await?;
        tx.commit().await?;

        self.publish(collection, id);
        Ok(())
    }

    async fn union_in(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        collection: &str,
        id: &str,
        field: &str,
        values: Vec<Value>,
        also: Fields,
    ) -> Result<()> {
        let mut existing = self
            .read_body(tx, collection, id)
            .await?
            .ok_or_else(|| Error::not_found(collection, id))?;

        let mut items = match existing.remove(field) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                return Err(Error::invalid(format!(
                    "{collection}/{id}.{field} is not an array: {other}"
                )));
            }
        };
        for value in values {
            if !items.contains(&value) {
                items.push(value);
            }
        }
        existing.insert(field.to_string(), Value::Array(items));
        existing.extend(also);

        self.write_body(tx, collection, id, existing).await
    }

    /// Delete a document. Returns whether it existed; deleting a missing
    /// document is not an error.
    pub async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM documents
            WHERE namespace = ? AND collection = ? AND id = ?
            "#,
        )
        .bind(&self.namespace)
        .bind(collection)
        .bind(id)
        .execute(&self.pool)
        .await?;

        let existed = result.rows_affected() > 0;
        if existed {
            self.publish(collection, id);
        }
        Ok(existed)
    }

    async fn read_collection<T: DeserializeOwned>(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        collection: &str,
    ) -> Result<Vec<T>> {
        let rows = sqlx::query(
            r#"
            SELECT id, body FROM documents
            WHERE namespace = ? AND collection = ?
            "#,
        )
        .bind(&self.namespace)
        .bind(collection)
        .fetch_all(&mut **tx)
        .await?;

        rows.iter().map(|row| decode_row(collection, row)).collect()
    }

    async fn read_body(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        collection: &str,
        id: &str,
    ) -> Result<Option<Fields>> {
        let row = sqlx::query(
            r#"
            SELECT body FROM documents
            WHERE namespace = ? AND collection = ? AND id = ?
            "#,
        )
        .bind(&self.namespace)
        .bind(collection)
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(|row| decode_body(row.get("body"), id)).transpose()
    }

    async fn write_body(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        collection: &str,
        id: &str,
        mut body: Fields,
    ) -> Result<()> {
        body.insert("id".to_string(), Value::String(id.to_string()));
        let encoded = serde_json::to_string(&body)?;

        sqlx::query(
            r#"
            INSERT INTO documents (namespace, collection, id, body, updated_ts)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (namespace, collection, id)
            DO UPDATE SET body = excluded.body, updated_ts = excluded.updated_ts
            "#,
        )
        .bind(&self.namespace)
        .bind(collection)
        .bind(id)
        .bind(encoded)
        .bind(Utc::now().timestamp_millis())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    fn publish(&self, collection: &str, id: &str) {
        debug!(namespace = %self.namespace, collection, id, "Document changed");
        // No listeners is the common case outside live views.
        let _ = self.changes.send(Change {
            collection: collection.to_string(),
            id: id.to_string(),
        });
    }
}

/// Serialize a value into top-level document fields.
pub fn to_fields<T: Serialize>(value: &T) -> Result<Fields> {
    match serde_json::to_value(value)? {
        Value::Object(fields) => Ok(fields),
        other => Err(Error::invalid(format!("document must be an object, got {other}"))),
    }
}

fn decode_body(body: String, id: &str) -> Result<Fields> {
    let mut fields: Fields = serde_json::from_str(&body)?;
    fields.insert("id".to_string(), Value::String(id.to_string()));
    Ok(fields)
}

fn decode_row<T: DeserializeOwned>(collection: &str, row: &SqliteRow) -> Result<T> {
    let id: String = row.get("id");
    let fields = decode_body(row.get("body"), &id)?;
    decode_document(collection, &id, fields)
}

fn decode_document<T: DeserializeOwned>(collection: &str, id: &str, fields: Fields) -> Result<T> {
    serde_json::from_value(Value::Object(fields)).map_err(|source| Error::InvalidDocument {
        collection: collection.to_string(),
        id: id.to_string(),
        source,
    })
}
