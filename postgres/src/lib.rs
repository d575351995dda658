//! `PostgreSQL` document store for the idproxy credential stores.
//!
//! This crate provides a production implementation of the
//! [`DocumentStore`] port from `idproxy-core`. Documents live in a single
//! table as JSONB bodies with an explicit row version:
//!
//! ```text
//! documents(collection TEXT, id TEXT, data JSONB, version BIGINT)
//! ```
//!
//! - Versions come from the `document_versions` sequence, so a key that is
//!   deleted and created again never sees a version it had before
//! - Commits lock every row they read or write (`SELECT ... FOR UPDATE`, in
//!   key order), validate the read set and write preconditions against the
//!   locked versions, then apply all writes in one database transaction
//! - Range filters compare JSONB values of the same JSON type only, so
//!   `null` or missing fields never match a range
//! - Serialization failures and deadlocks surface as `Aborted` so callers
//!   re-run their transaction
//!
//! # Example
//!
//! ```ignore
//! use idproxy_postgres::PostgresDocumentStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresDocumentStore::new("postgres://localhost/idproxy").await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use idproxy_core::document::{Document, DocumentKey, FilterOp, Precondition, Query, Version};
use idproxy_core::document_store::{Commit, DocumentStore, DocumentStoreError, StoreFuture, Write};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::{BTreeMap, BTreeSet};

/// Default largest batch accepted by `batch_delete`.
const DEFAULT_MAX_BATCH_SIZE: usize = 500;

/// `PostgreSQL`-backed [`DocumentStore`].
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone, Debug)]
pub struct PostgresDocumentStore {
    pool: PgPool,
    max_batch_size: usize,
}

impl PostgresDocumentStore {
    /// Connect to `database_url` with a default pool.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Unavailable`] if the connection fails.
    pub async fn new(database_url: &str) -> Result<Self, DocumentStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| DocumentStoreError::Unavailable(e.to_string()))?;
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }

    /// Override the batch ceiling for `batch_delete`.
    #[must_use]
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    /// Underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `documents` table, its version sequence and indexes if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::DatabaseError`] if a statement fails.
    pub async fn migrate(&self) -> Result<(), DocumentStoreError> {
        sqlx::query("CREATE SEQUENCE IF NOT EXISTS document_versions AS BIGINT MINVALUE 1")
            .execute(&self.pool)
            .await
            .map_err(|e| DocumentStoreError::DatabaseError(e.to_string()))?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                data JSONB NOT NULL,
                version BIGINT NOT NULL,
                PRIMARY KEY (collection, id)
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DocumentStoreError::DatabaseError(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_data ON documents USING GIN (data jsonb_path_ops)")
            .execute(&self.pool)
            .await
            .map_err(|e| DocumentStoreError::DatabaseError(e.to_string()))?;

        tracing::info!("Document store schema ready");
        Ok(())
    }

    async fn get_document(&self, key: &DocumentKey) -> Result<Option<Document>, DocumentStoreError> {
        let row = sqlx::query("SELECT data, version FROM documents WHERE collection = $1 AND id = $2")
            .bind(key.collection())
            .bind(key.id())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify(e, key))?;

        row.map(|row| decode_row(key.clone(), &row)).transpose()
    }

    async fn apply_commit(&self, commit: Commit) -> Result<(), DocumentStoreError> {
        let Some(first_key) = commit
            .writes
            .first()
            .map(Write::key)
            .or_else(|| commit.reads.first().map(|(key, _)| key))
            .cloned()
        else {
            return Ok(());
        };

        let mut tx = self.pool.begin().await.map_err(|e| classify(e, &first_key))?;

        // Lock in key order so concurrent commits cannot deadlock each other.
        let keys: BTreeSet<&DocumentKey> = commit
            .reads
            .iter()
            .map(|(key, _)| key)
            .chain(commit.writes.iter().map(Write::key))
            .collect();

        let mut current: BTreeMap<DocumentKey, Option<Version>> = BTreeMap::new();
        for key in keys {
            let version: Option<i64> =
                sqlx::query_scalar("SELECT version FROM documents WHERE collection = $1 AND id = $2 FOR UPDATE")
                    .bind(key.collection())
                    .bind(key.id())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| classify(e, key))?;
            current.insert(key.clone(), version.map(to_version).transpose()?);
        }

        for (key, seen) in &commit.reads {
            if current.get(key).copied().flatten() != *seen {
                metrics::counter!("document_store.commit.aborted").increment(1);
                return Err(DocumentStoreError::Aborted { key: key.clone() });
            }
        }
        for write in &commit.writes {
            check_write(current.get(write.key()).copied().flatten(), write)?;
        }

        let read_keys: BTreeSet<&DocumentKey> = commit.reads.iter().map(|(key, _)| key).collect();
        for write in &commit.writes {
            let result = match write {
                Write::Create { key, data } => {
                    sqlx::query(
                        "INSERT INTO documents (collection, id, data, version) \
                         VALUES ($1, $2, $3, nextval('document_versions'))",
                    )
                    .bind(key.collection())
                    .bind(key.id())
                    .bind(data)
                    .execute(&mut *tx)
                    .await
                }
                Write::Update { key, data, .. } => {
                    sqlx::query(
                        "UPDATE documents SET data = $3, version = nextval('document_versions') \
                         WHERE collection = $1 AND id = $2",
                    )
                    .bind(key.collection())
                    .bind(key.id())
                    .bind(data)
                    .execute(&mut *tx)
                    .await
                }
                Write::Delete { key, .. } => {
                    sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
                        .bind(key.collection())
                        .bind(key.id())
                        .execute(&mut *tx)
                        .await
                }
            };

            if let Err(e) = result {
                let key = write.key();
                // A concurrent insert of a key we locked as absent.
                if is_unique_violation(&e) {
                    return Err(if read_keys.contains(key) {
                        DocumentStoreError::Aborted { key: key.clone() }
                    } else {
                        DocumentStoreError::AlreadyExists(key.clone())
                    });
                }
                return Err(classify(e, key));
            }
        }

        tx.commit().await.map_err(|e| classify(e, &first_key))?;
        Ok(())
    }

    async fn run_query(&self, query: Query) -> Result<Vec<Document>, DocumentStoreError> {
        let mut builder = build_select(&query)?;
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify(e, &DocumentKey::new(query.collection.as_str(), "")))?;

        rows.iter()
            .map(|row| {
                let id: String = row
                    .try_get("id")
                    .map_err(|e| DocumentStoreError::DatabaseError(e.to_string()))?;
                decode_row(DocumentKey::new(query.collection.as_str(), id), row)
            })
            .collect()
    }

    async fn delete_batch(&self, keys: Vec<DocumentKey>) -> Result<usize, DocumentStoreError> {
        if keys.len() > self.max_batch_size {
            return Err(DocumentStoreError::InvalidRequest(format!(
                "batch of {} exceeds limit of {}",
                keys.len(),
                self.max_batch_size
            )));
        }
        let Some(first_key) = keys.first().cloned() else {
            return Ok(0);
        };

        let (collections, ids): (Vec<String>, Vec<String>) = keys
            .into_iter()
            .map(|key| (key.collection().to_string(), key.id().to_string()))
            .unzip();

        let result = sqlx::query(
            r"
            DELETE FROM documents
            WHERE (collection, id) IN (SELECT * FROM UNNEST($1::text[], $2::text[]))
            ",
        )
        .bind(collections)
        .bind(ids)
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, &first_key))?;

        usize::try_from(result.rows_affected())
            .map_err(|e| DocumentStoreError::DatabaseError(e.to_string()))
    }
}

impl DocumentStore for PostgresDocumentStore {
    fn get<'a>(&'a self, key: &'a DocumentKey) -> StoreFuture<'a, Option<Document>> {
        Box::pin(self.get_document(key))
    }

    fn commit(&self, commit: Commit) -> StoreFuture<'_, ()> {
        Box::pin(self.apply_commit(commit))
    }

    fn query(&self, query: Query) -> StoreFuture<'_, Vec<Document>> {
        Box::pin(self.run_query(query))
    }

    fn batch_delete(&self, keys: Vec<DocumentKey>) -> StoreFuture<'_, usize> {
        Box::pin(self.delete_batch(keys))
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}

/// Build the `SELECT` for a [`Query`].
///
/// Field names and operands are always bound, never interpolated.
fn build_select(query: &Query) -> Result<QueryBuilder<'static, Postgres>, DocumentStoreError> {
    let mut builder =
        QueryBuilder::new("SELECT id, data, version FROM documents WHERE collection = ");
    builder.push_bind(query.collection.clone());

    for filter in &query.filters {
        if filter.op == FilterOp::Eq {
            builder.push(" AND data -> ");
            builder.push_bind(filter.field.clone());
            builder.push(" = ");
            builder.push_bind(filter.value.clone());
            continue;
        }

        builder.push(" AND jsonb_typeof(data -> ");
        builder.push_bind(filter.field.clone());
        builder.push(") = jsonb_typeof(");
        builder.push_bind(filter.value.clone());
        builder.push(") AND data -> ");
        builder.push_bind(filter.field.clone());
        builder.push(" ");
        builder.push(filter.op.as_sql());
        builder.push(" ");
        builder.push_bind(filter.value.clone());
    }

    builder.push(" ORDER BY id");
    if let Some(limit) = query.limit {
        let limit = i64::try_from(limit).map_err(|e| DocumentStoreError::InvalidRequest(e.to_string()))?;
        builder.push(" LIMIT ");
        builder.push_bind(limit);
    }
    Ok(builder)
}

fn check_write(current: Option<Version>, write: &Write) -> Result<(), DocumentStoreError> {
    let key = write.key();
    match write {
        Write::Create { .. } => {
            if current.is_some() {
                return Err(DocumentStoreError::AlreadyExists(key.clone()));
            }
        }
        Write::Update { precondition, .. } | Write::Delete { precondition, .. } => {
            let must_exist = matches!(write, Write::Update { .. }) || *precondition == Precondition::Exists;
            if must_exist && current.is_none() {
                return Err(DocumentStoreError::NotFound(key.clone()));
            }
            if !precondition.holds(current) {
                return Err(DocumentStoreError::FailedPrecondition {
                    key: key.clone(),
                    expected: *precondition,
                    actual: current,
                });
            }
        }
    }
    Ok(())
}

fn decode_row(key: DocumentKey, row: &PgRow) -> Result<Document, DocumentStoreError> {
    let data: Value = row
        .try_get("data")
        .map_err(|e| DocumentStoreError::SerializationError(e.to_string()))?;
    let version: i64 = row
        .try_get("version")
        .map_err(|e| DocumentStoreError::DatabaseError(e.to_string()))?;
    Ok(Document {
        key,
        data,
        version: to_version(version)?,
    })
}

fn to_version(raw: i64) -> Result<Version, DocumentStoreError> {
    u64::try_from(raw)
        .map(Version::new)
        .map_err(|_| DocumentStoreError::DatabaseError(format!("negative row version {raw}")))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// Map a driver error onto the port's error kinds.
fn classify(err: sqlx::Error, key: &DocumentKey) -> DocumentStoreError {
    match &err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // serialization_failure, deadlock_detected
            Some("40001" | "40P01") => DocumentStoreError::Aborted { key: key.clone() },
            // query_canceled (statement_timeout)
            Some("57014") => DocumentStoreError::DeadlineExceeded(err.to_string()),
            // insufficient_resources class
            Some(code) if code.starts_with("53") => DocumentStoreError::ResourceExhausted(err.to_string()),
            // admin_shutdown, crash_shutdown, cannot_connect_now
            Some("57P01" | "57P02" | "57P03") => DocumentStoreError::Unavailable(err.to_string()),
            _ => DocumentStoreError::DatabaseError(err.to_string()),
        },
        sqlx::Error::PoolTimedOut => DocumentStoreError::DeadlineExceeded(err.to_string()),
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            DocumentStoreError::Unavailable(err.to_string())
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            DocumentStoreError::SerializationError(err.to_string())
        }
        _ => DocumentStoreError::DatabaseError(err.to_string()),
    }
}
