//! State management with SQLite persistence.
//!
//! Records live in a single hierarchical key-value table:
//!
//! - `/accounts/{ns}/account` - account records
//! - `/accounts/{ns}/services/{key}` - user catalog entries
//! - `/accounts/{ns}/stacks/{id}` - stacks
//! - `/services/{key}` - system catalog entries
//! - `/vocabularies/{name}` - vocabularies
//!
//! Every row carries a revision that increments on each write, which backs
//! the compare-and-swap path used by concurrent stack writers.

use crate::error::{Result, StrataError};
use crate::events::{Event, EventBus, EventType};
use crate::observability::metrics;
use crate::types::{Account, CatalogScope, ServiceSpec, Stack, Vocabulary};
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{ConnectOptions, Row};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, instrument};

pub mod migrations;
mod store;

pub use store::{keys, require_stack, update_stack, CasOutcome, StackStore, MAX_UPDATE_ATTEMPTS};


/// One stored record.
struct Record {
    key: String,
    value: String,
    revision: u64,
}

/// SQLite-backed [`StackStore`].
#[derive(Clone)]
pub struct StateManager {
    pool: SqlitePool,
    events: EventBus,
}

impl StateManager {
    /// Create a new StateManager with an in-memory database (for tests).
    pub async fn new_in_memory() -> Result<Self> {
        Self::new(":memory:").await
    }

    /// Get a reference to the underlying SQLite pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a new StateManager with a database at the specified path.
    #[instrument(skip(db_path))]
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        info!("Initializing state manager at {:?}", db_path);

        let in_memory = db_path == Path::new(":memory:");
        if !in_memory {
            if let Some(parent) = db_path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| StrataError::InvalidConfig {
                    reason: format!("Failed to create directory {}: {}", parent.display(), e),
                })?;
            }
        }

        let mut options = SqliteConnectOptions::from_str(db_path.to_str().ok_or_else(|| {
            StrataError::InvalidConfig { reason: "Invalid database path".to_string() }
        })?)
        .map_err(|e| StrataError::DatabaseError(e.to_string()))?;

        options = options.create_if_missing(true).log_statements(tracing::log::LevelFilter::Debug);

        // Each in-memory connection is its own database.
        let mut pool_options =
            SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StrataError::DatabaseError(e.to_string()))?;

        let manager = Self { pool, events: EventBus::new() };

        manager.run_migrations().await?;

        info!("State manager initialized successfully");
        Ok(manager)
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");
        migrations::run(&self.pool).await?;
        info!("Database migrations complete");
        Ok(())
    }

    // ========================
    // Raw Record Operations
    // ========================

    async fn get_record(&self, key: &str) -> Result<Option<Record>> {
        let row = sqlx::query("SELECT key, value, revision FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("get", e))?;

        Ok(row.map(|row| Record {
            key: row.get("key"),
            value: row.get("value"),
            revision: row.get::<i64, _>("revision") as u64,
        }))
    }

    /// Upsert a record, returning its new revision.
    async fn put_record(&self, key: &str, value: &str) -> Result<u64> {
        let now = Utc::now().timestamp();
        let revision: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO kv (key, value, revision, created_at, updated_at)
            VALUES (?, ?, 1, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                revision = kv.revision + 1,
                updated_at = excluded.updated_at
            RETURNING revision
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("put", e))?;

        Ok(revision as u64)
    }

    /// Write `value` only if the stored revision equals `expected`.
    async fn cas_record(&self, key: &str, value: &str, expected: u64) -> Result<CasOutcome> {
        let result = sqlx::query(
            "UPDATE kv SET value = ?, revision = revision + 1, updated_at = ? WHERE key = ? AND revision = ?",
        )
        .bind(value)
        .bind(Utc::now().timestamp())
        .bind(key)
        .bind(expected as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("cas", e))?;

        if result.rows_affected() == 1 {
            return Ok(CasOutcome::Stored(expected + 1));
        }

        match self.get_record(key).await? {
            Some(current) => Ok(CasOutcome::Conflict(current.revision)),
            None => Ok(CasOutcome::Missing),
        }
    }

    /// Delete a record. Returns whether it existed.
    async fn delete_record(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("delete", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM kv WHERE substr(key, 1, length(?)) = ?")
            .bind(prefix)
            .bind(prefix)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("delete", e))?;
        Ok(result.rows_affected())
    }

    /// Direct children of `prefix`, ordered by key.
    async fn list_children(&self, prefix: &str) -> Result<Vec<Record>> {
        let rows = sqlx::query(
            "SELECT key, value, revision FROM kv WHERE substr(key, 1, length(?)) = ? ORDER BY key",
        )
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list", e))?;

        Ok(rows
            .into_iter()
            .map(|row| Record {
                key: row.get("key"),
                value: row.get("value"),
                revision: row.get::<i64, _>("revision") as u64,
            })
            .filter(|record| !record.key[prefix.len()..].contains('/'))
            .collect())
    }

    async fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_record(key).await? {
            Some(record) => decode(&record).map(Some),
            None => Ok(None),
        }
    }

    // ========================
    // Stack Operations
    // ========================

    fn decode_stack(record: &Record) -> Result<Stack> {
        let mut stack: Stack = decode(record)?;
        stack.revision = record.revision;
        Ok(stack)
    }

    fn stack_written(&self, account: &str, stack_id: &str, revision: u64) {
        self.events
            .publish(Event::new(EventType::StackUpdated, account, stack_id).with_revision(revision));
    }

    /// Every stack of every account, for startup resume.
    #[instrument(skip(self))]
    pub async fn list_all_stacks(&self) -> Result<Vec<(String, Stack)>> {
        let mut all = Vec::new();
        for account in self.list_accounts().await? {
            for stack in self.list_stacks(&account.namespace).await? {
                all.push((account.namespace.clone(), stack));
            }
        }
        Ok(all)
    }
}

#[async_trait]
impl StackStore for StateManager {
    // ========================
    // Account Operations
    // ========================

    async fn get_account(&self, account: &str) -> Result<Option<Account>> {
        self.get_value(&keys::account(account)).await
    }

    #[instrument(skip(self, account), fields(account = %account.namespace))]
    async fn put_account(&self, account: &Account) -> Result<()> {
        self.put_record(&keys::account(&account.namespace), &encode(account)?).await?;
        self.events
            .publish(Event::new(EventType::AccountUpdated, &account.namespace, &account.namespace));
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_account(&self, account: &str) -> Result<()> {
        let removed = self.delete_prefix(&keys::account_subtree(account)).await?;
        debug!(removed, "Deleted account subtree");
        self.events.publish(Event::new(EventType::AccountDeleted, account, account));
        Ok(())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query(
            "SELECT key, value, revision FROM kv WHERE substr(key, 1, length(?)) = ? ORDER BY key",
        )
        .bind(keys::ACCOUNTS_PREFIX)
        .bind(keys::ACCOUNTS_PREFIX)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list", e))?;

        rows.into_iter()
            .map(|row| Record {
                key: row.get("key"),
                value: row.get("value"),
                revision: row.get::<i64, _>("revision") as u64,
            })
            .filter(|record| keys::account_of(&record.key).is_some())
            .map(|record| decode(&record))
            .collect()
    }

    // ========================
    // Stack Operations
    // ========================

    async fn get_stack(&self, account: &str, stack_id: &str) -> Result<Option<Stack>> {
        match self.get_record(&keys::stack(account, stack_id)).await? {
            Some(record) => Self::decode_stack(&record).map(Some),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, stack), fields(stack_id = %stack.id))]
    async fn put_stack(&self, account: &str, stack: &Stack) -> Result<u64> {
        let revision = self.put_record(&keys::stack(account, &stack.id), &encode(stack)?).await?;
        self.stack_written(account, &stack.id, revision);
        Ok(revision)
    }

    async fn compare_and_put_stack(&self, account: &str, stack: &Stack) -> Result<CasOutcome> {
        let outcome =
            self.cas_record(&keys::stack(account, &stack.id), &encode(stack)?, stack.revision).await?;
        if let CasOutcome::Stored(revision) = outcome {
            self.stack_written(account, &stack.id, revision);
        }
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn delete_stack(&self, account: &str, stack_id: &str) -> Result<()> {
        if self.delete_record(&keys::stack(account, stack_id)).await? {
            self.events.publish(Event::new(EventType::StackDeleted, account, stack_id));
        }
        Ok(())
    }

    async fn list_stacks(&self, account: &str) -> Result<Vec<Stack>> {
        self.list_children(&keys::stacks(account))
            .await?
            .iter()
            .map(Self::decode_stack)
            .collect()
    }

    // ========================
    // Catalog Operations
    // ========================

    async fn get_service_spec(&self, account: &str, key: &str) -> Result<Option<ServiceSpec>> {
        if let Some(mut spec) =
            self.get_value::<ServiceSpec>(&keys::user_service(account, key)).await?
        {
            spec.catalog = CatalogScope::User;
            return Ok(Some(spec));
        }
        Ok(self.get_value::<ServiceSpec>(&keys::system_service(key)).await?.map(|mut spec| {
            spec.catalog = CatalogScope::System;
            spec
        }))
    }

    #[instrument(skip(self, spec), fields(key = %spec.key))]
    async fn put_service_spec(
        &self,
        scope: CatalogScope,
        account: &str,
        spec: &ServiceSpec,
    ) -> Result<()> {
        let key = match scope {
            CatalogScope::System => keys::system_service(&spec.key),
            CatalogScope::User => keys::user_service(account, &spec.key),
        };
        let mut stored = spec.clone();
        stored.catalog = scope;
        self.put_record(&key, &encode(&stored)?).await?;
        self.events.publish(Event::new(EventType::ServiceRegistered, account, &spec.key));
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_service_spec(
        &self,
        scope: CatalogScope,
        account: &str,
        key: &str,
    ) -> Result<()> {
        let record_key = match scope {
            CatalogScope::System => keys::system_service(key),
            CatalogScope::User => keys::user_service(account, key),
        };
        if self.delete_record(&record_key).await? {
            self.events.publish(Event::new(EventType::ServiceRemoved, account, key));
        }
        Ok(())
    }

    async fn list_services(&self, account: &str) -> Result<Vec<ServiceSpec>> {
        scoped_specs(self.list_children(&keys::user_services(account)).await?, CatalogScope::User)
    }

    async fn list_global_services(&self) -> Result<Vec<ServiceSpec>> {
        scoped_specs(
            self.list_children(keys::SYSTEM_SERVICES_PREFIX).await?,
            CatalogScope::System,
        )
    }

    // ========================
    // Vocabulary Operations
    // ========================

    async fn get_vocabulary(&self, name: &str) -> Result<Option<Vocabulary>> {
        self.get_value(&keys::vocabulary(name)).await
    }

    async fn put_vocabulary(&self, vocabulary: &Vocabulary) -> Result<()> {
        self.put_record(&keys::vocabulary(&vocabulary.name), &encode(vocabulary)?).await?;
        Ok(())
    }

    fn events(&self) -> &EventBus {
        &self.events
    }
}

fn scoped_specs(records: Vec<Record>, scope: CatalogScope) -> Result<Vec<ServiceSpec>> {
    records
        .iter()
        .map(|record| {
            let mut spec: ServiceSpec = decode(record)?;
            spec.catalog = scope;
            Ok(spec)
        })
        .collect()
}

fn encode<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| StrataError::DatabaseError(format!("Failed to serialize record: {}", e)))
}

fn decode<T: DeserializeOwned>(record: &Record) -> Result<T> {
    serde_json::from_str(&record.value).map_err(|e| {
        StrataError::DatabaseError(format!("Failed to deserialize {}: {}", record.key, e))
    })
}

fn db_error(operation: &str, err: sqlx::Error) -> StrataError {
    metrics::record_store_error(operation);
    StrataError::DatabaseError(err.to_string())
}
