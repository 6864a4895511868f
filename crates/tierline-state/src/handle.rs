//! SurrealDB Handle - Connection and Operations
//!
//! Manages the connection and provides the append/query primitives behind
//! every storage trait:
//! - append-only entry tables (runs, releases, outcomes, rollbacks, audit)
//! - the replaceable per-environment status snapshot
//!
//! Supports in-memory (`mem://`), embedded (`surrealkv://path`) and remote
//! (`ws://`, `wss://`) connections.

use crate::error::{StateError, StorageError};
use crate::schema::EnvironmentStatus;
use crate::storage_traits::StorageResult;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::sql::Datetime as SurrealDatetime;
use surrealdb::Surreal;
use tracing::{debug, info, instrument};

pub(crate) const RUNS: &str = "pipeline_runs";
pub(crate) const RELEASES: &str = "releases";
pub(crate) const RELEASE_OUTCOMES: &str = "release_outcomes";
pub(crate) const ROLLBACKS: &str = "rollbacks";
pub(crate) const AUTHZ_DECISIONS: &str = "authz_decisions";
pub(crate) const ENVIRONMENT_STATUS: &str = "environment_status";

/// Credentials for a remote SurrealDB instance
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// WebSocket endpoint URL (e.g., "wss://xxx.aws-use1.surrealdb.cloud")
    pub endpoint: String,
    pub username: String,
    pub password: String,
    /// Namespace (default: "tierline")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    /// Whether this is a root user (true) or database user (false)
    pub is_root: bool,
}

impl CloudConfig {
    /// Create from environment variables
    ///
    /// Reads:
    /// - SURREALDB_ENDPOINT (required)
    /// - SURREALDB_USERNAME (required)
    /// - SURREALDB_PASSWORD (required)
    /// - SURREALDB_NAMESPACE (optional, default: "tierline")
    /// - SURREALDB_DATABASE (optional, default: "main")
    /// - SURREALDB_ROOT (optional, default: "false")
    pub fn from_env() -> std::result::Result<Self, String> {
        let endpoint =
            std::env::var("SURREALDB_ENDPOINT").map_err(|_| "SURREALDB_ENDPOINT not set")?;
        let username =
            std::env::var("SURREALDB_USERNAME").map_err(|_| "SURREALDB_USERNAME not set")?;
        let password =
            std::env::var("SURREALDB_PASSWORD").map_err(|_| "SURREALDB_PASSWORD not set")?;
        let namespace =
            std::env::var("SURREALDB_NAMESPACE").unwrap_or_else(|_| "tierline".to_string());
        let database = std::env::var("SURREALDB_DATABASE").unwrap_or_else(|_| "main".to_string());
        let is_root = std::env::var("SURREALDB_ROOT")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            endpoint,
            username,
            password,
            namespace,
            database,
            is_root,
        })
    }
}

/// Row shape shared by every table: the record body plus the fields the
/// queries filter and order on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DbEntry<T> {
    pub environment: String,
    pub key: String,
    pub recorded_at: SurrealDatetime,
    pub body: T,
}

/// SurrealDB connection handle
pub struct SurrealHandle {
    db: Surreal<Any>,
}

impl SurrealHandle {
    /// Connect to an in-memory database and set up the schema
    #[instrument(skip_all)]
    pub async fn setup_db() -> Result<Self, StateError> {
        Self::connect("mem://").await
    }

    /// Connect to any supported URL (`mem://`, `surrealkv://path`, `ws://host`)
    #[instrument(skip_all, fields(url = %url))]
    pub async fn connect(url: &str) -> Result<Self, StateError> {
        info!("Connecting to SurrealDB");

        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        db.use_ns("tierline")
            .use_db("main")
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        let handle = SurrealHandle { db };
        handle.init_schema().await?;

        info!("SurrealDB connected and schema initialized");
        Ok(handle)
    }

    /// Connect to a remote instance with credentials
    #[instrument(skip(config), fields(endpoint = %config.endpoint, namespace = %config.namespace))]
    pub async fn connect_cloud(config: CloudConfig) -> Result<Self, StateError> {
        let db = surrealdb::engine::any::connect(&config.endpoint)
            .await
            .map_err(|e| {
                StateError::Connection(format!("Failed to connect to {}: {}", config.endpoint, e))
            })?;

        if config.is_root {
            db.signin(Root {
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| StateError::Connection(format!("Root authentication failed: {}", e)))?;
        } else {
            db.signin(Database {
                namespace: &config.namespace,
                database: &config.database,
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| {
                StateError::Connection(format!("Database authentication failed: {}", e))
            })?;
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(|e| {
                StateError::Connection(format!("Failed to select namespace/database: {}", e))
            })?;

        let handle = SurrealHandle { db };
        handle.init_schema().await?;
        Ok(handle)
    }

    /// Connect using credentials from the environment when present,
    /// otherwise to `url`.
    pub async fn connect_from_env(url: &str) -> Result<Self, StateError> {
        match CloudConfig::from_env() {
            Ok(config) => Self::connect_cloud(config).await,
            Err(_) => Self::connect(url).await,
        }
    }

    async fn init_schema(&self) -> Result<(), StateError> {
        debug!("Initializing Tierline schema");

        let schema = r#"
            DEFINE TABLE IF NOT EXISTS pipeline_runs SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS idx_runs_key ON pipeline_runs FIELDS key UNIQUE;
            DEFINE INDEX IF NOT EXISTS idx_runs_env ON pipeline_runs FIELDS environment;

            DEFINE TABLE IF NOT EXISTS releases SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS idx_releases_key ON releases FIELDS key UNIQUE;
            DEFINE INDEX IF NOT EXISTS idx_releases_env ON releases FIELDS environment, recorded_at;

            DEFINE TABLE IF NOT EXISTS release_outcomes SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS idx_outcomes_key ON release_outcomes FIELDS key, recorded_at;

            DEFINE TABLE IF NOT EXISTS rollbacks SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS idx_rollbacks_key ON rollbacks FIELDS key UNIQUE;

            DEFINE TABLE IF NOT EXISTS authz_decisions SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS idx_authz_env ON authz_decisions FIELDS environment;

            DEFINE TABLE IF NOT EXISTS environment_status SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS idx_status_env ON environment_status FIELDS environment UNIQUE;
        "#;

        self.db
            .query(schema)
            .await
            .and_then(|response| response.check())
            .map_err(|e| StateError::SchemaSetup(e.to_string()))?;

        debug!("Schema initialized successfully");
        Ok(())
    }

    // ========== Append-only entries ==========

    /// Append an entry; `unique` rejects a second entry with the same key.
    #[instrument(skip(self, body), fields(table = %table, key = %key))]
    pub(crate) async fn append_entry<T>(
        &self,
        table: &'static str,
        environment: &str,
        key: String,
        unique: bool,
        body: &T,
    ) -> StorageResult<()>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        if unique && !self.entries_by_key::<T>(table, &key).await?.is_empty() {
            return Err(StorageError::Conflict { kind: table, key });
        }

        let entry = DbEntry {
            environment: environment.to_string(),
            key,
            recorded_at: SurrealDatetime::from(Utc::now()),
            body: body.clone(),
        };

        let created: Option<DbEntry<T>> = self.db.create(table).content(entry).await?;
        created
            .map(|_| ())
            .ok_or_else(|| StorageError::Backend(format!("failed to create {} entry", table)))
    }

    /// Entries with the given key, newest first.
    pub(crate) async fn entries_by_key<T>(
        &self,
        table: &'static str,
        key: &str,
    ) -> StorageResult<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let mut result = self
            .db
            .query(format!(
                "SELECT * FROM {} WHERE key = $key ORDER BY recorded_at DESC",
                table
            ))
            .bind(("key", key.to_string()))
            .await?;

        let entries: Vec<DbEntry<T>> = result.take(0)?;
        Ok(entries.into_iter().map(|e| e.body).collect())
    }

    /// Entries oldest first, optionally restricted to one environment.
    pub(crate) async fn entries<T>(
        &self,
        table: &'static str,
        environment: Option<&str>,
    ) -> StorageResult<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let mut result = match environment {
            Some(env) => {
                self.db
                    .query(format!(
                        "SELECT * FROM {} WHERE environment = $env ORDER BY recorded_at ASC",
                        table
                    ))
                    .bind(("env", env.to_string()))
                    .await?
            }
            None => {
                self.db
                    .query(format!("SELECT * FROM {} ORDER BY recorded_at ASC", table))
                    .await?
            }
        };

        let entries: Vec<DbEntry<T>> = result.take(0)?;
        Ok(entries.into_iter().map(|e| e.body).collect())
    }

    // ========== Status snapshot ==========

    /// Replace the snapshot for `status.environment` unless the stored one is
    /// newer. Compare and write happen in one transaction on the
    /// environment's own record, so concurrent writers (in any process)
    /// cannot interleave and readers never observe a missing snapshot.
    #[instrument(skip(self, status), fields(environment = %status.environment, outcome = %status.outcome))]
    pub(crate) async fn replace_status(&self, status: &EnvironmentStatus) -> StorageResult<bool> {
        let row = StatusEntry {
            environment: status.environment.clone(),
            key: status.environment.clone(),
            recorded_at: SurrealDatetime::from(Utc::now()),
            stamp: status.timestamp.timestamp_micros(),
            body: status.clone(),
        };

        self.db
            .query(
                r#"
                BEGIN TRANSACTION;
                LET $stored = (SELECT VALUE stamp FROM type::thing('environment_status', $env));
                IF array::len($stored) = 0 OR $stored[0] <= $stamp {
                    UPSERT type::thing('environment_status', $env) CONTENT $row;
                };
                COMMIT TRANSACTION;
                "#,
            )
            .bind(("env", status.environment.clone()))
            .bind(("stamp", row.stamp))
            .bind(("row", row))
            .await?
            .check()?;

        let current: Vec<EnvironmentStatus> = self
            .entries(ENVIRONMENT_STATUS, Some(&status.environment))
            .await?;
        let written = current.first().is_some_and(|c| {
            c.triggering_run_id == status.triggering_run_id && c.timestamp == status.timestamp
        });
        if !written {
            debug!("Stored status is newer; keeping it");
        }
        Ok(written)
    }
}

/// Status row: one record per environment, keyed by the environment name.
/// `stamp` is the snapshot timestamp in microseconds for ordered comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatusEntry {
    environment: String,
    key: String,
    recorded_at: SurrealDatetime,
    stamp: i64,
    body: EnvironmentStatus,
}
