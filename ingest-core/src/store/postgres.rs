use async_trait::async_trait;
use sqlx::{
    PgPool, Postgres,
    postgres::{PgArguments, PgPoolOptions},
    query::Query,
};
use std::time::Duration;
use tracing::debug;

use crate::{
    config::RunConfig,
    error::{IngestError, Result},
    model::WeatherSnapshot,
};

use super::{SnapshotStore, SqlValue, bind_values, create_table_sql, insert_sql};

/// PostgreSQL-backed snapshot store.
///
/// The pool is lazy and capped at one connection: nothing is opened until the first
/// statement, and [`SnapshotStore::close`] releases it before the run ends.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgStore {
    /// Fails with a configuration error if the URL is blank or unparseable.
    pub fn connect_lazy(database_url: &str, timeout: Duration) -> Result<Self> {
        if database_url.trim().is_empty() {
            return Err(IngestError::Config("database URL must not be empty".into()));
        }

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(timeout)
            .connect_lazy(database_url)
            .map_err(|e| IngestError::Config(format!("invalid database URL: {e}")))?;

        Ok(Self { pool, timeout })
    }

    pub fn from_config(config: &RunConfig) -> Result<Self> {
        Self::connect_lazy(&config.database_url, config.db_timeout)
    }

    async fn insert(&self, snapshot: &WeatherSnapshot) -> Result<()> {
        let sql = insert_sql();
        let mut tx = self.pool.begin().await.map_err(classify_write_error)?;

        let query = bind_values(snapshot)
            .into_iter()
            .fold(sqlx::query(&sql), |query, (_, value)| bind(query, value));

        match query.execute(&mut *tx).await {
            Ok(done) => {
                debug!(rows = done.rows_affected(), "insert executed");
                tx.commit().await.map_err(classify_write_error)
            }
            Err(e) => {
                // a failed rollback means the connection is gone, which discards the tx anyway
                let _ = tx.rollback().await;
                Err(classify_write_error(e))
            }
        }
    }
}

#[async_trait]
impl SnapshotStore for PgStore {
    async fn ensure_schema(&self) -> Result<()> {
        let ddl = create_table_sql();

        match tokio::time::timeout(self.timeout, sqlx::query(&ddl).execute(&self.pool)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(IngestError::Schema(e.to_string())),
            Err(_) => Err(IngestError::Schema(format!(
                "timed out after {:?} creating table",
                self.timeout
            ))),
        }
    }

    async fn persist(&self, snapshot: &WeatherSnapshot) -> Result<()> {
        // Dropping the in-flight transaction on timeout rolls it back.
        tokio::time::timeout(self.timeout, self.insert(snapshot))
            .await
            .unwrap_or_else(|_| {
                Err(IngestError::transient_write(format!(
                    "insert timed out after {:?}",
                    self.timeout
                )))
            })
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn bind<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: SqlValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        SqlValue::Text(v) => query.bind(v),
        SqlValue::Float(v) => query.bind(v),
        SqlValue::Integer(v) => query.bind(v),
        SqlValue::Boolean(v) => query.bind(v),
        SqlValue::Timestamp(v) => query.bind(v),
        SqlValue::Time(v) => query.bind(v),
    }
}

/// Connection-level failures are transient; statement-level failures are not.
pub(crate) fn classify_write_error(err: sqlx::Error) -> IngestError {
    let transient = match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|code| is_transient_sqlstate(&code)),
        _ => false,
    };

    if transient {
        IngestError::transient_write(err.to_string())
    } else {
        IngestError::fatal_write(err.to_string())
    }
}

/// SQLSTATE classes that describe the connection or server, not the statement.
fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08") // connection exception
        || code.starts_with("53") // insufficient resources
        || code.starts_with("57") // operator intervention, admin shutdown
        || code == "40001" // serialization failure
        || code == "40P01" // deadlock detected
}
