use super::{OutboxRecord, OutboxStore};
use crate::config::OutboxConfig;
use crate::message::{Envelope, Message};
use crate::{Error, Result};
use async_trait::async_trait;
use tokio_postgres::{Client, GenericClient, NoTls, Row};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

/// Outbox table in PostgreSQL.
///
/// ```sql
/// CREATE TABLE outbox (
///     id            UUID PRIMARY KEY,
///     topic         TEXT NOT NULL,
///     type          TEXT NOT NULL,
///     trace_context TEXT,
///     message       TEXT NOT NULL,
///     occurred_at   TIMESTAMPTZ NOT NULL,
///     created_at    TIMESTAMPTZ NOT NULL
/// );
/// ```
pub struct PostgresOutbox {
    client: Client,
    connection_task: tokio::task::JoinHandle<()>,
    table: String,
}

impl PostgresOutbox {
    /// Connects using `config.postgres` and spawns the connection driver.
    pub async fn connect(config: &OutboxConfig) -> Result<Self> {
        let postgres = config
            .postgres
            .as_ref()
            .ok_or_else(|| Error::Config("outbox.postgres is not configured".to_string()))?;

        info!(
            host = %postgres.host,
            port = postgres.port,
            database = %postgres.database,
            "Connecting outbox store to PostgreSQL"
        );
        let (client, connection) = tokio_postgres::connect(&postgres.postgres_url(), NoTls).await?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Outbox connection error: {}", e);
            }
        });

        Ok(Self {
            client,
            connection_task,
            table: config.table.clone(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Creates the table and its `created_at` index if missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        let statement = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id UUID PRIMARY KEY,
                topic TEXT NOT NULL,
                type TEXT NOT NULL,
                trace_context TEXT,
                message TEXT NOT NULL,
                occurred_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {table}_created_at_idx ON {table} (created_at);",
            table = self.table
        );
        self.client.batch_execute(&statement).await?;
        info!("Outbox table '{}' is ready", self.table);
        Ok(())
    }

    /// Stages `envelope` for `topic` through `client`.
    ///
    /// Pass the caller's open [`tokio_postgres::Transaction`] so the insert
    /// commits or rolls back together with the business write.
    pub async fn add<C, T>(&self, client: &C, topic: &str, envelope: &Envelope<T>) -> Result<OutboxRecord>
    where
        C: GenericClient + Sync,
        T: Message,
    {
        let record = OutboxRecord::from_envelope(topic, envelope)?;
        let statement = format!(
            "INSERT INTO {} (id, topic, type, trace_context, message, occurred_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            self.table
        );

        client
            .execute(
                statement.as_str(),
                &[
                    &record.id,
                    &record.topic,
                    &record.message_type,
                    &record.trace_context,
                    &record.message,
                    &record.occurred_at,
                    &record.created_at,
                ],
            )
            .await?;

        debug!(message_id = %record.id, topic = %record.topic, "Staged message in outbox");
        Ok(record)
    }

    pub async fn close(self) {
        drop(self.client);
        let _ = self.connection_task.await;
    }
}

fn record_from_row(row: &Row) -> Result<OutboxRecord> {
    Ok(OutboxRecord {
        id: row.try_get("id")?,
        topic: row.try_get("topic")?,
        message_type: row.try_get("type")?,
        trace_context: row.try_get("trace_context")?,
        message: row.try_get("message")?,
        occurred_at: row.try_get("occurred_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl OutboxStore for PostgresOutbox {
    #[instrument(skip(self))]
    async fn list_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let statement = format!(
            "SELECT id, topic, type, trace_context, message, occurred_at, created_at \
             FROM {} ORDER BY created_at ASC LIMIT $1",
            self.table
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = self.client.query(statement.as_str(), &[&limit]).await?;
        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn delete_by_ids(&self, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let statement = format!("DELETE FROM {} WHERE id = ANY($1)", self.table);
        let ids = ids.to_vec();
        let deleted = self.client.execute(statement.as_str(), &[&ids]).await?;
        Ok(deleted)
    }
}
