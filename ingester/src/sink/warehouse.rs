use super::TableLoader;
use crate::transform::CSV_COLUMNS;
use async_trait::async_trait;
use bytes::Bytes;
use listings_core::config::is_valid_identifier;
use listings_core::{Error, Result};
use sqlx::{Connection, PgPool};
use tracing::{debug, instrument};

/// Appends CSV batches to Postgres tables with `COPY`.
pub struct PostgresLoader {
    pool: PgPool,
}

impl PostgresLoader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

pub(crate) fn copy_statement(table: &str) -> Result<String> {
    if !is_valid_identifier(table) {
        return Err(Error::Validation(format!("invalid table name '{table}'")));
    }
    Ok(format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT csv, HEADER true)",
        table,
        CSV_COLUMNS.join(", ")
    ))
}

#[async_trait]
impl TableLoader for PostgresLoader {
    #[instrument(skip(self, csv), fields(bytes = csv.len()))]
    async fn load_csv(&self, table: &str, csv: Bytes) -> Result<u64> {
        let statement = copy_statement(table)?;

        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;

        let mut copy_in = tx.copy_in_raw(&statement).await?;
        let sent = copy_in.send(csv).await.map(|_| ());
        if let Err(e) = sent {
            let _ = copy_in.abort(e.to_string()).await;
            return Err(Error::Sink {
                destination: table.to_string(),
                details: format!("COPY failed: {e}"),
            });
        }
        let rows = copy_in.finish().await?;

        tx.commit().await?;

        debug!(table, rows, "Appended rows");
        Ok(rows)
    }
}
