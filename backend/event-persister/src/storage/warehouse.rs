use async_trait::async_trait;
use clickhouse::{Client, Row};
use serde::Serialize;
use std::marker::PhantomData;
use tracing::{debug, error};

use crate::error::{PersisterError, Result};

/// Append-only batch sink for one row type
#[async_trait]
pub trait WarehouseWriter<R>: Send + Sync
where
    R: Send + Sync,
{
    async fn append_rows(&self, rows: &[R]) -> Result<()>;
}

/// Writes rows into one ClickHouse table
pub struct ClickHouseWriter<R> {
    client: Client,
    table: String,
    _row: PhantomData<fn() -> R>,
}

impl<R> ClickHouseWriter<R> {
    pub fn new(client: Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
            _row: PhantomData,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

#[async_trait]
impl<R> WarehouseWriter<R> for ClickHouseWriter<R>
where
    R: Row + Serialize + Send + Sync + 'static,
{
    async fn append_rows(&self, rows: &[R]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut insert = self.client.insert::<R>(&self.table).map_err(|e| {
            error!("ClickHouse insert preparation error: {}", e);
            PersisterError::Warehouse(e.to_string())
        })?;

        for row in rows {
            insert.write(row).await.map_err(|e| {
                error!("ClickHouse row write error: {}", e);
                PersisterError::Warehouse(e.to_string())
            })?;
        }

        insert.end().await?;

        debug!(table = %self.table, rows = rows.len(), "Appended rows");
        Ok(())
    }
}
