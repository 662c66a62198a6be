use async_trait::async_trait;
use clickhouse::{Client, Row};
use serde::Serialize;
use tracing::debug;

use crate::{
    config::WarehouseConfig,
    error::WarehouseError,
    warehouse::{WarehouseClient, rows::TableRows},
};

/// Production warehouse client over ClickHouse's native batch protocol.
pub struct ClickHouseWarehouse {
    client: Client,
}

impl ClickHouseWarehouse {
    pub fn new(config: &WarehouseConfig) -> Self {
        let client = Client::default()
            .with_url(config.url())
            .with_user(&config.user)
            .with_password(&config.password)
            .with_database(&config.database);
        Self { client }
    }

    async fn insert_rows<T: Serialize>(
        &self,
        table: &str,
        rows: &[T],
    ) -> Result<u64, WarehouseError>
    where
        for<'a> T: Row<Value<'a> = T>,
    {
        let mut insert = self.client.insert::<T>(table).await.map_err(|e| map_err(table, e))?;
        for row in rows {
            insert.write(row).await.map_err(|e| map_err(table, e))?;
        }
        insert.end().await.map_err(|e| map_err(table, e))?;
        debug!(table, rows = rows.len(), "chunk inserted");
        Ok(rows.len() as u64)
    }
}

#[async_trait]
impl WarehouseClient for ClickHouseWarehouse {
    async fn execute(&self, statement: &str) -> Result<(), WarehouseError> {
        self.client
            .query(statement)
            .execute()
            .await
            .map_err(|e| map_err("ddl", e))
    }

    async fn insert(&self, table: &str, rows: &TableRows) -> Result<u64, WarehouseError> {
        match rows {
            TableRows::Ohlc(rows) => self.insert_rows(table, rows).await,
            TableRows::CorporateActions(rows) => self.insert_rows(table, rows).await,
            TableRows::IndexConstituents(rows) => self.insert_rows(table, rows).await,
            TableRows::TradingCalendar(rows) => self.insert_rows(table, rows).await,
            TableRows::SymbolMaster(rows) => self.insert_rows(table, rows).await,
            TableRows::Deals(rows) => self.insert_rows(table, rows).await,
            TableRows::Financials(rows) => self.insert_rows(table, rows).await,
            TableRows::Shareholding(rows) => self.insert_rows(table, rows).await,
            TableRows::MacroIndicators(rows) => self.insert_rows(table, rows).await,
        }
    }

    async fn count(&self, table: &str, predicate: &str) -> Result<u64, WarehouseError> {
        self.client
            .query(&format!("SELECT count() FROM {table} WHERE {predicate}"))
            .fetch_one::<u64>()
            .await
            .map_err(|e| map_err(table, e))
    }
}

/// Connection-level failures are retryable at the task layer; everything
/// else is an insert failure.
fn map_err(table: &str, e: clickhouse::error::Error) -> WarehouseError {
    use clickhouse::error::Error;
    match e {
        Error::Network(_) | Error::TimedOut => WarehouseError::Connection(e.to_string()),
        other => WarehouseError::Insert {
            table: table.to_string(),
            msg: other.to_string(),
        },
    }
}
