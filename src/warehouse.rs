pub mod client;
pub mod ddl;
pub mod loader;
pub mod markers;
pub mod rows;

use async_trait::async_trait;

use crate::{error::WarehouseError, warehouse::rows::TableRows};

/// Capability seam over the analytical warehouse. The production
/// implementation speaks ClickHouse's native batch protocol; tests
/// substitute an in-memory fake.
#[async_trait]
pub trait WarehouseClient: Send + Sync {
    /// Runs one DDL statement.
    async fn execute(&self, statement: &str) -> Result<(), WarehouseError>;

    /// Inserts one chunk of typed rows; returns the row count written.
    async fn insert(&self, table: &str, rows: &TableRows) -> Result<u64, WarehouseError>;

    /// `SELECT count()` under a predicate, for load verification.
    async fn count(&self, table: &str, predicate: &str) -> Result<u64, WarehouseError>;
}

/// Creates every warehouse table. Idempotent: all DDL is
/// `CREATE TABLE IF NOT EXISTS`.
pub async fn ensure_tables(client: &dyn WarehouseClient) -> Result<(), WarehouseError> {
    for statement in ddl::all_tables() {
        client.execute(&statement).await?;
    }
    Ok(())
}
