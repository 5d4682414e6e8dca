use std::path::Path;

use anyhow::Result;
use tokio_rusqlite::{
    Connection, rusqlite,
    rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef},
};
use uuid::Uuid;

use crate::core::{JpkType, TransferState};

pub mod artifacts;
pub mod documents;
pub mod transfers;

pub async fn init(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).await?;
    migrate(&conn).await?;
    Ok(conn)
}

pub async fn init_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().await?;
    migrate(&conn).await?;
    Ok(conn)
}

async fn migrate(conn: &Connection) -> Result<()> {
    conn.call(|conn| {
        // Enable foreign keys (SQLite disables them by default!)
        conn.execute("PRAGMA foreign_keys = ON;", [])?;

        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;

        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

pub(crate) fn new_id() -> String {
    Uuid::now_v7().to_string()
}

pub(crate) fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl ToSql for TransferState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TransferState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        s.parse::<TransferState>()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for JpkType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for JpkType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        s.parse::<JpkType>()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}
