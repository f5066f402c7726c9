//! PostGIS sink: DDL synthesis, batched inserts, incremental journal.
//!
//! # DDL
//!
//! Before any archive is processed the sink synthesizes the target schema
//! from the table configuration: one `CREATE TABLE` per configured table
//! (optional `gid BIGSERIAL`, optional `geomhash BYTEA`, a typed geometry
//! column, the declared constraints) plus a GiST index on every geometry
//! column. `--drop-schema` / `--drop-table` run up front; the deferred
//! foreign-key statements (`pgFkCONSTRAINT`, with `$schema$` substituted)
//! run strictly after all archives complete.
//!
//! # Inserts
//!
//! Rows go in as batched multi-row `INSERT … ON CONFLICT DO NOTHING`, so
//! re-ingesting an unchanged sheet is a no-op wherever the table declares
//! a unique or primary key. Geometry values travel as EWKT through
//! `ST_GeomFromEWKT`. A batch that fails on a lost connection is retried
//! once after a short backoff; a second failure is fatal for the archive.
//!
//! # Journal
//!
//! `ingest_journal` maps archive basename → content checksum. The
//! orchestrator consults it before decompressing anything and records new
//! checksums after successful loads; workers never write it directly.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPool;
use tracing::{debug, warn};

use crate::config::{Config, TableConfig};
use crate::transform::{insert_columns, pgtype_family, PgFamily, SqlValue};

/// Rows per INSERT statement. Kept well under the 65535 bind-parameter
/// limit even for wide tables.
const BATCH_ROWS: usize = 500;

/// The shared PostGIS writer.
pub struct Sink {
    pool: PgPool,
    schema: String,
}

impl Sink {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the schema, every configured table, the geometry indexes
    /// and the incremental journal. Idempotent unless the drop flags ask
    /// otherwise.
    pub async fn prepare(
        &self,
        config: &Config,
        target_epsg: u32,
        drop_schema: bool,
        drop_table: bool,
    ) -> Result<()> {
        if drop_schema {
            self.execute(&format!(
                "DROP SCHEMA IF EXISTS {} CASCADE",
                quote_ident(&self.schema)
            ))
            .await?;
        }
        self.execute(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(&self.schema)
        ))
        .await?;

        for (_, table) in config.ordered_tables() {
            if drop_table {
                self.execute(&format!(
                    "DROP TABLE IF EXISTS {}.{} CASCADE",
                    quote_ident(&self.schema),
                    quote_ident(&table.table)
                ))
                .await?;
            }
            self.execute(&create_table_sql(&self.schema, table, target_epsg))
                .await?;
            if let Some(index) = create_gist_index_sql(&self.schema, table) {
                self.execute(&index).await?;
            }
        }

        self.execute(&format!(
            "CREATE TABLE IF NOT EXISTS {}.ingest_journal (\
             archive TEXT PRIMARY KEY, \
             checksum TEXT NOT NULL, \
             ingested_at TIMESTAMPTZ NOT NULL DEFAULT now())",
            quote_ident(&self.schema)
        ))
        .await?;

        Ok(())
    }

    /// Inserts rows into one table, in batches, with conflict suppression.
    /// Returns the number of rows actually inserted.
    pub async fn insert_rows(
        &self,
        table: &TableConfig,
        rows: &[Vec<SqlValue>],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let columns = insert_columns(table);
        let families = bind_families(table);
        let mut inserted = 0u64;

        for batch in rows.chunks(BATCH_ROWS) {
            let sql = insert_sql(&self.schema, &table.table, &columns, table, batch.len());
            inserted += self
                .run_batch(&sql, batch, &families)
                .await
                .with_context(|| {
                    format!("insert into {}.{} failed", self.schema, table.table)
                })?;
        }

        Ok(inserted)
    }

    async fn run_batch(
        &self,
        sql: &str,
        batch: &[Vec<SqlValue>],
        families: &[BindFamily],
    ) -> Result<u64> {
        let mut attempt = 0u32;
        loop {
            let mut query = sqlx::query(sql);
            for row in batch {
                for (value, family) in row.iter().zip(families) {
                    query = bind_value(query, value, *family);
                }
            }

            match query.execute(&self.pool).await {
                Ok(result) => return Ok(result.rows_affected()),
                Err(e) if attempt == 0 && is_connection_error(&e) => {
                    warn!("connection lost during insert, retrying once: {}", e);
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Runs the deferred foreign-key DDL of every table. Constraints that
    /// already exist (from an earlier run) are tolerated.
    pub async fn apply_deferred_constraints(&self, config: &Config) -> Result<()> {
        for (_, table) in config.ordered_tables() {
            for statement in &table.fk_constraints {
                let sql = statement.replace("$schema$", &quote_ident(&self.schema));
                if let Err(e) = sqlx::query(&sql).execute(&self.pool).await {
                    let message = e.to_string();
                    if message.contains("already exists") {
                        debug!(table = table.table.as_str(), "constraint already exists");
                    } else {
                        return Err(anyhow::Error::new(e)
                            .context(format!("deferred constraint failed: {}", sql)));
                    }
                }
            }
        }
        Ok(())
    }

    /// Looks up the journalled checksum of an archive.
    pub async fn journal_checksum(&self, archive: &str) -> Result<Option<String>> {
        let sql = format!(
            "SELECT checksum FROM {}.ingest_journal WHERE archive = $1",
            quote_ident(&self.schema)
        );
        Ok(sqlx::query_scalar(&sql)
            .bind(archive)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Records (or refreshes) an archive's checksum after a successful load.
    pub async fn record_checksum(&self, archive: &str, checksum: &str) -> Result<()> {
        let sql = format!(
            "INSERT INTO {}.ingest_journal (archive, checksum) VALUES ($1, $2) \
             ON CONFLICT (archive) DO UPDATE SET \
             checksum = excluded.checksum, ingested_at = now()",
            quote_ident(&self.schema)
        );
        sqlx::query(&sql)
            .bind(archive)
            .bind(checksum)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        sqlx::query(sql)
            .execute(&self.pool)
            .await
            .with_context(|| format!("DDL failed: {}", sql))?;
        Ok(())
    }
}

fn is_connection_error(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}

/// Whether an archive-level failure was ultimately a lost connection, in
/// which case the orchestrator stops dispatching new archives.
pub fn is_connection_failure(error: &anyhow::Error) -> bool {
    error
        .chain()
        .any(|cause| match cause.downcast_ref::<sqlx::Error>() {
            Some(e) => is_connection_error(e),
            None => false,
        })
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Builds the `CREATE TABLE` statement of one configured table.
pub fn create_table_sql(schema: &str, table: &TableConfig, target_epsg: u32) -> String {
    let mut columns: Vec<String> = Vec::new();

    if table.insert_gid {
        let gid_is_key = !table
            .constraints
            .iter()
            .any(|c| c.to_ascii_uppercase().contains("PRIMARY KEY"));
        columns.push(if gid_is_key {
            "gid BIGSERIAL PRIMARY KEY".to_string()
        } else {
            "gid BIGSERIAL".to_string()
        });
    }

    for field in &table.fields {
        let mut column = format!("{} {}", quote_ident(&field.db), field.pgtype);
        if field.not_null {
            column.push_str(" NOT NULL");
        }
        columns.push(column);
    }

    if table.hash_geom {
        columns.push("geomhash BYTEA".to_string());
    }
    if let Some(geometry) = table.geometry_column() {
        columns.push(format!(
            "{} geometry(Geometry, {})",
            quote_ident(geometry),
            target_epsg
        ));
    }

    for constraint in &table.constraints {
        columns.push(constraint.clone());
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {}.{} ({})",
        quote_ident(schema),
        quote_ident(&table.table),
        columns.join(", ")
    )
}

/// Builds the GiST index statement for a table's geometry column.
pub fn create_gist_index_sql(schema: &str, table: &TableConfig) -> Option<String> {
    let geometry = table.geometry_column()?;
    Some(format!(
        "CREATE INDEX IF NOT EXISTS {} ON {}.{} USING GIST ({})",
        quote_ident(&format!("idx_{}_{}", table.table, geometry)),
        quote_ident(schema),
        quote_ident(&table.table),
        quote_ident(geometry)
    ))
}

/// Builds one multi-row INSERT with `ON CONFLICT DO NOTHING`. Geometry
/// parameters are wrapped in `ST_GeomFromEWKT`.
pub fn insert_sql(
    schema: &str,
    table_name: &str,
    columns: &[String],
    table: &TableConfig,
    row_count: usize,
) -> String {
    let geometry_column = table.geometry_column();
    let column_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();

    let mut placeholder = 0usize;
    let mut tuples: Vec<String> = Vec::with_capacity(row_count);
    for _ in 0..row_count {
        let values: Vec<String> = columns
            .iter()
            .map(|column| {
                placeholder += 1;
                if Some(column.as_str()) == geometry_column {
                    format!("ST_GeomFromEWKT(${})", placeholder)
                } else {
                    format!("${}", placeholder)
                }
            })
            .collect();
        tuples.push(format!("({})", values.join(", ")));
    }

    format!(
        "INSERT INTO {}.{} ({}) VALUES {} ON CONFLICT DO NOTHING",
        quote_ident(schema),
        quote_ident(table_name),
        column_list.join(", "),
        tuples.join(", ")
    )
}

/// NULL parameters must carry the column's type or Postgres rejects the
/// prepared statement, so each insert column gets a bind family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindFamily {
    Text,
    Int,
    Float,
    Date,
    Bytes,
}

fn bind_families(table: &TableConfig) -> Vec<BindFamily> {
    let mut families: Vec<BindFamily> = table
        .fields
        .iter()
        .map(|field| match pgtype_family(&field.pgtype) {
            PgFamily::Text => BindFamily::Text,
            PgFamily::Int => BindFamily::Int,
            PgFamily::Float => BindFamily::Float,
            PgFamily::Date => BindFamily::Date,
        })
        .collect();
    if table.hash_geom {
        families.push(BindFamily::Bytes);
    }
    if table.geometry_column().is_some() {
        // EWKT text, consumed by ST_GeomFromEWKT.
        families.push(BindFamily::Text);
    }
    families
}

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

fn bind_value<'q>(query: PgQuery<'q>, value: &'q SqlValue, family: BindFamily) -> PgQuery<'q> {
    match value {
        SqlValue::Null => match family {
            BindFamily::Text => query.bind(None::<String>),
            BindFamily::Int => query.bind(None::<i64>),
            BindFamily::Float => query.bind(None::<f64>),
            BindFamily::Date => query.bind(None::<chrono::NaiveDate>),
            BindFamily::Bytes => query.bind(None::<Vec<u8>>),
        },
        SqlValue::Text(v) => query.bind(v.as_str()),
        SqlValue::Int(v) => query.bind(v),
        SqlValue::Float(v) => query.bind(v),
        SqlValue::Date(v) => query.bind(v),
        SqlValue::Bytes(v) => query.bind(v.as_slice()),
        SqlValue::Geometry(v) => query.bind(v.as_str()),
    }
}

/// Per-table insert accounting for the end-of-run summary.
#[derive(Debug, Default, Clone)]
pub struct InsertStats {
    pub rows_by_table: HashMap<String, u64>,
}

impl InsertStats {
    pub fn add(&mut self, table: &str, rows: u64) {
        *self.rows_by_table.entry(table.to_string()).or_default() += rows;
    }

    pub fn merge(&mut self, other: &InsertStats) {
        for (table, rows) in &other.rows_by_table {
            *self.rows_by_table.entry(table.clone()).or_default() += rows;
        }
    }

    pub fn total(&self) -> u64 {
        self.rows_by_table.values().sum()
    }
}
