//! PostgreSQL connection pool.
//!
//! Connection parameters come from the standard `PG*` environment
//! variables, with CLI flags taking precedence. The pool is shared across
//! the worker tasks; each worker borrows a connection for the duration of
//! its insert batches.

use anyhow::{bail, Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};

/// Database connection configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub pool_size: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "cadastre".to_string(),
            user: "postgres".to_string(),
            password: None,
            ssl_mode: "disable".to_string(),
            pool_size: 16,
        }
    }
}

impl DbConfig {
    /// Reads `PGHOST`, `PGPORT`, `PGDATABASE`, `PGUSER`, `PGPASSWORD` and
    /// `PGSSLMODE`, falling back to the defaults above.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("PGHOST").unwrap_or(defaults.host),
            port: std::env::var("PGPORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            dbname: std::env::var("PGDATABASE").unwrap_or(defaults.dbname),
            user: std::env::var("PGUSER").unwrap_or(defaults.user),
            password: std::env::var("PGPASSWORD").ok(),
            ssl_mode: std::env::var("PGSSLMODE").unwrap_or(defaults.ssl_mode),
            pool_size: defaults.pool_size,
        }
    }

    /// Applies CLI overrides on top of the environment values.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_overrides(
        &mut self,
        host: Option<String>,
        port: Option<u16>,
        database: Option<String>,
        user: Option<String>,
        password: Option<String>,
        ssl: Option<String>,
    ) {
        if let Some(host) = host {
            self.host = host;
        }
        if let Some(port) = port {
            self.port = port;
        }
        if let Some(database) = database {
            self.dbname = database;
        }
        if let Some(user) = user {
            self.user = user;
        }
        if let Some(password) = password {
            self.password = Some(password);
        }
        if let Some(ssl) = ssl {
            self.ssl_mode = ssl;
        }
    }

    fn ssl_mode(&self) -> Result<PgSslMode> {
        Ok(match self.ssl_mode.to_ascii_lowercase().as_str() {
            "disable" => PgSslMode::Disable,
            "allow" => PgSslMode::Allow,
            "prefer" => PgSslMode::Prefer,
            "require" => PgSslMode::Require,
            "verify-ca" => PgSslMode::VerifyCa,
            "verify-full" => PgSslMode::VerifyFull,
            other => bail!("unknown ssl mode '{}'", other),
        })
    }
}

/// Opens the connection pool and verifies the server is reachable.
pub async fn connect(config: &DbConfig) -> Result<PgPool> {
    let mut options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .database(&config.dbname)
        .username(&config.user)
        .ssl_mode(config.ssl_mode()?);
    if let Some(password) = &config.password {
        options = options.password(password);
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size)
        .connect_with(options)
        .await
        .with_context(|| {
            format!(
                "cannot connect to {}@{}:{}/{}",
                config.user, config.host, config.port, config.dbname
            )
        })?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .context("connection test failed")?;

    Ok(pool)
}
