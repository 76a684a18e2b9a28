use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub max_connections: u32,
    pub busy_timeout: Duration,
    pub max_upload_bytes: Option<u64>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Deduplicating, reference-counted file store")]
pub struct Args {
    /// Host to bind to (overrides DEDUP_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides DEDUP_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where blobs are stored (overrides DEDUP_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides DEDUP_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Catalog connection pool size (overrides DEDUP_STORE_MAX_CONNECTIONS)
    #[arg(long)]
    pub max_connections: Option<u32>,

    /// Seconds to wait on a locked catalog (overrides DEDUP_STORE_BUSY_TIMEOUT_SECS)
    #[arg(long)]
    pub busy_timeout_secs: Option<u64>,

    /// Largest accepted upload in bytes (overrides DEDUP_STORE_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    /// CLI values win; the environment fills the gaps; defaults fill the rest.
    pub fn merge(args: Args) -> Result<Self> {
        let env_host = env::var("DEDUP_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("DEDUP_STORE_PORT")?.unwrap_or(3000);
        let env_storage =
            env::var("DEDUP_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/blobs".into());
        let env_db = env::var("DEDUP_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/dedup_store.db".into());
        let env_max_connections = env_parse("DEDUP_STORE_MAX_CONNECTIONS")?.unwrap_or(5);
        let env_busy_timeout = env_parse("DEDUP_STORE_BUSY_TIMEOUT_SECS")?.unwrap_or(10);
        let env_max_upload = env_parse("DEDUP_STORE_MAX_UPLOAD_BYTES")?;

        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            max_connections: args.max_connections.unwrap_or(env_max_connections),
            busy_timeout: Duration::from_secs(args.busy_timeout_secs.unwrap_or(env_busy_timeout)),
            max_upload_bytes: args.max_upload_bytes.or(env_max_upload),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_values_take_precedence() {
        let cfg = AppConfig::merge(Args {
            host: Some("127.0.0.1".into()),
            port: Some(8081),
            storage_dir: Some("/tmp/blobs".into()),
            database_url: Some("sqlite://:memory:".into()),
            max_connections: Some(2),
            busy_timeout_secs: Some(1),
            max_upload_bytes: Some(1024),
            migrate: false,
        })
        .unwrap();
        assert_eq!(cfg.addr(), "127.0.0.1:8081");
        assert_eq!(cfg.storage_dir, "/tmp/blobs");
        assert_eq!(cfg.max_connections, 2);
        assert_eq!(cfg.busy_timeout, Duration::from_secs(1));
        assert_eq!(cfg.max_upload_bytes, Some(1024));
    }
}
