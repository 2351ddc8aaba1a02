//! Service configuration, loaded from the environment.
//!
//! Required values fail fast at startup; tunables carry defaults.

use std::env;

/// Runtime configuration for the sync service.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string. Required: `DATABASE_URL`.
    pub database_url: String,

    /// Listen host. `HOST`, default `0.0.0.0`.
    pub host: String,

    /// Listen port. `PORT`, default `8080`.
    pub port: u16,

    /// Log filter directive. `RUST_LOG`, default `info`.
    pub rust_log: String,

    /// Database pool size. `DATABASE_MAX_CONNECTIONS`, default `10`.
    pub database_max_connections: u32,

    /// Worker concurrency. `WORKER_CONCURRENCY`, default `4`.
    pub worker_concurrency: usize,

    /// Optional webhook URL for outbound alerts. `ALERT_WEBHOOK_URL`.
    pub alert_webhook_url: Option<String>,

    /// Maximum accepted request body size in bytes.
    /// `MAX_BODY_SIZE`, default 1 MiB.
    pub max_body_size: usize,
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, String> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set".to_string())?;

        let port = parse_env("PORT", 8080u16)?;
        let database_max_connections = parse_env("DATABASE_MAX_CONNECTIONS", 10u32)?;
        let worker_concurrency = parse_env("WORKER_CONCURRENCY", 4usize)?;
        let max_body_size = parse_env("MAX_BODY_SIZE", 1024 * 1024usize)?;

        Ok(Self {
            database_url,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port,
            rust_log: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            database_max_connections,
            worker_concurrency,
            alert_webhook_url: env::var("ALERT_WEBHOOK_URL").ok().filter(|url| !url.is_empty()),
            max_body_size,
        })
    }

    /// The socket address to bind.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, String> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| format!("{name} has an invalid value: {raw}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_addr() {
        let config = Config {
            database_url: "postgres://localhost/mercato".to_string(),
            host: "127.0.0.1".to_string(),
            port: 9000,
            rust_log: "info".to_string(),
            database_max_connections: 10,
            worker_concurrency: 4,
            alert_webhook_url: None,
            max_body_size: 1024 * 1024,
        };
        assert_eq!(config.bind_addr(), "127.0.0.1:9000");
    }
}
