use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;

/// Process configuration loaded from environment variables.
///
/// Site settings (thresholds, contacts, the admin PIN) live in the persisted
/// config blob, not here.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `8080`).
    pub port: u16,
    /// Directory holding the config and heartbeat blobs (default: `./data`).
    pub data_dir: PathBuf,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// How often the peer liveness check runs (default: `3600`).
    pub liveness_check_interval_secs: u64,
    /// How often overdue tanks are swept into failure (default: `300`).
    pub overdue_sweep_interval_secs: u64,
    /// Restrict admin routes to loopback and private peers (default: `true`).
    pub admin_local_only: bool,
    /// Admin PIN written on first boot only.
    pub bootstrap_pin: Option<String>,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                        | Default    |
    /// |--------------------------------|------------|
    /// | `HOST`                         | `0.0.0.0`  |
    /// | `PORT`                         | `8080`     |
    /// | `DATA_DIR`                     | `./data`   |
    /// | `REQUEST_TIMEOUT_SECS`         | `30`       |
    /// | `LIVENESS_CHECK_INTERVAL_SECS` | `3600`     |
    /// | `OVERDUE_SWEEP_INTERVAL_SECS`  | `300`      |
    /// | `ADMIN_LOCAL_ONLY`             | `true`     |
    /// | `BOOTSTRAP_PIN`                | unset      |
    pub fn from_env() -> anyhow::Result<Self> {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port = parse_var("PORT", 8080u16)?;
        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        let request_timeout_secs = parse_var("REQUEST_TIMEOUT_SECS", 30u64)?;
        let liveness_check_interval_secs = parse_var("LIVENESS_CHECK_INTERVAL_SECS", 3600u64)?;
        let overdue_sweep_interval_secs = parse_var("OVERDUE_SWEEP_INTERVAL_SECS", 300u64)?;
        let admin_local_only = parse_var("ADMIN_LOCAL_ONLY", true)?;
        let bootstrap_pin = std::env::var("BOOTSTRAP_PIN")
            .ok()
            .filter(|pin| !pin.is_empty());

        for (name, value) in [
            ("REQUEST_TIMEOUT_SECS", request_timeout_secs),
            ("LIVENESS_CHECK_INTERVAL_SECS", liveness_check_interval_secs),
            ("OVERDUE_SWEEP_INTERVAL_SECS", overdue_sweep_interval_secs),
        ] {
            anyhow::ensure!(value > 0, "{name} must be greater than zero");
        }

        Ok(Self {
            host,
            port,
            data_dir,
            request_timeout_secs,
            liveness_check_interval_secs,
            overdue_sweep_interval_secs,
            admin_local_only,
            bootstrap_pin,
        })
    }
}

fn parse_var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} has an invalid value: {raw:?}")),
        Err(_) => Ok(default),
    }
}
