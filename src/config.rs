//! Runtime configuration, read from the environment (and `.env`) at startup.

use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};

use crate::services::cancel::DEFAULT_GRACE;

#[derive(Clone, Debug)]
pub struct Config {
    /// HTTP control surface address
    pub listen_addr: SocketAddr,
    /// Encoder executable, bypassing discovery
    pub encoder_path: Option<PathBuf>,
    /// Encoder name to discover, without platform suffix
    pub encoder_name: String,
    /// Delay between interrupt and forced kill on cancel
    pub kill_grace: Duration,
    /// Capacity of the event broadcast channel
    pub event_buffer: usize,
    pub log_level: tracing::Level,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            encoder_path: None,
            encoder_name: "ffmpeg".to_string(),
            kill_grace: DEFAULT_GRACE,
            event_buffer: 1024,
            log_level: tracing::Level::DEBUG,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            listen_addr: parse_or(get("LISTEN_ADDR"), "LISTEN_ADDR", defaults.listen_addr)?,
            encoder_path: get("ENCODER_PATH").map(PathBuf::from),
            encoder_name: get("ENCODER_NAME").unwrap_or(defaults.encoder_name),
            kill_grace: Duration::from_millis(parse_or(
                get("KILL_GRACE_MS"),
                "KILL_GRACE_MS",
                defaults.kill_grace.as_millis() as u64,
            )?),
            event_buffer: parse_or(get("EVENT_BUFFER"), "EVENT_BUFFER", defaults.event_buffer)?,
            log_level: parse_or(get("LOG_LEVEL"), "LOG_LEVEL", defaults.log_level)?,
        })
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(v) => v
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: '{}'", key, v)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.listen_addr.port(), 3000);
        assert_eq!(config.encoder_name, "ffmpeg");
        assert_eq!(config.kill_grace, DEFAULT_GRACE);
        assert!(config.encoder_path.is_none());
    }

    #[test]
    fn reads_overrides() {
        let config = load(&[
            ("LISTEN_ADDR", "0.0.0.0:8080"),
            ("ENCODER_PATH", "/opt/ffmpeg/bin/ffmpeg"),
            ("KILL_GRACE_MS", "250"),
            ("LOG_LEVEL", "info"),
        ])
        .unwrap();
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(
            config.encoder_path,
            Some(PathBuf::from("/opt/ffmpeg/bin/ffmpeg"))
        );
        assert_eq!(config.kill_grace, Duration::from_millis(250));
        assert_eq!(config.log_level, tracing::Level::INFO);
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = load(&[("KILL_GRACE_MS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("KILL_GRACE_MS"));
    }
}
