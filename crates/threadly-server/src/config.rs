use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use threadly_gateway::presence::{DEFAULT_HEARTBEAT_TTL, DEFAULT_SWEEP_INTERVAL};

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub blob_dir: PathBuf,
    pub heartbeat_ttl: Duration,
    pub sweep_interval: Duration,
    pub vapid: Option<VapidConfig>,
    pub push_timeout: Duration,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct VapidConfig {
    pub public_key: String,
    pub private_key: String,
    pub subject: String,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let jwt_secret = get("THREADLY_JWT_SECRET", "");
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("THREADLY_JWT_SECRET is unset or still a placeholder; it must match the auth service's secret");
        }

        let public_key = get("THREADLY_VAPID_PUBLIC_KEY", "");
        let private_key = get("THREADLY_VAPID_PRIVATE_KEY", "");
        let vapid = (!private_key.trim().is_empty()).then(|| VapidConfig {
            public_key: public_key.trim().to_string(),
            private_key: private_key.trim().to_string(),
            subject: get("THREADLY_VAPID_SUBJECT", "mailto:admin@localhost"),
        });

        Ok(Self {
            host: get("THREADLY_HOST", "0.0.0.0"),
            port: parse(&var, "THREADLY_PORT", 8080)?,
            db_path: get("THREADLY_DB_PATH", "threadly.db").into(),
            jwt_secret,
            blob_dir: get("THREADLY_BLOB_DIR", "./blobs").into(),
            heartbeat_ttl: secs(&var, "THREADLY_HEARTBEAT_TTL_SECS", DEFAULT_HEARTBEAT_TTL)?,
            sweep_interval: secs(&var, "THREADLY_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL)?,
            vapid,
            push_timeout: secs(&var, "THREADLY_PUSH_TIMEOUT_SECS", Duration::from_secs(10))?,
            max_upload_bytes: parse(&var, "THREADLY_MAX_UPLOAD_BYTES", 10 * 1024 * 1024)?,
        })
    }
}

fn parse<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value '{}'", key, raw)),
        None => Ok(default),
    }
}

fn secs(var: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Result<Duration> {
    let secs = parse(var, key, default.as_secs())?;
    if secs == 0 {
        bail!("{} must be greater than zero", key);
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> Result<ServerConfig> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_apply() {
        let cfg = config(&[("THREADLY_JWT_SECRET", "a-real-secret")]).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.db_path, PathBuf::from("threadly.db"));
        assert_eq!(cfg.heartbeat_ttl, Duration::from_secs(90));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(45));
        assert_eq!(cfg.max_upload_bytes, 10 * 1024 * 1024);
        assert!(cfg.vapid.is_none());
    }

    #[test]
    fn placeholder_secret_is_rejected() {
        assert!(config(&[]).is_err());
        assert!(config(&[("THREADLY_JWT_SECRET", "dev-secret-change-me")]).is_err());
    }

    #[test]
    fn bad_numbers_are_reported() {
        let err = config(&[("THREADLY_JWT_SECRET", "s"), ("THREADLY_PORT", "http")]).unwrap_err();
        assert!(err.to_string().contains("THREADLY_PORT"));

        let zero = config(&[("THREADLY_JWT_SECRET", "s"), ("THREADLY_SWEEP_INTERVAL_SECS", "0")]);
        assert!(zero.is_err());
    }

    #[test]
    fn vapid_enabled_by_private_key() {
        let cfg = config(&[
            ("THREADLY_JWT_SECRET", "s"),
            ("THREADLY_VAPID_PRIVATE_KEY", "abc"),
        ])
        .unwrap();
        let vapid = cfg.vapid.unwrap();
        assert_eq!(vapid.private_key, "abc");
        assert_eq!(vapid.subject, "mailto:admin@localhost");
    }
}
