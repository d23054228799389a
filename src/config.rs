use crate::error::AppError;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// How a member's history fetch relates to read receipts for messages
/// authored by someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadReceiptPolicy {
    /// Fetching history counts as having read it.
    #[default]
    FetchImpliesRead,
    /// A message is read only once the member's read pointer reaches it.
    Explicit,
}

impl FromStr for ReadReceiptPolicy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fetch_implies_read" | "fetch" => Ok(ReadReceiptPolicy::FetchImpliesRead),
            "explicit" => Ok(ReadReceiptPolicy::Explicit),
            other => Err(AppError::Config(format!(
                "READ_RECEIPT_POLICY must be fetch_implies_read or explicit, got {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub ttl: Duration,
    pub heartbeat_interval: Duration,
    pub offline_grace: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(60),
            offline_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WsConfig {
    pub send_buffer: usize,
    pub rate_limit_per_sec: u32,
    pub rate_limit_burst: u32,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            send_buffer: 256,
            rate_limit_per_sec: 30,
            rate_limit_burst: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub db_max_connections: usize,
    pub redis_url: Option<String>,
    pub port: u16,
    pub revoke_window_secs: i64,
    pub read_receipts: ReadReceiptPolicy,
    pub presence: PresenceConfig,
    pub ws: WsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: 16,
            redis_url: None,
            port: 3000,
            revoke_window_secs: 120,
            read_receipts: ReadReceiptPolicy::default(),
            presence: PresenceConfig::default(),
            ws: WsConfig::default(),
        }
    }
}

fn parse_or<T: FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, fallback = %default, "invalid config value");
            default
        }),
        Err(_) => default,
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        let defaults = Config::default();

        let read_receipts = match env::var("READ_RECEIPT_POLICY") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.read_receipts,
        };

        let presence = PresenceConfig {
            ttl: Duration::from_secs(parse_or(
                "PRESENCE_TTL_SECS",
                defaults.presence.ttl.as_secs(),
            )),
            heartbeat_interval: Duration::from_secs(parse_or(
                "PRESENCE_HEARTBEAT_SECS",
                defaults.presence.heartbeat_interval.as_secs(),
            )),
            offline_grace: Duration::from_secs(parse_or(
                "PRESENCE_OFFLINE_GRACE_SECS",
                defaults.presence.offline_grace.as_secs(),
            )),
        };
        if presence.heartbeat_interval >= presence.ttl {
            return Err(AppError::Config(
                "PRESENCE_HEARTBEAT_SECS must be shorter than PRESENCE_TTL_SECS".into(),
            ));
        }

        let ws = WsConfig {
            send_buffer: parse_or("WS_SEND_BUFFER", defaults.ws.send_buffer).max(1),
            rate_limit_per_sec: parse_or("WS_RATE_LIMIT_PER_SEC", defaults.ws.rate_limit_per_sec),
            rate_limit_burst: parse_or("WS_RATE_LIMIT_BURST", defaults.ws.rate_limit_burst),
        };

        Ok(Self {
            database_url: non_empty("DATABASE_URL"),
            db_max_connections: parse_or("DB_MAX_CONNECTIONS", defaults.db_max_connections),
            redis_url: non_empty("REDIS_URL"),
            port: parse_or("PORT", defaults.port),
            revoke_window_secs: parse_or("REVOKE_WINDOW_SECS", defaults.revoke_window_secs),
            read_receipts,
            presence,
            ws,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_reference_policy() {
        let cfg = Config::default();
        assert_eq!(cfg.revoke_window_secs, 120);
        assert_eq!(cfg.presence.ttl, Duration::from_secs(120));
        assert_eq!(cfg.presence.heartbeat_interval, Duration::from_secs(60));
        assert_eq!(cfg.ws.send_buffer, 256);
        assert_eq!(cfg.read_receipts, ReadReceiptPolicy::FetchImpliesRead);
    }

    #[test]
    fn read_receipt_policy_parses_known_values() {
        assert_eq!(
            "explicit".parse::<ReadReceiptPolicy>(),
            Ok(ReadReceiptPolicy::Explicit)
        );
        assert_eq!(
            " Fetch_Implies_Read ".parse::<ReadReceiptPolicy>(),
            Ok(ReadReceiptPolicy::FetchImpliesRead)
        );
        assert!(matches!(
            "sometimes".parse::<ReadReceiptPolicy>(),
            Err(AppError::Config(_))
        ));
    }
}
