//! Pool tuning carried in the connection URL.
//!
//! `postgres://u:p@host/db?pool_max_conns=10&pool_max_conn_lifetime=30m&sslmode=disable`
//!
//! The `pool_*` parameters configure the sqlx pool and are removed before the URL is
//! handed to the driver or the migrator; every other parameter is kept as is.

use crate::error::{Error, Result};
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use url::Url;

pub const POOL_MAX_CONNS: &str = "pool_max_conns";
pub const POOL_MIN_CONNS: &str = "pool_min_conns";
pub const POOL_MAX_CONN_LIFETIME: &str = "pool_max_conn_lifetime";
pub const POOL_MAX_CONN_IDLE_TIME: &str = "pool_max_conn_idle_time";
pub const POOL_HEALTH_CHECK_PERIOD: &str = "pool_health_check_period";

const POOL_PARAMS: [&str; 5] = [
    POOL_MAX_CONNS,
    POOL_MIN_CONNS,
    POOL_MAX_CONN_LIFETIME,
    POOL_MAX_CONN_IDLE_TIME,
    POOL_HEALTH_CHECK_PERIOD,
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    pub max_lifetime: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub health_check_period: Option<Duration>,
}

impl PoolSettings {
    /// Apply the settings on top of the substrate defaults.
    #[must_use]
    pub fn apply(&self, options: PgPoolOptions) -> PgPoolOptions {
        let mut options = options;
        if let Some(max) = self.max_connections {
            options = options.max_connections(max);
        }
        if let Some(min) = self.min_connections {
            options = options.min_connections(min);
        }
        if let Some(lifetime) = self.max_lifetime {
            options = options.max_lifetime(lifetime);
        }
        if let Some(idle) = self.idle_timeout {
            options = options.idle_timeout(idle);
        }
        // sqlx has no background pinger; a configured period turns on ping-before-use.
        if self
            .health_check_period
            .is_some_and(|period| !period.is_zero())
        {
            options = options.test_before_acquire(true);
        }
        options
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseUrl {
    /// URL without the `pool_*` parameters.
    pub connect: String,
    pub pool: PoolSettings,
}

/// Split a connection URL into the driver URL and the pool settings.
///
/// # Errors
/// Fails on an unparseable URL, a non-postgres scheme or a malformed `pool_*` value.
pub fn parse(raw: &str) -> Result<DatabaseUrl> {
    let mut url = Url::parse(raw.trim())
        .map_err(|err| Error::configuration(format!("invalid database url: {err}")))?;

    if !matches!(url.scheme(), "postgres" | "postgresql") {
        return Err(Error::configuration(format!(
            "unsupported database url scheme: {}",
            url.scheme()
        )));
    }

    let mut pool = PoolSettings::default();
    let mut kept = Vec::new();
    for (key, value) in url.query_pairs().into_owned() {
        match key.as_str() {
            POOL_MAX_CONNS => pool.max_connections = Some(parse_count(&key, &value)?),
            POOL_MIN_CONNS => pool.min_connections = Some(parse_count(&key, &value)?),
            POOL_MAX_CONN_LIFETIME => pool.max_lifetime = Some(parse_param(&key, &value)?),
            POOL_MAX_CONN_IDLE_TIME => pool.idle_timeout = Some(parse_param(&key, &value)?),
            POOL_HEALTH_CHECK_PERIOD => {
                pool.health_check_period = Some(parse_param(&key, &value)?);
            }
            _ => kept.push((key.clone(), value.clone())),
        }
    }

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    Ok(DatabaseUrl {
        connect: url.to_string(),
        pool,
    })
}

/// The URL with pool parameters removed, as handed to the migrator.
pub fn strip_pool_params(raw: &str) -> Result<String> {
    parse(raw).map(|parsed| parsed.connect)
}

#[must_use]
pub fn is_pool_param(key: &str) -> bool {
    POOL_PARAMS.contains(&key)
}

fn parse_count(key: &str, value: &str) -> Result<u32> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|err| Error::configuration(format!("invalid {key}={value}: {err}")))
}

fn parse_param(key: &str, value: &str) -> Result<Duration> {
    parse_duration(value).map_err(|err| Error::configuration(format!("invalid {key}: {err}")))
}

/// Parse `250ms`, `30s`, `5m`, `1h` (and combinations such as `1h30m`).
///
/// # Errors
/// Fails on an empty value, a missing unit or an unknown unit.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::validation("empty duration"));
    }

    let mut total = Duration::ZERO;
    let mut rest = value;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(Error::validation(format!("invalid duration: {value}")));
        }
        let amount: u64 = rest[..digits]
            .parse()
            .map_err(|_| Error::validation(format!("invalid duration: {value}")))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        total += match unit {
            "ms" => Duration::from_millis(amount),
            "s" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount * 60),
            "h" => Duration::from_secs(amount * 3600),
            "" => {
                return Err(Error::validation(format!(
                    "duration {value} is missing a unit"
                )));
            }
            other => {
                return Err(Error::validation(format!("unknown duration unit: {other}")));
            }
        };
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() -> Result<()> {
        assert_eq!(parse_duration("250ms")?, Duration::from_millis(250));
        assert_eq!(parse_duration("30s")?, Duration::from_secs(30));
        assert_eq!(parse_duration("5m")?, Duration::from_secs(300));
        assert_eq!(parse_duration("1h")?, Duration::from_secs(3600));
        assert_eq!(parse_duration("1h30m")?, Duration::from_secs(5400));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("3d").is_err());
        Ok(())
    }

    #[test]
    fn pool_params_are_stripped() -> Result<()> {
        let parsed = parse(
            "postgres://app:pw@db:5432/payments?sslmode=disable&pool_max_conns=10&pool_min_conns=2&pool_max_conn_lifetime=30m&pool_max_conn_idle_time=5m&pool_health_check_period=1m",
        )?;
        assert_eq!(
            parsed.connect,
            "postgres://app:pw@db:5432/payments?sslmode=disable"
        );
        assert_eq!(parsed.pool.max_connections, Some(10));
        assert_eq!(parsed.pool.min_connections, Some(2));
        assert_eq!(parsed.pool.max_lifetime, Some(Duration::from_secs(1800)));
        assert_eq!(parsed.pool.idle_timeout, Some(Duration::from_secs(300)));
        assert_eq!(parsed.pool.health_check_period, Some(Duration::from_secs(60)));
        Ok(())
    }

    #[test]
    fn query_removed_when_only_pool_params() -> Result<()> {
        assert_eq!(
            strip_pool_params("postgres://localhost/app?pool_max_conns=4")?,
            "postgres://localhost/app"
        );
        assert_eq!(
            strip_pool_params("postgres://localhost/app")?,
            "postgres://localhost/app"
        );
        Ok(())
    }

    #[test]
    fn invalid_urls_are_configuration_errors() {
        for raw in [
            "not a url",
            "mysql://localhost/app",
            "postgres://localhost/app?pool_max_conns=many",
            "postgres://localhost/app?pool_max_conn_lifetime=forever",
        ] {
            let kind = parse(raw).err().map(|err| err.kind());
            assert_eq!(kind, Some(crate::ErrorKind::Configuration), "{raw}");
        }
    }

    #[test]
    fn recognises_pool_params() {
        assert!(is_pool_param("pool_max_conns"));
        assert!(!is_pool_param("sslmode"));
    }
}
