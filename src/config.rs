use std::env;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub event_buffer_size: usize,
    /// Proof token lifetime in seconds.
    pub token_ttl_secs: u64,
    /// Distance to drop-off below which a sub-order flips to nearby.
    pub nearby_threshold_km: f64,
    /// Distance from pickup above which an assigned unit counts as en route.
    pub en_route_threshold_km: f64,
    /// Telemetry older than this marks the unit's feed stale.
    pub telemetry_stale_secs: u64,
    pub telemetry_sweep_secs: u64,
    /// Fallback interval for re-attempting parked reservations.
    pub availability_poll_secs: u64,
    /// Default search radius for reservations and availability checks.
    pub default_radius_km: f64,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            token_ttl_secs: parse_or_default("TOKEN_TTL_SECS", 300)?,
            nearby_threshold_km: parse_or_default("NEARBY_THRESHOLD_KM", 0.15)?,
            en_route_threshold_km: parse_or_default("EN_ROUTE_THRESHOLD_KM", 0.05)?,
            telemetry_stale_secs: parse_or_default("TELEMETRY_STALE_SECS", 120)?,
            telemetry_sweep_secs: parse_or_default("TELEMETRY_SWEEP_SECS", 5)?,
            availability_poll_secs: parse_or_default("AVAILABILITY_POLL_SECS", 20)?,
            default_radius_km: parse_or_default("DEFAULT_RADIUS_KM", 10.0)?,
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}

impl Default for Config {
    /// Defaults used by tests; mirrors the env defaults above.
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            event_buffer_size: 1024,
            token_ttl_secs: 300,
            nearby_threshold_km: 0.15,
            en_route_threshold_km: 0.05,
            telemetry_stale_secs: 120,
            telemetry_sweep_secs: 5,
            availability_poll_secs: 20,
            default_radius_km: 10.0,
        }
    }
}
