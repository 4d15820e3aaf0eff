//! Process configuration from the environment. One `Settings` struct feeds
//! every crate; the server binary resolves it once at startup.

use std::str::FromStr;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 4000;
pub const DEFAULT_RESET_TIMEZONE: &str = "America/New_York";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("PORT is not a valid TCP port: {0}")]
    InvalidPort(String),
    #[error("AUTH_SECRET is required outside development")]
    MissingAuthSecret,
    #[error("DAILY_RESET_TIMEZONE is not a valid IANA zone: {0}")]
    InvalidTimezone(String),
}

/// Comma-separated CORS allow list; entries may carry a `*` wildcard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsOrigins {
    patterns: Vec<String>,
}

impl CorsOrigins {
    pub fn parse(raw: &str) -> Self {
        let patterns = raw
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn allows(&self, origin: &str) -> bool {
        self.patterns.iter().any(|p| pattern_matches(p, origin))
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

fn pattern_matches(pattern: &str, origin: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.split_once('*') {
        None => pattern == origin,
        Some((prefix, suffix)) => {
            origin.len() >= prefix.len() + suffix.len()
                && origin.starts_with(prefix)
                && origin.ends_with(suffix)
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub database_url: Option<String>,
    pub auth_secret: String,
    pub email_hash_key: Option<String>,
    pub pii_encryption_key: Option<String>,
    pub daily_reset_timezone: Tz,
    pub cors_origins: CorsOrigins,
    pub oauth_google_client_id: Option<String>,
    pub development: bool,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let development = std::env::var("ENVIRONMENT")
            .map(|v| v != "production")
            .unwrap_or(true);

        let port = match std::env::var("PORT") {
            Ok(raw) => u16::from_str(&raw).map_err(|_| ConfigError::InvalidPort(raw))?,
            Err(_) => DEFAULT_PORT,
        };

        let auth_secret = match std::env::var("AUTH_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ if development => "velotype-development-secret".to_string(),
            _ => return Err(ConfigError::MissingAuthSecret),
        };

        let tz_raw = std::env::var("DAILY_RESET_TIMEZONE")
            .unwrap_or_else(|_| DEFAULT_RESET_TIMEZONE.to_string());
        let daily_reset_timezone =
            tz_raw.parse::<Tz>().map_err(|_| ConfigError::InvalidTimezone(tz_raw))?;

        let cors_origins = std::env::var("CORS_ORIGIN")
            .map(|raw| CorsOrigins::parse(&raw))
            .unwrap_or_default();

        Ok(Self {
            port,
            database_url: non_empty_var("DATABASE_URL"),
            auth_secret,
            email_hash_key: non_empty_var("EMAIL_HASH_KEY"),
            pii_encryption_key: non_empty_var("PII_ENCRYPTION_KEY"),
            daily_reset_timezone,
            cors_origins,
            oauth_google_client_id: non_empty_var("OAUTH_GOOGLE_CLIENT_ID"),
            development,
        })
    }

    /// Email lookup hashes fall back to the auth secret when no dedicated
    /// key is configured.
    pub fn email_hash_key(&self) -> &str {
        self.email_hash_key.as_deref().unwrap_or(&self.auth_secret)
    }

    pub fn pii_encryption_key(&self) -> &str {
        self.pii_encryption_key.as_deref().unwrap_or(&self.auth_secret)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cors_exact_and_wildcard() {
        let origins = CorsOrigins::parse("https://velotype.io, https://*.velotype.io");
        assert!(origins.allows("https://velotype.io"));
        assert!(origins.allows("https://staging.velotype.io"));
        assert!(!origins.allows("https://evil.example"));
    }

    #[test]
    fn cors_star_allows_everything() {
        let origins = CorsOrigins::parse("*");
        assert!(origins.allows("https://anything.example"));
    }

    #[test]
    fn cors_empty_allows_nothing() {
        let origins = CorsOrigins::default();
        assert!(!origins.allows("https://velotype.io"));
    }

    #[test]
    fn timezone_must_be_valid() {
        assert!("America/New_York".parse::<Tz>().is_ok());
        assert!("Not/AZone".parse::<Tz>().is_err());
    }
}
