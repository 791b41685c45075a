use std::str::FromStr;

use anyhow::{Context, Result, bail};
use axum::http::HeaderName;
use chrono::Duration;

/// Upper bound for any configured lifetime (ten years).
const MAX_DURATION_SECS: i64 = 10 * 365 * 24 * 60 * 60;

/// Everything the auth endpoints need to know about the deployment.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub nonce_expiration: Duration,
    pub otp_expiration: Duration,
    pub session: SessionPolicy,
    pub cookies: CookieConfig,
    /// When set, SIWE messages must name exactly this domain.
    pub siwe_domain: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub ttl: Duration,
    /// Slide a session's expiry forward each time it is used.
    pub auto_refresh: bool,
    /// Skip the refresh write unless it gains at least this much.
    pub min_refresh_interval: Duration,
    pub token_limit_per_user: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct CookieConfig {
    pub auth_cookie_name: String,
    pub csrf_cookie_name: String,
    pub domain: Option<String>,
    pub secure: bool,
    /// Request header the client echoes the CSRF token in.
    pub csrf_header: HeaderName,
    /// Response header the server hands the CSRF token out in.
    pub csrf_response_header: HeaderName,
    /// Keyword of the `Authorization: <keyword> <token>` header.
    pub token_keyword: String,
    pub trusted_origins: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            nonce_expiration: Duration::minutes(15),
            otp_expiration: Duration::minutes(5),
            session: SessionPolicy::default(),
            cookies: CookieConfig::default(),
            siwe_domain: None,
        }
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::days(7),
            auto_refresh: true,
            min_refresh_interval: Duration::seconds(60),
            token_limit_per_user: None,
        }
    }
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            auth_cookie_name: "artcade_auth_cookie".into(),
            csrf_cookie_name: "csrftoken".into(),
            domain: None,
            secure: true,
            csrf_header: HeaderName::from_static("x-csrftoken"),
            csrf_response_header: HeaderName::from_static("x-csrf-token"),
            token_keyword: "Token".into(),
            trusted_origins: Vec::new(),
        }
    }
}

impl AuthConfig {
    /// Build the config from `ARTCADE_*` environment variables, falling back
    /// to the defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let session = SessionPolicy {
            ttl: secs_var("ARTCADE_TOKEN_TTL_SECS", defaults.session.ttl, 1)?,
            auto_refresh: parsed_var("ARTCADE_AUTO_REFRESH")?.unwrap_or(defaults.session.auto_refresh),
            min_refresh_interval: secs_var(
                "ARTCADE_MIN_REFRESH_INTERVAL_SECS",
                defaults.session.min_refresh_interval,
                0,
            )?,
            token_limit_per_user: parsed_var("ARTCADE_TOKEN_LIMIT_PER_USER")?,
        };

        let cookies = CookieConfig {
            auth_cookie_name: string_var("ARTCADE_AUTH_COOKIE_NAME")
                .unwrap_or(defaults.cookies.auth_cookie_name),
            csrf_cookie_name: string_var("ARTCADE_CSRF_COOKIE_NAME")
                .unwrap_or(defaults.cookies.csrf_cookie_name),
            domain: string_var("ARTCADE_COOKIE_DOMAIN"),
            secure: parsed_var("ARTCADE_COOKIE_SECURE")?.unwrap_or(defaults.cookies.secure),
            csrf_header: header_var("ARTCADE_CSRF_HEADER_NAME")?
                .unwrap_or(defaults.cookies.csrf_header),
            csrf_response_header: header_var("ARTCADE_CSRF_RESPONSE_HEADER_NAME")?
                .unwrap_or(defaults.cookies.csrf_response_header),
            token_keyword: defaults.cookies.token_keyword,
            trusted_origins: list_var("ARTCADE_CSRF_TRUSTED_ORIGINS"),
        };

        Ok(Self {
            nonce_expiration: secs_var("ARTCADE_NONCE_EXPIRATION_SECS", defaults.nonce_expiration, 1)?,
            otp_expiration: secs_var("ARTCADE_OTP_EXPIRATION_SECS", defaults.otp_expiration, 1)?,
            session,
            cookies,
            siwe_domain: string_var("ARTCADE_SIWE_DOMAIN"),
        })
    }
}

/// Non-empty value of an environment variable.
pub fn string_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn parsed_var<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    string_var(key)
        .map(|v| v.parse::<T>().with_context(|| format!("Invalid value for {}: {:?}", key, v)))
        .transpose()
}

/// Comma separated list, empty entries dropped.
pub fn list_var(key: &str) -> Vec<String> {
    string_var(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().trim_end_matches('/').to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// A duration in whole seconds, at least `min` and at most ten years.
pub fn secs_var(key: &str, default: Duration, min: i64) -> Result<Duration> {
    secs_from(key, string_var(key).as_deref(), default, min)
}

fn secs_from(key: &str, raw: Option<&str>, default: Duration, min: i64) -> Result<Duration> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    let secs: i64 = raw
        .parse()
        .with_context(|| format!("Invalid value for {}: {:?}", key, raw))?;
    if !(min..=MAX_DURATION_SECS).contains(&secs) {
        bail!(
            "{} must be between {} and {} seconds, got {}",
            key,
            min,
            MAX_DURATION_SECS,
            secs
        );
    }
    Ok(Duration::seconds(secs))
}

fn header_var(key: &str) -> Result<Option<HeaderName>> {
    string_var(key)
        .map(|v| HeaderName::from_str(&v).with_context(|| format!("Invalid header name for {}", key)))
        .transpose()
}
