use std::convert::Infallible;

use anyhow::anyhow;
use axum::{
    http::{HeaderMap, HeaderName, HeaderValue, Method, header},
    response::{IntoResponseParts, ResponseParts},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Utc};
use tracing::warn;

use artcade_crypto::csrf::{
    csrf_token_matches, decode_secret, generate_csrf_secret, mask_csrf_secret,
};
use artcade_db::models::UserRow;

use crate::config::CookieConfig;
use crate::error::AuthError;
use crate::session::{IssuedSession, SessionManager};

/// Django-compatible CSRF cookie lifetime (one year).
const CSRF_COOKIE_AGE_SECS: i64 = 31_449_600;

/// How a request presented its session token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Browser path: the HTTP-only auth cookie. Subject to CSRF checks.
    Cookie(String),
    /// `Authorization: Token <value>`. Never CSRF checked.
    Bearer(String),
    None,
}

/// Identity attached to requests that passed the gateway.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: UserRow,
    pub token: String,
    pub via_cookie: bool,
    /// New expiry when the lookup refreshed the session.
    pub refreshed_expiry: Option<DateTime<Utc>>,
}

/// Response-side effects decided by the gateway: cookies to set and the CSRF
/// token header. Handlers return it as part of their response.
#[derive(Debug, Default)]
pub struct AuthResult {
    pub cookies: CookieJar,
    pub csrf_header: Option<(HeaderName, HeaderValue)>,
}

impl IntoResponseParts for AuthResult {
    type Error = Infallible;

    fn into_response_parts(self, res: ResponseParts) -> Result<ResponseParts, Self::Error> {
        let mut res = self.cookies.into_response_parts(res)?;
        if let Some((name, value)) = self.csrf_header {
            res.headers_mut().insert(name, value);
        }
        Ok(res)
    }
}

/// Decides which credential authenticates a request and enforces
/// double-submit CSRF on the cookie path.
#[derive(Clone)]
pub struct Gateway {
    config: CookieConfig,
    sessions: SessionManager,
}

impl Gateway {
    pub fn new(config: CookieConfig, sessions: SessionManager) -> Self {
        Self { config, sessions }
    }

    pub fn credential(&self, headers: &HeaderMap) -> Result<Credential, AuthError> {
        if let Some(raw) = headers.get(header::AUTHORIZATION) {
            let raw = raw.to_str().map_err(|_| AuthError::Unauthenticated)?;
            let mut parts = raw.split_whitespace();
            return match (parts.next(), parts.next(), parts.next()) {
                (Some(keyword), Some(token), None)
                    if keyword.eq_ignore_ascii_case(&self.config.token_keyword) =>
                {
                    Ok(Credential::Bearer(token.to_string()))
                }
                _ => Err(AuthError::Unauthenticated),
            };
        }

        let jar = CookieJar::from_headers(headers);
        Ok(match jar.get(&self.config.auth_cookie_name) {
            Some(cookie) if !cookie.value().is_empty() => {
                Credential::Cookie(cookie.value().to_string())
            }
            _ => Credential::None,
        })
    }

    /// Double-submit check for cookie-authenticated requests. Safe methods
    /// pass untouched.
    pub fn check_csrf(&self, method: &Method, headers: &HeaderMap) -> Result<(), AuthError> {
        if is_safe_method(method) {
            return Ok(());
        }

        if !self.config.trusted_origins.is_empty() {
            if let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
                let origin = origin.trim_end_matches('/');
                let trusted = self.config.trusted_origins.iter().any(|o| o == origin)
                    || self.own_origin(headers).is_some_and(|o| o == origin);
                if !trusted {
                    return Err(AuthError::CsrfFailed("Origin checking failed"));
                }
            }
        }

        let jar = CookieJar::from_headers(headers);
        let secret = jar
            .get(&self.config.csrf_cookie_name)
            .and_then(|c| decode_secret(c.value()))
            .ok_or(AuthError::CsrfFailed("CSRF cookie not set."))?;

        let token = headers
            .get(&self.config.csrf_header)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or(AuthError::CsrfFailed("CSRF token missing."))?;

        if !csrf_token_matches(&secret, token) {
            return Err(AuthError::CsrfFailed("CSRF token incorrect."));
        }
        Ok(())
    }

    /// Credential, then CSRF (cookie path only), then session lookup.
    pub fn authenticate(&self, method: &Method, headers: &HeaderMap) -> Result<AuthUser, AuthError> {
        let (token, via_cookie) = match self.credential(headers)? {
            Credential::Bearer(token) => (token, false),
            Credential::Cookie(token) => {
                self.check_csrf(method, headers)?;
                (token, true)
            }
            Credential::None => return Err(AuthError::Unauthenticated),
        };

        let resolved = self.sessions.resolve_session(&token).inspect_err(|_| {
            warn!("Rejected session token (cookie: {})", via_cookie);
        })?;

        Ok(AuthUser {
            user: resolved.user,
            token,
            via_cookie,
            refreshed_expiry: resolved.refreshed.then_some(resolved.expiry),
        })
    }

    /// Auth cookie carrying a refreshed expiry, for cookie sessions that
    /// were extended while handling the request.
    pub fn refreshed_cookie(&self, auth: &AuthUser) -> Option<AuthResult> {
        let expiry = auth.refreshed_expiry.filter(|_| auth.via_cookie)?;
        Some(AuthResult {
            cookies: CookieJar::new().add(self.auth_cookie(&auth.token, expiry)),
            csrf_header: None,
        })
    }

    /// Whether a response already sets (or clears) the auth cookie.
    pub fn sets_auth_cookie(&self, headers: &HeaderMap) -> bool {
        let prefix = format!("{}=", self.config.auth_cookie_name);
        headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.starts_with(&prefix))
    }

    /// Cookies and header for a fresh login: the auth cookie carrying the new
    /// token and a rotated CSRF secret.
    pub fn login_result(&self, session: &IssuedSession) -> Result<AuthResult, AuthError> {
        let secret = generate_csrf_secret();
        let token = mask_csrf_secret(&secret)?;

        let cookies = CookieJar::new()
            .add(self.auth_cookie(&session.token, session.expiry))
            .add(self.csrf_cookie(secret));

        Ok(AuthResult {
            cookies,
            csrf_header: Some(self.csrf_header(&token)?),
        })
    }

    /// A fresh masked token for the request's CSRF secret, minting the secret
    /// (and its cookie) if the request has none.
    pub fn csrf_refresh(&self, headers: &HeaderMap) -> Result<AuthResult, AuthError> {
        let existing = CookieJar::from_headers(headers)
            .get(&self.config.csrf_cookie_name)
            .map(|c| c.value().to_string())
            .filter(|v| decode_secret(v).is_some());

        let (secret, cookies) = match existing {
            Some(secret) => (secret, CookieJar::new()),
            None => {
                let secret = generate_csrf_secret();
                (secret.clone(), CookieJar::new().add(self.csrf_cookie(secret)))
            }
        };

        let token = mask_csrf_secret(&secret)?;
        Ok(AuthResult {
            cookies,
            csrf_header: Some(self.csrf_header(&token)?),
        })
    }

    /// Expire the auth cookie.
    pub fn logout_result(&self) -> AuthResult {
        let removal = self.cookie(
            self.config.auth_cookie_name.clone(),
            String::new(),
            true,
            time::Duration::ZERO,
        );

        AuthResult {
            cookies: CookieJar::new().add(removal),
            csrf_header: None,
        }
    }

    /// Origin of the host the request was sent to. The scheme follows the
    /// cookie `Secure` setting.
    fn own_origin(&self, headers: &HeaderMap) -> Option<String> {
        let host = headers.get(header::HOST)?.to_str().ok()?;
        let scheme = if self.config.secure { "https" } else { "http" };
        Some(format!("{}://{}", scheme, host))
    }

    fn auth_cookie(&self, token: &str, expiry: DateTime<Utc>) -> Cookie<'static> {
        let max_age = (expiry - Utc::now()).num_seconds().max(0);
        self.cookie(
            self.config.auth_cookie_name.clone(),
            token.to_string(),
            true,
            time::Duration::seconds(max_age),
        )
    }

    // readable by page script, which echoes it back
    fn csrf_cookie(&self, secret: String) -> Cookie<'static> {
        self.cookie(
            self.config.csrf_cookie_name.clone(),
            secret,
            false,
            time::Duration::seconds(CSRF_COOKIE_AGE_SECS),
        )
    }

    fn cookie(
        &self,
        name: String,
        value: String,
        http_only: bool,
        max_age: time::Duration,
    ) -> Cookie<'static> {
        // browsers drop SameSite=None cookies that are not Secure
        let same_site = if self.config.secure {
            SameSite::None
        } else {
            SameSite::Lax
        };

        let mut cookie = Cookie::build((name, value))
            .path("/")
            .http_only(http_only)
            .secure(self.config.secure)
            .same_site(same_site)
            .max_age(max_age)
            .build();

        if let Some(domain) = &self.config.domain {
            cookie.set_domain(domain.clone());
        }
        cookie
    }

    fn csrf_header(&self, token: &str) -> Result<(HeaderName, HeaderValue), AuthError> {
        let value = HeaderValue::from_str(token).map_err(|e| anyhow!("Bad CSRF header value: {}", e))?;
        Ok((self.config.csrf_response_header.clone(), value))
    }
}

fn is_safe_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    )
}
