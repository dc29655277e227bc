//! Access/refresh token lifecycle with an injectable clock.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::sync::{Arc, Mutex};

use super::ClientError;

/// Refresh this long before the access token actually expires.
pub const REFRESH_SKEW_SECONDS: i64 = 60;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = to;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Deserialize)]
struct ExpiryClaim {
    exp: i64,
}

/// Reads `exp` from a JWT payload. The signature is not checked; the server
/// does that.
pub fn token_expiry(token: &str) -> Result<DateTime<Utc>, ClientError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| ClientError::InvalidToken("token is not a JWT".into()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| ClientError::InvalidToken(format!("payload is not base64url: {}", e)))?;
    let claim: ExpiryClaim = serde_json::from_slice(&bytes)
        .map_err(|e| ClientError::InvalidToken(format!("payload has no exp: {}", e)))?;
    DateTime::from_timestamp(claim.exp, 0)
        .ok_or_else(|| ClientError::InvalidToken(format!("exp {} is out of range", claim.exp)))
}

pub struct TokenSession {
    clock: Arc<dyn Clock>,
    access_token: Option<String>,
    refresh_token: Option<String>,
    access_expires_at: Option<DateTime<Utc>>,
    refresh_expires_at: Option<DateTime<Utc>>,
}

impl TokenSession {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            access_token: None,
            refresh_token: None,
            access_expires_at: None,
            refresh_expires_at: None,
        }
    }

    /// Stores a new access token, and a new refresh token when one is given.
    /// A refresh response carries no refresh token, so the old one is kept.
    pub fn set_tokens(&mut self, access_token: String, refresh_token: Option<String>) -> Result<(), ClientError> {
        let access_expires_at = token_expiry(&access_token)?;
        if let Some(refresh) = refresh_token {
            self.refresh_expires_at = Some(token_expiry(&refresh)?);
            self.refresh_token = Some(refresh);
        }
        self.access_expires_at = Some(access_expires_at);
        self.access_token = Some(access_token);
        Ok(())
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    pub fn access_expires_at(&self) -> Option<DateTime<Utc>> {
        self.access_expires_at
    }

    /// True when a usable refresh token is held.
    pub fn can_refresh(&self) -> bool {
        match (&self.refresh_token, self.refresh_expires_at) {
            (Some(_), Some(expires_at)) => self.clock.now() < expires_at,
            _ => false,
        }
    }

    /// True once the access token is within the skew window of expiring.
    pub fn needs_refresh(&self) -> bool {
        match self.access_expires_at {
            Some(expires_at) => self.clock.now() + Duration::seconds(REFRESH_SKEW_SECONDS) >= expires_at,
            None => self.can_refresh(),
        }
    }

    /// Time until a refresh should be scheduled. Zero when one is already due.
    pub fn refresh_due_in(&self) -> Option<std::time::Duration> {
        let expires_at = self.access_expires_at?;
        let due_at = expires_at - Duration::seconds(REFRESH_SKEW_SECONDS);
        Some((due_at - self.clock.now()).to_std().unwrap_or_default())
    }

    pub fn is_authenticated(&self) -> bool {
        let access_valid = matches!(
            (&self.access_token, self.access_expires_at),
            (Some(_), Some(expires_at)) if self.clock.now() < expires_at
        );
        access_valid || self.can_refresh()
    }

    pub fn clear(&mut self) {
        self.access_token = None;
        self.refresh_token = None;
        self.access_expires_at = None;
        self.refresh_expires_at = None;
    }
}
