//! # Voter Identity
//!
//! Self-certifying pseudonymous identity for helpful votes. Nothing is stored
//! server side: the browser carries
//!
//! `v=<voterId>&ts=<unixSeconds>&sig=<base64url(HMAC-SHA256(v=..&ts=..))>`
//!
//! in the [`COOKIE_NAME`] cookie. Any token that fails verification is treated
//! as absent and replaced by a fresh identity. Resolution never errors.
use axum::http::{HeaderMap, header::COOKIE};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;

use crate::{error::AppError, models::VoterId};

type HmacSha256 = Hmac<Sha256>;

pub const COOKIE_NAME: &str = "mc_helpful_voter";

/// 180 days.
pub const MAX_AGE_SECS: i64 = 180 * 24 * 60 * 60;

/// Tolerated clock skew for tokens stamped slightly in the future.
const FUTURE_SKEW_SECS: i64 = 300;

#[derive(Clone)]
pub struct VoterProtocol {
    mac: HmacSha256,
    secure: bool,
}

impl VoterProtocol {
    pub fn new(secret: &[u8], secure: bool) -> Result<Self, AppError> {
        if secret.is_empty() {
            return Err(AppError::invalid("voter secret must not be empty"));
        }

        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|_| AppError::invalid("voter secret rejected"))?;

        Ok(Self { mac, secure })
    }

    fn sign(&self, payload: &str) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    pub fn issue(&self, voter_id: &VoterId, now: DateTime<Utc>) -> String {
        let payload = format!("v={}&ts={}", voter_id, now.timestamp());
        let sig = URL_SAFE_NO_PAD.encode(self.sign(&payload));

        format!("{payload}&sig={sig}")
    }

    pub fn resolve(&self, token: &str, now: DateTime<Utc>) -> Option<VoterId> {
        let mut voter = None;
        let mut issued = None;
        let mut sig = None;

        for part in token.split('&') {
            match part.split_once('=') {
                Some(("v", value)) => voter = Some(value),
                Some(("ts", value)) => issued = Some(value),
                Some(("sig", value)) => sig = Some(value),
                _ => {}
            }
        }

        let (voter, issued, sig) = (voter?, issued?, sig?);
        let voter_id = VoterId::parse(voter)?;
        let issued_at: i64 = issued.parse().ok()?;
        let sig = URL_SAFE_NO_PAD.decode(sig).ok()?;

        let mut mac = self.mac.clone();
        mac.update(format!("v={voter}&ts={issued}").as_bytes());
        if mac.verify_slice(&sig).is_err() {
            debug!("Rejected voter token with bad signature");
            return None;
        }

        let age = now.timestamp() - issued_at;
        if age >= MAX_AGE_SECS || age < -FUTURE_SKEW_SECS {
            debug!("Rejected voter token aged {age}s");
            return None;
        }

        Some(voter_id)
    }

    /// Resolves the first presented token that verifies, or mints a new
    /// identity. The second value is the `Set-Cookie` header to attach when a
    /// new identity was minted.
    pub fn ensure<S: AsRef<str>>(
        &self,
        candidates: &[S],
        now: DateTime<Utc>,
    ) -> (VoterId, Option<String>) {
        if let Some(voter_id) = candidates
            .iter()
            .find_map(|token| self.resolve(token.as_ref(), now))
        {
            return (voter_id, None);
        }

        let voter_id = VoterId::generate();
        let set_cookie = self.set_cookie(&self.issue(&voter_id, now));

        (voter_id, Some(set_cookie))
    }

    fn set_cookie(&self, token: &str) -> String {
        let mut cookie =
            format!("{COOKIE_NAME}={token}; Path=/; Max-Age={MAX_AGE_SECS}; HttpOnly; SameSite=Lax");
        if self.secure {
            cookie.push_str("; Secure");
        }

        cookie
    }
}

/// Every voter cookie value across all `Cookie` headers, in order. Browsers
/// may send stale duplicates next to the current one.
pub fn cookie_values(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .filter(|(name, _)| *name == COOKIE_NAME)
        .map(|(_, value)| value.trim_matches('"').to_string())
        .collect()
}
