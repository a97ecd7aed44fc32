//! Login tokens for survey attribution.
//!
//! HS256 JWTs from the login service. A verified token only decides who a
//! survey is attributed to. Helpful votes never look at it.
use axum::http::{HeaderMap, header::AUTHORIZATION};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use tracing::debug;

use crate::{error::AppError, models::Submitter};

#[derive(Clone, Debug)]
pub struct JwtKey {
    pub issuer: String,
    pub secret: String,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    name: Option<String>,
    preferred_username: Option<String>,
    picture: Option<String>,
}

pub struct TokenVerifier {
    keys: Vec<(DecodingKey, Validation)>,
}

impl TokenVerifier {
    pub fn new(keys: &[JwtKey], audience: Option<&str>) -> Self {
        let keys = keys
            .iter()
            .map(|key| {
                let mut validation = Validation::new(Algorithm::HS256);
                validation.set_issuer(&[key.issuer.as_str()]);
                match audience {
                    Some(audience) => validation.set_audience(&[audience]),
                    None => validation.validate_aud = false,
                }

                (DecodingKey::from_secret(key.secret.as_bytes()), validation)
            })
            .collect();

        Self { keys }
    }

    pub fn verify(&self, token: &str) -> Result<Submitter, AppError> {
        for (key, validation) in &self.keys {
            match decode::<Claims>(token, key, validation) {
                Ok(data) => {
                    let claims = data.claims;
                    if claims.sub.trim().is_empty() {
                        return Err(AppError::Unauthorized);
                    }

                    return Ok(Submitter {
                        id: claims.sub,
                        name: claims.name.filter(|n| !n.trim().is_empty()),
                        username: claims.preferred_username.filter(|n| !n.trim().is_empty()),
                        picture: claims.picture.filter(|p| !p.trim().is_empty()),
                    });
                }
                Err(e) => debug!("Token rejected: {e}"),
            }
        }

        Err(AppError::Unauthorized)
    }

    /// Requires `Authorization: Bearer <token>`.
    pub fn from_headers(&self, headers: &HeaderMap) -> Result<Submitter, AppError> {
        let token = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(bearer)
            .ok_or(AppError::Unauthorized)?;

        self.verify(token)
    }
}

pub fn bearer(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();

    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}
