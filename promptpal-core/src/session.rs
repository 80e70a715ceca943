//! Session tokens
//!
//! Stateless HS256 JWTs carrying the user id and expiry. Validity is decided
//! entirely by the signature and the embedded `exp`; there is no server-side
//! session table and no revocation list, so rotating the secret invalidates
//! every outstanding token.
//!
//! Expiry is checked here against the injected [`Clock`] rather than by
//! `jsonwebtoken`, so a token is rejected from `now >= exp` with no leeway.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::Clock;

pub const MIN_SECRET_LEN: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("token expired")]
    TokenExpired,

    #[error("token signature is invalid")]
    TokenInvalidSignature,

    #[error("token is malformed: {0}")]
    TokenMalformed(String),

    #[error("session secret must be at least {MIN_SECRET_LEN} characters")]
    WeakSecret,

    #[error("failed to sign token: {0}")]
    Signing(String),

    #[error("session lifetime is out of range")]
    TtlOutOfRange,
}

/// JWT payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub uid: i64,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: i64,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub token: String,
}

#[derive(Clone)]
pub struct SessionIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    clock: Arc<dyn Clock>,
}

impl SessionIssuer {
    pub fn new(secret: &str, clock: Arc<dyn Clock>) -> Result<Self, SessionError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(SessionError::WeakSecret);
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            clock,
        })
    }

    pub fn issue(&self, user_id: i64, ttl: Duration) -> Result<Session, SessionError> {
        let now = self.clock.now();
        let iat = now.timestamp();
        let exp = iat
            .checked_add(ttl.num_seconds())
            .filter(|exp| Utc.timestamp_opt(*exp, 0).single().is_some())
            .ok_or(SessionError::TtlOutOfRange)?;

        let claims = Claims { uid: user_id, iat, exp };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| SessionError::Signing(e.to_string()))?;

        Ok(Session {
            user_id,
            issued_at: timestamp(iat),
            expires_at: timestamp(exp),
            token,
        })
    }

    /// Returns the user id the token was issued for.
    pub fn validate(&self, token: &str) -> Result<i64, SessionError> {
        self.claims(token).map(|c| c.uid)
    }

    pub fn claims(&self, token: &str) -> Result<Claims, SessionError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    SessionError::TokenInvalidSignature
                }
                _ => SessionError::TokenMalformed(e.to_string()),
            }
        })?;

        if self.clock.now().timestamp() >= data.claims.exp {
            return Err(SessionError::TokenExpired);
        }
        Ok(data.claims)
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    const SECRET: &str = "test-secret-that-is-long-enough-0123456789";

    fn issuer() -> (SessionIssuer, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let issuer = SessionIssuer::new(SECRET, clock.clone()).unwrap();
        (issuer, clock)
    }

    #[test]
    fn test_issue_then_validate_returns_user() {
        let (issuer, _) = issuer();
        let session = issuer.issue(42, Duration::days(30)).unwrap();
        assert_eq!(issuer.validate(&session.token), Ok(42));
        assert_eq!(session.expires_at - session.issued_at, Duration::days(30));
    }

    #[test]
    fn test_unrepresentable_expiry_is_out_of_range() {
        let (issuer, _) = issuer();
        let ttl = Duration::try_days(1_000_000_000).unwrap();
        assert_eq!(issuer.issue(1, ttl).unwrap_err(), SessionError::TtlOutOfRange);
    }

    #[test]
    fn test_expiry_boundary_is_exact() {
        let (issuer, clock) = issuer();
        let ttl = Duration::days(30);
        let session = issuer.issue(1, ttl).unwrap();

        clock.advance(ttl - Duration::seconds(1));
        assert_eq!(issuer.validate(&session.token), Ok(1));

        clock.advance(Duration::seconds(1));
        assert_eq!(issuer.validate(&session.token), Err(SessionError::TokenExpired));

        clock.advance(Duration::days(1));
        assert_eq!(issuer.validate(&session.token), Err(SessionError::TokenExpired));
    }

    #[test]
    fn test_token_from_other_secret_is_invalid_signature() {
        let (issuer, clock) = issuer();
        let other =
            SessionIssuer::new("another-secret-that-is-long-enough-987654", clock).unwrap();
        let session = other.issue(5, Duration::hours(1)).unwrap();
        assert_eq!(
            issuer.validate(&session.token),
            Err(SessionError::TokenInvalidSignature)
        );
    }

    #[test]
    fn test_tampered_payload_is_invalid_signature() {
        let (issuer, _) = issuer();
        let session = issuer.issue(5, Duration::hours(1)).unwrap();
        let forged_claims = Claims { uid: 6, iat: 0, exp: i64::MAX / 2 };
        let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims).unwrap());
        let mut parts: Vec<&str> = session.token.split('.').collect();
        parts[1] = &forged_payload;
        let forged = parts.join(".");

        assert_eq!(issuer.validate(&forged), Err(SessionError::TokenInvalidSignature));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let (issuer, _) = issuer();
        assert!(matches!(issuer.validate("not-a-token"), Err(SessionError::TokenMalformed(_))));
        assert!(matches!(issuer.validate(""), Err(SessionError::TokenMalformed(_))));
        assert!(matches!(issuer.validate("a.b.c"), Err(SessionError::TokenMalformed(_))));
    }

    #[test]
    fn test_short_secret_is_rejected() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        assert!(matches!(
            SessionIssuer::new("short", clock),
            Err(SessionError::WeakSecret)
        ));
    }
}
