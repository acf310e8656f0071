//! JWT validation.
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing
//! - Only HS256 is accepted, against one shared secret
//! - `exp` is validated by `jsonwebtoken`; `iat` is checked against the
//!   configured clock skew
//! - Every failure maps to the same generic client message

use crate::auth::claims::Claims;
use crate::errors::ControllerError;
use common::secret::{ExposeSecret, SecretString};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use std::time::Duration;
use tracing::instrument;

/// Maximum accepted token size in bytes (8KB).
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// Default JWT clock skew tolerance (5 minutes).
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Maximum allowed JWT clock skew tolerance (10 minutes).
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(600);

const INVALID_TOKEN_MESSAGE: &str = "The access token is invalid or expired";

fn invalid_token() -> ControllerError {
    ControllerError::InvalidToken(INVALID_TOKEN_MESSAGE.to_string())
}

/// Validates bearer tokens signed with the shared secret.
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
    clock_skew: Duration,
}

impl JwtValidator {
    /// Create a validator.
    ///
    /// # Arguments
    ///
    /// * `secret` - Shared HS256 signing secret
    /// * `clock_skew_seconds` - Tolerance for `iat` in the future
    #[must_use]
    pub fn new(secret: &SecretString, clock_skew_seconds: i64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            decoding_key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation,
            clock_skew: Duration::from_secs(clock_skew_seconds.unsigned_abs()),
        }
    }

    /// Validate a JWT and return its claims.
    ///
    /// # Security Checks
    ///
    /// 1. Size check - reject tokens > 8KB before parsing
    /// 2. Verify the HS256 signature
    /// 3. Validate `exp` (reject expired tokens)
    /// 4. Validate `iat` with clock skew tolerance
    /// 5. Require `sub` to be a usable user id
    ///
    /// # Errors
    ///
    /// Returns `ControllerError::InvalidToken` with a generic message for
    /// every failure.
    #[instrument(skip_all, name = "cc.auth.validate")]
    pub fn validate(&self, token: &str) -> Result<Claims, ControllerError> {
        if token.len() > MAX_JWT_SIZE_BYTES {
            tracing::debug!(
                target: "cc.auth",
                token_size = token.len(),
                max_size = MAX_JWT_SIZE_BYTES,
                "Token rejected: size exceeds maximum allowed"
            );
            return Err(invalid_token());
        }

        let token_data =
            decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
                tracing::debug!(target: "cc.auth", error = %e, "Token verification failed");
                invalid_token()
            })?;
        let claims = token_data.claims;

        validate_iat_at(claims.iat, self.clock_skew, chrono::Utc::now().timestamp())?;

        if claims.user_id().is_err() {
            tracing::debug!(target: "cc.auth", "Token rejected: unusable subject");
            return Err(invalid_token());
        }

        tracing::debug!(target: "cc.auth", "Token validated successfully");
        Ok(claims)
    }
}

/// Reject tokens issued further in the future than `clock_skew` allows.
fn validate_iat_at(iat: i64, clock_skew: Duration, now: i64) -> Result<(), ControllerError> {
    let clock_skew_secs = i64::try_from(clock_skew.as_secs()).unwrap_or(i64::MAX);
    let max_iat = now.saturating_add(clock_skew_secs);

    if iat > max_iat {
        tracing::debug!(
            target: "cc.auth",
            iat = iat,
            now = now,
            max_allowed = max_iat,
            "Token rejected: iat too far in the future"
        );
        return Err(invalid_token());
    }
    Ok(())
}
