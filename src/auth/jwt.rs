use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::debug;

use crate::config::JwtConfig;

/// Signed session claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,   // user ID
    pub exp: i64,   // expires at (unix timestamp)
    pub iat: i64,   // issued at (unix timestamp)
}

/// Issues and validates session tokens with a symmetric server secret.
/// Stateless: holds only the process-wide keys and the default lifetime.
pub struct TokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    algorithm: Algorithm,
    default_ttl: TimeDuration,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("algorithm", &self.algorithm)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl TokenCodec {
    pub fn from_config(cfg: &JwtConfig) -> anyhow::Result<Self> {
        let algorithm = cfg
            .algorithm
            .parse::<Algorithm>()
            .map_err(|e| anyhow::anyhow!("unsupported JWT algorithm {:?}: {e:?}", cfg.algorithm))?;
        Ok(Self {
            encoding: EncodingKey::from_secret(cfg.secret.as_bytes()),
            decoding: DecodingKey::from_secret(cfg.secret.as_bytes()),
            algorithm,
            default_ttl: TimeDuration::minutes(cfg.ttl_minutes),
        })
    }

    pub fn default_ttl(&self) -> TimeDuration {
        self.default_ttl
    }

    /// Sign a token for `subject` expiring after `ttl`.
    pub fn issue(&self, subject: i64, ttl: TimeDuration) -> anyhow::Result<String> {
        let now = OffsetDateTime::now_utc();
        let claims = Claims {
            sub: subject,
            exp: (now + ttl).unix_timestamp(),
            iat: now.unix_timestamp(),
        };
        let token = encode(&Header::new(self.algorithm), &claims, &self.encoding)?;
        debug!(user_id = %subject, "session token signed");
        Ok(token)
    }

    /// Sign a token with the configured lifetime.
    pub fn issue_default(&self, subject: i64) -> anyhow::Result<String> {
        self.issue(subject, self.default_ttl)
    }

    /// Verify signature and expiry. Every failure mode (malformed, forged,
    /// expired) collapses to `None`; callers cannot tell them apart.
    pub fn validate(&self, token: &str) -> Option<Claims> {
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = 0;
        match decode::<Claims>(token, &self.decoding, &validation) {
            Ok(data) => {
                debug!(user_id = %data.claims.sub, "session token verified");
                Some(data.claims)
            }
            Err(e) => {
                debug!(error = %e, "session token rejected");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_codec(secret: &str) -> TokenCodec {
        TokenCodec::from_config(&JwtConfig {
            secret: secret.into(),
            algorithm: "HS256".into(),
            ttl_minutes: 30,
        })
        .expect("codec should build")
    }

    #[test]
    fn issue_and_validate_roundtrip() {
        let codec = make_codec("dev-secret");
        let token = codec.issue_default(42).expect("sign");
        let claims = codec.validate(&token).expect("token should be valid");
        assert_eq!(claims.sub, 42);
        assert_eq!(claims.exp - claims.iat, 30 * 60);
    }

    #[test]
    fn explicit_ttl_overrides_default() {
        let codec = make_codec("dev-secret");
        let token = codec.issue(7, TimeDuration::minutes(5)).expect("sign");
        let claims = codec.validate(&token).expect("token should be valid");
        assert_eq!(claims.exp - claims.iat, 5 * 60);
    }

    #[test]
    fn expired_token_is_invalid() {
        let codec = make_codec("dev-secret");
        let token = codec.issue(42, TimeDuration::seconds(-10)).expect("sign");
        assert!(codec.validate(&token).is_none());
    }

    #[test]
    fn tampered_token_is_invalid() {
        let codec = make_codec("dev-secret");
        let token = codec.issue_default(42).expect("sign");
        // Flip one character in the signature segment.
        let mut bytes = token.into_bytes();
        let last = bytes.len() - 1;
        bytes[last] = if bytes[last] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();
        assert!(codec.validate(&tampered).is_none());
    }

    #[test]
    fn wrong_secret_is_invalid() {
        let codec = make_codec("dev-secret");
        let other = make_codec("another-secret");
        let token = codec.issue_default(42).expect("sign");
        assert!(other.validate(&token).is_none());
    }

    #[test]
    fn garbage_is_invalid() {
        let codec = make_codec("dev-secret");
        assert!(codec.validate("not-a-token").is_none());
        assert!(codec.validate("").is_none());
    }

    #[test]
    fn rejects_unsupported_algorithm_tag() {
        let err = TokenCodec::from_config(&JwtConfig {
            secret: "s".into(),
            algorithm: "HS9000".into(),
            ttl_minutes: 30,
        })
        .unwrap_err();
        assert!(err.to_string().contains("HS9000"));
    }
}
