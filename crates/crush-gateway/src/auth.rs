// SPDX-License-Identifier: MIT
//! JWT authentication and per-IP rate limiting for the WebSocket upgrade
//! endpoint, adapted from the teacher's bearer-token middleware: the same
//! "rate-limit only failed attempts, exempt loopback" shape, but verifying a
//! JWT's signature/issuer/expiry instead of comparing a stored token hash
//! (SPEC_FULL.md §4.9).

use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::keyed::DashMapStateStore;
use governor::{Quota, RateLimiter};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::warn;

use crush_config::GatewayConfig;

use crate::error::GatewayError;

type IpLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>;

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[allow(dead_code)]
    exp: usize,
}

/// Shared auth state threaded through the gateway's WebSocket handler.
#[derive(Clone)]
pub struct AuthState {
    secret: Arc<str>,
    issuer: String,
    limiter: Arc<IpLimiter>,
}

impl AuthState {
    pub fn new(config: &GatewayConfig, secret: String) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(5).unwrap()).allow_burst(NonZeroU32::new(2).unwrap());
        Self {
            secret: Arc::from(secret.as_str()),
            issuer: config.jwt_issuer.clone(),
            limiter: Arc::new(RateLimiter::keyed(quota)),
        }
    }

    /// Load the HMAC secret from the environment variable named by
    /// `GatewayConfig::jwt_secret_env`.
    pub fn from_env(config: &GatewayConfig) -> anyhow::Result<Self> {
        let secret = std::env::var(&config.jwt_secret_env)
            .map_err(|_| anyhow::anyhow!("missing env var {}", config.jwt_secret_env))?;
        Ok(Self::new(config, secret))
    }

    /// Verify a JWT, applying per-IP rate limiting to failed attempts only
    /// (loopback addresses are exempt — a local process already has local
    /// machine access). Returns the subject claim (treated as the
    /// authenticated user id) on success.
    pub fn verify(&self, token: &str, ip: IpAddr) -> Result<String, GatewayError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        let key = DecodingKey::from_secret(self.secret.as_bytes());
        match decode::<Claims>(token, &key, &validation) {
            Ok(data) => Ok(data.claims.sub),
            Err(e) => {
                if !is_loopback(ip) && self.limiter.check_key(&ip).is_err() {
                    warn!(%ip, "rate limit exceeded after repeated auth failures");
                }
                warn!(%ip, "JWT verification failed");
                Err(GatewayError::InvalidToken(e))
            }
        }
    }
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4 == Ipv4Addr::LOCALHOST,
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn config() -> GatewayConfig {
        GatewayConfig {
            bind_addr: "127.0.0.1:0".into(),
            jwt_issuer: "crush".into(),
            jwt_secret_env: "TEST_JWT_SECRET_UNUSED".into(),
            outbound_queue_len: 256,
        }
    }

    fn token(secret: &str, issuer: &str, exp_offset_secs: i64) -> String {
        let claims = serde_json::json!({
            "sub": "user-1",
            "iss": issuer,
            "exp": (chrono::Utc::now().timestamp() + exp_offset_secs),
        });
        encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn valid_token_verifies() {
        let state = AuthState::new(&config(), "s3cr3t".into());
        let t = token("s3cr3t", "crush", 3600);
        let sub = state.verify(&t, IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        assert_eq!(sub, "user-1");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let state = AuthState::new(&config(), "s3cr3t".into());
        let t = token("wrong-secret", "crush", 3600);
        assert!(state.verify(&t, IpAddr::V4(Ipv4Addr::LOCALHOST)).is_err());
    }

    #[test]
    fn wrong_issuer_is_rejected() {
        let state = AuthState::new(&config(), "s3cr3t".into());
        let t = token("s3cr3t", "someone-else", 3600);
        assert!(state.verify(&t, IpAddr::V4(Ipv4Addr::LOCALHOST)).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let state = AuthState::new(&config(), "s3cr3t".into());
        let t = token("s3cr3t", "crush", -3600);
        assert!(state.verify(&t, IpAddr::V4(Ipv4Addr::LOCALHOST)).is_err());
    }

    #[test]
    fn malformed_token_is_rejected() {
        let state = AuthState::new(&config(), "s3cr3t".into());
        assert!(state.verify("not-a-jwt", IpAddr::V4(Ipv4Addr::LOCALHOST)).is_err());
    }
}
