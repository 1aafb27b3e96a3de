//! Per-identity request rate limiting.
//!
//! Identity is the caller's API key when one is presented, otherwise the
//! remote IP. Each endpoint class keeps its own keyed token bucket so chat
//! traffic cannot exhaust the upload budget and vice versa.

use crate::utils::error::ApiError;
use crate::utils::sanitize::safe_key_display;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::warn;

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Who is being limited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    ApiKey(String),
    Ip(IpAddr),
}

impl Identity {
    /// Stable bucket key, namespaced so a key and an IP can never collide.
    pub fn bucket_key(&self) -> String {
        match self {
            Identity::ApiKey(key) => format!("api_key:{}", key),
            Identity::Ip(addr) => format!("ip:{}", addr),
        }
    }

    /// Loggable form with the key redacted.
    pub fn display(&self) -> String {
        match self {
            Identity::ApiKey(key) => safe_key_display(key),
            Identity::Ip(addr) => addr.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    Chat,
    Retrieval,
    Upload,
    Auth,
}

impl EndpointClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::Chat => "chat",
            EndpointClass::Retrieval => "retrieval",
            EndpointClass::Upload => "upload",
            EndpointClass::Auth => "auth",
        }
    }
}

/// Parse a limit expression like `10/minute`, `100/hour`, `5/second`.
fn parse_quota(spec: &str) -> anyhow::Result<Quota> {
    let (count, period) = spec
        .split_once('/')
        .ok_or_else(|| anyhow::anyhow!("invalid rate limit spec: {}", spec))?;
    let count: NonZeroU32 = count
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid rate limit count in: {}", spec))?;
    let quota = match period.trim() {
        "second" | "sec" | "s" => Quota::per_second(count),
        "minute" | "min" | "m" => Quota::per_minute(count),
        "hour" | "h" => Quota::per_hour(count),
        other => anyhow::bail!("invalid rate limit period: {}", other),
    };
    Ok(quota)
}

struct ClassLimiter {
    limiter: KeyedLimiter,
    limit_spec: String,
}

/// Process-wide rate limiter, one keyed bucket set per endpoint class.
pub struct ApiRateLimiter {
    chat: ClassLimiter,
    retrieval: ClassLimiter,
    upload: ClassLimiter,
    auth: ClassLimiter,
    clock: DefaultClock,
    enabled: bool,
}

impl ApiRateLimiter {
    pub fn new(cfg: &crate::config::RateLimitConfig) -> anyhow::Result<Self> {
        let build = |spec: &str| -> anyhow::Result<ClassLimiter> {
            Ok(ClassLimiter {
                limiter: RateLimiter::keyed(parse_quota(spec)?),
                limit_spec: spec.to_string(),
            })
        };
        Ok(Self {
            chat: build(&cfg.chat)?,
            retrieval: build(&cfg.retrieval)?,
            upload: build(&cfg.upload)?,
            auth: build(&cfg.auth)?,
            clock: DefaultClock::default(),
            enabled: cfg.enabled,
        })
    }

    fn class(&self, class: EndpointClass) -> &ClassLimiter {
        match class {
            EndpointClass::Chat => &self.chat,
            EndpointClass::Retrieval => &self.retrieval,
            EndpointClass::Upload => &self.upload,
            EndpointClass::Auth => &self.auth,
        }
    }

    /// Check a request against its endpoint-class budget.
    pub fn check(&self, class: EndpointClass, identity: &Identity) -> Result<(), ApiError> {
        if !self.enabled {
            return Ok(());
        }

        let limiter = self.class(class);
        match limiter.limiter.check_key(&identity.bucket_key()) {
            Ok(()) => Ok(()),
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                // Round up so clients never retry too early
                let retry_after = retry_after_secs(wait);
                warn!(
                    identity = %identity.display(),
                    endpoint = class.as_str(),
                    retry_after,
                    "rate limit exceeded"
                );
                Err(ApiError::RateLimited {
                    retry_after,
                    limit: limiter.limit_spec.clone(),
                    endpoint: class.as_str().to_string(),
                })
            }
        }
    }
}

fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs();
    if wait.subsec_nanos() > 0 {
        (secs + 1).max(1)
    } else {
        secs.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;

    fn limiter(chat: &str) -> ApiRateLimiter {
        ApiRateLimiter::new(&RateLimitConfig {
            enabled: true,
            chat: chat.to_string(),
            retrieval: "100/minute".to_string(),
            upload: "20/hour".to_string(),
            auth: "5/minute".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn eleventh_request_in_a_minute_is_rejected() {
        let rl = limiter("10/minute");
        let id = Identity::ApiKey("rk_testkey_0123456789abcdef".to_string());
        for _ in 0..10 {
            // Burst capacity equals the per-minute quota
            assert!(rl.check(EndpointClass::Chat, &id).is_ok());
        }
        match rl.check(EndpointClass::Chat, &id) {
            Err(ApiError::RateLimited {
                retry_after,
                limit,
                endpoint,
            }) => {
                assert!(retry_after >= 1);
                assert_eq!(limit, "10/minute");
                assert_eq!(endpoint, "chat");
            }
            other => panic!("expected rate limit error, got {:?}", other.err()),
        }
    }

    #[test]
    fn classes_have_independent_budgets() {
        let rl = limiter("1/minute");
        let id = Identity::Ip("10.0.0.7".parse().unwrap());
        assert!(rl.check(EndpointClass::Chat, &id).is_ok());
        assert!(rl.check(EndpointClass::Chat, &id).is_err());
        // Retrieval budget untouched
        assert!(rl.check(EndpointClass::Retrieval, &id).is_ok());
    }

    #[test]
    fn identities_have_independent_budgets() {
        let rl = limiter("1/minute");
        let a = Identity::Ip("10.0.0.1".parse().unwrap());
        let b = Identity::Ip("10.0.0.2".parse().unwrap());
        assert!(rl.check(EndpointClass::Chat, &a).is_ok());
        assert!(rl.check(EndpointClass::Chat, &b).is_ok());
    }

    #[test]
    fn disabled_limiter_always_allows() {
        let rl = ApiRateLimiter::new(&RateLimitConfig {
            enabled: false,
            chat: "1/minute".to_string(),
            retrieval: "1/minute".to_string(),
            upload: "1/minute".to_string(),
            auth: "1/minute".to_string(),
        })
        .unwrap();
        let id = Identity::Ip("10.0.0.3".parse().unwrap());
        for _ in 0..100 {
            assert!(rl.check(EndpointClass::Auth, &id).is_ok());
        }
    }

    #[test]
    fn quota_spec_parsing() {
        assert!(parse_quota("10/minute").is_ok());
        assert!(parse_quota("5/second").is_ok());
        assert!(parse_quota("20/hour").is_ok());
        assert!(parse_quota("nonsense").is_err());
        assert!(parse_quota("0/minute").is_err());
    }
}
