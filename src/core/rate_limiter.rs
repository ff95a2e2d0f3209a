//! Rule-scoped rate limiting built atop `governor`.
//!
//! Each rate limiter rule owns one in-memory token bucket refilled at
//! `replenishRate` tokens per second and holding at most `burstCapacity`
//! tokens. Buckets live in a concurrent registry keyed by rule id and are
//! rebuilt when the rule's handle changes.
use std::{num::NonZeroU32, sync::Arc};

use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use scc::HashMap;
use thiserror::Error;

use crate::core::handle::RateLimiterHandle;

pub type DirectRateLimiterImpl = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("rate limit exceeded for rule '{rule_id}'")]
    Exceeded { rule_id: String },
    #[error("invalid rate limiter handle: {0}")]
    InvalidQuota(String),
}

/// Bucket for a single rule plus the handle it was built from.
pub struct RuleLimiter {
    pub handle: RateLimiterHandle,
    limiter: DirectRateLimiterImpl,
}

impl RuleLimiter {
    pub fn new(handle: RateLimiterHandle) -> Result<Self, RateLimitError> {
        Ok(Self {
            handle,
            limiter: RateLimiter::direct(quota_for(handle)?),
        })
    }

    pub fn check(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

fn quota_for(handle: RateLimiterHandle) -> Result<Quota, RateLimitError> {
    let rate = NonZeroU32::new(handle.replenish_rate)
        .ok_or_else(|| RateLimitError::InvalidQuota("replenishRate must be greater than 0".into()))?;
    let burst = NonZeroU32::new(handle.burst_capacity).ok_or_else(|| {
        RateLimitError::InvalidQuota("burstCapacity must be greater than 0".into())
    })?;
    Ok(Quota::per_second(rate).allow_burst(burst))
}

/// Concurrent registry of rule limiters.
#[derive(Default)]
pub struct RateLimiterRegistry {
    limiters: HashMap<String, Arc<RuleLimiter>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one token from the rule's bucket, creating or rebuilding the bucket
    /// when the handle is new or has changed.
    pub async fn check(&self, rule_id: &str, handle: RateLimiterHandle) -> Result<(), RateLimitError> {
        let limiter = self.limiter_for(rule_id, handle).await?;
        if limiter.check() {
            Ok(())
        } else {
            Err(RateLimitError::Exceeded {
                rule_id: rule_id.to_string(),
            })
        }
    }

    async fn limiter_for(
        &self,
        rule_id: &str,
        handle: RateLimiterHandle,
    ) -> Result<Arc<RuleLimiter>, RateLimitError> {
        if let Some(entry) = self.limiters.get_async(rule_id).await
            && entry.get().handle == handle
        {
            return Ok(Arc::clone(entry.get()));
        }

        let fresh = Arc::new(RuleLimiter::new(handle)?);
        let mut entry = self
            .limiters
            .entry_async(rule_id.to_string())
            .await
            .or_insert_with(|| Arc::clone(&fresh));
        if entry.get().handle != handle {
            tracing::debug!(rule.id = rule_id, ?handle, "Rebuilding rate limiter for changed handle");
            *entry.get_mut() = Arc::clone(&fresh);
        }
        Ok(Arc::clone(entry.get()))
    }

    /// Drop buckets whose rule no longer exists.
    pub async fn prune(&self, is_live: impl Fn(&str) -> bool) {
        self.limiters.retain_async(|rule_id, _| is_live(rule_id)).await;
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(burst: u32, rate: u32) -> RateLimiterHandle {
        RateLimiterHandle {
            burst_capacity: burst,
            replenish_rate: rate,
        }
    }

    #[test]
    fn test_zero_values_rejected() {
        assert!(RuleLimiter::new(handle(0, 1)).is_err());
        assert!(RuleLimiter::new(handle(1, 0)).is_err());
    }

    #[tokio::test]
    async fn test_burst_then_exhausted() {
        let registry = RateLimiterRegistry::new();
        for _ in 0..3 {
            assert!(registry.check("r1", handle(3, 1)).await.is_ok());
        }
        assert_eq!(
            registry.check("r1", handle(3, 1)).await,
            Err(RateLimitError::Exceeded {
                rule_id: "r1".into()
            })
        );
        // Separate rules have separate buckets
        assert!(registry.check("r2", handle(3, 1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_handle_change_rebuilds_bucket() {
        let registry = RateLimiterRegistry::new();
        assert!(registry.check("r1", handle(1, 1)).await.is_ok());
        assert!(registry.check("r1", handle(1, 1)).await.is_err());
        assert!(registry.check("r1", handle(5, 1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_prune_drops_dead_rules() {
        let registry = RateLimiterRegistry::new();
        registry.check("keep", handle(5, 5)).await.unwrap();
        registry.check("drop", handle(5, 5)).await.unwrap();
        registry.prune(|id| id == "keep").await;
        assert_eq!(registry.len(), 1);
    }
}
