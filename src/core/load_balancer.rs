use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    net::IpAddr,
    sync::atomic::{AtomicUsize, Ordering},
};

use rand::Rng;

use crate::core::handle::{DivideUpstream, LoadBalance};

/// Trait defining the interface for upstream selection strategies.
///
/// Upstreams with a weight of zero are never selected.
pub trait LoadBalancingStrategy: Send + Sync + 'static {
    /// Select an upstream for a request from `client_ip`
    fn select<'a>(
        &self,
        upstreams: &'a [DivideUpstream],
        client_ip: Option<IpAddr>,
    ) -> Option<&'a DivideUpstream>;
    /// Create a new instance of this strategy as a boxed trait object
    fn boxed(self) -> Box<dyn LoadBalancingStrategy>
    where
        Self: Sized,
    {
        Box::new(self)
    }
}

fn eligible(upstreams: &[DivideUpstream]) -> Vec<&DivideUpstream> {
    upstreams.iter().filter(|u| u.weight > 0).collect()
}

/// Round-robin over eligible upstreams
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select<'a>(
        &self,
        upstreams: &'a [DivideUpstream],
        _client_ip: Option<IpAddr>,
    ) -> Option<&'a DivideUpstream> {
        let candidates = eligible(upstreams);
        if candidates.is_empty() {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(candidates[count % candidates.len()])
    }
}

/// Weighted random selection
pub struct RandomStrategy;

impl Default for RandomStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancingStrategy for RandomStrategy {
    fn select<'a>(
        &self,
        upstreams: &'a [DivideUpstream],
        _client_ip: Option<IpAddr>,
    ) -> Option<&'a DivideUpstream> {
        let candidates = eligible(upstreams);
        let total: u64 = candidates.iter().map(|u| u64::from(u.weight)).sum();
        if total == 0 {
            return None;
        }
        let mut point = rand::rng().random_range(0..total);
        for upstream in &candidates {
            let weight = u64::from(upstream.weight);
            if point < weight {
                return Some(upstream);
            }
            point -= weight;
        }
        candidates.last().copied()
    }
}

/// Stable choice per client IP; requests without an address go to the first upstream
pub struct HashStrategy;

impl LoadBalancingStrategy for HashStrategy {
    fn select<'a>(
        &self,
        upstreams: &'a [DivideUpstream],
        client_ip: Option<IpAddr>,
    ) -> Option<&'a DivideUpstream> {
        let candidates = eligible(upstreams);
        if candidates.is_empty() {
            return None;
        }
        let index = match client_ip {
            Some(ip) => {
                let mut hasher = DefaultHasher::new();
                ip.hash(&mut hasher);
                (hasher.finish() % candidates.len() as u64) as usize
            }
            None => 0,
        };
        Some(candidates[index])
    }
}

/// Factory for creating strategies from a divide handle
pub struct LoadBalancerFactory;

impl LoadBalancerFactory {
    pub fn create_strategy(strategy: LoadBalance) -> Box<dyn LoadBalancingStrategy> {
        match strategy {
            LoadBalance::RoundRobin => RoundRobinStrategy::new().boxed(),
            LoadBalance::Random => RandomStrategy::new().boxed(),
            LoadBalance::Hash => HashStrategy.boxed(),
        }
    }
}
