//! Named limiters, one per protected endpoint family.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::limiter::RateLimiter;
use crate::config::TurnstileConfig;
use crate::error::{Result, TurnstileError};

/// A fixed set of rate limiters keyed by endpoint family.
///
/// Families are configured up front; the registry never creates limiters on
/// demand, so an unknown family is a caller error.
#[derive(Debug, Default, Clone)]
pub struct LimiterRegistry {
    limiters: BTreeMap<String, Arc<RateLimiter>>,
}

impl LimiterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one limiter per configured family.
    pub fn from_config(config: &TurnstileConfig) -> Result<Self> {
        let mut registry = Self::new();
        for (family, settings) in &config.limiters {
            let limiter = RateLimiter::from_settings(*settings)?;
            info!(
                family = %family,
                capacity = settings.capacity,
                window_ms = settings.window_ms,
                max_buckets = settings.max_buckets,
                "Rate limiter initialized"
            );
            registry.insert(family.clone(), Arc::new(limiter));
        }
        Ok(registry)
    }

    /// Register a limiter, replacing any previous one for the family.
    pub fn insert(&mut self, family: impl Into<String>, limiter: Arc<RateLimiter>) {
        self.limiters.insert(family.into(), limiter);
    }

    /// Get the limiter for a family.
    pub fn get(&self, family: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(family).cloned()
    }

    /// Run an admission check against a family's limiter.
    pub fn allow(&self, family: &str, key: &str) -> Result<bool> {
        self.limiters
            .get(family)
            .map(|limiter| limiter.allow(key))
            .ok_or_else(|| TurnstileError::UnknownFamily(family.to_string()))
    }

    /// Configured family names, sorted.
    pub fn families(&self) -> impl Iterator<Item = &str> {
        self.limiters.keys().map(String::as_str)
    }

    /// All limiters in the registry.
    pub fn limiters(&self) -> Vec<Arc<RateLimiter>> {
        self.limiters.values().cloned().collect()
    }

    /// Sum of approximate bucket counts across families.
    pub fn total_buckets(&self) -> usize {
        self.limiters
            .values()
            .map(|limiter| limiter.approximate_bucket_count())
            .sum()
    }
}
