//! Learned-bypass cache (C4): per-name failure counters and bypass-until
//! deadlines, plus a default CDN-suffix allowlist. State lives in a
//! `DashMap` of small per-name records, keyed the same way upstream
//! endpoint health is tracked elsewhere in this crate, just scoped to a
//! name instead of an endpoint.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::Config;

#[derive(Debug, Clone, Default)]
pub struct DomainRecord {
    pub total_queries: u64,
    pub consecutive_primary_failures: u32,
    pub last_primary_success_at: Option<Instant>,
    pub bypass_until: Option<Instant>,
}

pub struct BypassCache {
    records: DashMap<String, DomainRecord>,
    cdn_suffixes: Vec<String>,
    max_entries: usize,
    failure_threshold: u32,
    bypass_duration: Duration,
    min_queries_before_bypass: u64,
    enabled: bool,
}

impl BypassCache {
    pub fn new(config: &Config) -> Self {
        BypassCache {
            records: DashMap::new(),
            cdn_suffixes: config.cdn_bypass_suffixes.clone(),
            max_entries: config.max_domain_cache,
            failure_threshold: config.fallback_threshold,
            bypass_duration: config.bypass_duration,
            min_queries_before_bypass: config.min_queries_before_bypass,
            enabled: config.intelligent_caching,
        }
    }

    /// True if `name` (already lowercased, trailing dot stripped) should
    /// skip the primary: either a CDN-suffix match, or an active bypass
    /// deadline recorded from prior primary failures.
    pub fn should_bypass(&self, name: &str) -> bool {
        if !self.enabled {
            return false;
        }
        if self.cdn_suffixes.iter().any(|suffix| name.ends_with(suffix.as_str())) {
            return true;
        }
        self.records
            .get(name)
            .map(|record| matches!(record.bypass_until, Some(until) if until > Instant::now()))
            .unwrap_or(false)
    }

    /// Records the outcome of a primary exchange for `name`. Returns
    /// `Some(bypass_seconds)` if this call just triggered a fresh bypass
    /// (used to emit a `DOMAIN_BYPASSED` event), else `None`.
    pub fn record_primary_result(&self, name: &str, success: bool) -> Option<u64> {
        if !self.enabled {
            return None;
        }

        let mut triggered = None;
        {
            let mut record = self.records.entry(name.to_string()).or_default();
            record.total_queries += 1;

            if success {
                record.consecutive_primary_failures = 0;
                record.last_primary_success_at = Some(Instant::now());
                record.bypass_until = None;
            } else {
                record.consecutive_primary_failures += 1;
                if record.consecutive_primary_failures >= self.failure_threshold
                    && record.total_queries >= self.min_queries_before_bypass
                    && record.bypass_until.is_none()
                {
                    record.bypass_until = Some(Instant::now() + self.bypass_duration);
                    triggered = Some(self.bypass_duration.as_secs());
                }
            }
        }

        self.evict_if_over_capacity();
        triggered
    }

    /// Approximate LRU by use-count: when the map grows past `max_entries`,
    /// drop the record with the smallest `total_queries`. Exact recency
    /// ordering isn't required for correctness here.
    fn evict_if_over_capacity(&self) {
        if self.records.len() <= self.max_entries {
            return;
        }
        let victim = self
            .records
            .iter()
            .min_by_key(|entry| entry.value().total_queries)
            .map(|entry| entry.key().clone());
        if let Some(victim) = victim {
            self.records.remove(&victim);
        }
    }

    pub fn consecutive_failures(&self, name: &str) -> u32 {
        self.records.get(name).map(|r| r.consecutive_primary_failures).unwrap_or(0)
    }

    /// Domains with the most consecutive primary failures, for the metrics
    /// snapshot's "top-failing domains" field.
    pub fn top_failing(&self, limit: usize) -> Vec<(String, u32)> {
        let mut entries: Vec<(String, u32)> = self
            .records
            .iter()
            .filter(|e| e.value().consecutive_primary_failures > 0)
            .map(|e| (e.key().clone(), e.value().consecutive_primary_failures))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries.truncate(limit);
        entries
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
