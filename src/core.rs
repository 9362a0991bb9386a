//! The long-lived "core" value: process-wide mutable state collected into
//! one struct whose lifetime equals the server. Every accessor takes an
//! explicit `&Core` reference rather than reaching for a global.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::bypass::BypassCache;
use crate::config::Config;
use crate::dedupe::Deduper;
use crate::events::EventSink;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::selector::Selector;

#[derive(Default)]
struct Counters {
    total_queries: AtomicU64,
    primary_successes: AtomicU64,
    fallback_uses: AtomicU64,
    bypassed: AtomicU64,
    servfails: AtomicU64,
}

pub struct Core {
    pub config: Config,
    pub selector: Arc<Selector>,
    pub bypass: Arc<BypassCache>,
    pub dedupe: Arc<Deduper>,
    pub metrics: Arc<Metrics>,
    pub events: Arc<EventSink>,
    counters: Counters,
}

impl Core {
    pub fn new(config: Config) -> Arc<Self> {
        let event_sink_path = config.event_sink_path.clone().map(std::path::PathBuf::from);
        let metrics = Arc::new(Metrics::new().expect("metrics registry construction cannot fail"));
        let events = EventSink::spawn(event_sink_path, config.structured_logging, Some(Arc::clone(&metrics)));
        let selector = Arc::new(Selector::new(&config, Arc::clone(&events), Arc::clone(&metrics)));
        let bypass = Arc::new(BypassCache::new(&config));
        let dedupe = Arc::new(Deduper::new(
            config.dedupe_wait_timeout,
            config.dedupe_grace,
            config.enable_query_deduplication,
        ));

        Arc::new(Core {
            config,
            selector,
            bypass,
            dedupe,
            metrics,
            events,
            counters: Counters::default(),
        })
    }

    pub fn record_outcome(&self, resolver_tag: crate::events::ResolverTag) {
        use crate::events::ResolverTag::*;
        self.counters.total_queries.fetch_add(1, Ordering::Relaxed);
        match resolver_tag {
            Primary => self.counters.primary_successes.fetch_add(1, Ordering::Relaxed),
            Fallback => self.counters.fallback_uses.fetch_add(1, Ordering::Relaxed),
            Bypassed => self.counters.bypassed.fetch_add(1, Ordering::Relaxed),
            Servfail => self.counters.servfails.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot(
            self.selector.current().name,
            self.counters.total_queries.load(Ordering::Relaxed),
            self.counters.primary_successes.load(Ordering::Relaxed),
            self.counters.fallback_uses.load(Ordering::Relaxed),
            self.counters.bypassed.load(Ordering::Relaxed),
            self.counters.servfails.load(Ordering::Relaxed),
            self.bypass.top_failing(10),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let core = Core::new(Config::default());
        let snapshot = core.metrics_snapshot();
        assert_eq!(snapshot.total_queries, 0);
    }

    #[test]
    fn record_outcome_updates_the_matching_counter() {
        let core = Core::new(Config::default());
        core.record_outcome(crate::events::ResolverTag::Primary);
        core.record_outcome(crate::events::ResolverTag::Servfail);
        let snapshot = core.metrics_snapshot();
        assert_eq!(snapshot.total_queries, 2);
        assert_eq!(snapshot.primary_successes, 1);
        assert_eq!(snapshot.servfails, 1);
    }
}
