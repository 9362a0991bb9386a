//! Resolver selector (C3): holds the active resolver index, runs the
//! periodic probe loop, and promotes/demotes endpoints on health evidence.
//! Health is an atomic failure counter with linear backoff, evaluated by a
//! dedicated probe task that samples probe domains at random and requires a
//! majority of responses to succeed before calling an endpoint healthy.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::broadcast;

use crate::config::{Config, ResolverEndpoint};
use crate::events::{EventSink, Level, StateEvent};
use crate::metrics::Metrics;
use crate::transport;
use crate::wire::Message;
use crate::wire::header::Header;

/// Number of probe queries sent per `probe_once` call; a resolver is
/// considered healthy if at least `ceil(2n/3)` succeed.
const PROBES_PER_CHECK: usize = 3;
const BACKOFF_STEP: Duration = Duration::from_secs(2);
const IN_BAND_PROBE_THRESHOLD: u32 = 2;

pub struct Selector {
    chain: Vec<ResolverEndpoint>,
    active: AtomicUsize,
    interval: Mutex<Duration>,
    base_interval: Duration,
    backoff_ceiling: Duration,
    probe_domains: Vec<String>,
    probe_timeout: Duration,
    consecutive_probe_failures: AtomicU32,
    in_band_failures: AtomicU32,
    events: Arc<EventSink>,
    metrics: Arc<Metrics>,
}

impl Selector {
    pub fn new(config: &Config, events: Arc<EventSink>, metrics: Arc<Metrics>) -> Self {
        Selector {
            chain: config.resolver_chain(),
            active: AtomicUsize::new(0),
            interval: Mutex::new(config.health_check_interval),
            base_interval: config.health_check_interval,
            backoff_ceiling: config.probe_backoff_ceiling,
            probe_domains: config.health_check_domains.clone(),
            probe_timeout: config.primary_timeout,
            consecutive_probe_failures: AtomicU32::new(0),
            in_band_failures: AtomicU32::new(0),
            events,
            metrics,
        }
    }

    pub fn current(&self) -> ResolverEndpoint {
        let index = self.active.load(Ordering::Acquire);
        self.chain[index].clone()
    }

    pub fn current_index(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_primary_active(&self) -> bool {
        self.current_index() == 0
    }

    pub fn fallbacks_configured(&self) -> bool {
        self.chain.len() > 1
    }

    pub fn chain(&self) -> &[ResolverEndpoint] {
        &self.chain
    }

    /// Feeds in-band evidence from the query pipeline. Two consecutive
    /// in-band failures on the active endpoint trigger an out-of-band probe
    /// so a dying primary is detected faster than the next scheduled tick.
    pub fn note_observed_failure(self: Arc<Self>, endpoint: &ResolverEndpoint) {
        if endpoint != &self.current() {
            return;
        }
        let failures = self.in_band_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= IN_BAND_PROBE_THRESHOLD {
            self.in_band_failures.store(0, Ordering::Release);
            tokio::spawn(async move { self.run_probe_tick().await });
        }
    }

    pub fn note_observed_success(&self, endpoint: &ResolverEndpoint) {
        if endpoint == &self.current() {
            self.in_band_failures.store(0, Ordering::Release);
        }
    }

    /// Issues up to [`PROBES_PER_CHECK`] A-record probe queries against
    /// `endpoint`. The endpoint is healthy if a majority (≥⌈2n/3⌉) succeed.
    pub async fn probe_once(&self, endpoint: &ResolverEndpoint) -> bool {
        let mut rng = rand::rng();
        let mut domains: Vec<&String> = self.probe_domains.iter().collect();
        domains.shuffle(&mut rng);

        let mut successes = 0usize;
        for i in 0..PROBES_PER_CHECK {
            let domain = domains[i % domains.len().max(1)];
            let probe = build_probe_query(domain);
            if transport::query_udp(endpoint, &probe, self.probe_timeout).await.is_ok() {
                successes += 1;
            }
        }

        let required = (2 * PROBES_PER_CHECK).div_ceil(3);
        let healthy = successes >= required;
        self.metrics.set_resolver_health(&endpoint.name, healthy);
        healthy
    }

    /// Runs the periodic probe schedule until `shutdown_rx` fires. Interval
    /// grows linearly by [`BACKOFF_STEP`] per consecutive failure up to
    /// `backoff_ceiling`, and resets to the configured base on success.
    pub async fn probe_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            let wait = *self.interval.lock();
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            self.run_probe_tick().await;
        }
    }

    async fn run_probe_tick(&self) {
        let active_index = self.current_index();
        let active_endpoint = self.chain[active_index].clone();
        let active_healthy = self.probe_once(&active_endpoint).await;

        if active_healthy {
            self.consecutive_probe_failures.store(0, Ordering::Release);
            *self.interval.lock() = self.base_interval;

            if active_index != 0 {
                let primary = &self.chain[0];
                if self.probe_once(primary).await {
                    self.active.store(0, Ordering::Release);
                    self.metrics.set_active_resolver_index(0);
                    self.events.emit_state(
                        StateEvent::new(Level::Info, "PRIMARY_RESTORED")
                            .with_field("endpoint", &primary.name),
                    );
                }
            }
            return;
        }

        let failures = self.consecutive_probe_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let backoff = (self.base_interval + BACKOFF_STEP * failures).min(self.backoff_ceiling);
        *self.interval.lock() = backoff;

        if active_index == 0 {
            self.events.emit_state(
                StateEvent::new(Level::Warn, "PRIMARY_DOWN").with_field("endpoint", &active_endpoint.name),
            );
        }

        for (index, candidate) in self.chain.iter().enumerate() {
            if index == active_index {
                continue;
            }
            if self.probe_once(candidate).await {
                self.active.store(index, Ordering::Release);
                self.metrics.set_active_resolver_index(index);
                self.events.emit_state(
                    StateEvent::new(Level::Warn, format!("SWITCHING_TO {}", candidate.name)),
                );
                return;
            }
        }

        self.events.emit_state(StateEvent::new(Level::Warn, "ALL_DOWN"));
    }
}

fn build_probe_query(domain: &str) -> Message {
    let header = Header {
        id: rand::random::<u16>(),
        rd: true,
        qdcount: 1,
        ..Default::default()
    };
    let mut buf = Vec::new();
    header.write(&mut buf).expect("in-memory header write cannot fail");
    crate::wire::common::write_name(&mut buf, domain).expect("probe domain within label limits");
    buf.extend_from_slice(&u16::from(crate::wire::enums::QType::A).to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes());
    Message::parse(Bytes::from(buf)).expect("freshly built probe query parses")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_events() -> Arc<EventSink> {
        EventSink::spawn(None, false, None)
    }

    #[test]
    fn current_defaults_to_primary() {
        let config = Config::default();
        let selector = Selector::new(&config, test_events(), Arc::new(Metrics::new().unwrap()));
        assert_eq!(selector.current(), config.primary);
        assert!(selector.is_primary_active());
    }

    #[test]
    fn builds_a_well_formed_probe_query() {
        let probe = build_probe_query("example.com");
        assert_eq!(probe.qname(), Some("example.com"));
        assert!(!probe.is_response());
    }

    async fn healthy_probe_responder() -> std::net::SocketAddr {
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            loop {
                let (n, peer) = match socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(_) => break,
                };
                let mut header = Header::parse(&buf[..n]).unwrap();
                header.qr = true;
                header.rcode = 0;
                let mut out = Vec::new();
                header.write(&mut out).unwrap();
                out.extend_from_slice(&buf[12..n]);
                let _ = socket.send_to(&out, peer).await;
            }
        });
        addr
    }

    async fn silent_probe_target() -> std::net::SocketAddr {
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            loop {
                if socket.recv_from(&mut buf).await.is_err() {
                    break;
                }
            }
        });
        addr
    }

    /// S8: the primary failing its health probe switches the active
    /// resolver to the first healthy fallback; once the primary recovers,
    /// the next tick fails back to it.
    #[tokio::test]
    async fn probe_tick_fails_over_then_fails_back() {
        let dead_primary = silent_probe_target().await;
        let healthy_fallback = healthy_probe_responder().await;

        let config = Config {
            primary: crate::config::ResolverEndpoint::new(dead_primary.ip().to_string(), dead_primary.port()),
            fallbacks: vec![crate::config::ResolverEndpoint::new(
                healthy_fallback.ip().to_string(),
                healthy_fallback.port(),
            )],
            primary_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let selector = Arc::new(Selector::new(&config, test_events(), Arc::new(Metrics::new().unwrap())));

        selector.run_probe_tick().await;
        assert_eq!(selector.current_index(), 1, "should switch to the healthy fallback");

        // Swap the roles: now the "primary" endpoint is reachable.
        let recovered_primary = healthy_probe_responder().await;
        let selector = Arc::new(Selector::new(
            &Config {
                primary: crate::config::ResolverEndpoint::new(
                    recovered_primary.ip().to_string(),
                    recovered_primary.port(),
                ),
                fallbacks: config.fallbacks.clone(),
                primary_timeout: Duration::from_millis(50),
                ..Default::default()
            },
            test_events(),
            Arc::new(Metrics::new().unwrap()),
        ));
        selector.active.store(1, Ordering::Release); // pretend we already failed over
        selector.run_probe_tick().await;
        assert_eq!(selector.current_index(), 0, "should fail back once the primary is healthy again");
    }
}
