//! Deduper (C5): collapses concurrent identical in-flight queries into a
//! single upstream exchange. A `DashMap<Key, InFlightQuery>` holds a
//! one-shot broadcast sender: the first arrival owns the upstream exchange
//! and later arrivals subscribe and await completion without ever holding
//! the map lock while they wait.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::events::ResolverTag;
use crate::wire::enums::QType;

pub type DedupeKey = (String, QType);

/// What an owner broadcasts to waiters: the raw response bytes (with the
/// owner's own transaction ID, not yet rewritten) and the resolver tag the
/// owner's exchange was classified as, so a waiter can emit an event
/// inherited from the owner's exchange instead of running its own.
#[derive(Clone)]
pub struct DedupeResult {
    pub bytes: Bytes,
    pub resolver_tag: ResolverTag,
}

struct InFlightQuery {
    sender: broadcast::Sender<DedupeResult>,
    /// Populated by `complete` before the entry is removed, so a joiner that
    /// subscribes after the broadcast already fired still gets the result
    /// instead of waiting out the full `wait_timeout`.
    completed: Mutex<Option<DedupeResult>>,
}

/// Outcome of waiting on an existing in-flight query.
pub enum DedupeWait {
    /// This call owns the upstream exchange; the caller must resolve it and
    /// call [`Deduper::complete`].
    Owner,
    /// Another caller already owns the exchange and its result arrived
    /// before the wait timeout. The bytes carry the *original* transaction
    /// ID; the caller must rewrite it to match their own request.
    Completed(DedupeResult),
    /// The wait timed out; the caller should proceed with its own
    /// independent upstream exchange rather than failing the client.
    TimedOut,
}

pub struct Deduper {
    in_flight: DashMap<DedupeKey, InFlightQuery>,
    wait_timeout: Duration,
    grace: Duration,
    enabled: bool,
}

impl Deduper {
    pub fn new(wait_timeout: Duration, grace: Duration, enabled: bool) -> Self {
        Deduper {
            in_flight: DashMap::new(),
            wait_timeout,
            grace,
            enabled,
        }
    }

    pub fn key(qname: &str, qtype: QType) -> DedupeKey {
        (qname.to_ascii_lowercase(), qtype)
    }

    /// Either installs this call as the owner of `key`'s in-flight
    /// exchange, or waits for the existing owner to complete.
    pub async fn join(&self, key: DedupeKey) -> DedupeWait {
        if !self.enabled {
            return DedupeWait::Owner;
        }

        // Subscribe before checking the cache: this guarantees we observe
        // either the cached result of a send that already happened, or the
        // broadcast of a send that happens after we subscribed. There is no
        // gap in which a completion could be missed by both paths.
        let (receiver, cached) = match self.in_flight.entry(key) {
            Entry::Vacant(vacant) => {
                let (sender, _) = broadcast::channel(1);
                vacant.insert(InFlightQuery {
                    sender,
                    completed: Mutex::new(None),
                });
                return DedupeWait::Owner;
            }
            Entry::Occupied(occupied) => {
                let entry = occupied.get();
                (entry.sender.subscribe(), entry.completed.lock().clone())
            }
        };
        if let Some(result) = cached {
            return DedupeWait::Completed(result);
        }

        match timeout(self.wait_timeout, await_one(receiver)).await {
            Ok(Some(bytes)) => DedupeWait::Completed(bytes),
            Ok(None) | Err(_) => DedupeWait::TimedOut,
        }
    }

    /// Called by the owner once the upstream exchange completes. Caches the
    /// result and broadcasts it to any waiters already subscribed, then
    /// removes the entry after the configured grace period. A joiner that
    /// arrives during the grace window, whether before or after the
    /// broadcast fired, finds the result through the cache.
    pub fn complete(self: Arc<Self>, key: DedupeKey, response: DedupeResult) {
        if !self.enabled {
            return;
        }
        if let Some(entry) = self.in_flight.get(&key) {
            *entry.completed.lock() = Some(response.clone());
            let _ = entry.sender.send(response);
        }

        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            self.in_flight.remove(&key);
        });
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

async fn await_one(mut receiver: broadcast::Receiver<DedupeResult>) -> Option<DedupeResult> {
    receiver.recv().await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_caller_owns_the_exchange() {
        let deduper = Deduper::new(Duration::from_secs(1), Duration::from_millis(50), true);
        let key = Deduper::key("example.com", QType::A);
        match deduper.join(key).await {
            DedupeWait::Owner => {}
            _ => panic!("expected to own the exchange"),
        }
    }

    #[tokio::test]
    async fn second_caller_waits_and_receives_the_broadcast_result() {
        let deduper = Arc::new(Deduper::new(Duration::from_secs(1), Duration::from_millis(50), true));
        let key = Deduper::key("example.com", QType::A);

        match deduper.join(key.clone()).await {
            DedupeWait::Owner => {}
            _ => panic!("expected owner"),
        }

        let waiter_deduper = Arc::clone(&deduper);
        let waiter_key = key.clone();
        let waiter = async move {
            match waiter_deduper.join(waiter_key).await {
                DedupeWait::Completed(result) => result,
                _ => panic!("expected Completed, not owner/timeout"),
            }
        };

        let completer_deduper = Arc::clone(&deduper);
        let complete = async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            completer_deduper.complete(
                key.clone(),
                DedupeResult {
                    bytes: Bytes::from_static(b"response"),
                    resolver_tag: ResolverTag::Primary,
                },
            );
        };

        let (result, _) = tokio::join!(waiter, complete);
        assert_eq!(result.bytes, Bytes::from_static(b"response"));
        assert_eq!(result.resolver_tag, ResolverTag::Primary);
    }

    /// A joiner arriving after the owner's broadcast already fired (but
    /// within the grace window) must still get the result from the cache
    /// instead of racing the one-shot channel and timing out.
    #[tokio::test]
    async fn late_joiner_gets_cached_result_after_broadcast_already_fired() {
        let deduper = Arc::new(Deduper::new(Duration::from_millis(20), Duration::from_millis(200), true));
        let key = Deduper::key("example.com", QType::A);

        match deduper.join(key.clone()).await {
            DedupeWait::Owner => {}
            _ => panic!("expected owner"),
        }

        deduper.clone().complete(
            key.clone(),
            DedupeResult {
                bytes: Bytes::from_static(b"cached"),
                resolver_tag: ResolverTag::Fallback,
            },
        );

        match deduper.join(key).await {
            DedupeWait::Completed(result) => {
                assert_eq!(result.bytes, Bytes::from_static(b"cached"));
                assert_eq!(result.resolver_tag, ResolverTag::Fallback);
            }
            _ => panic!("expected a late joiner to find the cached result, not time out"),
        }
    }

    #[tokio::test]
    async fn waiter_times_out_when_owner_never_completes() {
        let deduper = Deduper::new(Duration::from_millis(20), Duration::from_millis(50), true);
        let key = Deduper::key("stuck.example", QType::A);
        let _ = deduper.join(key.clone()).await;

        match deduper.join(key).await {
            DedupeWait::TimedOut => {}
            _ => panic!("expected timeout"),
        }
    }

    #[tokio::test]
    async fn disabled_deduper_always_reports_owner() {
        let deduper = Deduper::new(Duration::from_secs(1), Duration::from_millis(50), false);
        let key = Deduper::key("example.com", QType::A);
        assert!(matches!(deduper.join(key.clone()).await, DedupeWait::Owner));
        assert!(matches!(deduper.join(key).await, DedupeWait::Owner));
    }
}
