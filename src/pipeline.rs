//! Query pipeline (C6): end-to-end per-query orchestration as a linear
//! sequence of conditional fall-throughs, driven by plain `Result` returns
//! from transport rather than any nonlocal control flow.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::core::Core;
use crate::dedupe::{DedupeResult, DedupeWait};
use crate::events::{QueryEvent, ResolverTag};
use crate::transport;
use crate::wire::Message;
use crate::wire::message::synthesize_servfail;

/// Resolves one client request end to end and returns the bytes to write
/// back to `client_addr`. Never fails: on total upstream failure a
/// synthesized SERVFAIL is returned instead of an error, matching the
/// "clients never observe a missing response for a well-formed query"
/// invariant.
pub async fn resolve(core: &Core, request: Message, client_addr: SocketAddr) -> Bytes {
    let started = Instant::now();
    let qname = request.qname().unwrap_or("").to_string();
    let qtype = request
        .question
        .as_ref()
        .map(|q| q.qtype)
        .unwrap_or(crate::wire::enums::QType::A);

    if core.config.enable_query_deduplication {
        let key = crate::dedupe::Deduper::key(&qname, qtype);
        match core.dedupe.join(key.clone()).await {
            DedupeWait::Owner => {
                let (response_bytes, tag) = resolve_uncached(core, &request, &qname).await;
                std::sync::Arc::clone(&core.dedupe).complete(
                    key,
                    DedupeResult {
                        bytes: response_bytes.clone(),
                        resolver_tag: tag,
                    },
                );
                emit_and_count(core, &qname, qtype, client_addr, tag, started, &response_bytes);
                return response_bytes;
            }
            DedupeWait::Completed(result) => {
                let rewritten = rewrite_id(&result.bytes, request.id());
                emit_and_count(core, &qname, qtype, client_addr, result.resolver_tag, started, &rewritten);
                return rewritten;
            }
            DedupeWait::TimedOut => {
                let (response_bytes, tag) = resolve_uncached(core, &request, &qname).await;
                emit_and_count(core, &qname, qtype, client_addr, tag, started, &response_bytes);
                return response_bytes;
            }
        }
    }

    let (response_bytes, tag) = resolve_uncached(core, &request, &qname).await;
    emit_and_count(core, &qname, qtype, client_addr, tag, started, &response_bytes);
    response_bytes
}

/// Records a primary failure with the bypass cache and, if this call just
/// triggered a fresh bypass, emits the `DOMAIN_BYPASSED` state event.
fn note_primary_failure(core: &Core, qname: &str) {
    if let Some(bypass_seconds) = core.bypass.record_primary_result(qname, false) {
        core.events.emit_state(
            crate::events::StateEvent::new(crate::events::Level::Warn, format!("DOMAIN_BYPASSED {qname}"))
                .with_field("seconds", bypass_seconds),
        );
    }
}

async fn resolve_uncached(core: &Core, request: &Message, qname: &str) -> (Bytes, ResolverTag) {
    if core.bypass.should_bypass(qname) {
        if let Some((bytes, true)) = try_fallback_chain(core, request).await {
            return (bytes, ResolverTag::Bypassed);
        }
        return (synthesize_servfail(request), ResolverTag::Servfail);
    }

    let primary = core.selector.chain()[0].clone();
    let attempt_start = Instant::now();
    let primary_error = match transport::query(&primary, request, core.config.primary_timeout).await {
        Ok(response) => {
            core.metrics
                .record_upstream_attempt(&primary.name, true, attempt_start.elapsed());
            core.bypass.record_primary_result(qname, true);
            core.selector.note_observed_success(&primary);
            return (response.raw, ResolverTag::Primary);
        }
        Err(e) => e,
    };
    core.metrics
        .record_upstream_attempt(&primary.name, false, attempt_start.elapsed());
    note_primary_failure(core, qname);
    std::sync::Arc::clone(&core.selector).note_observed_failure(&primary);

    if primary_error.is_transport_level() {
        if let Some((bytes, true)) = try_fallback_chain(core, request).await {
            return (bytes, ResolverTag::Fallback);
        }
    }

    (synthesize_servfail(request), ResolverTag::Servfail)
}

/// Tries the fallback resolvers in order: the selector's current pick
/// first (which is the primary itself if no failover has happened yet, in
/// which case the configured fallback list is walked instead), stopping at
/// the first success.
async fn try_fallback_chain(core: &Core, request: &Message) -> Option<(Bytes, bool)> {
    let chain = core.selector.chain();
    if chain.len() <= 1 {
        return None;
    }

    let current = core.selector.current();
    let candidates: Vec<_> = if current.name != chain[0].name {
        vec![current]
    } else {
        chain[1..].to_vec()
    };

    for endpoint in candidates {
        let attempt_start = Instant::now();
        match transport::query(&endpoint, request, core.config.fallback_timeout).await {
            Ok(response) => {
                core.metrics
                    .record_upstream_attempt(&endpoint.name, true, attempt_start.elapsed());
                return Some((response.raw, true));
            }
            Err(_) => {
                core.metrics
                    .record_upstream_attempt(&endpoint.name, false, attempt_start.elapsed());
            }
        }
    }

    Some((Bytes::new(), false))
}

/// Rewrites the first two bytes (the 16-bit transaction ID) of a dedupe
/// broadcast result so a waiting client accepts the reply as its own.
fn rewrite_id(bytes: &Bytes, id: u16) -> Bytes {
    if bytes.len() < 2 {
        return bytes.clone();
    }
    let mut out = bytes.to_vec();
    out[0..2].copy_from_slice(&id.to_be_bytes());
    Bytes::from(out)
}

fn emit_and_count(
    core: &Core,
    qname: &str,
    qtype: crate::wire::enums::QType,
    client_addr: SocketAddr,
    tag: ResolverTag,
    started: Instant,
    response: &Bytes,
) {
    let elapsed: Duration = started.elapsed();
    core.record_outcome(tag);
    core.metrics.record_query(tag.as_str(), elapsed);
    core.events.emit_query(QueryEvent {
        timestamp: chrono::Utc::now(),
        domain: qname.to_string(),
        client: client_addr,
        resolver: tag,
        response_time: elapsed.as_secs_f64(),
        query_type: qtype.to_string(),
        success: tag != ResolverTag::Servfail,
    });
    let _ = response;
}
