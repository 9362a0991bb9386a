//! Event sink (C8): structured per-query and state-change records, emitted
//! through `tracing` unconditionally and optionally appended to a
//! line-oriented file sink in JSON or text format.

use std::collections::VecDeque;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolverTag {
    /// Historical name kept for dashboard compatibility; denotes the primary.
    #[serde(rename = "unbound")]
    Primary,
    Fallback,
    Bypassed,
    Servfail,
}

impl ResolverTag {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolverTag::Primary => "primary",
            ResolverTag::Fallback => "fallback",
            ResolverTag::Bypassed => "bypassed",
            ResolverTag::Servfail => "servfail",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryEvent {
    pub timestamp: chrono::DateTime<Utc>,
    pub domain: String,
    pub client: SocketAddr,
    pub resolver: ResolverTag,
    pub response_time: f64,
    pub query_type: String,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StateEvent {
    pub timestamp: chrono::DateTime<Utc>,
    #[serde(skip)]
    pub level: LevelSerde,
    pub message: String,
    pub tail: Vec<(String, String)>,
}

/// serde can't derive on the plain `Level` enum without extra ceremony for
/// the `skip`ped field above; this newtype keeps `Level` simple elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LevelSerde(pub Level);

impl Default for Level {
    fn default() -> Self {
        Level::Info
    }
}

impl StateEvent {
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        StateEvent {
            timestamp: Utc::now(),
            level: LevelSerde(level),
            message: message.into(),
            tail: Vec::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl std::fmt::Display) -> Self {
        self.tail.push((key.into(), value.to_string()));
        self
    }

    fn text_line(&self) -> String {
        let level = match self.level.0 {
            Level::Info => "INFO",
            Level::Warn => "WARN",
        };
        let tail = self
            .tail
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        if tail.is_empty() {
            format!("{} [{level}] {}", self.timestamp.to_rfc3339(), self.message)
        } else {
            format!("{} [{level}] {} {tail}", self.timestamp.to_rfc3339(), self.message)
        }
    }
}

pub enum Record {
    Query(QueryEvent),
    State(StateEvent),
}

const SINK_QUEUE_CAPACITY: usize = 4096;

/// Bounded, non-blocking event sink. `emit` never blocks the query
/// pipeline: a record arriving once the queue is at capacity evicts the
/// oldest queued record (drop-oldest) rather than being rejected itself.
pub struct EventSink {
    queue: Arc<Mutex<VecDeque<Record>>>,
    notify: Arc<Notify>,
    dropped: Arc<Mutex<u64>>,
    metrics: Option<Arc<crate::metrics::Metrics>>,
}

impl EventSink {
    /// Spawns the background writer task. `path` is the optional on-disk
    /// sink; every record is forwarded through `tracing` regardless.
    /// `metrics`, if given, receives a counter bump for every record dropped
    /// to make room in the queue.
    pub fn spawn(
        path: Option<std::path::PathBuf>,
        structured: bool,
        metrics: Option<Arc<crate::metrics::Metrics>>,
    ) -> Arc<Self> {
        let queue = Arc::new(Mutex::new(VecDeque::with_capacity(SINK_QUEUE_CAPACITY)));
        let notify = Arc::new(Notify::new());
        let dropped = Arc::new(Mutex::new(0u64));

        let writer = path.map(|p| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&p)
                .map(Mutex::new)
        });

        let writer_queue = Arc::clone(&queue);
        let writer_notify = Arc::clone(&notify);
        tokio::spawn(async move {
            let mut file = match writer {
                Some(Ok(file)) => Some(file),
                Some(Err(e)) => {
                    warn!("failed to open event sink file: {e}");
                    None
                }
                None => None,
            };

            loop {
                writer_notify.notified().await;
                while let Some(record) = writer_queue.lock().pop_front() {
                    forward_to_tracing(&record);
                    if let Some(file) = file.as_mut() {
                        let line = render(&record, structured);
                        let mut guard = file.lock();
                        if let Err(e) = writeln!(guard, "{line}") {
                            warn!("event sink write failed: {e}");
                        }
                    }
                }
            }
        });

        Arc::new(EventSink {
            queue,
            notify,
            dropped,
            metrics,
        })
    }

    pub fn emit_query(&self, event: QueryEvent) {
        self.emit(Record::Query(event));
    }

    pub fn emit_state(&self, event: StateEvent) {
        self.emit(Record::State(event));
    }

    /// Pushes `record` onto the queue, evicting the oldest queued record
    /// first if the queue is already at capacity.
    fn emit(&self, record: Record) {
        let mut guard = self.queue.lock();
        if guard.len() >= SINK_QUEUE_CAPACITY {
            guard.pop_front();
            *self.dropped.lock() += 1;
            if let Some(metrics) = &self.metrics {
                metrics.record_event_dropped();
            }
        }
        guard.push_back(record);
        drop(guard);
        self.notify.notify_one();
    }

    pub fn dropped_count(&self) -> u64 {
        *self.dropped.lock()
    }
}

fn forward_to_tracing(record: &Record) {
    match record {
        Record::Query(event) => {
            if !event.success {
                warn!(domain = %event.domain, resolver = event.resolver.as_str(), "query failed");
            } else {
                debug!(domain = %event.domain, resolver = event.resolver.as_str(), response_time = event.response_time, "query resolved");
            }
        }
        Record::State(event) => match event.level.0 {
            Level::Warn => warn!("{}", event.text_line()),
            Level::Info => info!("{}", event.text_line()),
        },
    }
}

fn render(record: &Record, structured: bool) -> String {
    match record {
        Record::Query(event) => {
            if structured {
                serde_json::to_string(event).unwrap_or_default()
            } else {
                format!(
                    "{} [QUERY] domain={} client={} resolver={} type={} success={} response_time={:.3}",
                    event.timestamp.to_rfc3339(),
                    event.domain,
                    event.client,
                    event.resolver.as_str(),
                    event.query_type,
                    event.success,
                    event.response_time,
                )
            }
        }
        Record::State(event) => {
            if structured {
                let tail: serde_json::Map<String, serde_json::Value> = event
                    .tail
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                    .collect();
                serde_json::json!({
                    "timestamp": event.timestamp.to_rfc3339(),
                    "level": if event.level.0 == Level::Warn { "warn" } else { "info" },
                    "message": event.message,
                    "fields": tail,
                })
                .to_string()
            } else {
                event.text_line()
            }
        }
    }
}
