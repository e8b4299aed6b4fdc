//! Telemetry surface
//!
//! Counters and the duration histogram live in the shared backing so the
//! fleet aggregates naturally; gauges (queue depth, in-progress count) are
//! read live from their owning components at scrape time. Recording is
//! best-effort and never fails the operation being measured.

use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;
use uuid::Uuid;

use crate::backend::RedisPool;

/// Histogram bucket upper bounds in seconds
pub const DURATION_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0];

/// How long a worker heartbeat counts as fresh
pub const HEARTBEAT_FRESH_WINDOW: Duration = Duration::from_secs(30);

/// Label values for `transcription_requests_total`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Enqueued for a worker
    Submitted,

    /// Answered synchronously from the result cache
    Cached,

    /// Refused before enrollment
    Rejected,
}

impl RequestOutcome {
    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            RequestOutcome::Submitted => "submitted",
            RequestOutcome::Cached => "cached",
            RequestOutcome::Rejected => "rejected",
        }
    }
}

/// Aggregate health answer for operators
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// ok, degraded, or down
    pub status: HealthStatus,

    /// Whether the shared backing answers a PING
    pub queue_backend_reachable: bool,

    /// Whether any worker heartbeat landed inside the freshness window
    pub worker_heartbeat_fresh: bool,
}

/// Health traffic light
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Down,
}

/// Point-in-time counter values used to render the exposition
#[derive(Debug, Default, Clone)]
pub struct TelemetrySnapshot {
    /// Requests by outcome label
    pub requests: HashMap<String, i64>,

    /// Cache hit counter
    pub cache_hits: i64,

    /// Cache miss counter
    pub cache_misses: i64,

    /// Cumulative histogram bucket counts keyed by upper bound label
    pub duration_buckets: HashMap<String, i64>,

    /// Histogram sum of observations
    pub duration_sum: f64,

    /// Histogram observation count
    pub duration_count: i64,
}

/// Fleet-wide counters over the shared backing
#[derive(Clone)]
pub struct Telemetry {
    pool: RedisPool,
}

impl Telemetry {
    /// Create a telemetry handle
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    fn requests_key(&self, outcome: RequestOutcome) -> String {
        self.pool.key(format!("metrics:requests:{}", outcome.label()))
    }

    fn cache_hits_key(&self) -> String {
        self.pool.key("metrics:cache_hits")
    }

    fn cache_misses_key(&self) -> String {
        self.pool.key("metrics:cache_misses")
    }

    fn duration_buckets_key(&self) -> String {
        self.pool.key("metrics:duration:buckets")
    }

    fn duration_sum_key(&self) -> String {
        self.pool.key("metrics:duration:sum")
    }

    fn duration_count_key(&self) -> String {
        self.pool.key("metrics:duration:count")
    }

    fn heartbeats_key(&self) -> String {
        self.pool.key("workers:heartbeats")
    }

    fn now_secs() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }

    /// Count a submission by outcome
    pub async fn record_request(&self, outcome: RequestOutcome) {
        let key = self.requests_key(outcome);
        if let Err(e) = self.pool.conn().incr(&key).await {
            warn!(error = %e, "failed to record request counter");
        }
    }

    /// Count a result-cache hit
    pub async fn record_cache_hit(&self) {
        if let Err(e) = self.pool.conn().incr(&self.cache_hits_key()).await {
            warn!(error = %e, "failed to record cache hit");
        }
    }

    /// Count a result-cache miss
    pub async fn record_cache_miss(&self) {
        if let Err(e) = self.pool.conn().incr(&self.cache_misses_key()).await {
            warn!(error = %e, "failed to record cache miss");
        }
    }

    /// Observe one completed transcription duration
    pub async fn observe_duration(&self, seconds: f64) {
        let mut conn = self.pool.conn();
        let buckets_key = self.duration_buckets_key();

        for le in DURATION_BUCKETS {
            if seconds <= *le {
                if let Err(e) = conn.hincr(&buckets_key, &format_le(*le), 1).await {
                    warn!(error = %e, "failed to record duration bucket");
                    return;
                }
            }
        }
        let _ = conn.hincr(&buckets_key, "+Inf", 1).await;
        let _ = conn.incr_by_float(&self.duration_sum_key(), seconds).await;
        let _ = conn.incr(&self.duration_count_key()).await;
    }

    /// Refresh this worker's heartbeat and prune long-dead entries
    pub async fn heartbeat(&self, worker_id: Uuid) {
        let mut conn = self.pool.conn();
        let key = self.heartbeats_key();
        let now = Self::now_secs();
        if let Err(e) = conn.zadd(&key, now, &worker_id.to_string()).await {
            warn!(error = %e, "failed to record worker heartbeat");
            return;
        }
        let _ = conn
            .zremrangebyscore_upto(&key, now - HEARTBEAT_FRESH_WINDOW.as_secs_f64() * 10.0)
            .await;
    }

    /// Number of workers with a fresh heartbeat
    pub async fn fresh_workers(&self) -> i64 {
        let min = Self::now_secs() - HEARTBEAT_FRESH_WINDOW.as_secs_f64();
        self.pool
            .conn()
            .zcount_from(&self.heartbeats_key(), min)
            .await
            .unwrap_or(0)
    }

    /// Aggregate health answer
    pub async fn health(&self) -> HealthReport {
        let queue_backend_reachable = self.pool.health_check().await;
        let worker_heartbeat_fresh = queue_backend_reachable && self.fresh_workers().await > 0;

        let status = if !queue_backend_reachable {
            HealthStatus::Down
        } else if !worker_heartbeat_fresh {
            HealthStatus::Degraded
        } else {
            HealthStatus::Ok
        };

        HealthReport {
            status,
            queue_backend_reachable,
            worker_heartbeat_fresh,
        }
    }

    /// Read every counter for rendering
    pub async fn snapshot(&self) -> TelemetrySnapshot {
        let mut conn = self.pool.conn();
        let mut snapshot = TelemetrySnapshot::default();

        for outcome in [
            RequestOutcome::Submitted,
            RequestOutcome::Cached,
            RequestOutcome::Rejected,
        ] {
            let value = read_counter(&mut conn, &self.requests_key(outcome)).await;
            snapshot.requests.insert(outcome.label().to_string(), value);
        }

        snapshot.cache_hits = read_counter(&mut conn, &self.cache_hits_key()).await;
        snapshot.cache_misses = read_counter(&mut conn, &self.cache_misses_key()).await;

        if let Ok(buckets) = conn.hgetall(&self.duration_buckets_key()).await {
            snapshot.duration_buckets = buckets
                .into_iter()
                .filter_map(|(k, v)| v.parse().ok().map(|n| (k, n)))
                .collect();
        }
        snapshot.duration_sum = match conn.get(&self.duration_sum_key()).await {
            Ok(Some(data)) => String::from_utf8_lossy(&data).parse().unwrap_or(0.0),
            _ => 0.0,
        };
        snapshot.duration_count = read_counter(&mut conn, &self.duration_count_key()).await;

        snapshot
    }
}

async fn read_counter(conn: &mut crate::backend::RedisConnection, key: &str) -> i64 {
    match conn.get(key).await {
        Ok(Some(data)) => String::from_utf8_lossy(&data).parse().unwrap_or(0),
        _ => 0,
    }
}

fn format_le(le: f64) -> String {
    if le.fract() == 0.0 {
        format!("{}", le as i64)
    } else {
        format!("{}", le)
    }
}

/// Render the text exposition format served at /metrics
pub fn render_exposition(
    snapshot: &TelemetrySnapshot,
    queue_depth: i64,
    in_progress: i64,
) -> String {
    let mut out = String::with_capacity(1024);

    out.push_str("# HELP transcription_requests_total Submissions by outcome\n");
    out.push_str("# TYPE transcription_requests_total counter\n");
    for outcome in ["submitted", "cached", "rejected"] {
        let value = snapshot.requests.get(outcome).copied().unwrap_or(0);
        out.push_str(&format!(
            "transcription_requests_total{{outcome=\"{}\"}} {}\n",
            outcome, value
        ));
    }

    out.push_str("# HELP transcription_in_progress Jobs currently Processing\n");
    out.push_str("# TYPE transcription_in_progress gauge\n");
    out.push_str(&format!("transcription_in_progress {}\n", in_progress));

    out.push_str("# HELP transcription_duration_seconds Worker processing time\n");
    out.push_str("# TYPE transcription_duration_seconds histogram\n");
    for le in DURATION_BUCKETS {
        let label = format_le(*le);
        let value = snapshot.duration_buckets.get(&label).copied().unwrap_or(0);
        out.push_str(&format!(
            "transcription_duration_seconds_bucket{{le=\"{}\"}} {}\n",
            label, value
        ));
    }
    let inf = snapshot.duration_buckets.get("+Inf").copied().unwrap_or(0);
    out.push_str(&format!(
        "transcription_duration_seconds_bucket{{le=\"+Inf\"}} {}\n",
        inf
    ));
    out.push_str(&format!(
        "transcription_duration_seconds_sum {}\n",
        snapshot.duration_sum
    ));
    out.push_str(&format!(
        "transcription_duration_seconds_count {}\n",
        snapshot.duration_count
    ));

    out.push_str("# HELP queue_depth Pending entries in the work queue\n");
    out.push_str("# TYPE queue_depth gauge\n");
    out.push_str(&format!("queue_depth {}\n", queue_depth));

    out.push_str("# HELP cache_hits_total Result cache hits\n");
    out.push_str("# TYPE cache_hits_total counter\n");
    out.push_str(&format!("cache_hits_total {}\n", snapshot.cache_hits));

    out.push_str("# HELP cache_misses_total Result cache misses\n");
    out.push_str("# TYPE cache_misses_total counter\n");
    out.push_str(&format!("cache_misses_total {}\n", snapshot.cache_misses));

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(RequestOutcome::Submitted.label(), "submitted");
        assert_eq!(RequestOutcome::Cached.label(), "cached");
        assert_eq!(RequestOutcome::Rejected.label(), "rejected");
    }

    #[test]
    fn test_bucket_label_formatting() {
        assert_eq!(format_le(1.0), "1");
        assert_eq!(format_le(600.0), "600");
        assert_eq!(format_le(0.5), "0.5");
    }

    #[test]
    fn test_render_exposition_contains_normative_names() {
        let mut snapshot = TelemetrySnapshot::default();
        snapshot.requests.insert("submitted".to_string(), 3);
        snapshot.cache_hits = 2;
        snapshot.duration_buckets.insert("60".to_string(), 1);
        snapshot.duration_buckets.insert("+Inf".to_string(), 1);
        snapshot.duration_sum = 42.5;
        snapshot.duration_count = 1;

        let text = render_exposition(&snapshot, 7, 2);
        assert!(text.contains("transcription_requests_total{outcome=\"submitted\"} 3"));
        assert!(text.contains("transcription_requests_total{outcome=\"rejected\"} 0"));
        assert!(text.contains("transcription_in_progress 2"));
        assert!(text.contains("queue_depth 7"));
        assert!(text.contains("cache_hits_total 2"));
        assert!(text.contains("cache_misses_total 0"));
        assert!(text.contains("transcription_duration_seconds_bucket{le=\"60\"} 1"));
        assert!(text.contains("transcription_duration_seconds_bucket{le=\"+Inf\"} 1"));
        assert!(text.contains("transcription_duration_seconds_count 1"));
    }

    #[test]
    fn test_health_status_serializes_lowercase() {
        let report = HealthReport {
            status: HealthStatus::Degraded,
            queue_backend_reachable: true,
            worker_heartbeat_fresh: false,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "degraded");
    }

    #[tokio::test]
    async fn test_counters_round_trip() {
        let pool = RedisPool::connect(BackendConfig {
            max_retries: 1,
            connect_timeout_ms: 500,
            key_prefix: format!("scribe-test-{}", uuid::Uuid::new_v4()),
            ..BackendConfig::default()
        })
        .await;

        if let Ok(pool) = pool {
            let telemetry = Telemetry::new(pool);

            telemetry.record_request(RequestOutcome::Submitted).await;
            telemetry.record_request(RequestOutcome::Submitted).await;
            telemetry.record_cache_hit().await;
            telemetry.observe_duration(12.0).await;

            let snapshot = telemetry.snapshot().await;
            assert_eq!(snapshot.requests.get("submitted").copied(), Some(2));
            assert_eq!(snapshot.cache_hits, 1);
            assert_eq!(snapshot.duration_count, 1);
            // 12s lands in every bucket from 30 upward
            assert_eq!(snapshot.duration_buckets.get("30").copied(), Some(1));
            assert_eq!(snapshot.duration_buckets.get("10").copied(), None);
            assert_eq!(snapshot.duration_buckets.get("+Inf").copied(), Some(1));
        }
    }

    #[tokio::test]
    async fn test_heartbeat_freshness() {
        let pool = RedisPool::connect(BackendConfig {
            max_retries: 1,
            connect_timeout_ms: 500,
            key_prefix: format!("scribe-test-{}", uuid::Uuid::new_v4()),
            ..BackendConfig::default()
        })
        .await;

        if let Ok(pool) = pool {
            let telemetry = Telemetry::new(pool);
            assert_eq!(telemetry.fresh_workers().await, 0);

            telemetry.heartbeat(uuid::Uuid::new_v4()).await;
            assert_eq!(telemetry.fresh_workers().await, 1);

            let health = telemetry.health().await;
            assert_eq!(health.status, HealthStatus::Ok);
            assert!(health.queue_backend_reachable);
            assert!(health.worker_heartbeat_fresh);
        }
    }
}
