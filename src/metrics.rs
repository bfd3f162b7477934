//! Status endpoint
//!
//! Counters for the aquarium exposed over a tiny HTTP server:
//! `/` (live fish count), `/health` (JSON liveness), `/metrics`
//! (Prometheus text) and `/metrics/json`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Samples kept for tick-time percentiles
const TICK_HISTORY: usize = 1000;

#[derive(Debug)]
pub struct Metrics {
    // Population
    pub sessions_active: AtomicU64,
    pub sessions_total: AtomicU64,
    pub fish_count: AtomicU64,
    pub epochs_started: AtomicU64,

    // Negotiation outcomes
    pub negotiations_reported: AtomicU64,
    pub negotiations_defaulted: AtomicU64,

    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,

    // Broadcast
    pub bytes_broadcast: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub clicks: AtomicU64,

    start_time: Instant,
    tick_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            sessions_active: AtomicU64::new(0),
            sessions_total: AtomicU64::new(0),
            fish_count: AtomicU64::new(0),
            epochs_started: AtomicU64::new(0),
            negotiations_reported: AtomicU64::new(0),
            negotiations_defaulted: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            bytes_broadcast: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            clicks: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(TICK_HISTORY)),
        }
    }

    /// Record a tick's duration and refresh the percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > TICK_HISTORY {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();
            let p95 = ((sorted.len() as f32 * 0.95) as usize).min(sorted.len() - 1);
            self.tick_time_p95_us.store(sorted[p95], Ordering::Relaxed);
            self.tick_time_max_us
                .store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(2048);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("reef_sessions_active", "Connected sessions", "gauge",
            self.sessions_active.load(Ordering::Relaxed));
        metric!("reef_sessions_total", "Sessions registered since start", "counter",
            self.sessions_total.load(Ordering::Relaxed));
        metric!("reef_fish", "Fish in the aquarium", "gauge",
            self.fish_count.load(Ordering::Relaxed));
        metric!("reef_epochs_total", "Aquarium epochs started", "counter",
            self.epochs_started.load(Ordering::Relaxed));
        metric!("reef_negotiations_reported_total", "Negotiations answered by the terminal", "counter",
            self.negotiations_reported.load(Ordering::Relaxed));
        metric!("reef_negotiations_defaulted_total", "Negotiations that fell back to defaults", "counter",
            self.negotiations_defaulted.load(Ordering::Relaxed));

        metric!("reef_tick_time_microseconds", "Last tick time in microseconds", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("reef_tick_time_p95_microseconds", "95th percentile tick time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("reef_tick_time_max_microseconds", "Maximum recent tick time", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));
        metric!("reef_tick_count", "Total ticks processed", "counter",
            self.tick_count.load(Ordering::Relaxed));

        metric!("reef_bytes_broadcast_total", "Bytes queued to sessions", "counter",
            self.bytes_broadcast.load(Ordering::Relaxed));
        metric!("reef_frames_dropped_total", "Frames dropped on full session queues", "counter",
            self.frames_dropped.load(Ordering::Relaxed));
        metric!("reef_clicks_total", "Clicks that nudged a fish", "counter",
            self.clicks.load(Ordering::Relaxed));
        metric!("reef_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions: SessionStats {
                active: self.sessions_active.load(Ordering::Relaxed),
                total: self.sessions_total.load(Ordering::Relaxed),
            },
            aquarium: AquariumStats {
                fish: self.fish_count.load(Ordering::Relaxed),
                epochs: self.epochs_started.load(Ordering::Relaxed),
                negotiations_reported: self.negotiations_reported.load(Ordering::Relaxed),
                negotiations_defaulted: self.negotiations_defaulted.load(Ordering::Relaxed),
                clicks: self.clicks.load(Ordering::Relaxed),
            },
            performance: PerformanceStats {
                tick_time_us: self.tick_time_us.load(Ordering::Relaxed),
                tick_time_p95_us: self.tick_time_p95_us.load(Ordering::Relaxed),
                tick_time_max_us: self.tick_time_max_us.load(Ordering::Relaxed),
                tick_count: self.tick_count.load(Ordering::Relaxed),
            },
            network: NetworkStats {
                bytes_broadcast: self.bytes_broadcast.load(Ordering::Relaxed),
                frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            },
            uptime_seconds: self.uptime_seconds(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub sessions: SessionStats,
    pub aquarium: AquariumStats,
    pub performance: PerformanceStats,
    pub network: NetworkStats,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AquariumStats {
    pub fish: u64,
    pub epochs: u64,
    pub negotiations_reported: u64,
    pub negotiations_defaulted: u64,
    pub clicks: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStats {
    pub tick_time_us: u64,
    pub tick_time_p95_us: u64,
    pub tick_time_max_us: u64,
    pub tick_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkStats {
    pub bytes_broadcast: u64,
    pub frames_dropped: u64,
}

/// Body of `/health`
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    /// Seconds since the Unix epoch
    pub timestamp: u64,
}

impl HealthStatus {
    pub fn now() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            status: "ok",
            timestamp,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the full HTTP response for a raw request
fn respond(metrics: &Metrics, request: &str) -> String {
    let path = request
        .lines()
        .next()
        .and_then(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("GET"), Some(path)) => Some(path),
                _ => None,
            }
        })
        .unwrap_or("");

    let (status, content_type, body) = match path {
        "/metrics" => ("200 OK", "text/plain; version=0.0.4", metrics.to_prometheus()),
        "/metrics/json" => ("200 OK", "application/json", metrics.to_json()),
        "/" => (
            "200 OK",
            "text/plain; charset=utf-8",
            format!("Fish in the aquarium: {}\n", metrics.fish_count.load(Ordering::Relaxed)),
        ),
        "/health" => (
            "200 OK",
            "application/json",
            serde_json::to_string(&HealthStatus::now()).unwrap_or_else(|_| "{}".to_string()),
        ),
        _ => ("404 Not Found", "text/plain", String::new()),
    };

    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
}

/// Serve the status endpoint until the listener fails
pub async fn start_status_server(metrics: Arc<Metrics>, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Status server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];
            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    let response = respond(&metrics, &request);
                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write status response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => debug!("Failed to read from status socket {}: {}", peer, e),
            }
        });
    }
}
