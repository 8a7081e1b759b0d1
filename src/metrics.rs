//! Метрики шлюза в формате Prometheus (RED: Rate, Errors, Duration).

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Upper bucket bounds in seconds; +Inf is the total count.
const DURATION_BUCKETS: [f64; 11] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

const OPERATIONS: [&str; 5] = ["bind", "search", "abandon", "unbind", "unsupported"];

#[derive(Debug, Default)]
struct DurationHistogram {
    buckets: [AtomicU64; 11],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl DurationHistogram {
    fn observe(&self, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        let secs = duration.as_secs_f64();
        // non-cumulative storage, summed up on render
        if let Some(i) = DURATION_BUCKETS.iter().position(|&le| secs <= le) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

/// Lock-free counters shared by all connections.
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    parse_errors: AtomicU64,
    requests: [AtomicU64; 5],
    errors: [AtomicU64; 5],
    entries_sent: AtomicU64,
    searches_abandoned: AtomicU64,
    search_duration: DurationHistogram,
}

fn operation_index(op: &str) -> Option<usize> {
    OPERATIONS.iter().position(|&o| o == op)
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_connections(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a request by operation ("bind", "search", "abandon", "unbind", "unsupported").
    #[inline]
    pub fn inc_request(&self, op: &str) {
        if let Some(i) = operation_index(op) {
            self.requests[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn inc_error(&self, op: &str) {
        if let Some(i) = operation_index(op) {
            self.errors[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn add_entries_sent(&self, count: usize) {
        self.entries_sent.fetch_add(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_abandoned(&self) {
        self.searches_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn observe_search(&self, duration: Duration) {
        self.search_duration.observe(duration);
    }

    /// Рендер метрик в текстовом формате Prometheus (exposition format).
    pub fn render(&self, active_searches: usize) -> String {
        let mut out = String::new();
        push_metric(
            &mut out,
            "ldap_gal_connections_total",
            "counter",
            "Total number of client connections accepted.",
            self.connections_total.load(Ordering::Relaxed),
        );
        push_metric(
            &mut out,
            "ldap_gal_parse_errors_total",
            "counter",
            "Total number of undecodable LDAP messages.",
            self.parse_errors.load(Ordering::Relaxed),
        );

        out.push_str("# HELP ldap_gal_requests_total Total LDAP requests by operation.\n");
        out.push_str("# TYPE ldap_gal_requests_total counter\n");
        for (op, val) in OPERATIONS.iter().zip(self.requests.iter()) {
            out.push_str(&format!(
                "ldap_gal_requests_total{{op=\"{}\"}} {}\n",
                op,
                val.load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP ldap_gal_errors_total Total failed requests by operation.\n");
        out.push_str("# TYPE ldap_gal_errors_total counter\n");
        for (op, val) in OPERATIONS.iter().zip(self.errors.iter()) {
            out.push_str(&format!(
                "ldap_gal_errors_total{{op=\"{}\"}} {}\n",
                op,
                val.load(Ordering::Relaxed)
            ));
        }

        push_metric(
            &mut out,
            "ldap_gal_entries_sent_total",
            "counter",
            "Total search result entries sent to clients.",
            self.entries_sent.load(Ordering::Relaxed),
        );
        push_metric(
            &mut out,
            "ldap_gal_searches_abandoned_total",
            "counter",
            "Total searches stopped by ABANDON or disconnect.",
            self.searches_abandoned.load(Ordering::Relaxed),
        );
        push_metric(
            &mut out,
            "ldap_gal_active_searches",
            "gauge",
            "Searches currently running.",
            active_searches as u64,
        );

        let hist = &self.search_duration;
        out.push_str("# HELP ldap_gal_search_duration_seconds Search duration in seconds.\n");
        out.push_str("# TYPE ldap_gal_search_duration_seconds histogram\n");
        let count = hist.count.load(Ordering::Relaxed);
        let mut cumulative = 0u64;
        for (i, le) in DURATION_BUCKETS.iter().enumerate() {
            cumulative += hist.buckets[i].load(Ordering::Relaxed);
            out.push_str(&format!(
                "ldap_gal_search_duration_seconds_bucket{{le=\"{}\"}} {}\n",
                le, cumulative
            ));
        }
        out.push_str(&format!("ldap_gal_search_duration_seconds_bucket{{le=\"+Inf\"}} {}\n", count));
        let sum_secs = hist.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        out.push_str(&format!("ldap_gal_search_duration_seconds_sum {}\n", sum_secs));
        out.push_str(&format!("ldap_gal_search_duration_seconds_count {}\n", count));

        out
    }
}

fn push_metric(out: &mut String, name: &str, kind: &str, help: &str, value: u64) {
    out.push_str(&format!("# HELP {} {}\n", name, help));
    out.push_str(&format!("# TYPE {} {}\n", name, kind));
    out.push_str(&format!("{} {}\n", name, value));
}

/// Извлекает путь из первой строки HTTP-запроса ("GET /health HTTP/1.1" -> "/health").
fn request_path(first_line: &str) -> &str {
    let mut parts = first_line.trim().split_ascii_whitespace();
    let _method = parts.next();
    let path = parts.next().unwrap_or("");
    if path.starts_with('/') {
        path
    } else {
        ""
    }
}

/// Serves GET /metrics and GET /health until the process exits.
/// `active_searches` is sampled on every /metrics request.
pub async fn run_metrics_server(
    addr: &str,
    metrics: Arc<Metrics>,
    active_searches: Arc<dyn Fn() -> usize + Send + Sync>,
) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics listen address: {}", addr))?;

    let listener = TcpListener::bind(&socket_addr)
        .await
        .with_context(|| format!("Failed to bind metrics server to {}", socket_addr))?;

    info!("Metrics server listening on http://{} (GET /metrics, /health)", socket_addr);

    loop {
        let (mut stream, _peer) = match listener.accept().await {
            Ok(accept) => accept,
            Err(e) => {
                error!("Metrics accept error: {}", e);
                continue;
            }
        };

        let metrics = Arc::clone(&metrics);
        let active_searches = Arc::clone(&active_searches);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let mut total = 0usize;
            loop {
                match stream.read(&mut buf[total..]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        total += n;
                        if buf[..total].windows(4).any(|w| w == b"\r\n\r\n") || total >= buf.len() {
                            break;
                        }
                    }
                    Err(_) => return,
                }
            }

            let request = String::from_utf8_lossy(&buf[..total]);
            let path = request.lines().next().map(request_path).unwrap_or("");

            let (status, body) = match path {
                "/health" => ("200 OK", "ok".to_string()),
                "/metrics" => ("200 OK", metrics.render(active_searches())),
                _ => ("404 Not Found", "Not found. Supported: GET /metrics, GET /health.\n".to_string()),
            };
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: text/plain; charset=utf-8\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
                status,
                body.len(),
                body
            );

            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::{request_path, Metrics};
    use std::time::Duration;

    #[test]
    fn test_request_path() {
        assert_eq!(request_path("GET /health HTTP/1.1"), "/health");
        assert_eq!(request_path("GET /metrics HTTP/1.0"), "/metrics");
        assert_eq!(request_path(""), "");
        assert_eq!(request_path("GET  HTTP/1.1"), "");
    }

    #[test]
    fn test_render_counters() {
        let m = Metrics::new();
        m.inc_connections();
        m.inc_request("search");
        m.inc_request("search");
        m.inc_request("bind");
        m.inc_error("bind");
        m.inc_request("compare");
        m.add_entries_sent(7);
        m.inc_abandoned();

        let out = m.render(3);
        assert!(out.contains("ldap_gal_connections_total 1\n"));
        assert!(out.contains("ldap_gal_requests_total{op=\"search\"} 2\n"));
        assert!(out.contains("ldap_gal_requests_total{op=\"bind\"} 1\n"));
        assert!(out.contains("ldap_gal_errors_total{op=\"bind\"} 1\n"));
        assert!(out.contains("ldap_gal_entries_sent_total 7\n"));
        assert!(out.contains("ldap_gal_searches_abandoned_total 1\n"));
        assert!(out.contains("ldap_gal_active_searches 3\n"));
        assert!(!out.contains("compare"));
    }

    #[test]
    fn test_search_histogram_is_cumulative() {
        let m = Metrics::new();
        m.observe_search(Duration::from_millis(3));
        m.observe_search(Duration::from_millis(200));
        m.observe_search(Duration::from_secs(30));

        let out = m.render(0);
        assert!(out.contains("ldap_gal_search_duration_seconds_bucket{le=\"0.005\"} 1\n"));
        assert!(out.contains("ldap_gal_search_duration_seconds_bucket{le=\"0.25\"} 2\n"));
        assert!(out.contains("ldap_gal_search_duration_seconds_bucket{le=\"10\"} 2\n"));
        assert!(out.contains("ldap_gal_search_duration_seconds_bucket{le=\"+Inf\"} 3\n"));
        assert!(out.contains("ldap_gal_search_duration_seconds_count 3\n"));
    }
}
