use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

/// Process-wide gateway counters rendered in the Prometheus text format.
pub struct GatewayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_frames_total: Mutex<HashMap<String, u64>>,
    ws_frame_errors_total: Mutex<HashMap<String, u64>>,
    store_failures_total: Mutex<HashMap<String, u64>>,
    evictions_total: Mutex<HashMap<String, u64>>,
    live_clients: AtomicI64,
    bus_publishes_total: AtomicU64,
    superseded_sessions_total: AtomicU64,
    payloads_processed_total: AtomicU64,
    broadcast_frames_total: AtomicU64,
    direct_replies_total: AtomicU64,
}

const EVICTION_REASONS: [&str; 2] = ["backpressure", "closed"];
static GLOBAL_METRICS: OnceLock<Arc<GatewayMetrics>> = OnceLock::new();

impl Default for GatewayMetrics {
    fn default() -> Self {
        let mut evictions_total = HashMap::new();
        for reason in EVICTION_REASONS {
            evictions_total.insert(reason.to_string(), 0);
        }

        Self {
            request_duration_count: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_rate_total: Mutex::new(HashMap::new()),
            ws_frames_total: Mutex::new(HashMap::new()),
            ws_frame_errors_total: Mutex::new(HashMap::new()),
            store_failures_total: Mutex::new(HashMap::new()),
            evictions_total: Mutex::new(evictions_total),
            live_clients: AtomicI64::new(0),
            bus_publishes_total: AtomicU64::new(0),
            superseded_sessions_total: AtomicU64::new(0),
            payloads_processed_total: AtomicU64::new(0),
            broadcast_frames_total: AtomicU64::new(0),
            direct_replies_total: AtomicU64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<GatewayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<GatewayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_ws_frame(kind: &str, is_error: bool) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_frame(kind, is_error);
    }
}

pub fn set_live_clients(count: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.set_live_clients(count);
    }
}

pub fn increment_evictions(reason: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.increment_evictions(reason);
    }
}

pub fn increment_bus_publishes() {
    if let Some(metrics) = global_metrics() {
        metrics.increment_bus_publishes();
    }
}

pub fn increment_superseded_sessions() {
    if let Some(metrics) = global_metrics() {
        metrics.increment_superseded_sessions();
    }
}

pub fn increment_store_failures(operation: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.increment_store_failures(operation);
    }
}

pub fn increment_payloads_processed() {
    if let Some(metrics) = global_metrics() {
        metrics.increment_payloads_processed();
    }
}

pub fn record_broadcast(delivered: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.record_broadcast(delivered);
    }
}

pub fn increment_direct_replies() {
    if let Some(metrics) = global_metrics() {
        metrics.increment_direct_replies();
    }
}

impl GatewayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_ws_frame(&self, kind: &str, is_error: bool) {
        let label = normalize_label(kind);
        increment_label_counter(&self.ws_frames_total, &label, 1);
        if is_error {
            increment_label_counter(&self.ws_frame_errors_total, &label, 1);
        }
    }

    pub fn set_live_clients(&self, count: usize) {
        let count = i64::try_from(count).unwrap_or(i64::MAX);
        self.live_clients.store(count, Ordering::SeqCst);
    }

    pub fn increment_evictions(&self, reason: &str) {
        let mut guard = self.evictions_total.lock().expect("metrics map lock poisoned");
        let normalized = normalize_eviction_reason(reason);
        let value = guard.entry(normalized).or_insert(0);
        *value = value.saturating_add(1);
    }

    pub fn increment_bus_publishes(&self) {
        self.bus_publishes_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_superseded_sessions(&self) {
        self.superseded_sessions_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_store_failures(&self, operation: &str) {
        increment_label_counter(&self.store_failures_total, &normalize_label(operation), 1);
    }

    pub fn increment_payloads_processed(&self) {
        self.payloads_processed_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_broadcast(&self, delivered: usize) {
        let delivered = u64::try_from(delivered).unwrap_or(u64::MAX);
        self.broadcast_frames_total.fetch_add(delivered, Ordering::SeqCst);
    }

    pub fn increment_direct_replies(&self) {
        self.direct_replies_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP gateway_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE gateway_request_rate_total counter\n");
        append_counter_lines(&mut output, "gateway_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP gateway_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE gateway_request_errors_total counter\n");
        append_counter_lines(
            &mut output,
            "gateway_request_errors_total",
            &self.request_errors_total,
        );

        output.push_str(
            "# HELP gateway_request_duration_ms_sum Sum of HTTP request latency in milliseconds.\n",
        );
        output.push_str("# TYPE gateway_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "gateway_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str(
            "# HELP gateway_request_duration_ms_count Count of HTTP request latency samples.\n",
        );
        output.push_str("# TYPE gateway_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "gateway_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP gateway_ws_frames_total Inbound socket frames by type.\n");
        output.push_str("# TYPE gateway_ws_frames_total counter\n");
        append_label_counter_lines(
            &mut output,
            "gateway_ws_frames_total",
            "type",
            &self.ws_frames_total,
        );

        output.push_str(
            "# HELP gateway_ws_frame_errors_total Undecodable inbound socket frames.\n",
        );
        output.push_str("# TYPE gateway_ws_frame_errors_total counter\n");
        append_label_counter_lines(
            &mut output,
            "gateway_ws_frame_errors_total",
            "type",
            &self.ws_frame_errors_total,
        );

        output.push_str(
            "# HELP gateway_payloads_processed_total Payloads run through the hub pipeline.\n",
        );
        output.push_str("# TYPE gateway_payloads_processed_total counter\n");
        output.push_str(&format!(
            "gateway_payloads_processed_total {}\n",
            self.payloads_processed_total.load(Ordering::SeqCst)
        ));

        output.push_str(
            "# HELP gateway_broadcast_frames_total Chat frames queued to session listeners.\n",
        );
        output.push_str("# TYPE gateway_broadcast_frames_total counter\n");
        output.push_str(&format!(
            "gateway_broadcast_frames_total {}\n",
            self.broadcast_frames_total.load(Ordering::SeqCst)
        ));

        output.push_str(
            "# HELP gateway_direct_replies_total Frames queued to a single client.\n",
        );
        output.push_str("# TYPE gateway_direct_replies_total counter\n");
        output.push_str(&format!(
            "gateway_direct_replies_total {}\n",
            self.direct_replies_total.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP gateway_live_clients Clients currently registered with the hub.\n");
        output.push_str("# TYPE gateway_live_clients gauge\n");
        output.push_str(&format!(
            "gateway_live_clients {}\n",
            self.live_clients.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP gateway_evictions_total Clients dropped by the hub by reason.\n");
        output.push_str("# TYPE gateway_evictions_total counter\n");
        append_label_counter_lines(
            &mut output,
            "gateway_evictions_total",
            "reason",
            &self.evictions_total,
        );

        output.push_str(
            "# HELP gateway_superseded_sessions_total Sessions notified of a newer login.\n",
        );
        output.push_str("# TYPE gateway_superseded_sessions_total counter\n");
        output.push_str(&format!(
            "gateway_superseded_sessions_total {}\n",
            self.superseded_sessions_total.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP gateway_bus_publishes_total Frames published to the bus.\n");
        output.push_str("# TYPE gateway_bus_publishes_total counter\n");
        output.push_str(&format!(
            "gateway_bus_publishes_total {}\n",
            self.bus_publishes_total.load(Ordering::SeqCst)
        ));

        output.push_str(
            "# HELP gateway_store_failures_total Failed session store calls by operation.\n",
        );
        output.push_str("# TYPE gateway_store_failures_total counter\n");
        append_label_counter_lines(
            &mut output,
            "gateway_store_failures_total",
            "operation",
            &self.store_failures_total,
        );

        output
    }
}

fn normalize_endpoint(path: &str) -> String {
    let segments: Vec<String> = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            if segment.chars().all(|character| character.is_ascii_digit()) {
                "{number}".to_string()
            } else {
                segment.to_string()
            }
        })
        .collect();

    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

fn normalize_eviction_reason(reason: &str) -> String {
    let normalized = reason.trim().to_ascii_lowercase();
    if EVICTION_REASONS.contains(&normalized.as_str()) {
        normalized
    } else {
        "unknown".to_string()
    }
}

fn normalize_label(label: &str) -> String {
    let normalized = label.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::GatewayMetrics;

    #[test]
    fn render_prometheus_includes_http_socket_and_hub_metrics() {
        let metrics = GatewayMetrics::default();
        metrics.record_http_request("get", "/healthz", 200, 3);
        metrics.record_http_request("GET", "/sessions/42", 503, 9);
        metrics.record_ws_frame("MESSAGE", false);
        metrics.record_ws_frame("MESSAGE", false);
        metrics.record_ws_frame("malformed", true);
        metrics.set_live_clients(4);
        metrics.increment_evictions("backpressure");
        metrics.increment_evictions("not-a-reason");
        metrics.increment_superseded_sessions();
        metrics.increment_bus_publishes();
        metrics.increment_bus_publishes();
        metrics.increment_store_failures("history_append");
        metrics.increment_payloads_processed();
        metrics.record_broadcast(3);
        metrics.record_broadcast(2);
        metrics.increment_direct_replies();

        let rendered = metrics.render_prometheus();

        assert!(rendered
            .contains("gateway_request_rate_total{method=\"GET\",endpoint=\"/healthz\"} 1"));
        assert!(rendered.contains(
            "gateway_request_errors_total{method=\"GET\",endpoint=\"/sessions/{number}\"} 1"
        ));
        assert!(rendered.contains("gateway_ws_frames_total{type=\"message\"} 2"));
        assert!(rendered.contains("gateway_ws_frame_errors_total{type=\"malformed\"} 1"));
        assert!(rendered.contains("gateway_live_clients 4"));
        assert!(rendered.contains("gateway_evictions_total{reason=\"backpressure\"} 1"));
        assert!(rendered.contains("gateway_evictions_total{reason=\"closed\"} 0"));
        assert!(rendered.contains("gateway_evictions_total{reason=\"unknown\"} 1"));
        assert!(rendered.contains("gateway_superseded_sessions_total 1"));
        assert!(rendered.contains("gateway_bus_publishes_total 2"));
        assert!(rendered.contains("gateway_store_failures_total{operation=\"history_append\"} 1"));
        assert!(rendered.contains("gateway_payloads_processed_total 1"));
        assert!(rendered.contains("gateway_broadcast_frames_total 5"));
        assert!(rendered.contains("gateway_direct_replies_total 1"));
    }

    #[test]
    fn empty_metrics_still_render_gauges() {
        let rendered = GatewayMetrics::default().render_prometheus();
        assert!(rendered.contains("gateway_live_clients 0"));
        assert!(rendered.contains("gateway_bus_publishes_total 0"));
        assert!(!rendered.contains("gateway_ws_frames_total{"));
    }
}
