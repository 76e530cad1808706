use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, OnceLock,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

pub struct ServerMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_frames_total: Mutex<HashMap<String, u64>>,
    ws_errors_total: Mutex<HashMap<String, u64>>,
    ws_connections: AtomicI64,
    stream_events_total: Mutex<HashMap<String, u64>>,
    cleanup_jobs_total: Mutex<HashMap<String, u64>>,
    chat_messages_total: AtomicU64,
    leases_expired_total: AtomicU64,
}

const STREAM_EVENTS: [&str; 5] = ["started", "ended", "joined", "left", "reaped"];
const CLEANUP_OUTCOMES: [&str; 5] = ["ended", "skipped", "rescheduled", "abandoned", "unknown"];
static GLOBAL_METRICS: OnceLock<Arc<ServerMetrics>> = OnceLock::new();

impl Default for ServerMetrics {
    fn default() -> Self {
        Self {
            request_duration_count: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_rate_total: Mutex::new(HashMap::new()),
            ws_frames_total: Mutex::new(HashMap::new()),
            ws_errors_total: Mutex::new(HashMap::new()),
            ws_connections: AtomicI64::new(0),
            stream_events_total: Mutex::new(zeroed(&STREAM_EVENTS)),
            cleanup_jobs_total: Mutex::new(zeroed(&CLEANUP_OUTCOMES[..4])),
            chat_messages_total: AtomicU64::new(0),
            leases_expired_total: AtomicU64::new(0),
        }
    }
}

fn zeroed(labels: &[&str]) -> HashMap<String, u64> {
    labels.iter().map(|label| (label.to_string(), 0)).collect()
}

pub fn set_global_metrics(metrics: Arc<ServerMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

pub fn global_metrics() -> Option<&'static Arc<ServerMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn record_ws_frame(frame_type: &str, is_error: bool) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_frame(frame_type, is_error);
    }
}

pub fn adjust_ws_connections(delta: i64) {
    if let Some(metrics) = global_metrics() {
        metrics.ws_connections.fetch_add(delta, Ordering::SeqCst);
    }
}

pub fn record_stream_event(event: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_stream_event(event);
    }
}

pub fn record_cleanup_outcome(outcome: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_cleanup_outcome(outcome);
    }
}

pub fn record_chat_message() {
    if let Some(metrics) = global_metrics() {
        metrics.chat_messages_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn record_leases_expired(count: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.leases_expired_total.fetch_add(count, Ordering::SeqCst);
    }
}

impl ServerMetrics {
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

    pub fn record_ws_frame(&self, frame_type: &str, is_error: bool) {
        let label = normalize_label(frame_type);
        increment_label_counter(&self.ws_frames_total, &label, 1);
        if is_error {
            increment_label_counter(&self.ws_errors_total, &label, 1);
        }
    }

    pub fn record_stream_event(&self, event: &str) {
        let label = known_label(event, &STREAM_EVENTS);
        increment_label_counter(&self.stream_events_total, &label, 1);
    }

    pub fn record_cleanup_outcome(&self, outcome: &str) {
        let label = known_label(outcome, &CLEANUP_OUTCOMES);
        increment_label_counter(&self.cleanup_jobs_total, &label, 1);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP scrolllive_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE scrolllive_request_rate_total counter\n");
        append_counter_lines(&mut output, "scrolllive_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP scrolllive_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE scrolllive_request_errors_total counter\n");
        append_counter_lines(
            &mut output,
            "scrolllive_request_errors_total",
            &self.request_errors_total,
        );

        output.push_str("# HELP scrolllive_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE scrolllive_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "scrolllive_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP scrolllive_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE scrolllive_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "scrolllive_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP scrolllive_ws_frames_total Total websocket frames by type.\n");
        output.push_str("# TYPE scrolllive_ws_frames_total counter\n");
        append_label_counter_lines(
            &mut output,
            "scrolllive_ws_frames_total",
            "type",
            &self.ws_frames_total,
        );

        output.push_str(
            "# HELP scrolllive_ws_errors_total Total rejected websocket frames by type.\n",
        );
        output.push_str("# TYPE scrolllive_ws_errors_total counter\n");
        append_label_counter_lines(
            &mut output,
            "scrolllive_ws_errors_total",
            "type",
            &self.ws_errors_total,
        );

        output.push_str("# HELP scrolllive_ws_connections Open live feed websocket connections.\n");
        output.push_str("# TYPE scrolllive_ws_connections gauge\n");
        output.push_str(&format!(
            "scrolllive_ws_connections {}\n",
            self.ws_connections.load(Ordering::SeqCst).max(0)
        ));

        output.push_str("# HELP scrolllive_stream_events_total Stream lifecycle and presence events.\n");
        output.push_str("# TYPE scrolllive_stream_events_total counter\n");
        append_label_counter_lines(
            &mut output,
            "scrolllive_stream_events_total",
            "event",
            &self.stream_events_total,
        );

        output.push_str("# HELP scrolllive_cleanup_jobs_total Cleanup job runs by outcome.\n");
        output.push_str("# TYPE scrolllive_cleanup_jobs_total counter\n");
        append_label_counter_lines(
            &mut output,
            "scrolllive_cleanup_jobs_total",
            "outcome",
            &self.cleanup_jobs_total,
        );

        output.push_str("# HELP scrolllive_chat_messages_total Chat messages accepted.\n");
        output.push_str("# TYPE scrolllive_chat_messages_total counter\n");
        output.push_str(&format!(
            "scrolllive_chat_messages_total {}\n",
            self.chat_messages_total.load(Ordering::SeqCst)
        ));

        output.push_str(
            "# HELP scrolllive_leases_expired_total Participant presence leases that lapsed.\n",
        );
        output.push_str("# TYPE scrolllive_leases_expired_total counter\n");
        output.push_str(&format!(
            "scrolllive_leases_expired_total {}\n",
            self.leases_expired_total.load(Ordering::SeqCst)
        ));

        output
    }
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut normalized_segments = Vec::new();
    let mut previous = "";
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        if uuid::Uuid::parse_str(segment).is_ok() {
            normalized_segments.push("{uuid}".to_string());
        } else if previous == "participants" {
            // User ids are opaque strings from the identity provider.
            normalized_segments.push("{user_id}".to_string());
        } else if segment.chars().all(|character| character.is_ascii_digit()) {
            normalized_segments.push("{number}".to_string());
        } else {
            normalized_segments.push(segment.to_string());
        }
        previous = segment;
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn normalize_label(value: &str) -> String {
    let normalized = value.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn known_label(value: &str, allowed: &[&str]) -> String {
    let normalized = value.trim().to_ascii_lowercase();
    if allowed.contains(&normalized.as_str()) {
        normalized
    } else {
        "unknown".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = lock(map);
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = lock(map);
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = lock(map);
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
    let guard = lock(map);
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
