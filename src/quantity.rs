//! Parse Kubernetes resource Quantity values to numbers for comparison.
//! CPU is parsed to millicores, memory to bytes.

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// Parse a CPU quantity string (e.g. "500m", "2", "1.5") to millicores.
pub fn parse_cpu_str(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Some(m) = s.strip_suffix('m') {
        if let Ok(n) = m.parse::<i64>() {
            return Some(n);
        }
    }
    if let Some(n) = s.strip_suffix('n') {
        // Nanocores show up in metrics-server responses.
        if let Ok(n) = n.parse::<i64>() {
            return Some(n / 1_000_000);
        }
    }
    if let Ok(n) = s.parse::<f64>() {
        return Some((n * 1000.0) as i64);
    }
    None
}

/// Parse a memory quantity string (e.g. "256Mi", "1Gi", "500M") to bytes.
pub fn parse_memory_str(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let binary = s.ends_with('i');
    let s = s.trim_end_matches('i');

    let (num_str, unit) = if let Some(n) = s.strip_suffix(['K', 'k']) {
        (n, if binary { 1024_i64 } else { 1000 })
    } else if let Some(n) = s.strip_suffix('M') {
        (n, if binary { 1024_i64.pow(2) } else { 1000_i64.pow(2) })
    } else if let Some(n) = s.strip_suffix('G') {
        (n, if binary { 1024_i64.pow(3) } else { 1000_i64.pow(3) })
    } else if let Some(n) = s.strip_suffix('T') {
        (n, if binary { 1024_i64.pow(4) } else { 1000_i64.pow(4) })
    } else if let Some(n) = s.strip_suffix('P') {
        (n, if binary { 1024_i64.pow(5) } else { 1000_i64.pow(5) })
    } else if let Ok(n) = s.parse::<i64>() {
        return Some(n);
    } else if let Ok(n) = s.parse::<f64>() {
        return Some(n as i64);
    } else {
        return None;
    };

    let n: f64 = num_str.parse().ok()?;
    Some((n * unit as f64) as i64)
}

pub fn cpu_millis(q: &Quantity) -> Option<i64> {
    parse_cpu_str(&q.0)
}

pub fn memory_bytes(q: &Quantity) -> Option<i64> {
    parse_memory_str(&q.0)
}

/// Sum of CPU requests across a pod's containers, in millicores.
/// Containers without a CPU request contribute zero.
pub fn pod_cpu_request_millis(pod: &Pod) -> i64 {
    sum_requests(pod, "cpu", cpu_millis)
}

/// Sum of memory requests across a pod's containers, in bytes.
pub fn pod_memory_request_bytes(pod: &Pod) -> i64 {
    sum_requests(pod, "memory", memory_bytes)
}

fn sum_requests(pod: &Pod, resource: &str, parse: fn(&Quantity) -> Option<i64>) -> i64 {
    let Some(spec) = &pod.spec else { return 0 };
    spec.containers
        .iter()
        .filter_map(|c| c.resources.as_ref())
        .filter_map(|r| r.requests.as_ref())
        .filter_map(|req| req.get(resource))
        .filter_map(parse)
        .sum()
}

/* ============================= TESTS ============================= */
