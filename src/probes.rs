//! Built-in readiness and health probes.
//!
//! Probes are plain `() -> bool` callables; the supervisor core never
//! does HTTP itself. Expected failure modes (connection refused, slow
//! server) return false rather than erroring, so a booting service reads
//! as "not ready yet" instead of crashing the poll loop.

use std::time::Duration;

use crate::process;

/// Per-request timeout for HTTP probes. Kept short: the poll loop retries,
/// and the monitor wraps calls in its own bound anyway.
const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// One-shot HTTP check: true on any 2xx response.
pub fn http_check(url: &str) -> bool {
    let client = match reqwest::blocking::Client::builder()
        .timeout(HTTP_PROBE_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(_) => return false,
    };
    client
        .get(url)
        .send()
        .map(|response| response.status().is_success())
        .unwrap_or(false)
}

/// Reusable HTTP probe against a fixed URL.
pub fn http_probe(url: String) -> impl Fn() -> bool + Send + Sync + 'static {
    move || http_check(&url)
}

/// Probe that reports whether a pid is still alive. Used for frontend
/// dev servers that expose no health endpoint.
pub fn process_alive_probe(pid: u32) -> impl Fn() -> bool + Send + Sync + 'static {
    move || process::is_process_alive(pid)
}
