//! Retry-after extraction from upstream 429 bodies.

use serde_json::Value;
use std::time::Duration;

/// Longest delay taken from an upstream body.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Suggested wait from a 429 body.
///
/// Looks at `error.details[].retryDelay` first, then `error.quotaResetDelay`.
/// Values are seconds, optionally suffixed with `s` (`"12.5s"`). Returns `None`
/// when the body is not JSON or carries no usable delay; callers pick the default.
pub fn parse_retry_delay(body: &str) -> Option<Duration> {
    let value: Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;

    let from_details = error
        .get("details")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|detail| detail.get("retryDelay").and_then(Value::as_str))
        .find_map(parse_seconds);

    from_details.or_else(|| {
        error
            .get("quotaResetDelay")
            .and_then(Value::as_str)
            .and_then(parse_seconds)
    })
}

fn parse_seconds(raw: &str) -> Option<Duration> {
    let digits = raw.strip_suffix('s').unwrap_or(raw);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    let secs: f64 = digits.parse().ok()?;
    if !secs.is_finite() {
        return None;
    }
    let delay = Duration::from_millis((secs * 1000.0).round() as u64);
    Some(delay.min(MAX_RETRY_DELAY))
}
