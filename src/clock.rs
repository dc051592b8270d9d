use std::time::{Duration, Instant};

/// Effective wait for an operation bounded by a relative timeout and an
/// absolute deadline, either of which may be absent (infinite).
///
/// Returns `None` only when both bounds are infinite; an expired deadline
/// clamps to zero so callers degrade to a readiness check instead of
/// blocking.
pub(crate) fn expiry(timeout: Option<Duration>, deadline: Option<Instant>) -> Option<Duration> {
    let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
    match (timeout, remaining) {
        (None, None) => None,
        (Some(timeout), None) => Some(timeout),
        (None, Some(remaining)) => Some(remaining),
        (Some(timeout), Some(remaining)) => Some(timeout.min(remaining)),
    }
}
