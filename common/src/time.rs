use std::time::{Duration, Instant};

/// A monotonic instant used for lease deadlines and lock timeouts.
///
/// Per spec, lease deadlines must never be derived from wall-clock time
/// (which can skew or jump across nodes); everything that matters for
/// correctness is computed relative to `Instant::now()` on the node that
/// commits the grant/renewal.
pub fn now() -> Instant {
    Instant::now()
}

pub fn deadline_from(ttl: Duration) -> Instant {
    Instant::now() + ttl
}
