//! Wall-clock helpers.
//!
//! The wire format carries timestamps as float seconds since the Unix
//! epoch. Everything time-sensitive in the library (gradient expiry, nonce
//! retention, throttle gates) takes an explicit `now` parameter internally
//! so tests can drive the clock; these helpers supply the real value at the
//! public surface.

/// Current wall-clock time as float seconds since the Unix epoch.
pub fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Monotonic milliseconds since an arbitrary process-local origin. Used by
/// throttle gates and latency measurement, where wall-clock jumps must not
/// open or close windows.
pub fn monotonic_ms() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    ORIGIN.get_or_init(Instant::now).elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_secs_is_past_2020() {
        assert!(now_secs() > 1_577_836_800.0);
    }

    #[test]
    fn monotonic_never_decreases() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
    }
}
