//! ---
//! dloc_section: "01-core-functionality"
//! dloc_subsection: "module"
//! dloc_type: "source"
//! dloc_scope: "code"
//! dloc_description: "Duration conversion and jitter helpers."
//! dloc_version: "v0.0.0-prealpha"
//! dloc_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

/// Convert a duration into milliseconds, saturating at `u64::MAX`.
pub fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Milliseconds elapsed since `started`, for log fields.
pub fn elapsed_ms(started: Instant) -> u64 {
    duration_to_millis(started.elapsed())
}

/// Add up to `jitter` of spread to `base`, using `sample` in `[0, 1]`.
pub fn with_jitter(base: Duration, jitter: Duration, sample: f64) -> Duration {
    base + jitter.mul_f64(sample.clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_saturate() {
        assert_eq!(duration_to_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(duration_to_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn jitter_is_bounded() {
        let base = Duration::from_millis(100);
        let jitter = Duration::from_millis(20);
        assert_eq!(with_jitter(base, jitter, 0.0), base);
        assert_eq!(with_jitter(base, jitter, 4.0), Duration::from_millis(120));
    }
}
