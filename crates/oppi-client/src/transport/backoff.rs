use std::time::Duration;

use rand::Rng;

/// Reconnect delay for `attempt`: `min(base^attempt, max)` seconds, jittered
/// by a uniform factor in `[0.75, 1.25]`.
pub fn reconnect_delay(attempt: u32, base: f64, max: Duration) -> Duration {
    let exp = base.powi(attempt.min(64) as i32);
    let capped = exp.min(max.as_secs_f64());
    let jitter = rand::rng().random_range(0.75..=1.25);
    Duration::from_secs_f64(capped * jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: Duration = Duration::from_secs(30);

    #[test]
    fn test_delay_within_jitter_band() {
        for attempt in 0..12 {
            let nominal = 2.0_f64.powi(attempt as i32).min(30.0);
            for _ in 0..50 {
                let delay = reconnect_delay(attempt, 2.0, MAX).as_secs_f64();
                assert!(
                    delay >= nominal * 0.75 - 1e-9 && delay <= nominal * 1.25 + 1e-9,
                    "attempt {attempt}: {delay} outside band around {nominal}"
                );
            }
        }
    }

    #[test]
    fn test_delay_capped() {
        let delay = reconnect_delay(40, 2.0, MAX);
        assert!(delay <= Duration::from_secs_f64(37.5));
        assert!(delay >= Duration::from_secs_f64(22.5));
    }

    #[test]
    fn test_delay_varies() {
        let samples: Vec<Duration> = (0..20).map(|_| reconnect_delay(3, 2.0, MAX)).collect();
        let first = samples[0];
        assert!(samples.iter().any(|d| *d != first));
    }
}
