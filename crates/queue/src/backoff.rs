use std::time::Duration;

use rand::Rng;

/// Exponential back-off for retried records:
/// `base * 2^(attempts-1) * (1 ± jitter)`, capped at `cap`. A server-supplied
/// `Retry-After` wins when it is larger than the computed delay.
pub fn retry_delay(
    attempts: u32,
    base: Duration,
    cap: Duration,
    jitter: f64,
    retry_after: Option<Duration>,
) -> Duration {
    let exp = attempts.saturating_sub(1).min(16);
    let raw = base.as_secs_f64() * 2f64.powi(exp as i32);

    let jitter = jitter.clamp(0.0, 1.0);
    let factor = if jitter > 0.0 {
        1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
    } else {
        1.0
    };

    let computed = Duration::from_secs_f64((raw * factor).min(cap.as_secs_f64()).max(0.0));

    match retry_after {
        Some(hint) if hint > computed => hint.min(cap),
        _ => computed,
    }
}
