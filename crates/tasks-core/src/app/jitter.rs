use rand::Rng;
use std::time::Duration;

/// Uniform pick in `[min, max]`.
pub(crate) fn jittered(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    rand::thread_rng().gen_range(min..=max)
}
