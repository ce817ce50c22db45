//! Backoff curves used by the connection doctor (§4.6) to space out
//! reconnection attempts. Replaces the registry-of-callables pattern the
//! original used with a closed enumeration mapped to a pure function.

use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingCurve {
    Constant,
    Linear,
    Quadratic,
    Exponential,
}

impl Default for ScalingCurve {
    fn default() -> ScalingCurve {
        ScalingCurve::Exponential
    }
}

impl ScalingCurve {
    /// `op(period, attempt_index)`, attempt_index starting at 0 for the
    /// first retry after the initial one.
    pub fn next_delay(&self, period: Duration, attempt_index: u32) -> Duration {
        match self {
            ScalingCurve::Constant => period,
            ScalingCurve::Linear => period * (attempt_index + 1),
            ScalingCurve::Quadratic => period * (attempt_index + 1).pow(2),
            ScalingCurve::Exponential => period * 2u32.saturating_pow(attempt_index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_never_grows() {
        let p = Duration::from_secs(2);
        assert_eq!(ScalingCurve::Constant.next_delay(p, 0), p);
        assert_eq!(ScalingCurve::Constant.next_delay(p, 5), p);
    }

    #[test]
    fn exponential_doubles() {
        let p = Duration::from_secs(1);
        assert_eq!(ScalingCurve::Exponential.next_delay(p, 0), Duration::from_secs(1));
        assert_eq!(ScalingCurve::Exponential.next_delay(p, 1), Duration::from_secs(2));
        assert_eq!(ScalingCurve::Exponential.next_delay(p, 3), Duration::from_secs(8));
    }

    #[test]
    fn quadratic_and_linear_order() {
        let p = Duration::from_secs(1);
        assert_eq!(ScalingCurve::Linear.next_delay(p, 2), Duration::from_secs(3));
        assert_eq!(ScalingCurve::Quadratic.next_delay(p, 2), Duration::from_secs(9));
    }
}
