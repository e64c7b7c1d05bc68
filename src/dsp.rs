//! Shared signal primitives: smoothing, range normalisation, vector projection.

use crate::types::Vec3;

/// One step of an exponential moving average.
/// `alpha` = 1.0 passes the raw value through; smaller values smooth harder.
pub fn ema(prev: f64, raw: f64, alpha: f64) -> f64 {
    alpha * raw + (1.0 - alpha) * prev
}

/// Position of `value` between `rest` (0.0) and `full` (1.0), clamped.
/// Works for either sensor polarity (`full` above or below `rest`).
/// Callers guarantee `rest != full`.
pub fn normalize(value: f64, rest: f64, full: f64) -> f64 {
    ((value - rest) / (full - rest)).clamp(0.0, 1.0)
}

/// Scalar projection of `v` onto `reference`, in the reference's units.
/// Returns `None` for a zero-length reference.
pub fn project(v: &Vec3, reference: &Vec3) -> Option<f64> {
    let mag = reference.magnitude();
    if mag <= f64::EPSILON {
        return None;
    }
    Some(v.dot(reference) / mag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ema_limits() {
        assert_eq!(ema(10.0, 20.0, 1.0), 20.0);
        assert!((ema(10.0, 20.0, 0.25) - 12.5).abs() < 1e-12);
    }

    #[test]
    fn test_normalize_inverted_polarity() {
        // Flex sensors read high at rest and drop when bent
        assert_eq!(normalize(4095.0, 4095.0, 500.0), 0.0);
        assert_eq!(normalize(500.0, 4095.0, 500.0), 1.0);
        assert!((normalize(2297.5, 4095.0, 500.0) - 0.5).abs() < 1e-12);
        assert_eq!(normalize(100.0, 4095.0, 500.0), 1.0, "past full clamps");
        assert_eq!(normalize(5000.0, 4095.0, 500.0), 0.0, "past rest clamps");
    }

    #[test]
    fn test_normalize_rising_polarity() {
        assert_eq!(normalize(0.0, 0.0, 1000.0), 0.0);
        assert_eq!(normalize(1000.0, 0.0, 1000.0), 1.0);
    }

    #[test]
    fn test_project() {
        let reference = Vec3::new(20000.0, 0.0, 0.0);
        assert_eq!(project(&Vec3::new(21000.0, 500.0, 0.0), &reference), Some(21000.0));
        assert_eq!(project(&Vec3::new(-3000.0, 0.0, 0.0), &reference), Some(-3000.0));
        assert_eq!(project(&reference, &Vec3::default()), None);
    }
}
