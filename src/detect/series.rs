use crate::detect::DetectError;

/// A window of per-bucket counts used as a burst baseline.
pub struct TimeSeries {
    values: Vec<f64>,
}

impl TimeSeries {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Population variance.
    pub fn variance(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let sum_sq_diff: f64 = self.values.iter().map(|&x| (x - mean).powi(2)).sum();
        sum_sq_diff / self.values.len() as f64
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Z-score of `value` against this series, which must hold at least
    /// `min_len` points. The deviation is floored at `min_std_dev` so a flat
    /// baseline still yields a finite score.
    pub fn z_score(&self, value: f64, min_std_dev: f64, min_len: usize) -> Result<f64, DetectError> {
        if self.values.len() < min_len {
            return Err(DetectError::InsufficientData {
                needed: min_len,
                have: self.values.len(),
            });
        }
        let std = self.std_dev().max(min_std_dev);
        if std <= 0.0 {
            if (value - self.mean()).abs() > f64::EPSILON {
                return Ok(f64::MAX);
            }
            return Ok(0.0);
        }
        Ok((value - self.mean()) / std)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats() {
        let ts = TimeSeries::new(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(ts.mean(), 3.0);
        // Population variance of 1..5 is 2.0
        let z = ts.z_score(10.0, 0.0, 3).unwrap();
        // (10 - 3) / 1.414 ~ 4.95
        assert!(z > 4.9);
    }

    #[test]
    fn test_flat_baseline_uses_floor() {
        let ts = TimeSeries::new(vec![2.0, 2.0, 2.0, 2.0]);
        let z = ts.z_score(50.0, 1.0, 3).unwrap();
        assert_eq!(z, 48.0);
    }

    #[test]
    fn test_short_baseline_rejected() {
        let ts = TimeSeries::new(vec![1.0, 2.0]);
        assert!(matches!(
            ts.z_score(5.0, 1.0, 3),
            Err(DetectError::InsufficientData { needed: 3, have: 2 })
        ));
        // Mean 1.5, deviation 0.5 floored to 1.0.
        assert_eq!(ts.z_score(5.0, 1.0, 2).unwrap(), 3.5);
        assert!(matches!(
            TimeSeries::new(vec![1.0; 4]).z_score(5.0, 1.0, 5),
            Err(DetectError::InsufficientData { needed: 5, have: 4 })
        ));
    }
}
