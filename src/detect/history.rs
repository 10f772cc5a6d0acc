use std::collections::VecDeque;

/// Bounded FIFO of prediction errors with running statistics.
///
/// The adaptive threshold is `mean + k * std_dev` and is recomputed on every
/// push.
#[derive(Debug, Clone)]
pub struct ErrorHistory {
    values: VecDeque<f64>,
    capacity: usize,
    k: f64,
    mean: f64,
    std_dev: f64,
}

impl ErrorHistory {
    pub fn new(capacity: usize, k: f64) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            k,
            mean: 0.0,
            std_dev: 0.0,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn push(&mut self, error: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(error);
        self.recompute();
    }

    fn recompute(&mut self) {
        let n = self.values.len() as f64;
        self.mean = self.values.iter().sum::<f64>() / n;
        let variance = self
            .values
            .iter()
            .map(|&x| (x - self.mean).powi(2))
            .sum::<f64>()
            / n;
        self.std_dev = variance.sqrt();
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.mean = 0.0;
        self.std_dev = 0.0;
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn std_dev(&self) -> f64 {
        self.std_dev
    }

    pub fn threshold(&self) -> f64 {
        self.mean + self.k * self.std_dev
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats() {
        let mut h = ErrorHistory::new(100, 2.0);
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            h.push(v);
        }
        assert_eq!(h.mean(), 3.0);
        // Population variance of 1..5 is 2.0
        assert!((h.std_dev() - 2.0_f64.sqrt()).abs() < 1e-12);
        assert!((h.threshold() - (3.0 + 2.0 * 2.0_f64.sqrt())).abs() < 1e-12);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut h = ErrorHistory::new(3, 2.0);
        for v in [100.0, 1.0, 1.0, 1.0] {
            h.push(v);
        }
        assert_eq!(h.len(), 3);
        assert_eq!(h.mean(), 1.0);
        assert_eq!(h.std_dev(), 0.0);
    }
}
