use std::collections::VecDeque;

use crate::detect::DetectError;

/// Fixed-capacity FIFO window over scalar magnitudes.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    values: VecDeque<f32>,
    capacity: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Result<Self, DetectError> {
        if capacity == 0 {
            return Err(DetectError::ZeroWindow);
        }
        Ok(Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.values.len() == self.capacity
    }

    /// Push a magnitude, evicting the oldest when full.
    ///
    /// Returns `None` until the window has filled once since construction or
    /// the last [`reset`](Self::reset).
    pub fn push(&mut self, magnitude: f32) -> Option<f32> {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(magnitude);

        if self.is_full() {
            Some(self.rms())
        } else {
            None
        }
    }

    /// sqrt(mean(x^2)) over the current contents. 0.0 when empty.
    pub fn rms(&self) -> f32 {
        if self.values.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = self.values.iter().map(|&v| (v as f64) * (v as f64)).sum();
        (sum_sq / self.values.len() as f64).sqrt() as f32
    }

    /// Oldest to newest.
    pub fn to_vec(&self) -> Vec<f32> {
        self.values.iter().copied().collect()
    }

    /// Oldest to newest, without allocating.
    pub fn contiguous(&mut self) -> &[f32] {
        self.values.make_contiguous()
    }

    pub fn reset(&mut self) {
        self.values.clear();
    }
}
