//! Temporal smoothing of per-cycle SH estimates over a fixed-size history.

use std::collections::VecDeque;

use crate::config::{EstimatorConfig, FilterMode};
use crate::error::{EstimatorError, Result};
use crate::sh::{ShBuffer, BANDS, CHANNELS};

/// FIFO of recent SH samples plus the aggregate derived from it.
///
/// The history always holds exactly `capacity` entries: it starts, and restarts on
/// [`reset`](Self::reset), filled with copies of the neutral seed.
#[derive(Clone, Debug)]
pub struct TemporalShFilter {
    mode: FilterMode,
    capacity: usize,
    seed: ShBuffer,
    history: VecDeque<ShBuffer>,
    scratch: Vec<f32>,
    aggregate: ShBuffer,
}

impl TemporalShFilter {
    pub fn new(capacity: usize, mode: FilterMode, seed_value: f32) -> Result<Self> {
        if capacity == 0 {
            return Err(EstimatorError::Misconfiguration(
                "history capacity must be at least 1".to_string(),
            ));
        }
        let seed = ShBuffer::splat(seed_value);
        Ok(Self {
            mode,
            capacity,
            seed,
            history: std::iter::repeat(seed).take(capacity).collect(),
            scratch: Vec::with_capacity(capacity),
            aggregate: seed,
        })
    }

    pub fn from_config(config: &EstimatorConfig) -> Result<Self> {
        Self::new(config.history_size, config.filter, config.seed_value)
    }

    /// Append `sample`, evicting the oldest entry, and return the new aggregate.
    pub fn push(&mut self, sample: ShBuffer) -> ShBuffer {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(sample);
        self.aggregate = match self.mode {
            FilterMode::TrimmedMean { trim } => self.trimmed_mean(trim),
            FilterMode::Blend { new_weight } => self.aggregate.lerp(&sample, new_weight),
        };
        self.aggregate
    }

    /// Aggregate as of the last push.
    pub fn aggregate(&self) -> ShBuffer {
        self.aggregate
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.history.extend(std::iter::repeat(self.seed).take(self.capacity));
        self.aggregate = self.seed;
    }

    /// Change capacity: drops the oldest samples or pads the front with the seed.
    pub fn resize(&mut self, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(EstimatorError::Misconfiguration(
                "history capacity must be at least 1".to_string(),
            ));
        }
        while self.history.len() > capacity {
            self.history.pop_front();
        }
        while self.history.len() < capacity {
            self.history.push_front(self.seed);
        }
        self.capacity = capacity;
        self.scratch.reserve(capacity);
        self.refresh();
        Ok(())
    }

    pub fn set_mode(&mut self, mode: FilterMode) {
        self.mode = mode;
        self.refresh();
    }

    /// Seed used by later resets and resizes.
    pub fn set_seed(&mut self, seed_value: f32) {
        self.seed = ShBuffer::splat(seed_value);
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn history(&self) -> &VecDeque<ShBuffer> {
        &self.history
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Trimmed mean is a pure function of the history; a blend keeps its running value.
    fn refresh(&mut self) {
        if let FilterMode::TrimmedMean { trim } = self.mode {
            self.aggregate = self.trimmed_mean(trim);
        }
    }

    fn trimmed_mean(&mut self, trim: usize) -> ShBuffer {
        let len = self.history.len();
        let kept = len.saturating_sub(trim.saturating_mul(2)).max(1);
        let start = (len - kept) / 2;
        let mut out = ShBuffer::ZERO;
        for c in 0..CHANNELS {
            for b in 0..BANDS {
                self.scratch.clear();
                self.scratch.extend(self.history.iter().map(|sh| sh.coefficients[c][b]));
                self.scratch.sort_unstable_by(f32::total_cmp);
                let sum: f64 = self.scratch[start..start + kept].iter().map(|&v| v as f64).sum();
                out.coefficients[c][b] = (sum / kept as f64) as f32;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trimmed(capacity: usize, trim: usize) -> TemporalShFilter {
        TemporalShFilter::new(capacity, FilterMode::TrimmedMean { trim }, 0.5).unwrap()
    }

    #[test]
    fn starts_full_of_seed() {
        let f = trimmed(5, 2);
        assert_eq!(f.len(), 5);
        assert_eq!(f.aggregate(), ShBuffer::splat(0.5));
    }

    #[test]
    fn identical_samples_give_exact_value() {
        let mut f = trimmed(5, 1);
        let x = ShBuffer::splat(0.1);
        for _ in 0..5 {
            f.push(x);
        }
        assert_eq!(f.aggregate(), x);
    }

    #[test]
    fn single_outlier_is_trimmed() {
        let mut f = trimmed(5, 2);
        let mut red = ShBuffer::ZERO;
        for b in 0..BANDS {
            red.coefficients[0][b] = 3.0;
        }
        assert_eq!(f.push(red), ShBuffer::splat(0.5));
        assert_eq!(f.len(), 5);
    }

    #[test]
    fn middle_values_are_averaged() {
        let mut f = trimmed(5, 1);
        for v in [9.0, 1.0, 3.0, 2.0, -7.0] {
            f.push(ShBuffer::splat(v));
        }
        // sorted: -7 1 2 3 9 -> mean of 1 2 3
        assert_eq!(f.aggregate(), ShBuffer::splat(2.0));
    }

    #[test]
    fn order_does_not_matter() {
        let samples = [0.3, 0.9, 0.1, 0.7, 0.2].map(ShBuffer::splat);
        let mut a = trimmed(5, 1);
        let mut b = trimmed(5, 1);
        for s in samples {
            a.push(s);
        }
        for s in samples.iter().rev() {
            b.push(*s);
        }
        assert_eq!(a.aggregate(), b.aggregate());
    }

    #[test]
    fn over_trimming_keeps_median() {
        let mut f = trimmed(3, 5);
        for v in [4.0, 1.0, 2.0] {
            f.push(ShBuffer::splat(v));
        }
        assert_eq!(f.aggregate(), ShBuffer::splat(2.0));
    }

    #[test]
    fn huge_trim_saturates_to_median() {
        let mut f = trimmed(3, usize::MAX / 2 + 1);
        for v in [4.0, 1.0, 2.0] {
            f.push(ShBuffer::splat(v));
        }
        assert_eq!(f.aggregate(), ShBuffer::splat(2.0));
    }

    /// Three samples whose ranking differs from cell to cell.
    fn crossed_samples() -> [ShBuffer; 3] {
        let mut a = ShBuffer::splat(1.0);
        let mut b = ShBuffer::splat(2.0);
        let mut c = ShBuffer::splat(3.0);
        a[(0, 0)] = 10.0;
        b[(0, 0)] = 0.0;
        c[(0, 0)] = 4.0;
        a[(2, 8)] = -6.0;
        b[(2, 8)] = 8.0;
        c[(2, 8)] = 0.5;
        a[(1, 4)] = 7.0;
        b[(1, 4)] = 5.0;
        c[(1, 4)] = -1.0;
        [a, b, c]
    }

    #[test]
    fn trimmed_mean_ranks_each_cell_independently() {
        // five entries per cell: two seeds (0.5) plus the three samples, trim 1 keeps the middle 3
        let mut f = trimmed(5, 1);
        for s in crossed_samples() {
            f.push(s);
        }
        let out = f.aggregate();
        // (0,0): 0.5 0.5 4 10 0 -> 0 0.5 0.5 4 10 -> (0.5 + 0.5 + 4) / 3
        assert_eq!(out[(0, 0)], 5.0 / 3.0);
        // (2,8): 0.5 0.5 -6 8 0.5 -> -6 0.5 0.5 0.5 8 -> 0.5
        assert_eq!(out[(2, 8)], 0.5);
        // (1,4): 0.5 0.5 7 5 -1 -> -1 0.5 0.5 5 7 -> 6 / 3
        assert_eq!(out[(1, 4)], 2.0);
        // untouched cell: 0.5 0.5 1 2 3 -> 0.5 1 2
        assert_eq!(out[(1, 0)], 3.5 / 3.0);

        let mut shuffled = trimmed(5, 1);
        let [a, b, c] = crossed_samples();
        for s in [c, a, b] {
            shuffled.push(s);
        }
        assert_eq!(shuffled.aggregate(), out);
    }

    #[test]
    fn blend_moves_toward_sample() {
        let mut f = TemporalShFilter::new(5, FilterMode::Blend { new_weight: 0.2 }, 0.0).unwrap();
        let out = f.push(ShBuffer::splat(1.0));
        assert!((out.coefficients[1][4] - 0.2).abs() < 1e-6);
        assert_eq!(f.len(), 5);
    }

    #[test]
    fn resize_and_reset() {
        let mut f = trimmed(5, 0);
        f.push(ShBuffer::splat(1.5));
        f.resize(2).unwrap();
        assert_eq!(f.len(), 2);
        assert_eq!(f.history().back(), Some(&ShBuffer::splat(1.5)));
        f.resize(4).unwrap();
        assert_eq!(f.history().front(), Some(&ShBuffer::splat(0.5)));
        f.reset();
        assert_eq!(f.aggregate(), ShBuffer::splat(0.5));
        assert!(f.resize(0).is_err());
    }
}
