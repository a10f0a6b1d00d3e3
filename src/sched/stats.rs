// Rolling render/vblank statistics
//
// The scheduler predicts the next frame's render budget from the
// 98th percentile of recent render times and paces against the
// mean vblank interval. Both estimators live here.
//
// Austin Shafer - 2024
use std::collections::VecDeque;

/// A fixed-capacity rolling window of microsecond samples
#[derive(Debug)]
pub struct RollingWindow {
    rw_cap: usize,
    rw_vals: VecDeque<u32>,
    rw_sum: u64,
}

impl RollingWindow {
    pub fn new(cap: usize) -> RollingWindow {
        RollingWindow {
            rw_cap: cap,
            rw_vals: VecDeque::with_capacity(cap),
            rw_sum: 0,
        }
    }

    pub fn push(&mut self, val: u32) {
        if self.rw_vals.len() == self.rw_cap {
            if let Some(old) = self.rw_vals.pop_front() {
                self.rw_sum -= old as u64;
            }
        }
        self.rw_vals.push_back(val);
        self.rw_sum += val as u64;
    }

    pub fn len(&self) -> usize {
        self.rw_vals.len()
    }

    pub fn is_full(&self) -> bool {
        self.rw_vals.len() == self.rw_cap
    }

    pub fn mean(&self) -> Option<u32> {
        match self.rw_vals.is_empty() {
            true => None,
            false => Some((self.rw_sum / self.rw_vals.len() as u64) as u32),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &u32> {
        self.rw_vals.iter()
    }

    pub fn clear(&mut self) {
        self.rw_vals.clear();
        self.rw_sum = 0;
    }
}

/// kth smallest (0-based) via quickselect
///
/// Median-of-three pivoting keeps the already-mostly-sorted case
/// from going quadratic.
fn quickselect(vals: &mut [u32], k: usize) -> u32 {
    // the window is [lo, hi)
    let mut lo = 0;
    let mut hi = vals.len();

    loop {
        if hi - lo <= 1 {
            return vals[lo];
        }

        // order (lo, mid, hi-1) so the median lands at mid, then
        // stash it at the end as the pivot
        let mid = lo + (hi - lo) / 2;
        if vals[mid] < vals[lo] {
            vals.swap(mid, lo);
        }
        if vals[hi - 1] < vals[lo] {
            vals.swap(hi - 1, lo);
        }
        if vals[hi - 1] < vals[mid] {
            vals.swap(hi - 1, mid);
        }
        vals.swap(mid, hi - 1);
        let pivot = vals[hi - 1];

        let mut store = lo;
        for i in lo..hi - 1 {
            if vals[i] < pivot {
                vals.swap(i, store);
                store += 1;
            }
        }
        vals.swap(store, hi - 1);

        if k == store {
            return vals[store];
        }
        if k < store {
            hi = store;
        } else {
            lo = store + 1;
        }
    }
}

/// Rolling quantile estimator with a rank tolerance band
///
/// Tracks one quantile (the render budget uses p = 0.98) over a
/// rolling window. The cached estimate is only recomputed, via
/// quickselect over a scratch copy, when its rank in the current
/// window drifts outside `p*n` by more than the tolerance band.
#[derive(Debug)]
pub struct RollingQuantile {
    rq_window: RollingWindow,
    /// the quantile tracked, in [0, 1]
    rq_p: f64,
    /// allowed rank drift as a fraction of the window
    rq_tolerance: f64,
    rq_estimate: Option<u32>,
}

impl RollingQuantile {
    pub fn new(cap: usize, p: f64, tolerance: f64) -> RollingQuantile {
        RollingQuantile {
            rq_window: RollingWindow::new(cap),
            rq_p: p,
            rq_tolerance: tolerance,
            rq_estimate: None,
        }
    }

    pub fn push(&mut self, val: u32) {
        self.rq_window.push(val);

        let n = self.rq_window.len();
        let target = self.rq_p * n as f64;
        let band = self.rq_tolerance * n as f64;

        // rank of the current estimate: samples at or below it
        let rank = match self.rq_estimate {
            Some(est) => self.rq_window.iter().filter(|v| **v <= est).count() as f64,
            None => f64::NEG_INFINITY,
        };

        if rank < target - band || rank > target + band {
            let mut scratch: Vec<u32> = self.rq_window.iter().copied().collect();
            let k = ((self.rq_p * n as f64).ceil() as usize)
                .max(1)
                .min(n)
                - 1;
            self.rq_estimate = Some(quickselect(scratch.as_mut_slice(), k));
        }
    }

    pub fn estimate(&self) -> Option<u32> {
        self.rq_estimate
    }

    pub fn len(&self) -> usize {
        self.rq_window.len()
    }

    pub fn clear(&mut self) {
        self.rq_window.clear();
        self.rq_estimate = None;
    }
}

/// Minimum standard deviation assumed for outlier detection, so a
/// perfectly steady interval doesn't turn every wobble into a reset
const MIN_STDDEV_USEC: f64 = 10.0;

/// Running mean/variance of the vblank interval
///
/// Welford's algorithm; a sample more than three standard
/// deviations from the mean throws the history away and starts
/// over, which is how mode switches and suspend wakeups are
/// absorbed.
#[derive(Debug)]
pub struct IntervalEstimator {
    ie_count: u64,
    ie_mean: f64,
    ie_m2: f64,
}

impl IntervalEstimator {
    pub fn new() -> IntervalEstimator {
        IntervalEstimator {
            ie_count: 0,
            ie_mean: 0.0,
            ie_m2: 0.0,
        }
    }

    /// Add a sample. Returns true when the sample was a 3-sigma
    /// outlier and the estimator reset.
    pub fn push(&mut self, sample: u64) -> bool {
        let x = sample as f64;

        if self.ie_count >= 2 {
            let sd = self.stddev().unwrap_or(0.0).max(MIN_STDDEV_USEC);
            if (x - self.ie_mean).abs() > 3.0 * sd {
                self.reset();
                self.push(sample);
                return true;
            }
        }

        self.ie_count += 1;
        let delta = x - self.ie_mean;
        self.ie_mean += delta / self.ie_count as f64;
        self.ie_m2 += delta * (x - self.ie_mean);
        return false;
    }

    pub fn reset(&mut self) {
        self.ie_count = 0;
        self.ie_mean = 0.0;
        self.ie_m2 = 0.0;
    }

    pub fn mean(&self) -> Option<u64> {
        match self.ie_count {
            0 => None,
            _ => Some(self.ie_mean as u64),
        }
    }

    pub fn stddev(&self) -> Option<f64> {
        match self.ie_count {
            0 | 1 => None,
            n => Some((self.ie_m2 / (n - 1) as f64).sqrt()),
        }
    }

    pub fn count(&self) -> u64 {
        self.ie_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_window_mean() {
        let mut win = RollingWindow::new(3);
        assert_eq!(win.mean(), None);
        win.push(10);
        win.push(20);
        win.push(30);
        assert_eq!(win.mean(), Some(20));
        // 10 rolls out
        win.push(50);
        assert_eq!(win.mean(), Some(33));
        assert!(win.is_full());
    }

    #[test]
    fn quickselect_selects() {
        let mut vals = vec![9, 1, 8, 2, 7, 3, 6, 4, 5];
        assert_eq!(quickselect(vals.as_mut_slice(), 0), 1);
        let mut vals = vec![9, 1, 8, 2, 7, 3, 6, 4, 5];
        assert_eq!(quickselect(vals.as_mut_slice(), 4), 5);
        let mut vals = vec![9, 1, 8, 2, 7, 3, 6, 4, 5];
        assert_eq!(quickselect(vals.as_mut_slice(), 8), 9);
    }

    #[test]
    fn quantile_stays_in_band() {
        // a full window of 0..1000 shuffled deterministically
        let mut q = RollingQuantile::new(1000, 0.98, 0.01);
        for i in 0..1000u32 {
            q.push((i * 7919) % 1000);
        }

        // true p97/p99 of 0..999 are 969 and 989
        let est = q.estimate().unwrap();
        assert!(est >= 969 && est <= 989, "estimate {} out of band", est);
    }

    #[test]
    fn quantile_tracks_shift() {
        let mut q = RollingQuantile::new(64, 0.98, 0.01);
        for _ in 0..64 {
            q.push(4_000);
        }
        assert_eq!(q.estimate(), Some(4_000));

        // workload jumps, the estimate must follow it out
        for _ in 0..64 {
            q.push(20_000);
        }
        assert_eq!(q.estimate(), Some(20_000));
    }

    #[test]
    fn interval_estimator_converges() {
        let mut est = IntervalEstimator::new();
        // 10 seconds worth of 60Hz samples with small jitter
        for i in 0..600u64 {
            est.push(16_667 + (i % 7) as u64 * 3);
        }
        let mean = est.mean().unwrap();
        let err = (mean as f64 - 16_676.0).abs() / 16_676.0;
        assert!(err < 0.01, "mean {} off by {}", mean, err);
    }

    #[test]
    fn interval_estimator_resets_on_outlier() {
        let mut est = IntervalEstimator::new();
        for _ in 0..100 {
            est.push(16_667);
        }
        assert_eq!(est.count(), 100);

        // a single 3-sigma outlier wipes the history
        assert!(est.push(50_000));
        assert_eq!(est.count(), 1);
        assert_eq!(est.mean(), Some(50_000));
    }
}
