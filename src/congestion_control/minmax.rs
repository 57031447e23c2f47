// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Windowed extremum tracking over a monotonic time dimension, after
//! Kathleen Nichols' algorithm. Refer to
//! <https://groups.google.com/g/bbr-dev/c/3RTgkzi5ZD8>.
//!
//! The filter keeps the best, 2nd-best and 3rd-best extremum candidates
//! seen over a fixed window, in constant space and constant time per
//! update, and almost always answers the same extremum as an exact
//! implementation that retains every sample in the window.
//!
//! The candidates satisfy two invariants: the measurement time of the
//! n'th best is >= that of the (n-1)'th best, and the three candidates
//! are kept spread across the window, which bounds the worst-case error
//! when the data moves monotonically against the filter direction.
//!
//! A new overall extremum makes everything older worthless: it beats
//! every candidate in the window and it is the most recent, so the
//! filter restarts from it. The same holds one level down for the 2nd
//! and 3rd choices.
//!
//! The time dimension is whatever unit the caller measures the window
//! in: packet-timed rounds for the bandwidth filter, coarse-clock ticks
//! for an RTT filter. Operating in rounds makes the bandwidth filter
//! robust to clock jitter.

/// One extremum candidate: a value and when it was observed.
#[derive(Debug, Copy, Clone, Default)]
struct Candidate {
    /// Timestamp in the window's native unit.
    time: u64,

    /// Observed value.
    value: u64,
}

/// Which end of the ordering the filter tracks.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Extremum {
    Min,
    Max,
}

/// A three-candidate windowed min/max filter.
#[derive(Debug)]
pub struct WindowedFilter {
    /// Tracked extremum.
    kind: Extremum,

    /// Window length, in the time dimension's native unit.
    window: u64,

    /// Best, 2nd best and 3rd best candidates, in that order.
    estimates: [Candidate; 3],
}

impl WindowedFilter {
    /// A running-maximum filter over the given window.
    pub fn max_over(window: u64) -> Self {
        Self {
            kind: Extremum::Max,
            window,
            estimates: [Default::default(); 3],
        }
    }

    /// A running-minimum filter over the given window.
    pub fn min_over(window: u64) -> Self {
        Self {
            kind: Extremum::Min,
            window,
            estimates: [Default::default(); 3],
        }
    }

    /// Forget all history and restart the filter from one observation.
    pub fn reset(&mut self, time: u64, value: u64) {
        self.estimates.fill(Candidate { time, value });
    }

    /// The current windowed extremum.
    pub fn get(&self) -> u64 {
        self.estimates[0].value
    }

    /// Whether `a` displaces `b` for the tracked extremum. Ties go to
    /// the newer sample.
    fn wins(&self, a: u64, b: u64) -> bool {
        match self.kind {
            Extremum::Max => a >= b,
            Extremum::Min => a <= b,
        }
    }

    /// Incorporate a new observation. `time` must be monotonically
    /// non-decreasing across calls; a stale timestamp is ignored.
    pub fn update(&mut self, time: u64, value: u64) {
        if time < self.estimates[2].time {
            return;
        }

        let sample = Candidate { time, value };

        if self.estimates[0].value == 0  // unused filter
            || self.wins(sample.value, self.estimates[0].value)
            || time.saturating_sub(self.estimates[2].time) > self.window
        // nothing else left in the window
        {
            self.reset(time, value);
            return;
        }

        if self.wins(sample.value, self.estimates[1].value) {
            self.estimates[2] = sample;
            self.estimates[1] = sample;
        } else if self.wins(sample.value, self.estimates[2].value) {
            self.estimates[2] = sample;
        }

        self.age_candidates(sample);
    }

    /// As time advances, promote the 2nd and 3rd choices so the three
    /// candidates stay spread across the window.
    fn age_candidates(&mut self, sample: Candidate) {
        let dt = sample.time.saturating_sub(self.estimates[0].time);

        if dt > self.window {
            // The best choice aged out of the window without being
            // displaced: promote the 2nd and 3rd choices and take the
            // sample as the new 3rd. The promoted 2nd choice may itself
            // be outside the window (the 3rd was checked on entry), so
            // one more promotion may be needed.
            self.estimates[0] = self.estimates[1];
            self.estimates[1] = self.estimates[2];
            self.estimates[2] = sample;
            if sample.time.saturating_sub(self.estimates[0].time) > self.window {
                self.estimates[0] = self.estimates[1];
                self.estimates[1] = self.estimates[2];
                self.estimates[2] = sample;
            }
        } else if self.estimates[1].time == self.estimates[0].time && dt > self.window / 4 {
            // A quarter of the window passed without a fresh 2nd
            // choice: take one from the second quarter.
            self.estimates[2] = sample;
            self.estimates[1] = sample;
        } else if self.estimates[2].time == self.estimates[1].time && dt > self.window / 2 {
            // Half the window passed without a fresh 3rd choice: take
            // one from the last half.
            self.estimates[2] = sample;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windowed_max() {
        let mut filter = WindowedFilter::max_over(10);
        let t: u64 = 20;

        // Unused filter adopts the first observation.
        filter.update(1, 200);
        assert_eq!(filter.get(), 200);
        // Nothing left in the window.
        filter.update(t, 120);
        assert_eq!(filter.get(), 120);
        // New overall max restarts the filter.
        filter.update(t + 1, 150);
        assert_eq!(filter.get(), 150);
        // Stale timestamp is ignored.
        filter.update(t, 180);
        assert_eq!(filter.get(), 150);
        // Within the first quarter of the window, nothing to age.
        filter.update(t + 2, 120);
        assert_eq!(filter.get(), 150);
        // Past a quarter window: sample becomes 2nd and 3rd choice.
        filter.update(t + 4, 110);
        assert_eq!(filter.get(), 150);
        assert_eq!(filter.estimates[1].value, 110);
        // Past half the window: sample becomes the 3rd choice.
        filter.update(t + 8, 100);
        assert_eq!(filter.get(), 150);
        assert_eq!(filter.estimates[2].value, 100);
        // Displaces only the 3rd choice.
        filter.update(t + 9, 105);
        assert_eq!(filter.get(), 150);
        assert_eq!(filter.estimates[1].value, 110);
        assert_eq!(filter.estimates[2].value, 105);
        // Best choice ages out: 2nd choice takes over.
        filter.update(t + 15, 90);
        assert_eq!(filter.get(), 105);
        // Displaces the 2nd and 3rd choices.
        filter.update(t + 17, 95);
        assert_eq!(filter.get(), 105);
        assert_eq!(filter.estimates[1].value, 95);
        assert_eq!(filter.estimates[2].value, 95);
    }

    #[test]
    fn windowed_min() {
        let mut filter = WindowedFilter::min_over(10);
        let t: u64 = 20;

        filter.update(1, 100);
        assert_eq!(filter.get(), 100);
        // Nothing left in the window.
        filter.update(t, 120);
        assert_eq!(filter.get(), 120);
        // New overall min restarts the filter.
        filter.update(t + 1, 110);
        assert_eq!(filter.get(), 110);
        // Stale timestamp is ignored, even for a would-be min.
        filter.update(t, 90);
        assert_eq!(filter.get(), 110);
        // Aging fills the 2nd and 3rd choices.
        filter.update(t + 4, 120);
        assert_eq!(filter.get(), 110);
        filter.update(t + 8, 115);
        assert_eq!(filter.estimates[1].value, 115);
        filter.update(t + 9, 120);
        assert_eq!(filter.estimates[2].value, 120);
        filter.update(t + 10, 118);
        assert_eq!(filter.estimates[2].value, 118);
    }

    #[test]
    fn reset_forgets_history() {
        let mut filter = WindowedFilter::max_over(10);
        filter.update(1, 300);
        filter.update(3, 200);
        filter.reset(5, 50);
        assert_eq!(filter.get(), 50);
        // All three candidates carry the reset observation.
        assert_eq!(filter.estimates[1].value, 50);
        assert_eq!(filter.estimates[2].value, 50);
    }
}
