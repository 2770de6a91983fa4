//! Float intervals with inclusive/exclusive bounds.
//!
//! Sampling ranges are inclusive on both ends; subtracting an inclusive
//! exclusion window `[a, b]` leaves the neighbours open at `a` and `b`, so
//! `[0, 5] - [2, 3]` is `[0, 2)` and `(3, 5]`.

use serde::{Deserialize, Serialize};

/// Sample positions closer than this (in samples) to a bound sit on it.
pub const SAMPLE_TOLERANCE: f32 = 1e-4;

/// Plain `[min, max]` pair used for configuration values.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FloatInterval {
    pub min: f32,
    pub max: f32,
}

impl FloatInterval {
    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    /// True when `min <= max`.
    pub fn is_valid(&self) -> bool {
        self.min <= self.max
    }
}

/// One end of a [`FloatRange`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub value: f32,
    pub inclusive: bool,
}

impl Bound {
    pub fn inclusive(value: f32) -> Self {
        Self {
            value,
            inclusive: true,
        }
    }

    pub fn exclusive(value: f32) -> Self {
        Self {
            value,
            inclusive: false,
        }
    }

    fn flipped(self) -> Self {
        Self {
            value: self.value,
            inclusive: !self.inclusive,
        }
    }
}

/// A bounded interval of the real line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FloatRange {
    pub lower: Bound,
    pub upper: Bound,
}

impl FloatRange {
    pub fn new(lower: Bound, upper: Bound) -> Self {
        Self { lower, upper }
    }

    /// `[min, max]`
    pub fn inclusive(min: f32, max: f32) -> Self {
        Self::new(Bound::inclusive(min), Bound::inclusive(max))
    }

    /// `[min, max)`
    pub fn half_open(min: f32, max: f32) -> Self {
        Self::new(Bound::inclusive(min), Bound::exclusive(max))
    }

    pub fn is_empty(&self) -> bool {
        if self.lower.value > self.upper.value {
            return true;
        }
        self.lower.value == self.upper.value && !(self.lower.inclusive && self.upper.inclusive)
    }

    pub fn contains(&self, t: f32) -> bool {
        let above = t > self.lower.value || (self.lower.inclusive && t == self.lower.value);
        let below = t < self.upper.value || (self.upper.inclusive && t == self.upper.value);
        above && below
    }

    pub fn size(&self) -> f32 {
        (self.upper.value - self.lower.value).max(0.0)
    }

    /// Largest range contained in both inputs. May be empty.
    pub fn intersection(&self, other: &FloatRange) -> FloatRange {
        let lower = if self.lower.value > other.lower.value {
            self.lower
        } else if other.lower.value > self.lower.value {
            other.lower
        } else {
            Bound {
                value: self.lower.value,
                inclusive: self.lower.inclusive && other.lower.inclusive,
            }
        };
        let upper = if self.upper.value < other.upper.value {
            self.upper
        } else if other.upper.value < self.upper.value {
            other.upper
        } else {
            Bound {
                value: self.upper.value,
                inclusive: self.upper.inclusive && other.upper.inclusive,
            }
        };
        FloatRange::new(lower, upper)
    }

    pub fn overlaps(&self, other: &FloatRange) -> bool {
        !self.intersection(other).is_empty()
    }

    /// `self - other`: zero, one or two disjoint pieces, in ascending order.
    pub fn difference(&self, other: &FloatRange) -> Vec<FloatRange> {
        if self.is_empty() {
            return Vec::new();
        }
        if other.is_empty() || !self.overlaps(other) {
            return vec![*self];
        }

        let mut pieces = Vec::with_capacity(2);
        let left = FloatRange::new(self.lower, other.lower.flipped());
        if !left.is_empty() {
            pieces.push(left);
        }
        let right = FloatRange::new(other.upper.flipped(), self.upper);
        if !right.is_empty() {
            pieces.push(right);
        }
        pieces
    }

    /// Index of the first sample `i` with `i / rate` inside the range.
    pub fn first_sample_index(&self, sample_rate: f32) -> i64 {
        let t = self.lower.value * sample_rate;
        if self.lower.inclusive {
            (t - SAMPLE_TOLERANCE).ceil() as i64
        } else {
            (t + SAMPLE_TOLERANCE).floor() as i64 + 1
        }
    }

    /// Index of the last sample `i` with `i / rate` inside the range.
    pub fn last_sample_index(&self, sample_rate: f32) -> i64 {
        let t = self.upper.value * sample_rate;
        if self.upper.inclusive {
            (t + SAMPLE_TOLERANCE).floor() as i64
        } else {
            (t - SAMPLE_TOLERANCE).ceil() as i64 - 1
        }
    }

    /// Returns a copy with both bounds multiplied by `factor` (> 0).
    pub fn scaled(&self, factor: f32) -> FloatRange {
        FloatRange::new(
            Bound {
                value: self.lower.value * factor,
                inclusive: self.lower.inclusive,
            },
            Bound {
                value: self.upper.value * factor,
                inclusive: self.upper.inclusive,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_difference_splits_in_the_middle() {
        let clip = FloatRange::inclusive(0.0, 5.0);
        let pieces = clip.difference(&FloatRange::inclusive(2.0, 3.0));
        assert_eq!(
            pieces,
            vec![
                FloatRange::new(Bound::inclusive(0.0), Bound::exclusive(2.0)),
                FloatRange::new(Bound::exclusive(3.0), Bound::inclusive(5.0)),
            ]
        );
    }

    #[test]
    fn test_difference_disjoint_and_covering() {
        let clip = FloatRange::inclusive(0.0, 1.0);
        assert_eq!(clip.difference(&FloatRange::inclusive(2.0, 3.0)), vec![clip]);
        assert!(clip
            .difference(&FloatRange::inclusive(-1.0, 2.0))
            .is_empty());
    }

    #[test]
    fn test_difference_touching_edge() {
        let clip = FloatRange::inclusive(0.0, 5.0);
        let pieces = clip.difference(&FloatRange::inclusive(0.0, 1.0));
        assert_eq!(
            pieces,
            vec![FloatRange::new(Bound::exclusive(1.0), Bound::inclusive(5.0))]
        );
        assert!(!pieces[0].contains(1.0));
        assert!(pieces[0].contains(5.0));
    }

    #[test]
    fn test_intersection_bounds() {
        let a = FloatRange::inclusive(0.0, 5.0);
        let b = FloatRange::half_open(2.0, 5.0);
        let i = a.intersection(&b);
        assert_eq!(i, FloatRange::half_open(2.0, 5.0));
        assert!(FloatRange::half_open(1.0, 1.0).is_empty());
        assert!(!FloatRange::inclusive(1.0, 1.0).is_empty());
    }

    #[test]
    fn test_sample_indices_respect_open_bounds() {
        let rate = 10.0;
        let closed = FloatRange::inclusive(0.0, 2.0);
        assert_eq!(closed.first_sample_index(rate), 0);
        assert_eq!(closed.last_sample_index(rate), 20);

        let open = FloatRange::new(Bound::exclusive(3.0), Bound::exclusive(5.0));
        assert_eq!(open.first_sample_index(rate), 31);
        assert_eq!(open.last_sample_index(rate), 49);

        let partial = FloatRange::inclusive(0.05, 0.26);
        assert_eq!(partial.first_sample_index(rate), 1);
        assert_eq!(partial.last_sample_index(rate), 2);
    }

    #[test]
    fn test_sample_indices_tolerate_rounding_at_bounds() {
        // 0.3 * 10.0 and 0.7 * 10.0 are one ulp off the whole sample
        let rate = 10.0;
        let closed = FloatRange::inclusive(0.3, 0.7);
        assert_eq!(closed.first_sample_index(rate), 3);
        assert_eq!(closed.last_sample_index(rate), 7);

        let open = FloatRange::new(Bound::exclusive(0.3), Bound::exclusive(0.7));
        assert_eq!(open.first_sample_index(rate), 4);
        assert_eq!(open.last_sample_index(rate), 6);
    }
}
