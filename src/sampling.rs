//! Frame sampling policy.
//!
//! A frame `f` is sampled iff `f mod frame_step == 0` (Euclidean remainder,
//! so negative frame numbers behave like positive ones). Both the build stage
//! and the live query layer use the same policy, so a frame skipped at build
//! time is also a no-op at query time.

use serde::{Deserialize, Serialize};

use crate::{Frame, FrameRange};

/// Stride-based frame sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplePolicy {
    frame_step: u32,
}

impl SamplePolicy {
    /// Create a policy with the given stride. A stride of 0 is treated as 1.
    pub fn new(frame_step: u32) -> Self {
        Self {
            frame_step: frame_step.max(1),
        }
    }

    /// Keep every frame.
    pub fn every_frame() -> Self {
        Self::new(1)
    }

    pub fn frame_step(&self) -> u32 {
        self.frame_step
    }

    /// Whether `frame` is materialized and displayed.
    #[inline]
    pub fn is_sampled(&self, frame: Frame) -> bool {
        frame.rem_euclid(self.frame_step as i64) == 0
    }

    /// First sampled frame inside `range`, if any.
    pub fn first_sampled(&self, range: FrameRange) -> Option<Frame> {
        let step = self.frame_step as i64;
        let offset = (step - range.min_frame.rem_euclid(step)) % step;
        let first = range.min_frame.checked_add(offset)?;
        (first <= range.max_frame).then_some(first)
    }

    /// Number of sampled frames inside `range`.
    pub fn sampled_count(&self, range: FrameRange) -> usize {
        match self.first_sampled(range) {
            Some(first) => {
                let steps = range.max_frame.abs_diff(first) / self.frame_step as u64;
                usize::try_from(steps).map_or(usize::MAX, |n| n.saturating_add(1))
            }
            None => 0,
        }
    }

    /// Dense index of a sampled frame inside `range`.
    ///
    /// Returns `None` for frames outside the range or not on the stride.
    pub fn index_of(&self, frame: Frame, range: FrameRange) -> Option<usize> {
        if !range.contains(frame) || !self.is_sampled(frame) {
            return None;
        }
        let first = self.first_sampled(range)?;
        usize::try_from(frame.abs_diff(first) / self.frame_step as u64).ok()
    }

    /// Iterate over all sampled frames inside `range` in ascending order.
    pub fn sampled_frames(&self, range: FrameRange) -> impl Iterator<Item = Frame> {
        let step = self.frame_step as usize;
        let first = self.first_sampled(range);
        let end = range.max_frame;
        first
            .into_iter()
            .flat_map(move |first| (first..=end).step_by(step))
    }
}

impl Default for SamplePolicy {
    fn default() -> Self {
        Self::every_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modulo_sampling() {
        let policy = SamplePolicy::new(3);
        assert!(policy.is_sampled(0));
        assert!(policy.is_sampled(9));
        assert!(!policy.is_sampled(10));
        assert!(policy.is_sampled(-3));
        assert!(!policy.is_sampled(-1));
    }

    #[test]
    fn test_zero_step_clamped() {
        let policy = SamplePolicy::new(0);
        assert_eq!(policy.frame_step(), 1);
        assert!(policy.is_sampled(7));
    }

    #[test]
    fn test_first_sampled_and_count() {
        let policy = SamplePolicy::new(3);
        let range = FrameRange::new(0, 40);
        assert_eq!(policy.first_sampled(range), Some(0));
        assert_eq!(policy.sampled_count(range), 14); // 0, 3, ..., 39

        let range = FrameRange::new(4, 8);
        assert_eq!(policy.first_sampled(range), Some(6));
        assert_eq!(policy.sampled_count(range), 1);

        let range = FrameRange::new(4, 5);
        assert_eq!(policy.first_sampled(range), None);
        assert_eq!(policy.sampled_count(range), 0);
    }

    #[test]
    fn test_index_of() {
        let policy = SamplePolicy::new(10);
        let range = FrameRange::new(5, 45);
        assert_eq!(policy.index_of(10, range), Some(0));
        assert_eq!(policy.index_of(40, range), Some(3));
        assert_eq!(policy.index_of(41, range), None);
        assert_eq!(policy.index_of(50, range), None);
    }

    #[test]
    fn test_extreme_range_does_not_overflow() {
        let range = FrameRange::new(i64::MIN, i64::MAX);
        assert_eq!(SamplePolicy::new(1).sampled_count(range), usize::MAX);
        assert_eq!(SamplePolicy::new(1).index_of(i64::MIN, range), Some(0));

        let policy = SamplePolicy::new(1 << 20);
        let first = policy.first_sampled(range).unwrap();
        assert_eq!(first, i64::MIN);
        assert_eq!(policy.index_of(0, range), Some(1 << 43));
        assert_eq!(policy.sampled_count(range), 1 << 44);
    }

    #[test]
    fn test_sampled_frames_iter() {
        let policy = SamplePolicy::new(10);
        let frames: Vec<Frame> = policy.sampled_frames(FrameRange::new(0, 40)).collect();
        assert_eq!(frames, vec![0, 10, 20, 30, 40]);

        let frames: Vec<Frame> = policy.sampled_frames(FrameRange::new(1, 9)).collect();
        assert!(frames.is_empty());
    }
}
