//! Animation clips and their annotation windows.

use std::sync::{Arc, Weak};

use crate::asset::{Asset, AssetData, ContentHasher};
use crate::database::Database;
use crate::range::FloatRange;

/// Blend-space coordinates. Unused axes are zero.
pub type BlendParameters = [f32; 3];

/// One axis of a blend-space sampling grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendAxis {
    pub min: f32,
    pub max: f32,
    /// Number of grid samples along the axis.
    pub samples: u32,
}

impl BlendAxis {
    pub fn new(min: f32, max: f32, samples: u32) -> Self {
        Self { min, max, samples }
    }

    fn value(&self, index: u32) -> f32 {
        if self.samples <= 1 {
            return self.min;
        }
        self.min + (self.max - self.min) * index as f32 / (self.samples - 1) as f32
    }
}

/// Regular grid over up to two blend-space axes.
#[derive(Debug, Clone, PartialEq)]
pub struct BlendSpace {
    pub horizontal: BlendAxis,
    pub vertical: Option<BlendAxis>,
}

impl BlendSpace {
    pub fn new(horizontal: BlendAxis) -> Self {
        Self {
            horizontal,
            vertical: None,
        }
    }

    pub fn with_vertical(mut self, axis: BlendAxis) -> Self {
        self.vertical = Some(axis);
        self
    }

    /// Grid points, horizontal index varying fastest.
    pub fn sampling_parameters(&self) -> Vec<BlendParameters> {
        let h = self.horizontal.samples.max(1);
        let v = self.vertical.map_or(1, |a| a.samples.max(1));
        let mut params = Vec::with_capacity((h * v) as usize);
        for j in 0..v {
            let y = self.vertical.map_or(0.0, |a| a.value(j));
            for i in 0..h {
                params.push([self.horizontal.value(i), y, 0.0]);
            }
        }
        params
    }
}

/// An annotation window `[start, start + duration]` on a clip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NotifyWindow {
    pub start: f32,
    pub duration: f32,
}

impl NotifyWindow {
    pub fn new(start: f32, duration: f32) -> Self {
        Self { start, duration }
    }

    pub fn range(&self) -> FloatRange {
        FloatRange::inclusive(self.start, self.start + self.duration)
    }
}

/// A discrete, tagged point in time (foot plant, attack start...).
#[derive(Debug, Clone, PartialEq)]
pub struct ClipEvent {
    pub tag: String,
    pub time: f32,
}

/// A sampled animation: a sequence or, with `blend_space`, a blend space.
#[derive(Debug, Clone, Default)]
pub struct AnimationClip {
    /// Length in seconds.
    pub play_length: f32,
    pub blend_space: Option<BlendSpace>,
    /// Windows never sampled into a database.
    pub exclusion_windows: Vec<NotifyWindow>,
    /// Windows whose poses cannot be transitioned into.
    pub block_transition_windows: Vec<NotifyWindow>,
    pub events: Vec<ClipEvent>,
    /// Extra bones required by sampling-attribute annotations.
    pub sampling_attribute_bones: Vec<String>,
    /// Databases this clip branches into; they mirror this clip as an asset.
    pub branch_in: Vec<Weak<Database>>,
}

pub type ClipRef = Arc<Asset<AnimationClip>>;

impl AnimationClip {
    pub fn new(play_length: f32) -> Self {
        Self {
            play_length,
            ..Default::default()
        }
    }

    pub fn with_blend_space(mut self, blend_space: BlendSpace) -> Self {
        self.blend_space = Some(blend_space);
        self
    }

    pub fn with_exclusion(mut self, start: f32, duration: f32) -> Self {
        self.exclusion_windows.push(NotifyWindow::new(start, duration));
        self
    }

    pub fn with_block_transition(mut self, start: f32, duration: f32) -> Self {
        self.block_transition_windows
            .push(NotifyWindow::new(start, duration));
        self
    }

    pub fn with_event(mut self, tag: impl Into<String>, time: f32) -> Self {
        self.events.push(ClipEvent {
            tag: tag.into(),
            time,
        });
        self
    }

    pub fn with_sampling_attribute_bone(mut self, bone: impl Into<String>) -> Self {
        self.sampling_attribute_bones.push(bone.into());
        self
    }

    pub fn with_branch_in(mut self, database: &Arc<Database>) -> Self {
        self.branch_in.push(Arc::downgrade(database));
        self
    }

    pub fn is_blend_space(&self) -> bool {
        self.blend_space.is_some()
    }

    /// Play length at the given blend parameters.
    pub fn play_length_at(&self, _params: &BlendParameters) -> f32 {
        self.play_length
    }

    /// Sampling grid; a single zero point for sequences.
    pub fn sampling_parameters(&self) -> Vec<BlendParameters> {
        match &self.blend_space {
            Some(bs) => bs.sampling_parameters(),
            None => vec![[0.0; 3]],
        }
    }

    pub fn is_block_transition(&self, time: f32) -> bool {
        self.block_transition_windows
            .iter()
            .any(|w| w.range().contains(time))
    }
}

fn hash_windows(hasher: &mut ContentHasher, windows: &[NotifyWindow]) {
    hasher.write_usize(windows.len());
    for w in windows {
        hasher.write_f32(w.start);
        hasher.write_f32(w.duration);
    }
}

impl AssetData for AnimationClip {
    const KIND: &'static str = "clip";

    fn hash_content(&self, hasher: &mut ContentHasher) {
        hasher.write_f32(self.play_length);
        hasher.write_bool(self.blend_space.is_some());
        if let Some(bs) = &self.blend_space {
            for axis in std::iter::once(Some(bs.horizontal)).chain(std::iter::once(bs.vertical)) {
                hasher.write_bool(axis.is_some());
                if let Some(axis) = axis {
                    hasher.write_f32(axis.min);
                    hasher.write_f32(axis.max);
                    hasher.write_u32(axis.samples);
                }
            }
        }
        hash_windows(hasher, &self.exclusion_windows);
        hash_windows(hasher, &self.block_transition_windows);
        hasher.write_usize(self.events.len());
        for event in &self.events {
            hasher.write_str(&event.tag);
            hasher.write_f32(event.time);
        }
        hasher.write_usize(self.sampling_attribute_bones.len());
        for bone in &self.sampling_attribute_bones {
            hasher.write_str(bone);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blend_space_grid() {
        let bs = BlendSpace::new(BlendAxis::new(0.0, 300.0, 3)).with_vertical(BlendAxis::new(
            -90.0,
            90.0,
            2,
        ));
        let params = bs.sampling_parameters();
        assert_eq!(params.len(), 6);
        assert_eq!(params[0], [0.0, -90.0, 0.0]);
        assert_eq!(params[1], [150.0, -90.0, 0.0]);
        assert_eq!(params[5], [300.0, 90.0, 0.0]);
    }

    #[test]
    fn test_single_sample_axis_uses_min() {
        let bs = BlendSpace::new(BlendAxis::new(10.0, 20.0, 1));
        assert_eq!(bs.sampling_parameters(), vec![[10.0, 0.0, 0.0]]);
    }

    #[test]
    fn test_sequence_has_one_sampling_parameter() {
        let clip = AnimationClip::new(2.0);
        assert_eq!(clip.sampling_parameters(), vec![[0.0; 3]]);
        assert!(!clip.is_blend_space());
    }

    #[test]
    fn test_block_transition_windows_are_inclusive() {
        let clip = AnimationClip::new(2.0).with_block_transition(0.5, 0.25);
        assert!(!clip.is_block_transition(0.4));
        assert!(clip.is_block_transition(0.5));
        assert!(clip.is_block_transition(0.75));
        assert!(!clip.is_block_transition(0.8));
    }
}
