//! Builds `WeightsSqrt` from channel weights and deviations.

use crate::schema::Schema;

const NEARLY_ZERO: f32 = 1e-8;

/// Square-rooted per-dimension weights for `schema`.
///
/// Channel weights are renormalized to sum to one when the preprocessor
/// asks for it, square-rooted, then divided by `deviation` unless the
/// preprocessor is `None`.
pub fn preprocess_weights(schema: &Schema, deviation: &[f32]) -> Vec<f32> {
    let dims = schema.cardinality();
    let mut weights = vec![1.0f32; dims];
    schema.fill_weights(&mut weights);

    let preprocessor = schema.data_preprocessor;
    if preprocessor.normalizes_weights() {
        let sum: f32 = weights.iter().sum();
        if sum.abs() > NEARLY_ZERO {
            let scale = 1.0 / sum;
            weights.iter_mut().for_each(|w| *w *= scale);
        }
    }

    for w in &mut weights {
        *w = w.sqrt();
    }

    if preprocessor.uses_deviation() {
        for (w, d) in weights.iter_mut().zip(deviation) {
            *w /= d;
        }
    }
    weights
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Asset;
    use crate::schema::{Bone, ChannelKind, DataPreprocessor, FeatureChannel, Skeleton};

    fn schema(preprocessor: DataPreprocessor) -> Schema {
        let skeleton = Asset::new("skel", Skeleton::new(vec![Bone::root("root")]));
        Schema::new(
            30,
            skeleton,
            vec![
                FeatureChannel::new("pos", ChannelKind::Position, 3).with_weight(2.0).into(),
                FeatureChannel::new("vel", ChannelKind::Velocity, 2).with_weight(1.0).into(),
            ],
        )
        .with_data_preprocessor(preprocessor)
    }

    #[test]
    fn test_raw_weights_are_square_rooted() {
        let weights = preprocess_weights(&schema(DataPreprocessor::None), &[4.0; 5]);
        assert!((weights[0] - 2f32.sqrt()).abs() < 1e-6);
        assert_eq!(weights[4], 1.0);
    }

    #[test]
    fn test_normalized_weights_sum_to_one() {
        let weights = preprocess_weights(&schema(DataPreprocessor::Normalize), &[1.0; 5]);
        let sum: f32 = weights.iter().map(|w| w * w).sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!((weights[0] * weights[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_deviation_divides_weights() {
        let deviation = [2.0, 2.0, 2.0, 0.5, 0.5];
        let weights = preprocess_weights(&schema(DataPreprocessor::NormalizeOnlyByDeviation), &deviation);
        assert!((weights[0] - 2f32.sqrt() / 2.0).abs() < 1e-6);
        assert!((weights[3] - 2.0).abs() < 1e-6);
    }
}
