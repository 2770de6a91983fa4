//! Per-dimension mean absolute deviation across a normalization set.
//!
//! Leaf channels of every schema are bucketed into groups that may share a
//! deviation. Each group stacks the matching column block of every
//! contributing database, mean-centers it, and averages the row norms.

use crate::schema::{Channel, Schema};
use crate::search_index::SearchIndexBase;

/// Deviations at or below this value are replaced by 1.0.
pub const MIN_FEATURE_MEAN_DEVIATION: f32 = 0.1;

#[derive(Clone, Copy)]
struct Entry<'a> {
    source: usize,
    channel: &'a Channel,
}

fn add_entry<'a>(groups: &mut Vec<Vec<Entry<'a>>>, entry: Entry<'a>) {
    for group in groups.iter_mut() {
        if group[0].channel.can_be_normalized_with(entry.channel) {
            group.push(entry);
            return;
        }
    }
    groups.push(vec![entry]);
}

fn collect_leaves<'a>(channel: &'a Channel, source: usize, groups: &mut Vec<Vec<Entry<'a>>>) {
    let children = channel.sub_channels();
    if children.is_empty() {
        add_entry(groups, Entry { source, channel });
    } else {
        for child in children {
            collect_leaves(child, source, groups);
        }
    }
}

fn group_mean_deviation(group: &[Entry<'_>], sources: &[(&Schema, &SearchIndexBase)]) -> f32 {
    let cardinality = group[0].channel.cardinality();
    let total_rows: usize = group
        .iter()
        .map(|e| sources[e.source].1.num_value_vectors())
        .sum();
    if cardinality == 0 || total_rows == 0 {
        return 0.0;
    }

    let mut stacked: Vec<f64> = Vec::with_capacity(total_rows * cardinality);
    for entry in group {
        let (schema, base) = sources[entry.source];
        let dims = schema.cardinality();
        let offset = entry.channel.data_offset();
        for row in base.values.chunks_exact(dims) {
            stacked.extend(row[offset..offset + cardinality].iter().map(|&v| v as f64));
        }
    }

    let rows = stacked.len() / cardinality;
    let mut mean = vec![0.0f64; cardinality];
    for row in stacked.chunks_exact(cardinality) {
        for (m, v) in mean.iter_mut().zip(row) {
            *m += v;
        }
    }
    for m in &mut mean {
        *m /= rows as f64;
    }

    let norm_sum: f64 = stacked
        .chunks_exact(cardinality)
        .map(|row| {
            row.iter()
                .zip(&mean)
                .map(|(v, m)| (v - m) * (v - m))
                .sum::<f64>()
                .sqrt()
        })
        .sum();
    (norm_sum / rows as f64) as f32
}

/// Deviation vector for `sources[0]`, the primary database.
///
/// `sources` pairs each database of the normalization set with the schema
/// its values were sampled with. The result has the primary schema's
/// cardinality and is all ones when the primary has no poses or its
/// preprocessor does not divide by deviation.
pub fn calculate_mean_deviation(sources: &[(&Schema, &SearchIndexBase)]) -> Vec<f32> {
    let Some(&(primary, primary_base)) = sources.first() else {
        return Vec::new();
    };
    let mut deviation = vec![1.0f32; primary.cardinality()];
    if primary_base.num_poses() == 0 || !primary.data_preprocessor.uses_deviation() {
        return deviation;
    }

    let mut groups: Vec<Vec<Entry<'_>>> = Vec::new();
    for (source, (schema, _)) in sources.iter().enumerate() {
        for channel in schema.channels() {
            collect_leaves(channel, source, &mut groups);
        }
    }

    for group in &groups {
        let primary_entries: Vec<&Entry<'_>> = group
            .iter()
            .filter(|e| e.source == 0 && e.channel.cardinality() > 0)
            .collect();
        if primary_entries.is_empty() {
            continue;
        }
        let value = group_mean_deviation(group, sources);
        let fill = if value > MIN_FEATURE_MEAN_DEVIATION { value } else { 1.0 };
        for entry in primary_entries {
            let start = entry.channel.data_offset();
            deviation[start..start + entry.channel.cardinality()].fill(fill);
        }
    }
    deviation
}
