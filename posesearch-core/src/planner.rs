//! Valid-range planning: which time ranges of which assets get sampled.

use std::collections::HashSet;

use crate::clip::BlendParameters;
use crate::database::{DatabaseAnimationAsset, DatabaseData};
use crate::error::{Error, Result};
use crate::range::{FloatInterval, FloatRange};
use crate::schema::Schema;
use crate::search_index::IndexAsset;

/// Subtracts every exclusion window from `range`.
///
/// Valid ranges are walked from the end so a split in the middle, which
/// turns one range into two, never disturbs ranges not yet processed.
pub fn find_valid_ranges(range: FloatRange, exclusions: &[FloatRange]) -> Vec<FloatRange> {
    let mut valid = Vec::with_capacity(exclusions.len() + 1);
    if !range.is_empty() {
        valid.push(range);
    }
    for exclusion in exclusions {
        for i in (0..valid.len()).rev() {
            let evaluated = valid.remove(i);
            for (offset, piece) in evaluated.difference(exclusion).into_iter().enumerate() {
                valid.insert(i + offset, piece);
            }
        }
    }
    valid
}

/// Effective range of `entry` minus its clips' exclusion windows, in asset
/// time.
fn asset_valid_ranges(
    entry: &DatabaseAnimationAsset,
    params: &BlendParameters,
    exclude_from_database: &FloatInterval,
) -> Vec<FloatRange> {
    let effective = entry.effective_sampling_range(params);
    let mut range = FloatRange::inclusive(effective.min, effective.max);
    if !entry.looping && !entry.is_blend_space() {
        let play_length = entry.play_length(params);
        let keep = FloatRange::half_open(
            exclude_from_database.min,
            play_length + exclude_from_database.max,
        );
        range = range.intersection(&keep);
    }

    // blend spaces carry no exclusion windows of their own
    let mut exclusions = Vec::new();
    if !entry.is_blend_space() {
        for roled in &entry.roles {
            let clip = roled.clip.read();
            exclusions.extend(clip.exclusion_windows.iter().map(|w| w.range()));
        }
    }
    find_valid_ranges(range, &exclusions)
}

/// Fails when a database asked for mirrored poses but some schema role
/// cannot be mirrored.
pub fn validate_mirroring(schema: &Schema, data: &DatabaseData) -> Result<()> {
    for roled in schema.roled_skeletons() {
        if let Some(table) = &roled.mirror_table {
            if table.read().skeleton.is_none() {
                return Err(Error::RoleOrMirrorConfigInvalid(format!(
                    "mirror table '{}' of role '{}' has no skeleton",
                    table.name(),
                    roled.role
                )));
            }
        }
    }

    let wants_mirrored = data
        .assets
        .iter()
        .any(|a| a.enabled && a.mirror_option.includes_mirrored());
    if wants_mirrored {
        if let Some(roled) = schema
            .roled_skeletons()
            .iter()
            .find(|r| r.mirror_table.is_none())
        {
            return Err(Error::RoleOrMirrorConfigInvalid(format!(
                "mirrored assets requested but role '{}' has no mirror table",
                roled.role
            )));
        }
    }
    Ok(())
}

/// Expands every enabled asset of `data` into index assets laid out
/// contiguously in pose-index space.
///
/// Every asset with duplicate roles, or lacking a role the schema needs, is
/// logged; the first such error fails the whole plan.
pub fn init_index_assets(data: &DatabaseData, schema: &Schema) -> Result<Vec<IndexAsset>> {
    let mut assets: Vec<IndexAsset> = Vec::new();
    let mut first_error: Option<Error> = None;
    let mut total_poses = 0usize;

    for (source_asset_idx, entry) in data.assets.iter().enumerate() {
        if !entry.enabled || entry.roles.is_empty() {
            continue;
        }

        let mut seen = HashSet::new();
        for roled in &entry.roles {
            if !seen.insert(roled.role.as_str()) {
                let err = Error::RoleOrMirrorConfigInvalid(format!(
                    "asset '{}' contains duplicate role '{}'",
                    roled.clip.name(),
                    roled.role
                ));
                tracing::error!(%err, "invalid database asset");
                first_error.get_or_insert(err);
            }
        }

        let missing: Vec<&str> = schema
            .roled_skeletons()
            .iter()
            .map(|r| r.role.as_str())
            .filter(|role| entry.clip_for_role(role).is_none())
            .collect();
        if !missing.is_empty() {
            let name = entry.primary().map(|r| r.clip.name().to_string()).unwrap_or_default();
            let err = Error::RoleOrMirrorConfigInvalid(format!(
                "asset '{}' doesn't support roles {:?} required by the schema",
                name, missing
            ));
            tracing::error!(%err, "invalid database asset");
            first_error.get_or_insert(err);
            continue;
        }

        let is_blend_space = entry.is_blend_space();
        for params in entry.sampling_parameters() {
            let ranges = asset_valid_ranges(entry, &params, &data.settings.exclude_from_database);
            let to_real_time_factor = if is_blend_space {
                let play_length = entry.play_length(&params);
                if play_length > f32::EPSILON {
                    play_length
                } else {
                    1.0
                }
            } else {
                1.0
            };

            for range in &ranges {
                for permutation_idx in 0..schema.number_of_permutations {
                    let variants = [
                        (false, entry.mirror_option.includes_unmirrored()),
                        (true, entry.mirror_option.includes_mirrored()),
                    ];
                    for (mirrored, requested) in variants {
                        if !requested {
                            continue;
                        }
                        let asset = IndexAsset {
                            source_asset_idx,
                            mirrored,
                            looping: entry.looping,
                            disable_reselection: entry.disable_reselection,
                            permutation_idx,
                            blend_parameters: params,
                            sampling_range: *range,
                            sample_rate: schema.sample_rate,
                            to_real_time_factor,
                            first_pose_idx: total_poses,
                        };
                        let num_poses = asset.num_poses();
                        if num_poses > 0 {
                            total_poses += num_poses;
                            assets.push(asset);
                        }
                    }
                }
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(assets),
    }
}
