//! Merge candidate selection
//!
//! Parts are bucketed into size tiers: tier 0 holds parts up to
//! `tier_base_bytes`, tier `n` parts up to `tier_base_bytes * tier_ratio^n`.
//! A tier holding more than `max_parts_per_tier` parts is merged, smallest
//! tier first and oldest parts first, so recent small parts are folded
//! together quickly while large parts are rewritten rarely.

use super::MergeConfig;
use crate::part::PartMeta;
use crate::Timestamp;
use std::collections::BTreeMap;

/// Size tier of a part
pub fn tier_of(size_bytes: u64, base: u64, ratio: u64) -> u32 {
    let mut tier = 0;
    let mut bound = base.max(1);
    while size_bytes > bound {
        tier += 1;
        bound = bound.saturating_mul(ratio.max(2));
    }
    tier
}

/// Pick the next group of parts to merge, or `None` if no tier is over
/// its limit. `parts` must only contain parts not already being merged.
pub fn select_merge_candidates(parts: &[PartMeta], config: &MergeConfig) -> Option<Vec<u64>> {
    let mut tiers: BTreeMap<u32, Vec<&PartMeta>> = BTreeMap::new();
    for meta in parts {
        let tier = tier_of(meta.size_bytes, config.tier_base_bytes, config.tier_ratio);
        tiers.entry(tier).or_default().push(meta);
    }

    for (tier, mut members) in tiers {
        if members.len() <= config.max_parts_per_tier {
            continue;
        }
        members.sort_by_key(|m| m.id);
        let picked = take_oldest(&members, config.max_merge_fanin, config.max_output_bytes);
        if picked.len() >= 2 {
            tracing::debug!("Tier {} over limit: merging parts {:?}", tier, picked);
            return Some(picked);
        }
    }
    None
}

/// Oldest parts up to the fan-in and output size limits; the first two are
/// always taken so an oversized tier still makes progress
fn take_oldest(members: &[&PartMeta], fanin: usize, max_bytes: u64) -> Vec<u64> {
    let mut picked = Vec::new();
    let mut total = 0u64;
    for meta in members.iter().take(fanin.max(2)) {
        if picked.len() >= 2 && total.saturating_add(meta.size_bytes) > max_bytes {
            break;
        }
        total = total.saturating_add(meta.size_bytes);
        picked.push(meta.id);
    }
    picked
}

/// Oldest parts for an explicit full merge, or `None` if at most one part is left
pub fn select_forced(parts: &[PartMeta], config: &MergeConfig) -> Option<Vec<u64>> {
    if parts.len() < 2 {
        return None;
    }
    let mut ids: Vec<u64> = parts.iter().map(|m| m.id).collect();
    ids.sort_unstable();
    ids.truncate(config.max_merge_fanin.max(2));
    Some(ids)
}

/// Parts affected by a retention cutoff
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetentionPlan {
    /// Entirely older than the cutoff: drop without rewriting
    pub drop: Vec<u64>,
    /// Straddle the cutoff: rewrite without the expired rows
    pub rewrite: Vec<u64>,
}

impl RetentionPlan {
    pub fn is_empty(&self) -> bool {
        self.drop.is_empty() && self.rewrite.is_empty()
    }
}

pub fn select_retention(parts: &[PartMeta], cutoff: Timestamp) -> RetentionPlan {
    let mut plan = RetentionPlan::default();
    for meta in parts {
        if meta.rows == 0 || meta.max_timestamp < cutoff {
            plan.drop.push(meta.id);
        } else if meta.min_timestamp < cutoff {
            plan.rewrite.push(meta.id);
        }
    }
    plan
}
