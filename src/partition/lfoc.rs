//! LFOC-family clustering (spec §4.J "the hardest sub-algorithm").
//!
//! Classifies applications, reserves ways for streaming workloads, clusters
//! cache-sensitive applications (optionally pairing them when that reduces
//! worst-case slowdown), and distributes light-sharing applications across
//! the result. The combined/partitioned slowdown model used by the
//! pair-clustering core is a declarative curve supplied by the caller
//! (typically sampled from hardware miss-rate counters upstream of this
//! module), not a hardware-specific cache simulator — out of scope per
//! spec §1.

use crate::error::{PmcError, PmcResult};
use crate::partition::set::AppId;

/// An application's cache-sensitivity classification (spec §4.J step 1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppClass {
    Sensitive,
    Light,
    Streaming,
    Unknown,
}

/// Per-way miss-rate and slowdown curves for one application, indexed
/// `0..=max_ways` (index 0 unused, ways are 1-based). `slowdown[w]` is this
/// app's estimated slowdown when given `w` ways alone.
#[derive(Clone, Debug)]
pub struct AppProfile {
    pub id: AppId,
    pub class: AppClass,
    pub miss_rate: Vec<f64>,
    pub slowdown: Vec<f64>,
}

impl AppProfile {
    fn slowdown_at(&self, ways: u8) -> f64 {
        let idx = (ways as usize).min(self.slowdown.len().saturating_sub(1));
        self.slowdown.get(idx).copied().unwrap_or(1.0)
    }

    fn miss_rate_at(&self, ways: u8) -> f64 {
        let idx = (ways as usize).min(self.miss_rate.len().saturating_sub(1));
        self.miss_rate.get(idx).copied().unwrap_or(0.0)
    }
}

/// Tunables for one clustering run (spec §4.J).
#[derive(Clone, Copy, Debug)]
pub struct LfocParams {
    pub nr_ways: u8,
    pub max_streaming: u32,
    pub use_pair_clustering: bool,
    pub max_ways_streaming_part: u8,
    pub collide_streaming_parts: bool,
}

/// Cache ways per streaming application; capped by [`LfocParams`].
const STREAMING_PART_SIZE: u32 = 1;
const MAX_WAYS_STREAMING: u8 = 4;
/// Ratio of reserved streaming-partition headroom handed to light apps
/// before the rest round-robins across sensitive clusters.
const LIGHT_PER_STREAMING: f64 = 0.5;

#[derive(Clone, Debug)]
pub struct Cluster {
    pub members: Vec<AppId>,
    pub ways: u8,
}

#[derive(Clone, Debug, Default)]
pub struct LfocResult {
    pub clusters: Vec<Cluster>,
    pub default_cluster: Option<usize>,
    pub streaming_clusters: Vec<Cluster>,
    pub light_assignments: Vec<(AppId, usize)>,
}

fn classify_counts(apps: &[AppProfile]) -> (usize, usize, usize, usize) {
    let mut sensitive = 0;
    let mut light = 0;
    let mut streaming = 0;
    let mut unknown = 0;
    for a in apps {
        match a.class {
            AppClass::Sensitive => sensitive += 1,
            AppClass::Light => light += 1,
            AppClass::Streaming => streaming += 1,
            AppClass::Unknown => unknown += 1,
        }
    }
    (sensitive, light, streaming, unknown)
}

/// Runs the full LFOC clustering pipeline (spec §4.J steps 1-7).
pub fn lfoc_cluster(apps: &[AppProfile], params: LfocParams) -> PmcResult<LfocResult> {
    let (nr_sensitive, _nr_light, nr_streaming, nr_unknown) = classify_counts(apps);

    if nr_unknown > 0 {
        return Err(PmcError::StateConflict(
            "unknown-class application present; profile before clustering".into(),
        ));
    }

    if nr_sensitive == 0 {
        let members: Vec<AppId> = apps.iter().map(|a| a.id).collect();
        return Ok(LfocResult {
            clusters: vec![Cluster {
                members,
                ways: params.nr_ways,
            }],
            default_cluster: Some(0),
            streaming_clusters: Vec::new(),
            light_assignments: Vec::new(),
        });
    }

    // Step 3: reserve ways for streaming apps.
    let mut nr_reserved_ways = 0u8;
    if nr_streaming > 0 {
        let raw = (nr_streaming as u32 * STREAMING_PART_SIZE).div_ceil(params.max_streaming.max(1));
        nr_reserved_ways = (raw as u8).min(MAX_WAYS_STREAMING).min(params.nr_ways);
    }
    let ways_for_sensitive = params.nr_ways.saturating_sub(nr_reserved_ways);

    let sensitive: Vec<&AppProfile> = apps
        .iter()
        .filter(|a| a.class == AppClass::Sensitive)
        .collect();

    // Step 4: cluster sensitive apps.
    let mut clusters = if params.use_pair_clustering {
        pair_cluster(&sensitive, ways_for_sensitive)
    } else {
        let mut clusters = Vec::with_capacity(sensitive.len());
        let assignment = ucp_lookahead(&sensitive.iter().map(|a| (*a).clone()).collect::<Vec<_>>(), ways_for_sensitive);
        for (app, ways) in sensitive.iter().zip(assignment) {
            clusters.push(Cluster {
                members: vec![app.id],
                ways,
            });
        }
        clusters
    };

    // Step 5: default cluster is the smallest.
    let default_cluster = clusters
        .iter()
        .enumerate()
        .min_by_key(|(_, c)| c.ways)
        .map(|(i, _)| i);

    // Step 6: streaming apps get the reserved partition(s).
    let streaming_apps: Vec<AppId> = apps
        .iter()
        .filter(|a| a.class == AppClass::Streaming)
        .map(|a| a.id)
        .collect();
    let streaming_clusters = if streaming_apps.is_empty() {
        Vec::new()
    } else if params.collide_streaming_parts {
        vec![Cluster {
            members: streaming_apps,
            ways: nr_reserved_ways,
        }]
    } else {
        let per = (nr_reserved_ways / streaming_apps.len().max(1) as u8).max(1);
        streaming_apps
            .into_iter()
            .map(|id| Cluster {
                members: vec![id],
                ways: per.min(params.max_ways_streaming_part),
            })
            .collect()
    };

    // Step 7: distribute light-sharing apps, preferring streaming-partition
    // headroom before round-robining across sensitive clusters.
    let light_apps: Vec<AppId> = apps
        .iter()
        .filter(|a| a.class == AppClass::Light)
        .map(|a| a.id)
        .collect();
    let mut light_assignments = Vec::with_capacity(light_apps.len());
    let headroom = if streaming_clusters.is_empty() {
        0
    } else {
        ((params.max_streaming as f64 * nr_reserved_ways as f64
            - apps.len() as f64
            + 1.0)
            .max(0.0)
            * LIGHT_PER_STREAMING) as usize
    };
    let mut light_iter = light_apps.into_iter();
    for _ in 0..headroom {
        if let Some(app) = light_iter.next() {
            light_assignments.push((app, clusters.len())); // index clusters.len() marks "streaming partition"
        } else {
            break;
        }
    }
    let nr_clusters = clusters.len().max(1);
    for (i, app) in light_iter.enumerate() {
        light_assignments.push((app, i % nr_clusters));
    }

    if clusters.is_empty() {
        clusters.push(Cluster {
            members: Vec::new(),
            ways: ways_for_sensitive,
        });
    }

    Ok(LfocResult {
        clusters,
        default_cluster,
        streaming_clusters,
        light_assignments,
    })
}

/// UCP lookahead: assigns each app one way, then repeatedly grants one more
/// way to whichever app has the highest marginal utility
/// `(slowdown[j] − slowdown[i]) / (i − j)` of moving from its current `j`
/// ways to a candidate `i > j`, until no positive utility remains or ways
/// run out; any leftover ways are distributed round-robin (spec §4.J "UCP
/// lookahead").
pub fn ucp_lookahead(apps: &[AppProfile], nr_ways: u8) -> Vec<u8> {
    if apps.is_empty() {
        return Vec::new();
    }
    let mut ways = vec![1u8; apps.len()];
    let mut remaining = nr_ways as i32 - apps.len() as i32;
    if remaining < 0 {
        // Fewer ways than apps: everyone gets at most 1, distributed
        // round-robin across whichever apps fit.
        return (0..apps.len())
            .map(|i| if (i as i32) < nr_ways as i32 { 1 } else { 0 })
            .collect();
    }

    while remaining > 0 {
        let mut best_app = None;
        let mut best_utility = 0.0f64;
        let mut best_candidate = 0u8;
        for (idx, app) in apps.iter().enumerate() {
            let current = ways[idx];
            let max_curve = (app.slowdown.len() as u8).saturating_sub(1);
            for candidate in (current + 1)..=max_curve.min(current + remaining as u8) {
                let delta_ways = (candidate - current) as f64;
                if delta_ways <= 0.0 {
                    continue;
                }
                let utility =
                    (app.slowdown_at(current) - app.slowdown_at(candidate)) / delta_ways;
                if utility > best_utility {
                    best_utility = utility;
                    best_app = Some(idx);
                    best_candidate = candidate;
                }
            }
        }
        match best_app {
            Some(idx) => {
                remaining -= (best_candidate - ways[idx]) as i32;
                ways[idx] = best_candidate;
            }
            None => break,
        }
    }

    let mut idx = 0;
    while remaining > 0 {
        ways[idx % ways.len()] += 1;
        remaining -= 1;
        idx += 1;
    }
    ways
}

/// The combined slowdown curve of two apps sharing `ways` ways together,
/// modeled by scaling each app's solo miss rate by its share of the pair's
/// combined miss-rate weight at that way count (spec §4.J "per-app space is
/// scaled by the ratio of per-way miss rates").
fn combined_slowdown(a: &AppProfile, b: &AppProfile, ways: u8) -> f64 {
    let ma = a.miss_rate_at(ways).max(1e-9);
    let mb = b.miss_rate_at(ways).max(1e-9);
    let share_a = ma / (ma + mb);
    let ways_a = ((ways as f64 * share_a).round() as u8).clamp(1, ways.saturating_sub(1).max(1));
    let ways_b = ways.saturating_sub(ways_a).max(1);
    a.slowdown_at(ways_a).max(b.slowdown_at(ways_b))
}

fn partitioned_slowdown(a: &AppProfile, b: &AppProfile, ways: u8) -> f64 {
    let split = ucp_lookahead(&[a.clone(), b.clone()], ways);
    a.slowdown_at(split[0]).max(b.slowdown_at(split[1]))
}

/// `sum over ways i of (combined_max_slowdown(i) − partitioned_max_slowdown(i))`
/// (spec §4.J "Pair-clustering core"). Negative means merging the pair is
/// beneficial (the combined curve dominates the partitioned one less than
/// it costs to keep them separate).
fn slowdown_distance(a: &AppProfile, b: &AppProfile, total_ways: u8) -> f64 {
    (2..=total_ways)
        .map(|w| combined_slowdown(a, b, w) - partitioned_slowdown(a, b, w))
        .sum()
}

fn unfairness(slowdowns: &[f64]) -> f64 {
    let max = slowdowns.iter().cloned().fold(f64::MIN, f64::max);
    let min = slowdowns.iter().cloned().fold(f64::MAX, f64::min).max(1e-9);
    1000.0 * max / min
}

/// Greedy pair-clustering core (spec §4.J). Starts with one cluster per
/// app; repeatedly merges the most-penalized app (highest solo slowdown)
/// with its lowest-distance neighbor as long as the merge strictly reduces
/// unfairness, keeping the best solution seen.
fn pair_cluster(apps: &[&AppProfile], total_ways: u8) -> Vec<Cluster> {
    if apps.is_empty() {
        return Vec::new();
    }
    let mut clusters: Vec<Vec<&AppProfile>> = apps.iter().map(|a| vec![*a]).collect();

    let cluster_ways = |clusters: &[Vec<&AppProfile>]| -> Vec<u8> {
        let profiles: Vec<AppProfile> = clusters
            .iter()
            .map(|c| representative_profile(c))
            .collect();
        ucp_lookahead(&profiles, total_ways)
    };

    let mut best = clusters.clone();
    let mut best_unfairness = {
        let ways = cluster_ways(&clusters);
        let slowdowns: Vec<f64> = clusters
            .iter()
            .zip(&ways)
            .map(|(c, &w)| representative_profile(c).slowdown_at(w))
            .collect();
        unfairness(&slowdowns)
    };

    let max_merges = apps.len().saturating_sub(1);
    for _ in 0..max_merges {
        if clusters.len() < 2 {
            break;
        }
        let ways = cluster_ways(&clusters);
        let slowdowns: Vec<f64> = clusters
            .iter()
            .zip(&ways)
            .map(|(c, &w)| representative_profile(c).slowdown_at(w))
            .collect();

        let (worst_idx, _) = slowdowns
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap();

        let worst_rep = representative_profile(&clusters[worst_idx]);
        let mut best_neighbor = None;
        let mut best_distance = f64::MAX;
        for (idx, other) in clusters.iter().enumerate() {
            if idx == worst_idx {
                continue;
            }
            let other_rep = representative_profile(other);
            let dist = slowdown_distance(&worst_rep, &other_rep, total_ways);
            if dist < best_distance {
                best_distance = dist;
                best_neighbor = Some(idx);
            }
        }

        let neighbor_idx = match best_neighbor {
            Some(n) => n,
            None => break,
        };

        let mut merged = clusters.clone();
        let (lo, hi) = if worst_idx < neighbor_idx {
            (worst_idx, neighbor_idx)
        } else {
            (neighbor_idx, worst_idx)
        };
        let removed = merged.remove(hi);
        merged[lo].extend(removed);

        let merged_ways = cluster_ways(&merged);
        let merged_slowdowns: Vec<f64> = merged
            .iter()
            .zip(&merged_ways)
            .map(|(c, &w)| representative_profile(c).slowdown_at(w))
            .collect();
        let merged_unfairness = unfairness(&merged_slowdowns);

        if merged_unfairness < best_unfairness {
            best_unfairness = merged_unfairness;
            best = merged.clone();
        }
        if merged_unfairness >= unfairness(&slowdowns) {
            break;
        }
        clusters = merged;
    }

    let ways = cluster_ways(&best);
    best.into_iter()
        .zip(ways)
        .map(|(c, w)| Cluster {
            members: c.iter().map(|a| a.id).collect(),
            ways: w,
        })
        .collect()
}

/// A synthetic profile standing in for a cluster: the pointwise worst-case
/// (max) slowdown and miss rate across members, used as the cluster's
/// curve for UCP lookahead and distance computations.
fn representative_profile(members: &[&AppProfile]) -> AppProfile {
    let len = members
        .iter()
        .map(|m| m.slowdown.len())
        .max()
        .unwrap_or(1);
    let mut slowdown = vec![1.0; len];
    let mut miss_rate = vec![0.0; len];
    for w in 0..len {
        slowdown[w] = members
            .iter()
            .map(|m| m.slowdown_at(w as u8))
            .fold(0.0, f64::max);
        miss_rate[w] = members
            .iter()
            .map(|m| m.miss_rate_at(w as u8))
            .fold(0.0, f64::max);
    }
    AppProfile {
        id: members[0].id,
        class: AppClass::Sensitive,
        miss_rate,
        slowdown,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn decreasing_curve(len: usize, floor: f64) -> Vec<f64> {
        (0..len).map(|w| floor + 10.0 / (w as f64 + 1.0)).collect()
    }

    fn profile(id: AppId, class: AppClass) -> AppProfile {
        AppProfile {
            id,
            class,
            miss_rate: decreasing_curve(21, 0.01),
            slowdown: decreasing_curve(21, 1.0),
        }
    }

    #[test]
    fn no_sensitive_apps_forms_one_shared_cluster() {
        let apps = vec![profile(1, AppClass::Light), profile(2, AppClass::Streaming)];
        let params = LfocParams {
            nr_ways: 16,
            max_streaming: 4,
            use_pair_clustering: true,
            max_ways_streaming_part: 4,
            collide_streaming_parts: true,
        };
        let result = lfoc_cluster(&apps, params).unwrap();
        assert_eq!(result.clusters.len(), 1);
        assert_eq!(result.clusters[0].ways, 16);
    }

    #[test]
    fn unknown_app_refuses_clustering() {
        let apps = vec![profile(1, AppClass::Unknown)];
        let params = LfocParams {
            nr_ways: 16,
            max_streaming: 4,
            use_pair_clustering: true,
            max_ways_streaming_part: 4,
            collide_streaming_parts: true,
        };
        assert!(lfoc_cluster(&apps, params).is_err());
    }

    #[test]
    fn streaming_reservation_is_capped() {
        let apps: Vec<AppProfile> = (0..20)
            .map(|i| profile(i, AppClass::Streaming))
            .chain(std::iter::once(profile(99, AppClass::Sensitive)))
            .collect();
        let params = LfocParams {
            nr_ways: 16,
            max_streaming: 1,
            use_pair_clustering: false,
            max_ways_streaming_part: 4,
            collide_streaming_parts: true,
        };
        let result = lfoc_cluster(&apps, params).unwrap();
        let streaming_ways: u8 = result.streaming_clusters.iter().map(|c| c.ways).sum();
        assert!(streaming_ways <= MAX_WAYS_STREAMING);
    }

    #[test]
    fn ucp_lookahead_uses_all_ways_and_favors_nobody_when_identical() {
        let apps = vec![
            profile(1, AppClass::Sensitive),
            profile(2, AppClass::Sensitive),
        ];
        let ways = ucp_lookahead(&apps, 10);
        assert_eq!(ways.iter().map(|&w| w as u32).sum::<u32>(), 10);
        assert_eq!(ways[0], ways[1], "identical curves split evenly");
    }

    #[test]
    fn ucp_lookahead_grants_more_ways_to_steeper_curve() {
        let hungry = AppProfile {
            id: 1,
            class: AppClass::Sensitive,
            miss_rate: decreasing_curve(21, 0.01),
            slowdown: (0..21).map(|w| 1.0 + 50.0 / (w as f64 + 1.0)).collect(),
        };
        let flat = AppProfile {
            id: 2,
            class: AppClass::Sensitive,
            miss_rate: vec![0.01; 21],
            slowdown: vec![1.0; 21],
        };
        let ways = ucp_lookahead(&[hungry, flat], 10);
        assert!(ways[0] > ways[1]);
    }

    #[test]
    fn pair_clustering_conserves_ways_across_clusters() {
        let apps = vec![
            profile(1, AppClass::Sensitive),
            profile(2, AppClass::Sensitive),
            profile(3, AppClass::Sensitive),
        ];
        let refs: Vec<&AppProfile> = apps.iter().collect();
        let clusters = pair_cluster(&refs, 12);
        let total: u32 = clusters.iter().map(|c| c.ways as u32).sum();
        assert_eq!(total, 12);
        let members: usize = clusters.iter().map(|c| c.members.len()).sum();
        assert_eq!(members, 3);
    }
}
