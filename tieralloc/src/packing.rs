//! Site packing: turns per-arena profile records into a value/weight
//! ordering over allocation sites, and greedily packs the most valuable
//! sites into the fast tier's capacity.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::{SortKey, WeightSource};
use crate::profile::data::{ApplicationProfile, ArenaProfile};

/// One site's standing in a packing decision. When an arena holds several
/// sites, each site carries the whole arena's profile.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteProfile {
    pub site: u32,
    pub arena_index: usize,
    pub value: u64,
    pub weight: u64,
    pub value_per_weight: f64,
}

impl SiteProfile {
    fn new(site: u32, arena_index: usize, value: u64, weight: u64) -> Self {
        SiteProfile {
            site,
            arena_index,
            value,
            weight,
            value_per_weight: value as f64 / weight as f64,
        }
    }
}

fn arena_value(arena: &ArenaProfile, value_events: &[usize], multipliers: &[f32]) -> u64 {
    let mut value = 0.0f64;
    for &idx in value_events {
        let total = arena.events.get(idx).map(|e| e.total).unwrap_or(0);
        let mult = multipliers.get(idx).copied().unwrap_or(1.0) as f64;
        value += total as f64 * mult;
    }
    value as u64
}

fn arena_weight(arena: &ArenaProfile, source: WeightSource) -> u64 {
    match source {
        WeightSource::AllocsPeak => arena.allocs.peak,
        WeightSource::ExtentSizePeak => arena.extent_size.peak,
        WeightSource::RssPeak => arena.rss.peak,
    }
}

fn sort_sites(sites: &mut [SiteProfile], sort: SortKey) {
    match sort {
        SortKey::ValuePerWeight => {
            sites.sort_by(|a, b| b.value_per_weight.total_cmp(&a.value_per_weight))
        }
        SortKey::Value => sites.sort_by(|a, b| b.value.cmp(&a.value)),
        SortKey::Weight => sites.sort_by(|a, b| b.weight.cmp(&a.weight)),
    }
}

/// Flattens a profile into one entry per site, sorted best-first by the
/// configured key. Sites whose arena has no weight yet are left out; they
/// have nothing to place.
pub fn site_values(
    profile: &ApplicationProfile,
    value_events: &[usize],
    multipliers: &[f32],
    weight: WeightSource,
    sort: SortKey,
) -> Vec<SiteProfile> {
    let mut sites = Vec::new();
    for arena in profile.live_arenas() {
        let w = arena_weight(arena, weight);
        if w == 0 {
            continue;
        }
        let v = arena_value(arena, value_events, multipliers);
        for &site in &arena.sites {
            sites.push(SiteProfile::new(site, arena.index, v, w));
        }
    }
    sort_sites(&mut sites, sort);
    sites
}

/// Blends a previous run's site values into the current ones. Only sites
/// present in the current run are kept; `value_ratio`/`weight_ratio` say
/// how much the offline numbers count for.
pub fn merge_offline(
    offline: &[SiteProfile],
    current: &[SiteProfile],
    value_ratio: f32,
    weight_ratio: f32,
    sort: SortKey,
) -> Vec<SiteProfile> {
    let offline_by_site: FxHashMap<u32, &SiteProfile> =
        offline.iter().map(|s| (s.site, s)).collect();

    let mut merged: Vec<SiteProfile> = current
        .iter()
        .map(|cur| match offline_by_site.get(&cur.site) {
            Some(old) => {
                let value = (old.value as f64 * value_ratio as f64
                    + cur.value as f64 * (1.0 - value_ratio as f64)) as u64;
                let weight = (old.weight as f64 * weight_ratio as f64
                    + cur.weight as f64 * (1.0 - weight_ratio as f64))
                    as u64;
                SiteProfile::new(cur.site, cur.arena_index, value, weight.max(1))
            }
            None => {
                log::debug!("site {} absent from the offline profile", cur.site);
                cur.clone()
            }
        })
        .collect();
    sort_sites(&mut merged, sort);
    merged
}

/// Greedy knapsack over the sorted sites: keep taking the best site until
/// the capacity is crossed, including the site that crosses it. The one
/// overflowing site keeps a single dominant site from being shut out of
/// the fast tier forever.
pub fn hotset(sorted: &[SiteProfile], capacity_bytes: u64) -> FxHashSet<u32> {
    let mut hot = FxHashSet::default();
    let mut packed = 0u64;
    for site in sorted {
        packed += site.weight;
        hot.insert(site.site);
        if packed > capacity_bytes {
            break;
        }
    }
    hot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::data::ApplicationProfile;

    fn profile_with(sites: &[(u32, u64, u64)]) -> ApplicationProfile {
        // (site, value, weight) triples; one arena per site.
        let mut p = ApplicationProfile::new(vec!["ev".into()], sites.len(), &[]);
        for (i, &(site, value, weight)) in sites.iter().enumerate() {
            let a = p.arena_mut(i, 0);
            a.sites = vec![site];
            a.num_intervals = 1;
            a.events[0].push(value);
            a.extent_size.push(weight);
        }
        p
    }

    #[test]
    fn sites_sort_by_value_per_weight() {
        let p = profile_with(&[(1, 100, 100), (2, 90, 10), (3, 50, 100)]);
        let sites =
            site_values(&p, &[0], &[1.0], WeightSource::ExtentSizePeak, SortKey::ValuePerWeight);
        let order: Vec<u32> = sites.iter().map(|s| s.site).collect();
        assert_eq!(order, vec![2, 1, 3]);
    }

    #[test]
    fn other_sort_keys() {
        let p = profile_with(&[(1, 100, 100), (2, 90, 10), (3, 50, 200)]);
        let by_value = site_values(&p, &[0], &[1.0], WeightSource::ExtentSizePeak, SortKey::Value);
        assert_eq!(by_value[0].site, 1);
        let by_weight =
            site_values(&p, &[0], &[1.0], WeightSource::ExtentSizePeak, SortKey::Weight);
        assert_eq!(by_weight[0].site, 3);
    }

    #[test]
    fn zero_weight_sites_are_dropped() {
        let p = profile_with(&[(1, 100, 0), (2, 5, 10)]);
        let sites =
            site_values(&p, &[0], &[1.0], WeightSource::ExtentSizePeak, SortKey::ValuePerWeight);
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].site, 2);
    }

    #[test]
    fn multipliers_weight_the_events() {
        let mut p = ApplicationProfile::new(vec!["upper".into(), "lower".into()], 1, &[]);
        let a = p.arena_mut(0, 0);
        a.sites = vec![4];
        a.events[0].push(10);
        a.events[1].push(10);
        a.extent_size.push(100);

        let sites =
            site_values(&p, &[0, 1], &[1.0, 3.0], WeightSource::ExtentSizePeak, SortKey::Value);
        assert_eq!(sites[0].value, 40);
    }

    #[test]
    fn hotset_includes_the_overflowing_site() {
        let sorted = vec![
            SiteProfile::new(1, 0, 100, 60),
            SiteProfile::new(2, 1, 50, 60),
            SiteProfile::new(3, 2, 10, 60),
        ];
        // 60 fits, adding site 2 crosses 100: include it, then stop.
        let hot = hotset(&sorted, 100);
        assert!(hot.contains(&1) && hot.contains(&2));
        assert!(!hot.contains(&3));
    }

    #[test]
    fn hotset_with_ample_capacity_takes_everything() {
        let sorted = vec![SiteProfile::new(1, 0, 1, 10), SiteProfile::new(2, 1, 1, 10)];
        assert_eq!(hotset(&sorted, 1 << 30).len(), 2);
        assert!(hotset(&[], 1 << 30).is_empty());
    }

    #[test]
    fn offline_blend_averages_and_passes_through() {
        let offline = vec![SiteProfile::new(1, 0, 100, 200)];
        let current =
            vec![SiteProfile::new(1, 0, 50, 100), SiteProfile::new(2, 1, 30, 10)];
        let merged = merge_offline(&offline, &current, 0.5, 0.5, SortKey::ValuePerWeight);

        let one = merged.iter().find(|s| s.site == 1).unwrap();
        assert_eq!(one.value, 75);
        assert_eq!(one.weight, 150);
        // Unknown-to-offline sites pass through untouched.
        let two = merged.iter().find(|s| s.site == 2).unwrap();
        assert_eq!(two.value, 30);
        assert_eq!(two.weight, 10);
        // And the merged list is sorted again: site 2 has the better ratio.
        assert_eq!(merged[0].site, 2);
    }
}
