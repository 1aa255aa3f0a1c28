//! The online placement controller: each interval, rank sites by
//! profiled value per byte, pack the best into the upper tier's starting
//! capacity, and migrate arenas whose hotset membership changed — but
//! only once the upper tier is actually contended and enough weight
//! would move to justify the churn.

use std::sync::Arc;

use log::{debug, error, info};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use tieralloc_pool::Device;

use super::{OnlineDecision, Reply, Source, SourceKind};
use crate::config::{OnlineOptions, WeightSource};
use crate::error::ProfileError;
use crate::packing::{self, SiteProfile};
use crate::profile::data::{ApplicationProfile, Tier};
use crate::runtime::Runtime;

/// Once contention trips there is no way back to warming up; the default
/// device stays on the lower tier for the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControllerState {
    WarmingUp,
    ActiveUpper,
    ActiveRebind,
}

pub(crate) struct OnlineSource {
    rt: Arc<Runtime>,
    profile: Arc<RwLock<ApplicationProfile>>,
    multipliers: Arc<RwLock<Vec<f32>>>,
    opts: OnlineOptions,
    weight: WeightSource,
    /// Indices into the access-sample event list used for value.
    value_events: Vec<usize>,
    upper: Device,
    lower: Device,
    upper_avail_initial: u64,
    lower_avail_initial: u64,
    state: ControllerState,
    prev_hotset: FxHashSet<u32>,
    site_hot_intervals: FxHashMap<u32, u64>,
    /// Where each site's arena currently sits.
    site_tiers: FxHashMap<u32, Tier>,
    offline_sites: Option<Vec<SiteProfile>>,
    num_reconfigures: u64,
}

impl OnlineSource {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rt: Arc<Runtime>,
        profile: Arc<RwLock<ApplicationProfile>>,
        multipliers: Arc<RwLock<Vec<f32>>>,
        opts: OnlineOptions,
        weight: WeightSource,
        value_events: Vec<usize>,
        upper: Device,
        lower: Device,
        offline_sites: Option<Vec<SiteProfile>>,
    ) -> Result<Self, ProfileError> {
        let upper_avail_initial = upper.avail_kb()? * 1024;
        let lower_avail_initial = lower.avail_kb()? * 1024;
        info!(
            "placement controller: upper node {} ({upper_avail_initial} B free), \
             lower node {} ({lower_avail_initial} B free)",
            upper.numa_id(),
            lower.numa_id()
        );
        Ok(OnlineSource {
            rt,
            profile,
            multipliers,
            opts,
            weight,
            value_events,
            upper,
            lower,
            upper_avail_initial,
            lower_avail_initial,
            state: ControllerState::WarmingUp,
            prev_hotset: FxHashSet::default(),
            site_hot_intervals: FxHashMap::default(),
            site_tiers: FxHashMap::default(),
            offline_sites,
            num_reconfigures: 0,
        })
    }

    fn rebind(&mut self, site: &SiteProfile, tier: Tier) {
        let device = match tier {
            Tier::Upper => self.upper,
            Tier::Lower => self.lower,
        };
        let Some(info) = self.rt.arena(site.arena_index) else {
            return;
        };
        // Placement failure must never take the application down.
        match info.arena.set_devices(&[device]) {
            Ok(()) => {
                self.site_tiers.insert(site.site, tier);
            }
            Err(e) => error!("rebinding arena {} for site {} failed: {e}", site.arena_index, site.site),
        }
    }
}

impl Source for OnlineSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Online
    }

    fn run(&mut self) -> Reply {
        let upper_avail = self.upper.avail_kb().map(|kb| kb * 1024);
        let lower_avail = self.lower.avail_kb().map(|kb| kb * 1024);
        if let (Ok(upper), Ok(lower)) = (&upper_avail, &lower_avail) {
            debug!("tier avail: upper {upper} B, lower {lower} B");
        }

        if self.state == ControllerState::WarmingUp {
            if let Ok(avail) = lower_avail {
                if avail < self.lower_avail_initial {
                    // Spill onto the lower tier means the upper tier is
                    // contended: new sites default low, the controller
                    // promotes from here on.
                    self.state = ControllerState::ActiveUpper;
                    self.rt.set_default_device(self.lower);
                    info!(
                        "upper tier contended (lower avail {avail} < {}); default device -> node {}",
                        self.lower_avail_initial,
                        self.lower.numa_id()
                    );
                }
            }
        }

        let sorted = {
            let profile = self.profile.read();
            let multipliers = self.multipliers.read();
            packing::site_values(
                &profile,
                &self.value_events,
                &multipliers,
                self.weight,
                self.opts.sort,
            )
        };
        let merged = match &self.offline_sites {
            Some(offline) => packing::merge_offline(
                offline,
                &sorted,
                self.opts.last_iter_value,
                self.opts.last_iter_weight,
                self.opts.sort,
            ),
            None => sorted,
        };
        let hotset = packing::hotset(&merged, self.upper_avail_initial);

        let mut total_weight = 0u64;
        let mut total_value = 0u64;
        let mut rebind_weight = 0u64;
        let mut rebind_value = 0u64;
        for site in &merged {
            total_weight += site.weight;
            total_value += site.value;
            let now_hot = hotset.contains(&site.site);
            if now_hot {
                *self.site_hot_intervals.entry(site.site).or_insert(0) += 1;
            } else {
                self.site_hot_intervals.insert(site.site, 0);
            }
            if now_hot != self.prev_hotset.contains(&site.site) {
                rebind_weight += site.weight;
                rebind_value += site.value;
            }
        }
        let rebind_ratio =
            if total_weight > 0 { rebind_weight as f64 / total_weight as f64 } else { 0.0 };

        let contended = self.state != ControllerState::WarmingUp;
        let full_rebind = !self.opts.nobind
            && contended
            && total_value >= self.opts.grace_accesses
            && rebind_ratio >= self.opts.reconf_weight_ratio;

        if full_rebind {
            self.state = ControllerState::ActiveRebind;
            for site in &merged {
                let now_hot = hotset.contains(&site.site);
                let was_hot = self.prev_hotset.contains(&site.site);
                if now_hot && !was_hot {
                    self.rebind(site, Tier::Upper);
                } else if !now_hot && was_hot {
                    self.rebind(site, Tier::Lower);
                }
            }
            self.num_reconfigures += 1;
            debug!(
                "reconfigure {}: moved {rebind_weight} B / {rebind_value} value \
                 (ratio {rebind_ratio:.3}, hotset {} sites)",
                self.num_reconfigures,
                hotset.len()
            );
            self.state = ControllerState::ActiveUpper;
        } else if let Some(threshold) = self.opts.hot_intervals {
            // The ratio gate did not fire; promote only sites that just
            // crossed the consecutive-hot threshold.
            let crossed: Vec<&SiteProfile> = merged
                .iter()
                .filter(|s| self.site_hot_intervals.get(&s.site) == Some(&threshold))
                .collect();
            for site in crossed {
                self.rebind(site, Tier::Upper);
            }
        }

        let decisions = merged
            .iter()
            .map(|site| OnlineDecision {
                arena_index: site.arena_index,
                tier: self.site_tiers.get(&site.site).copied().unwrap_or(Tier::Lower),
                hot: hotset.contains(&site.site),
            })
            .collect();

        self.prev_hotset = hotset;
        Reply::Online(decisions)
    }
}
