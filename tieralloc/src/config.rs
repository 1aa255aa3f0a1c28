//! Runtime configuration, read from `SH_*` environment variables at
//! [`crate::init`] time. Anything unrecognized or inconsistent fails
//! initialization; a half-configured allocator is worse than none.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::guidance;

/// Hard ceiling on `SH_MAX_ARENAS`; jemalloc arena indices must stay
/// encodable in the 12 bits of the mallocx flags word.
pub const ARENA_INDEX_CEILING: usize = 4095;

/// How allocation sites map to arenas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaLayout {
    /// Every site shares one arena.
    OneArena,
    /// One arena per thread, all of that thread's sites together.
    ExclusiveArenas,
    /// One arena per (thread, device) pair.
    ExclusiveDeviceArenas,
    /// One arena per site. The prevailing production layout.
    SharedSiteArenas,
    /// Per-thread arenas for small requests, per-site arenas for big ones.
    BigSmallArenas,
}

impl FromStr for ArenaLayout {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s.to_ascii_uppercase().as_str() {
            "ONE_ARENA" => Ok(ArenaLayout::OneArena),
            "EXCLUSIVE_ARENAS" => Ok(ArenaLayout::ExclusiveArenas),
            "EXCLUSIVE_DEVICE_ARENAS" => Ok(ArenaLayout::ExclusiveDeviceArenas),
            "SHARED_SITE_ARENAS" => Ok(ArenaLayout::SharedSiteArenas),
            "BIG_SMALL_ARENAS" => Ok(ArenaLayout::BigSmallArenas),
            _ => Err(()),
        }
    }
}

/// Which capacity metric weighs a site in the packing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightSource {
    AllocsPeak,
    ExtentSizePeak,
    RssPeak,
}

impl FromStr for WeightSource {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "profile_allocs" => Ok(WeightSource::AllocsPeak),
            "profile_extent_size" => Ok(WeightSource::ExtentSizePeak),
            "profile_rss" => Ok(WeightSource::RssPeak),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    ValuePerWeight,
    Value,
    Weight,
}

impl FromStr for SortKey {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "value_per_weight" => Ok(SortKey::ValuePerWeight),
            "value" => Ok(SortKey::Value),
            "weight" => Ok(SortKey::Weight),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackingAlgo {
    Hotset,
}

impl FromStr for PackingAlgo {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "hotset" => Ok(PackingAlgo::Hotset),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PebsOptions {
    pub events: Vec<String>,
    /// Per-event value multipliers; padded with 1.0 to the event count.
    pub multipliers: Vec<f32>,
    pub skip_intervals: u64,
}

#[derive(Debug, Clone)]
pub struct BwOptions {
    pub events: Vec<String>,
    pub skip_intervals: u64,
    /// Split socket bandwidth across arenas by their access-sample share.
    pub relative: bool,
}

#[derive(Debug, Clone)]
pub struct LatencyOptions {
    /// Eight ordered IMC events: upper read inserts/occupancy, upper write
    /// inserts/occupancy, then the same four for the lower tier.
    pub events: Vec<String>,
    pub clocktick_event: String,
    pub skip_intervals: u64,
    /// Overwrite the access-sample multipliers from the measured
    /// lower/upper latency ratio.
    pub set_multipliers: bool,
}

#[derive(Debug, Clone)]
pub struct OnlineOptions {
    pub skip_intervals: u64,
    /// No rebinding below this much total site value.
    pub grace_accesses: u64,
    /// Observe and log, never rebind.
    pub nobind: bool,
    /// Fraction of total weight that must change tier before a full
    /// rebind is worth the churn.
    pub reconf_weight_ratio: f64,
    /// Rebind a site after this many consecutive hot intervals, when the
    /// weight-ratio gate does not fire.
    pub hot_intervals: Option<u64>,
    /// Value events; defaults to all access-sample events.
    pub events: Vec<String>,
    pub weight: Option<WeightSource>,
    pub sort: SortKey,
    pub packing: PackingAlgo,
    /// Blend ratios against an offline profile.
    pub last_iter_value: f32,
    pub last_iter_weight: f32,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub layout: ArenaLayout,
    pub big_small_threshold: usize,
    pub max_threads: usize,
    pub max_arenas: usize,
    pub max_sites_per_arena: usize,
    pub max_sites: usize,
    pub upper_node: Option<u32>,
    pub lower_node: Option<u32>,
    pub default_node: Option<u32>,
    pub guidance: Vec<(u32, u32)>,
    pub log_file: Option<PathBuf>,
    pub isolate_site: Option<u32>,
    pub isolate_node: Option<u32>,

    pub profile_rate_ns: u64,
    pub sample_freq: u64,
    pub max_sample_pages: usize,
    pub print_profile_intervals: bool,
    pub profile_output: Option<PathBuf>,
    pub profile_input: Option<PathBuf>,

    pub pebs: Option<PebsOptions>,
    pub rss: Option<u64>,
    pub extent_size: Option<u64>,
    pub allocs: Option<u64>,
    pub bw: Option<BwOptions>,
    pub latency: Option<LatencyOptions>,
    pub online: Option<OnlineOptions>,

    /// IMC PMU names for the hardware-counter profilers.
    pub imcs: Vec<String>,
    /// One (cpu, socket NUMA node) pair per socket of interest.
    pub skt_cpus: Vec<(u32, u32)>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            layout: ArenaLayout::SharedSiteArenas,
            big_small_threshold: 4096,
            max_threads: 4096,
            max_arenas: ARENA_INDEX_CEILING,
            max_sites_per_arena: 0, // 0 = unlimited
            max_sites: 4096,
            upper_node: None,
            lower_node: None,
            default_node: None,
            guidance: Vec::new(),
            log_file: None,
            isolate_site: None,
            isolate_node: None,
            profile_rate_ns: 1_000_000_000,
            sample_freq: 2048,
            max_sample_pages: 64,
            print_profile_intervals: false,
            profile_output: None,
            profile_input: None,
            pebs: None,
            rss: None,
            extent_size: None,
            allocs: None,
            bw: None,
            latency: None,
            online: None,
            imcs: Vec::new(),
            skt_cpus: Vec::new(),
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::BadValue { var, value: raw }),
    }
}

fn parse_flag(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<bool, ConfigError> {
    Ok(parse_var::<u64>(lookup, var)?.unwrap_or(0) != 0)
}

/// Skip-interval knobs: run the profiler every Nth tick; absent or 0
/// means every tick.
fn parse_skip(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<u64, ConfigError> {
    Ok(parse_var::<u64>(lookup, var)?.unwrap_or(1).max(1))
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split([',', ' '])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect()
}

impl Options {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut opts = Options::default();

        if let Some(layout) = parse_var(lookup, "SH_ARENA_LAYOUT")? {
            opts.layout = layout;
        }
        if let Some(thresh) = parse_var(lookup, "SH_BIG_SMALL_THRESHOLD")? {
            opts.big_small_threshold = thresh;
        }
        if let Some(n) = parse_var(lookup, "SH_MAX_THREADS")? {
            opts.max_threads = n;
        }
        if let Some(n) = parse_var(lookup, "SH_MAX_ARENAS")? {
            if n > ARENA_INDEX_CEILING {
                return Err(ConfigError::TooManyArenas { max: ARENA_INDEX_CEILING });
            }
            opts.max_arenas = n;
        }
        if let Some(n) = parse_var(lookup, "SH_MAX_SITES_PER_ARENA")? {
            opts.max_sites_per_arena = n;
        }
        if let Some(n) = parse_var(lookup, "SH_MAX_SITES")? {
            opts.max_sites = n;
        }
        opts.upper_node = parse_var(lookup, "SH_UPPER_NODE")?;
        opts.lower_node = parse_var(lookup, "SH_LOWER_NODE")?;
        opts.default_node = parse_var(lookup, "SH_DEFAULT_NODE")?;
        opts.log_file = lookup("SH_LOG_FILE").map(PathBuf::from);
        opts.isolate_site = parse_var(lookup, "SH_PROFILE_ONE_SITE")?;
        opts.isolate_node = parse_var(lookup, "SH_PROFILE_ONE_NODE")?;

        if let Some(path) = lookup("SH_GUIDANCE_FILE") {
            let file = File::open(&path)
                .map_err(|source| ConfigError::Io { var: "SH_GUIDANCE_FILE", source })?;
            opts.guidance = guidance::parse(BufReader::new(file))?;
        }

        if let Some(ns) = parse_var(lookup, "SH_PROFILE_RATE_NSECONDS")? {
            opts.profile_rate_ns = ns;
        }
        if let Some(freq) = parse_var(lookup, "SH_SAMPLE_FREQ")? {
            opts.sample_freq = freq;
        }
        if let Some(pages) = parse_var(lookup, "SH_MAX_SAMPLE_PAGES")? {
            opts.max_sample_pages = pages;
        }
        opts.print_profile_intervals = parse_flag(lookup, "SH_PRINT_PROFILE_INTERVALS")?;
        opts.profile_output = lookup("SH_PROFILE_OUTPUT_FILE").map(PathBuf::from);
        opts.profile_input = lookup("SH_PROFILE_INPUT_FILE").map(PathBuf::from);

        if parse_flag(lookup, "SH_PROFILE_ALL")? {
            let events = lookup("SH_PROFILE_ALL_EVENTS")
                .map(|raw| parse_list(&raw))
                .unwrap_or_default();
            if events.is_empty() {
                return Err(ConfigError::BadValue {
                    var: "SH_PROFILE_ALL_EVENTS",
                    value: String::new(),
                });
            }
            let mut multipliers: Vec<f32> = match lookup("SH_PROFILE_ALL_MULTIPLIERS") {
                Some(raw) => parse_list(&raw)
                    .iter()
                    .map(|t| {
                        t.parse().map_err(|_| ConfigError::BadValue {
                            var: "SH_PROFILE_ALL_MULTIPLIERS",
                            value: t.clone(),
                        })
                    })
                    .collect::<Result<_, _>>()?,
                None => Vec::new(),
            };
            multipliers.resize(events.len(), 1.0);
            opts.pebs = Some(PebsOptions {
                events,
                multipliers,
                skip_intervals: parse_skip(lookup, "SH_PROFILE_ALL_SKIP_INTERVALS")?,
            });
        }

        if parse_flag(lookup, "SH_PROFILE_RSS")? {
            opts.rss = Some(parse_skip(lookup, "SH_PROFILE_RSS_SKIP_INTERVALS")?);
        }
        if parse_flag(lookup, "SH_PROFILE_EXTENT_SIZE")? {
            opts.extent_size = Some(parse_skip(lookup, "SH_PROFILE_EXTENT_SIZE_SKIP_INTERVALS")?);
        }
        if parse_flag(lookup, "SH_PROFILE_ALLOCS")? {
            opts.allocs = Some(parse_skip(lookup, "SH_PROFILE_ALLOCS_SKIP_INTERVALS")?);
        }

        if let Some(raw) = lookup("SH_PROFILE_IMC") {
            opts.imcs = parse_list(&raw);
        }
        if let Some(raw) = lookup("SH_PROFILE_NODES") {
            // "cpu:node" pairs, one per socket of interest.
            for tok in parse_list(&raw) {
                let pair = tok.split_once(':').and_then(|(cpu, node)| {
                    Some((cpu.parse().ok()?, node.parse().ok()?))
                });
                match pair {
                    Some(p) => opts.skt_cpus.push(p),
                    None => {
                        return Err(ConfigError::BadValue { var: "SH_PROFILE_NODES", value: tok })
                    }
                }
            }
        }

        if parse_flag(lookup, "SH_PROFILE_BW")? {
            let events = lookup("SH_PROFILE_BW_EVENTS")
                .map(|raw| parse_list(&raw))
                .unwrap_or_default();
            if events.is_empty() || opts.imcs.is_empty() || opts.skt_cpus.is_empty() {
                return Err(ConfigError::BadValue {
                    var: "SH_PROFILE_BW",
                    value: "requires SH_PROFILE_BW_EVENTS, SH_PROFILE_IMC and SH_PROFILE_NODES"
                        .into(),
                });
            }
            opts.bw = Some(BwOptions {
                events,
                skip_intervals: parse_skip(lookup, "SH_PROFILE_BW_SKIP_INTERVALS")?,
                relative: parse_flag(lookup, "SH_PROFILE_BW_RELATIVE")?,
            });
        }

        if parse_flag(lookup, "SH_PROFILE_LATENCY")? {
            let events = lookup("SH_PROFILE_LATENCY_EVENTS")
                .map(|raw| parse_list(&raw))
                .unwrap_or_default();
            let clocktick = lookup("SH_PROFILE_LATENCY_CLOCKTICK_EVENT").unwrap_or_default();
            if events.len() != 8 || clocktick.is_empty() || opts.imcs.is_empty()
                || opts.skt_cpus.is_empty()
            {
                return Err(ConfigError::BadValue {
                    var: "SH_PROFILE_LATENCY",
                    value: "requires 8 SH_PROFILE_LATENCY_EVENTS, a clock-tick event, \
                            SH_PROFILE_IMC and SH_PROFILE_NODES"
                        .into(),
                });
            }
            opts.latency = Some(LatencyOptions {
                events,
                clocktick_event: clocktick,
                skip_intervals: parse_skip(lookup, "SH_PROFILE_LATENCY_SKIP_INTERVALS")?,
                set_multipliers: parse_flag(lookup, "SH_PROFILE_LATENCY_SET_MULTIPLIERS")?,
            });
        }

        if parse_flag(lookup, "SH_PROFILE_ONLINE")? {
            let events = lookup("SH_PROFILE_ONLINE_EVENTS")
                .map(|raw| parse_list(&raw))
                .unwrap_or_default();
            let weight = match lookup("SH_PROFILE_ONLINE_WEIGHT") {
                None => None,
                Some(raw) => Some(raw.parse().map_err(|_| ConfigError::BadValue {
                    var: "SH_PROFILE_ONLINE_WEIGHT",
                    value: raw,
                })?),
            };
            let sort = match lookup("SH_PROFILE_ONLINE_SORT") {
                None => SortKey::ValuePerWeight,
                Some(raw) => raw.parse().map_err(|_| ConfigError::BadValue {
                    var: "SH_PROFILE_ONLINE_SORT",
                    value: raw,
                })?,
            };
            let packing = match lookup("SH_PROFILE_ONLINE_PACKING_ALGO") {
                None => PackingAlgo::Hotset,
                Some(raw) => raw.parse().map_err(|_| ConfigError::BadValue {
                    var: "SH_PROFILE_ONLINE_PACKING_ALGO",
                    value: raw,
                })?,
            };
            opts.online = Some(OnlineOptions {
                skip_intervals: parse_skip(lookup, "SH_PROFILE_ONLINE_SKIP_INTERVALS")?,
                grace_accesses: parse_var(lookup, "SH_PROFILE_ONLINE_GRACE_ACCESSES")?
                    .unwrap_or(0),
                nobind: parse_flag(lookup, "SH_PROFILE_ONLINE_NOBIND")?,
                reconf_weight_ratio: parse_var(lookup, "SH_PROFILE_ONLINE_RECONF_WEIGHT_RATIO")?
                    .unwrap_or(0.0),
                hot_intervals: parse_var(lookup, "SH_PROFILE_ONLINE_HOT_INTERVALS")?,
                events,
                weight,
                sort,
                packing,
                last_iter_value: parse_var(lookup, "SH_PROFILE_ONLINE_LAST_ITER_VALUE")?
                    .unwrap_or(0.5),
                last_iter_weight: parse_var(lookup, "SH_PROFILE_ONLINE_LAST_ITER_WEIGHT")?
                    .unwrap_or(0.5),
            });
        }

        opts.validate()?;
        Ok(opts)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(online) = &self.online {
            // The controller needs a value metric (access samples) and a
            // capacity metric for weights.
            let pebs = self.pebs.as_ref().ok_or(ConfigError::OnlineNeedsProfilers)?;
            if self.allocs.is_none() && self.extent_size.is_none() && self.rss.is_none() {
                return Err(ConfigError::OnlineNeedsProfilers);
            }
            for event in &online.events {
                if !pebs.events.contains(event) {
                    return Err(ConfigError::UnknownOnlineEvent(event.clone()));
                }
            }
        }
        Ok(())
    }

    /// The weight metric the packing decision actually uses: an explicit
    /// choice, else the best enabled capacity profiler.
    pub fn weight_source(&self) -> Option<WeightSource> {
        if let Some(online) = &self.online {
            if let Some(weight) = online.weight {
                return Some(weight);
            }
        }
        if self.allocs.is_some() {
            Some(WeightSource::AllocsPeak)
        } else if self.extent_size.is_some() {
            Some(WeightSource::ExtentSizePeak)
        } else if self.rss.is_some() {
            Some(WeightSource::RssPeak)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn defaults_are_sane() {
        let opts = Options::from_lookup(&lookup(&[])).unwrap();
        assert_eq!(opts.layout, ArenaLayout::SharedSiteArenas);
        assert_eq!(opts.max_arenas, ARENA_INDEX_CEILING);
        assert_eq!(opts.profile_rate_ns, 1_000_000_000);
        assert!(opts.pebs.is_none());
        assert!(opts.online.is_none());
    }

    #[test]
    fn layout_and_caps() {
        let opts = Options::from_lookup(&lookup(&[
            ("SH_ARENA_LAYOUT", "big_small_arenas"),
            ("SH_BIG_SMALL_THRESHOLD", "65536"),
            ("SH_MAX_ARENAS", "128"),
            ("SH_MAX_SITES_PER_ARENA", "4"),
            ("SH_DEFAULT_NODE", "1"),
        ]))
        .unwrap();
        assert_eq!(opts.layout, ArenaLayout::BigSmallArenas);
        assert_eq!(opts.big_small_threshold, 65536);
        assert_eq!(opts.max_arenas, 128);
        assert_eq!(opts.max_sites_per_arena, 4);
        assert_eq!(opts.default_node, Some(1));
    }

    #[test]
    fn arena_cap_ceiling_is_enforced() {
        let err = Options::from_lookup(&lookup(&[("SH_MAX_ARENAS", "5000")])).unwrap_err();
        assert!(matches!(err, ConfigError::TooManyArenas { .. }));
    }

    #[test]
    fn bad_layout_is_fatal() {
        assert!(Options::from_lookup(&lookup(&[("SH_ARENA_LAYOUT", "nonsense")])).is_err());
    }

    #[test]
    fn pebs_events_and_multipliers() {
        let opts = Options::from_lookup(&lookup(&[
            ("SH_PROFILE_ALL", "1"),
            ("SH_PROFILE_ALL_EVENTS", "MEM_LOAD_UOPS_RETIRED.LOCAL_DRAM,MEM_LOAD_UOPS_RETIRED.REMOTE_DRAM"),
            ("SH_PROFILE_ALL_MULTIPLIERS", "1.0"),
            ("SH_PROFILE_ALL_SKIP_INTERVALS", "2"),
        ]))
        .unwrap();
        let pebs = opts.pebs.unwrap();
        assert_eq!(pebs.events.len(), 2);
        // Missing multipliers pad out with 1.0.
        assert_eq!(pebs.multipliers, vec![1.0, 1.0]);
        assert_eq!(pebs.skip_intervals, 2);
    }

    #[test]
    fn online_requires_value_and_weight_profilers() {
        let err = Options::from_lookup(&lookup(&[("SH_PROFILE_ONLINE", "1")])).unwrap_err();
        assert!(matches!(err, ConfigError::OnlineNeedsProfilers));

        let err = Options::from_lookup(&lookup(&[
            ("SH_PROFILE_ONLINE", "1"),
            ("SH_PROFILE_ALL", "1"),
            ("SH_PROFILE_ALL_EVENTS", "some_event"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::OnlineNeedsProfilers));

        let opts = Options::from_lookup(&lookup(&[
            ("SH_PROFILE_ONLINE", "1"),
            ("SH_PROFILE_ALL", "1"),
            ("SH_PROFILE_ALL_EVENTS", "some_event"),
            ("SH_PROFILE_EXTENT_SIZE", "1"),
        ]))
        .unwrap();
        assert_eq!(opts.weight_source(), Some(WeightSource::ExtentSizePeak));
    }

    #[test]
    fn online_event_must_be_sampled() {
        let err = Options::from_lookup(&lookup(&[
            ("SH_PROFILE_ONLINE", "1"),
            ("SH_PROFILE_ONLINE_EVENTS", "other_event"),
            ("SH_PROFILE_ALL", "1"),
            ("SH_PROFILE_ALL_EVENTS", "some_event"),
            ("SH_PROFILE_RSS", "1"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownOnlineEvent(_)));
    }

    #[test]
    fn socket_pairs() {
        let opts = Options::from_lookup(&lookup(&[("SH_PROFILE_NODES", "0:0,24:1")])).unwrap();
        assert_eq!(opts.skt_cpus, vec![(0, 0), (24, 1)]);
        assert!(Options::from_lookup(&lookup(&[("SH_PROFILE_NODES", "0")])).is_err());
    }

    #[test]
    fn bw_needs_its_collaborators() {
        assert!(Options::from_lookup(&lookup(&[("SH_PROFILE_BW", "1")])).is_err());
        let opts = Options::from_lookup(&lookup(&[
            ("SH_PROFILE_BW", "1"),
            ("SH_PROFILE_BW_EVENTS", "UNC_M_CAS_COUNT.RD"),
            ("SH_PROFILE_IMC", "uncore_imc_0,uncore_imc_1"),
            ("SH_PROFILE_NODES", "0:0"),
        ]))
        .unwrap();
        let bw = opts.bw.unwrap();
        assert_eq!(bw.events, vec!["UNC_M_CAS_COUNT.RD"]);
        assert!(!bw.relative);
    }
}
