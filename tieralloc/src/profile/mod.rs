//! The profiling master: a dedicated thread whose POSIX interval timer
//! fires a realtime signal at it every `SH_PROFILE_RATE_NSECONDS`. Each
//! tick it wakes the profiler workers, waits for their interval data, and
//! folds it into the per-arena profile records. The application thread
//! stops it by raising the stop signal at it; a stop that lands during a
//! tick is consumed only after the interval drains.

pub mod data;
pub mod event;
mod sys;

mod allocs;
mod bw;
mod extent_size;
mod latency;
mod online;
mod pebs;
mod perf;
mod rss;

use std::fs::File;
use std::io::BufReader;
use std::mem;
use std::os::unix::thread::JoinHandleExt;
use std::ptr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use libc::c_int;
use log::{debug, error, warn};
use parking_lot::RwLock;

use crate::config::WeightSource;
use crate::error::ProfileError;
use crate::packing;
use crate::parsing;
use crate::runtime::Runtime;
use self::data::{ApplicationProfile, Tier};
use self::event::{EventEncoder, SysfsEventEncoder};
use self::latency::SocketLatency;

pub use self::rss::{PagemapOracle, ResidentPageOracle};

fn stop_signal() -> c_int {
    libc::SIGRTMIN()
}

fn tick_signal() -> c_int {
    libc::SIGRTMIN() + 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SourceKind {
    Pebs,
    Rss,
    ExtentSize,
    Allocs,
    Bw,
    Latency,
    Online,
}

/// An arena's placement and hotness at the end of an interval.
pub(crate) struct OnlineDecision {
    pub arena_index: usize,
    pub tier: Tier,
    pub hot: bool,
}

/// One interval's data from one worker.
pub(crate) enum Reply {
    /// `[event][arena index]` sample counts.
    Pebs(Vec<Vec<u64>>),
    Rss(Vec<u64>),
    ExtentSize(Vec<u64>),
    Allocs(Vec<u64>),
    /// Cache lines per second, one per configured socket.
    Bw(Vec<u64>),
    Latency(Vec<SocketLatency>),
    Online(Vec<OnlineDecision>),
    Skipped(SourceKind),
}

/// One profiler worker's per-interval behavior. Workers sleep on their
/// command channel between intervals; they never poll.
pub(crate) trait Source: Send {
    fn kind(&self) -> SourceKind;
    fn run(&mut self) -> Reply;
    fn skip(&mut self) {}
}

enum Cmd {
    Run,
    Skip,
    Stop,
}

struct Worker {
    cmd: Sender<Cmd>,
    handle: JoinHandle<()>,
    /// Run every Nth interval.
    skip_intervals: u64,
    skipped: u64,
}

fn spawn_worker(mut source: Box<dyn Source>, done: Sender<Reply>, skip_intervals: u64) -> Worker {
    let (cmd_tx, cmd_rx): (Sender<Cmd>, Receiver<Cmd>) = crossbeam_channel::unbounded();
    let handle = thread::Builder::new()
        .name("tieralloc-prof".into())
        .spawn(move || {
            while let Ok(cmd) = cmd_rx.recv() {
                match cmd {
                    Cmd::Run => {
                        let reply = source.run();
                        let _ = done.send(reply);
                    }
                    Cmd::Skip => {
                        source.skip();
                        let _ = done.send(Reply::Skipped(source.kind()));
                    }
                    Cmd::Stop => break,
                }
            }
        })
        .expect("spawning a profiler worker");
    Worker { cmd: cmd_tx, handle, skip_intervals, skipped: 0 }
}

pub(crate) struct Profiler {
    pub profile: Arc<RwLock<ApplicationProfile>>,
    #[allow(dead_code)]
    pub multipliers: Arc<RwLock<Vec<f32>>>,
    master: Option<JoinHandle<()>>,
    master_pthread: libc::pthread_t,
}

impl Profiler {
    /// Tells the master to stop and waits for it to drain the current
    /// interval, cancel the workers and delete its timer.
    pub fn stop(&mut self) {
        if let Some(handle) = self.master.take() {
            unsafe { libc::pthread_kill(self.master_pthread, stop_signal()) };
            let _ = handle.join();
        }
    }
}

/// Builds every enabled profiler source and starts the master thread.
/// Must run on the application's main thread so the sampling fds observe
/// it (see [`pebs::PebsSource::new`]).
pub(crate) fn start(rt: Arc<Runtime>) -> Result<Profiler, ProfileError> {
    let encoder = SysfsEventEncoder::new();
    start_with_encoder(rt, &encoder)
}

pub(crate) fn start_with_encoder(
    rt: Arc<Runtime>,
    encoder: &dyn EventEncoder,
) -> Result<Profiler, ProfileError> {
    let opts = rt.opts.clone();
    let events: Vec<String> =
        opts.pebs.as_ref().map(|p| p.events.clone()).unwrap_or_default();
    let skts: Vec<u32> = opts.skt_cpus.iter().map(|&(_, skt)| skt).collect();

    let mut profile = ApplicationProfile::new(events.clone(), opts.max_arenas, &skts);
    if let (Some(upper), Some(lower)) = (rt.upper_device, rt.lower_device) {
        profile.upper_capacity_kb = upper.capacity_kb().unwrap_or(0);
        profile.lower_capacity_kb = lower.capacity_kb().unwrap_or(0);
    }
    let profile = Arc::new(RwLock::new(profile));
    let multipliers = Arc::new(RwLock::new(
        opts.pebs.as_ref().map(|p| p.multipliers.clone()).unwrap_or_default(),
    ));

    let (done_tx, done_rx) = crossbeam_channel::unbounded();
    let mut workers = Vec::new();

    if let Some(pebs) = &opts.pebs {
        let source = pebs::PebsSource::new(
            rt.clone(),
            encoder,
            &pebs.events,
            opts.sample_freq,
            opts.max_sample_pages,
        )?;
        workers.push(spawn_worker(Box::new(source), done_tx.clone(), pebs.skip_intervals));
    }
    if let Some(skip) = opts.rss {
        let oracle = Box::new(PagemapOracle::open()?);
        workers.push(spawn_worker(
            Box::new(rss::RssSource::new(rt.clone(), oracle)),
            done_tx.clone(),
            skip,
        ));
    }
    if let Some(skip) = opts.extent_size {
        workers.push(spawn_worker(
            Box::new(extent_size::ExtentSizeSource::new(rt.clone())),
            done_tx.clone(),
            skip,
        ));
    }
    if let Some(skip) = opts.allocs {
        workers.push(spawn_worker(
            Box::new(allocs::AllocsSource::new(rt.clone())),
            done_tx.clone(),
            skip,
        ));
    }
    if let Some(bw) = &opts.bw {
        let source = bw::BwSource::new(encoder, bw, &opts.imcs, &opts.skt_cpus)?;
        workers.push(spawn_worker(Box::new(source), done_tx.clone(), bw.skip_intervals));
    }
    if let Some(lat) = &opts.latency {
        let source = latency::LatencySource::new(
            encoder,
            lat,
            &opts.imcs,
            &opts.skt_cpus,
            multipliers.clone(),
        )?;
        workers.push(spawn_worker(Box::new(source), done_tx.clone(), lat.skip_intervals));
    }
    if let Some(online) = &opts.online {
        let (upper, lower) = match (rt.upper_device, rt.lower_device) {
            (Some(u), Some(l)) => (u, l),
            _ => {
                return Err(ProfileError::Setup(
                    "SH_PROFILE_ONLINE requires SH_UPPER_NODE and SH_LOWER_NODE".into(),
                ))
            }
        };
        let weight = rt.opts.weight_source().expect("validated at configuration time");
        // Default to the first sampled event when none were named.
        let value_events: Vec<usize> = if online.events.is_empty() {
            vec![0]
        } else {
            online
                .events
                .iter()
                .filter_map(|name| events.iter().position(|e| e == name))
                .collect()
        };
        let offline_sites = match &opts.profile_input {
            None => None,
            Some(path) => {
                let file = File::open(path)?;
                let offline = parsing::parse_profile(BufReader::new(file))?;
                let offline_weight = offline_weight_source(&offline, weight);
                Some(packing::site_values(
                    &offline,
                    &value_events,
                    &multipliers.read(),
                    offline_weight,
                    online.sort,
                ))
            }
        };
        let source = online::OnlineSource::new(
            rt.clone(),
            profile.clone(),
            multipliers.clone(),
            online.clone(),
            weight,
            value_events,
            upper,
            lower,
            offline_sites,
        )?;
        workers.push(spawn_worker(Box::new(source), done_tx.clone(), online.skip_intervals));
    }

    let master_ctx = MasterCtx {
        rt,
        profile: profile.clone(),
        workers,
        done: done_rx,
        rate_ns: opts.profile_rate_ns,
        bw_relative: opts.bw.as_ref().map(|b| b.relative).unwrap_or(false),
    };
    let master = thread::Builder::new()
        .name("tieralloc-master".into())
        .spawn(move || master_main(master_ctx))
        .expect("spawning the profiling master");
    let master_pthread = master.as_pthread_t();

    Ok(Profiler { profile, multipliers, master: Some(master), master_pthread })
}

/// A parsed offline profile may not contain the preferred weight metric;
/// fall back to whatever it does carry.
fn offline_weight_source(profile: &ApplicationProfile, preferred: WeightSource) -> WeightSource {
    let has = |source: WeightSource| {
        profile.live_arenas().any(|a| {
            (match source {
                WeightSource::AllocsPeak => a.allocs.peak,
                WeightSource::ExtentSizePeak => a.extent_size.peak,
                WeightSource::RssPeak => a.rss.peak,
            }) > 0
        })
    };
    if has(preferred) {
        return preferred;
    }
    for source in
        [WeightSource::AllocsPeak, WeightSource::ExtentSizePeak, WeightSource::RssPeak]
    {
        if has(source) {
            return source;
        }
    }
    preferred
}

struct MasterCtx {
    rt: Arc<Runtime>,
    profile: Arc<RwLock<ApplicationProfile>>,
    workers: Vec<Worker>,
    done: Receiver<Reply>,
    rate_ns: u64,
    bw_relative: bool,
}

fn master_main(mut ctx: MasterCtx) {
    let stop = stop_signal();
    let tick = tick_signal();

    let mut set: libc::sigset_t = unsafe { mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, stop);
        libc::sigaddset(&mut set, tick);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, ptr::null_mut());
    }

    // The timer fires the tick signal at this thread, and only this
    // thread, on every period.
    let sev = sys::KernelSigevent::thread_signal(tick, sys::gettid());
    let timer = match sys::timer_create(libc::CLOCK_MONOTONIC, &sev)
        .and_then(|t| sys::timer_settime_interval(t, ctx.rate_ns).map(|_| t))
    {
        Ok(timer) => timer,
        Err(e) => {
            error!("interval timer setup failed, profiling disabled: {e}");
            stop_workers(&mut ctx);
            return;
        }
    };

    loop {
        let mut info: libc::siginfo_t = unsafe { mem::zeroed() };
        let sig = unsafe { libc::sigwaitinfo(&set, &mut info) };
        if sig == tick {
            run_interval(&mut ctx);
        } else if sig == stop {
            break;
        } else if sig < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                error!("sigwaitinfo failed: {err}");
                break;
            }
        }
    }

    let _ = sys::timer_delete(timer);
    stop_workers(&mut ctx);
}

fn stop_workers(ctx: &mut MasterCtx) {
    for worker in &ctx.workers {
        let _ = worker.cmd.send(Cmd::Stop);
    }
    for worker in ctx.workers.drain(..) {
        let _ = worker.handle.join();
    }
}

fn run_interval(ctx: &mut MasterCtx) {
    let started = Instant::now();

    // Open this interval: bump every live arena's counter and refresh its
    // site list, noting first observations.
    let live: Vec<usize> = {
        let mut profile = ctx.profile.write();
        let cur = profile.num_intervals;
        let mut live = Vec::new();
        for info in ctx.rt.arena_snapshot().into_iter().flatten() {
            let sites = info.sites.lock().clone();
            let record = profile.arena_mut(info.index, cur);
            record.sites = sites;
            record.num_intervals += 1;
            live.push(info.index);
        }
        live
    };

    for worker in &mut ctx.workers {
        if worker.skipped + 1 >= worker.skip_intervals {
            worker.skipped = 0;
            let _ = worker.cmd.send(Cmd::Run);
        } else {
            worker.skipped += 1;
            let _ = worker.cmd.send(Cmd::Skip);
        }
    }

    let mut replies = Vec::with_capacity(ctx.workers.len());
    for _ in 0..ctx.workers.len() {
        match ctx.done.recv() {
            Ok(reply) => replies.push(reply),
            Err(_) => {
                error!("a profiler worker died mid-interval");
                return;
            }
        }
    }

    fold_interval(ctx, &live, replies);

    let elapsed = started.elapsed();
    let budget = Duration::from_nanos(ctx.rate_ns);
    if elapsed > budget {
        warn!(
            "profiling interval took {elapsed:?}, over the {budget:?} budget; \
             lower the rate or the sample frequency"
        );
    }
}

fn fold_interval(ctx: &MasterCtx, live: &[usize], replies: Vec<Reply>) {
    let mut profile = ctx.profile.write();

    // Access samples fold first; relative bandwidth attribution needs the
    // per-arena sample counts from the same interval.
    let mut pebs_per_arena: Option<Vec<u64>> = None;
    let mut socket_total_bw = 0u64;

    for reply in &replies {
        if let Reply::Pebs(counts) = reply {
            let mut totals = vec![0u64; counts.first().map(|c| c.len()).unwrap_or(0)];
            for per_arena in counts {
                for (i, &n) in per_arena.iter().enumerate() {
                    totals[i] += n;
                }
            }
            pebs_per_arena = Some(totals);
        }
    }

    for reply in replies {
        match reply {
            Reply::Pebs(counts) => {
                for &index in live {
                    let record = profile.arena_mut(index, 0);
                    for (event_idx, series) in record.events.iter_mut().enumerate() {
                        let value = counts
                            .get(event_idx)
                            .and_then(|c| c.get(index))
                            .copied()
                            .unwrap_or(0);
                        series.push(value);
                    }
                }
            }
            Reply::Rss(bytes) => {
                for &index in live {
                    let value = bytes.get(index).copied().unwrap_or(0);
                    profile.arena_mut(index, 0).rss.push(value);
                }
            }
            Reply::ExtentSize(bytes) => {
                for &index in live {
                    let value = bytes.get(index).copied().unwrap_or(0);
                    profile.arena_mut(index, 0).extent_size.push(value);
                }
            }
            Reply::Allocs(bytes) => {
                for &index in live {
                    let value = bytes.get(index).copied().unwrap_or(0);
                    profile.arena_mut(index, 0).allocs.push(value);
                }
            }
            Reply::Bw(per_skt) => {
                for (i, &rate) in per_skt.iter().enumerate() {
                    socket_total_bw += rate;
                    if let Some(skt) = profile.bw_skts.get_mut(i) {
                        if rate > skt.peak {
                            skt.peak = rate;
                        }
                        skt.intervals.push(rate);
                    }
                }
            }
            Reply::Latency(samples) => {
                for s in &samples {
                    debug!(
                        "socket {} read-ratio cma {:.3} write-ratio cma {:.3}",
                        s.skt, s.read_ratio_cma, s.write_ratio_cma
                    );
                }
            }
            Reply::Online(decisions) => {
                for d in decisions {
                    let record = profile.arena_mut(d.arena_index, 0);
                    record.tier = Some(d.tier);
                    record.hot = Some(d.hot);
                }
            }
            Reply::Skipped(kind) => {
                for &index in live {
                    let record = profile.arena_mut(index, 0);
                    match kind {
                        SourceKind::Pebs => {
                            for series in &mut record.events {
                                series.push_skip();
                            }
                        }
                        SourceKind::Rss => record.rss.push_skip(),
                        SourceKind::ExtentSize => record.extent_size.push_skip(),
                        SourceKind::Allocs => record.allocs.push_skip(),
                        SourceKind::Bw | SourceKind::Latency | SourceKind::Online => {}
                    }
                }
                if kind == SourceKind::Bw {
                    for skt in &mut profile.bw_skts {
                        let value = skt.intervals.last().copied().unwrap_or(0);
                        skt.intervals.push(value);
                    }
                }
            }
        }
    }

    // Split socket bandwidth across arenas by their share of this
    // interval's access samples.
    if ctx.bw_relative {
        if let Some(per_arena) = &pebs_per_arena {
            let total_samples: u64 = per_arena.iter().sum();
            for &index in live {
                let share = if total_samples > 0 {
                    per_arena.get(index).copied().unwrap_or(0) as f64 / total_samples as f64
                } else {
                    0.0
                };
                let value = (socket_total_bw as f64 * share) as u64;
                profile.arena_mut(index, 0).bw.push(value);
            }
        }
    }

    profile.num_intervals += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;

    fn test_ctx(bw_relative: bool) -> Option<MasterCtx> {
        let devices = match tieralloc_pool::init() {
            Ok(d) if !d.is_empty() => d,
            _ => {
                eprintln!("skipping: no devices");
                return None;
            }
        };
        let rt = Arc::new(Runtime::new(Options::default(), devices).unwrap());
        let profile = Arc::new(RwLock::new(ApplicationProfile::new(
            vec!["ev".into()],
            rt.opts.max_arenas,
            &[0],
        )));
        let (_tx, done) = crossbeam_channel::unbounded();
        Some(MasterCtx { rt, profile, workers: Vec::new(), done, rate_ns: 1, bw_relative })
    }

    fn open_interval(ctx: &MasterCtx, live: &[usize]) {
        let mut profile = ctx.profile.write();
        let cur = profile.num_intervals;
        for &index in live {
            let record = profile.arena_mut(index, cur);
            record.num_intervals += 1;
        }
    }

    #[test]
    fn folding_builds_dense_series() {
        let Some(ctx) = test_ctx(false) else { return };
        let live = vec![0usize, 2];

        open_interval(&ctx, &live);
        fold_interval(
            &ctx,
            &live,
            vec![
                Reply::Pebs(vec![vec![3, 0, 9]]),
                Reply::Rss(vec![4096, 0, 8192]),
                Reply::Bw(vec![1000]),
            ],
        );
        open_interval(&ctx, &live);
        fold_interval(
            &ctx,
            &live,
            vec![Reply::Skipped(SourceKind::Pebs), Reply::Rss(vec![0, 0, 4096]), Reply::Bw(vec![500])],
        );

        let profile = ctx.profile.read();
        let a0 = profile.arenas[0].as_ref().unwrap();
        assert_eq!(a0.events[0].intervals, vec![3, 3]);
        assert_eq!(a0.events[0].total, 6);
        assert_eq!(a0.rss.intervals, vec![4096, 0]);
        let a2 = profile.arenas[2].as_ref().unwrap();
        assert_eq!(a2.events[0].intervals, vec![9, 9]);
        assert_eq!(a2.rss.peak, 8192);

        assert_eq!(profile.bw_skts[0].intervals, vec![1000, 500]);
        assert_eq!(profile.bw_skts[0].peak, 1000);
        assert_eq!(profile.num_intervals, 2);
    }

    #[test]
    fn relative_bandwidth_splits_by_sample_share() {
        let Some(ctx) = test_ctx(true) else { return };
        let live = vec![0usize, 1];

        open_interval(&ctx, &live);
        fold_interval(
            &ctx,
            &live,
            vec![Reply::Pebs(vec![vec![30, 10]]), Reply::Bw(vec![1000])],
        );

        let profile = ctx.profile.read();
        assert_eq!(profile.arenas[0].as_ref().unwrap().bw.intervals, vec![750]);
        assert_eq!(profile.arenas[1].as_ref().unwrap().bw.intervals, vec![250]);
    }

    #[test]
    fn online_decisions_land_on_the_records() {
        let Some(ctx) = test_ctx(false) else { return };
        let live = vec![0usize];
        open_interval(&ctx, &live);
        fold_interval(
            &ctx,
            &live,
            vec![Reply::Online(vec![OnlineDecision {
                arena_index: 0,
                tier: Tier::Upper,
                hot: true,
            }])],
        );
        let profile = ctx.profile.read();
        let a0 = profile.arenas[0].as_ref().unwrap();
        assert_eq!(a0.tier, Some(Tier::Upper));
        assert_eq!(a0.hot, Some(true));
    }
}
