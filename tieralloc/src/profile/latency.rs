//! Tier latency from the memory-controller queues: occupancy over
//! inserts, normalized by the DRAM clock, gives the average queue latency
//! per tier; the lower/upper ratio feeds a cumulative moving average, and
//! optionally rewrites the access-sample multipliers so the packing
//! decision prices lower-tier accesses at their true cost.

use std::sync::Arc;
use std::time::Instant;

use log::debug;
use parking_lot::RwLock;

use super::perf::CounterFd;
use super::{Reply, Source, SourceKind};
use crate::config::LatencyOptions;
use crate::error::ProfileError;
use crate::profile::event::EventEncoder;

/// The eight queue events, in the order `SH_PROFILE_LATENCY_EVENTS`
/// requires them.
const UPPER_READ_INSERTS: usize = 0;
const UPPER_READ_OCCUPANCY: usize = 1;
const UPPER_WRITE_INSERTS: usize = 2;
const UPPER_WRITE_OCCUPANCY: usize = 3;
const LOWER_READ_INSERTS: usize = 4;
const LOWER_READ_OCCUPANCY: usize = 5;
const LOWER_WRITE_INSERTS: usize = 6;
const LOWER_WRITE_OCCUPANCY: usize = 7;

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SocketLatency {
    pub skt: u32,
    pub upper_read: f64,
    pub upper_write: f64,
    pub lower_read: f64,
    pub lower_write: f64,
    pub read_ratio_cma: f64,
    pub write_ratio_cma: f64,
}

struct SocketCounters {
    skt: u32,
    clocktick: CounterFd,
    /// `[imc][event]`, eight events per IMC.
    queues: Vec<Vec<CounterFd>>,
}

pub(crate) struct LatencySource {
    sockets: Vec<SocketCounters>,
    read_cma: Vec<f64>,
    write_cma: Vec<f64>,
    num_samples: u64,
    last: Instant,
    set_multipliers: bool,
    multipliers: Arc<RwLock<Vec<f32>>>,
}

impl LatencySource {
    pub fn new(
        encoder: &dyn EventEncoder,
        opts: &LatencyOptions,
        imcs: &[String],
        skt_cpus: &[(u32, u32)],
        multipliers: Arc<RwLock<Vec<f32>>>,
    ) -> Result<Self, ProfileError> {
        let mut sockets = Vec::with_capacity(skt_cpus.len());
        for &(cpu, skt) in skt_cpus {
            let name = format!("{}::{}", imcs[0], opts.clocktick_event);
            let encoding = encoder.encode(&name)?;
            let clocktick = CounterFd::open(&name, &encoding, -1, cpu as i32)?;

            let mut queues = Vec::with_capacity(imcs.len());
            for imc in imcs {
                let mut events = Vec::with_capacity(opts.events.len());
                for event in &opts.events {
                    let name = format!("{imc}::{event}");
                    let encoding = encoder.encode(&name)?;
                    events.push(CounterFd::open(&name, &encoding, -1, cpu as i32)?);
                }
                queues.push(events);
            }
            sockets.push(SocketCounters { skt, clocktick, queues });
        }

        for socket in &sockets {
            socket.clocktick.reset();
            socket.clocktick.enable();
            for imc in &socket.queues {
                for counter in imc {
                    counter.reset();
                    counter.enable();
                }
            }
        }

        Ok(LatencySource {
            read_cma: vec![0.0; sockets.len()],
            write_cma: vec![0.0; sockets.len()],
            sockets,
            num_samples: 0,
            last: Instant::now(),
            set_multipliers: opts.set_multipliers,
            multipliers,
        })
    }
}

impl Source for LatencySource {
    fn kind(&self) -> SourceKind {
        SourceKind::Latency
    }

    fn run(&mut self) -> Reply {
        let elapsed_s = self.last.elapsed().as_secs_f64();

        for socket in &self.sockets {
            socket.clocktick.disable();
            for imc in &socket.queues {
                for counter in imc {
                    counter.disable();
                }
            }
        }

        let mut samples = Vec::with_capacity(self.sockets.len());
        for (i, socket) in self.sockets.iter().enumerate() {
            let ticks = socket.clocktick.read().unwrap_or(0) as f64;
            // DRAM cycles per nanosecond.
            let dram_speed = ticks / (1e9 * elapsed_s);

            let mut sums = [0.0f64; 8];
            for imc in &socket.queues {
                for (event_idx, counter) in imc.iter().enumerate() {
                    sums[event_idx] += counter.read().unwrap_or(0) as f64;
                }
            }

            let queue_latency = |occupancy: f64, inserts: f64| -> f64 {
                if occupancy > 0.0 && inserts > 0.0 && dram_speed > 0.0 {
                    occupancy / inserts / dram_speed
                } else {
                    0.0
                }
            };

            let mut sample = SocketLatency {
                skt: socket.skt,
                upper_read: queue_latency(sums[UPPER_READ_OCCUPANCY], sums[UPPER_READ_INSERTS]),
                upper_write: queue_latency(sums[UPPER_WRITE_OCCUPANCY], sums[UPPER_WRITE_INSERTS]),
                lower_read: queue_latency(sums[LOWER_READ_OCCUPANCY], sums[LOWER_READ_INSERTS]),
                lower_write: queue_latency(sums[LOWER_WRITE_OCCUPANCY], sums[LOWER_WRITE_INSERTS]),
                ..Default::default()
            };

            // Floating-point cumulative moving averages of the tier
            // ratios; a socket with no traffic this interval carries its
            // average forward.
            if sample.upper_read > 0.0 && sample.lower_read > 0.0 {
                let ratio = sample.lower_read / sample.upper_read;
                self.read_cma[i] = (self.read_cma[i] * self.num_samples as f64 + ratio)
                    / (self.num_samples as f64 + 1.0);
            }
            if sample.upper_write > 0.0 && sample.lower_write > 0.0 {
                let ratio = sample.lower_write / sample.upper_write;
                self.write_cma[i] = (self.write_cma[i] * self.num_samples as f64 + ratio)
                    / (self.num_samples as f64 + 1.0);
            }
            sample.read_ratio_cma = self.read_cma[i];
            sample.write_ratio_cma = self.write_cma[i];
            debug!(
                "socket {} latency: upper r/w {:.1}/{:.1}, lower r/w {:.1}/{:.1}, cma {:.3}",
                sample.skt,
                sample.upper_read,
                sample.upper_write,
                sample.lower_read,
                sample.lower_write,
                sample.read_ratio_cma
            );
            samples.push(sample);
        }
        self.num_samples += 1;

        if self.set_multipliers {
            // Geometric mean of the sockets' read-ratio averages scales
            // the lower-tier event; the upper-tier event is the unit.
            let positive: Vec<f64> =
                self.read_cma.iter().copied().filter(|&r| r > 0.0).collect();
            if !positive.is_empty() {
                let geomean =
                    (positive.iter().map(|r| r.ln()).sum::<f64>() / positive.len() as f64).exp();
                let mut multipliers = self.multipliers.write();
                if multipliers.len() >= 2 {
                    multipliers[0] = 1.0;
                    multipliers[1] = if geomean > 1.0 { geomean as f32 } else { 1.0 };
                }
            }
        }

        for socket in &self.sockets {
            socket.clocktick.reset();
            socket.clocktick.enable();
            for imc in &socket.queues {
                for counter in imc {
                    counter.reset();
                    counter.enable();
                }
            }
        }
        self.last = Instant::now();

        Reply::Latency(samples)
    }

    fn skip(&mut self) {}
}
