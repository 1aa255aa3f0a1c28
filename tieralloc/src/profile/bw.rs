//! Socket bandwidth from the memory-controller PMUs. One system-wide
//! counter per (socket CPU, IMC, event); per interval, the summed deltas
//! over elapsed time give cache lines per second per socket.

use std::time::Instant;

use log::debug;

use super::perf::CounterFd;
use super::{Reply, Source, SourceKind};
use crate::config::BwOptions;
use crate::error::ProfileError;
use crate::profile::event::EventEncoder;

struct SocketCounters {
    skt: u32,
    counters: Vec<CounterFd>,
}

pub(crate) struct BwSource {
    sockets: Vec<SocketCounters>,
    last: Instant,
}

impl BwSource {
    pub fn new(
        encoder: &dyn EventEncoder,
        opts: &BwOptions,
        imcs: &[String],
        skt_cpus: &[(u32, u32)],
    ) -> Result<Self, ProfileError> {
        let mut sockets = Vec::with_capacity(skt_cpus.len());
        for &(cpu, skt) in skt_cpus {
            let mut counters = Vec::new();
            for imc in imcs {
                for event in &opts.events {
                    let name = format!("{imc}::{event}");
                    let encoding = encoder.encode(&name)?;
                    counters.push(CounterFd::open(&name, &encoding, -1, cpu as i32)?);
                }
            }
            sockets.push(SocketCounters { skt, counters });
        }
        for socket in &sockets {
            for counter in &socket.counters {
                counter.reset();
                counter.enable();
            }
        }
        Ok(BwSource { sockets, last: Instant::now() })
    }
}

impl Source for BwSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Bw
    }

    fn run(&mut self) -> Reply {
        for socket in &self.sockets {
            for counter in &socket.counters {
                counter.disable();
            }
        }
        let elapsed = self.last.elapsed().as_secs_f64();

        let mut per_skt = Vec::with_capacity(self.sockets.len());
        for socket in &self.sockets {
            let mut lines = 0u64;
            for counter in &socket.counters {
                lines += counter.read().unwrap_or(0);
            }
            let rate = if elapsed > 0.0 { (lines as f64 / elapsed) as u64 } else { 0 };
            debug!("socket {}: {rate} cache lines/s", socket.skt);
            per_skt.push(rate);
        }

        for socket in &self.sockets {
            for counter in &socket.counters {
                counter.reset();
                counter.enable();
            }
        }
        self.last = Instant::now();

        Reply::Bw(per_skt)
    }

    fn skip(&mut self) {
        // Counters keep running; the next live interval divides by the
        // real elapsed time, so nothing is lost.
    }
}
