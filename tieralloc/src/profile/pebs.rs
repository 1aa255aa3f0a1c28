//! The access-sample profiler: one sampling perf event per configured
//! event name, classifying each sampled data address against the extent
//! registry to charge the owning arena.

use std::sync::Arc;

use super::perf::PerfSampler;
use super::{Reply, Source, SourceKind};
use crate::error::ProfileError;
use crate::profile::event::EventEncoder;
use crate::runtime::Runtime;

pub(crate) struct PebsSource {
    rt: Arc<Runtime>,
    samplers: Vec<PerfSampler>,
}

impl PebsSource {
    /// Must run on the application's main thread: the sampling fds are
    /// opened for the calling thread, and that is the thread whose
    /// accesses matter.
    pub fn new(
        rt: Arc<Runtime>,
        encoder: &dyn EventEncoder,
        events: &[String],
        sample_period: u64,
        ring_pages: usize,
    ) -> Result<Self, ProfileError> {
        let mut samplers = Vec::with_capacity(events.len());
        for name in events {
            let encoding = encoder.encode(name)?;
            samplers.push(PerfSampler::open(name, &encoding, sample_period, ring_pages)?);
        }
        for sampler in &samplers {
            sampler.reset_and_enable();
        }
        Ok(PebsSource { rt, samplers })
    }
}

impl Source for PebsSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Pebs
    }

    fn run(&mut self) -> Reply {
        let arenas = self.rt.max_index_plus1.load(std::sync::atomic::Ordering::Relaxed);
        let mut counts = vec![vec![0u64; arenas]; self.samplers.len()];

        for (event_idx, sampler) in self.samplers.iter_mut().enumerate() {
            // Hold the registry read lock across the whole window so a
            // concurrent dalloc cannot tear the classification.
            let extents = self.rt.extents.read();
            let per_arena = &mut counts[event_idx];
            sampler.drain(|addr| {
                if let Some((_, _, arena)) = extents.find_containing(addr as usize) {
                    if let Some(slot) = per_arena.get_mut(arena as usize) {
                        *slot += 1;
                    }
                }
            });
        }

        Reply::Pebs(counts)
    }
}
