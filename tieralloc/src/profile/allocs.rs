//! Allocation-size profiling: copies each arena's live byte count, as
//! maintained by the allocation-record map on every alloc and free.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::{Reply, Source, SourceKind};
use crate::runtime::Runtime;

pub(crate) struct AllocsSource {
    rt: Arc<Runtime>,
}

impl AllocsSource {
    pub fn new(rt: Arc<Runtime>) -> Self {
        AllocsSource { rt }
    }
}

impl Source for AllocsSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Allocs
    }

    fn run(&mut self) -> Reply {
        let bytes = self
            .rt
            .arena_snapshot()
            .iter()
            .map(|info| match info {
                Some(info) => info.size.load(Ordering::Relaxed) as u64,
                None => 0,
            })
            .collect();
        Reply::Allocs(bytes)
    }
}
