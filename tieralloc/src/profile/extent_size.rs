//! Extent-size profiling: per arena, the sum of its live extent lengths.
//! Pure registry arithmetic, no OS calls.

use std::sync::Arc;

use super::{Reply, Source, SourceKind};
use crate::runtime::Runtime;

pub(crate) struct ExtentSizeSource {
    rt: Arc<Runtime>,
}

impl ExtentSizeSource {
    pub fn new(rt: Arc<Runtime>) -> Self {
        ExtentSizeSource { rt }
    }
}

impl Source for ExtentSizeSource {
    fn kind(&self) -> SourceKind {
        SourceKind::ExtentSize
    }

    fn run(&mut self) -> Reply {
        let arenas = self.rt.max_index_plus1.load(std::sync::atomic::Ordering::Relaxed);
        let mut bytes = vec![0u64; arenas];

        let extents = self.rt.extents.read();
        for (start, end, arena) in extents.iter() {
            if let Some(slot) = bytes.get_mut(arena as usize) {
                *slot += (end - start) as u64;
            }
        }

        Reply::ExtentSize(bytes)
    }
}
