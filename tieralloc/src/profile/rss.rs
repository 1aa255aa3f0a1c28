//! Resident-set profiling: for every extent, ask the resident-page
//! oracle how many of its pages are actually present, and charge the
//! owning arena.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use log::warn;

use super::{Reply, Source, SourceKind};
use crate::error::ProfileError;
use crate::runtime::Runtime;

/// Answers "how many bytes of [start, end) are resident". The production
/// oracle reads the kernel pagemap; tests substitute their own.
pub trait ResidentPageOracle: Send {
    fn resident_bytes(&mut self, start: usize, end: usize) -> io::Result<u64>;
}

/// Reads `/proc/self/pagemap`: one 8-byte entry per page, bit 63 set when
/// the page is present.
pub struct PagemapOracle {
    file: File,
    pagesize: usize,
}

const PAGEMAP_ENTRY: usize = 8;
const PAGEMAP_PRESENT: u64 = 1 << 63;

impl PagemapOracle {
    pub fn open() -> Result<Self, ProfileError> {
        let file = File::open("/proc/self/pagemap").map_err(ProfileError::PagemapOpen)?;
        let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        Ok(PagemapOracle { file, pagesize })
    }
}

impl ResidentPageOracle for PagemapOracle {
    fn resident_bytes(&mut self, start: usize, end: usize) -> io::Result<u64> {
        let pages = (end - start) / self.pagesize;
        let mut buf = vec![0u8; pages * PAGEMAP_ENTRY];
        self.file
            .seek(SeekFrom::Start((start / self.pagesize * PAGEMAP_ENTRY) as u64))?;
        self.file.read_exact(&mut buf)?;

        let mut resident = 0u64;
        for entry in buf.chunks_exact(PAGEMAP_ENTRY) {
            let word = u64::from_ne_bytes(entry.try_into().unwrap());
            if word & PAGEMAP_PRESENT != 0 {
                resident += self.pagesize as u64;
            }
        }
        Ok(resident)
    }
}

pub(crate) struct RssSource {
    rt: Arc<Runtime>,
    oracle: Box<dyn ResidentPageOracle>,
}

impl RssSource {
    pub fn new(rt: Arc<Runtime>, oracle: Box<dyn ResidentPageOracle>) -> Self {
        RssSource { rt, oracle }
    }
}

impl Source for RssSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Rss
    }

    fn run(&mut self) -> Reply {
        let arenas = self.rt.max_index_plus1.load(std::sync::atomic::Ordering::Relaxed);
        let mut bytes = vec![0u64; arenas];

        let extents = self.rt.extents.read();
        for (start, end, arena) in extents.iter() {
            match self.oracle.resident_bytes(start, end) {
                Ok(resident) => {
                    if let Some(slot) = bytes.get_mut(arena as usize) {
                        *slot += resident;
                    }
                }
                // A transient short read just under-reports the interval.
                Err(e) => warn!("pagemap read for {start:#x}..{end:#x} failed: {e}"),
            }
        }

        Reply::Rss(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedOracle(u64);

    impl ResidentPageOracle for FixedOracle {
        fn resident_bytes(&mut self, _start: usize, _end: usize) -> io::Result<u64> {
            Ok(self.0)
        }
    }

    #[test]
    fn pagemap_oracle_sees_touched_pages() {
        let Ok(mut oracle) = PagemapOracle::open() else {
            eprintln!("skipping: pagemap unreadable");
            return;
        };
        let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        let len = 16 * pagesize;
        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(map, libc::MAP_FAILED);
        let base = map as usize;

        // Touch half the pages; at least those must be resident.
        for page in 0..8 {
            unsafe { (map as *mut u8).add(page * pagesize).write(1) };
        }
        let resident = oracle.resident_bytes(base, base + len).unwrap();
        assert!(resident >= 8 * pagesize as u64);
        assert!(resident <= len as u64);

        unsafe { libc::munmap(map, len) };
    }

    #[test]
    fn fixed_oracle_is_a_valid_substitute() {
        let mut oracle = FixedOracle(4096);
        assert_eq!(oracle.resident_bytes(0, 4096).unwrap(), 4096);
    }
}
