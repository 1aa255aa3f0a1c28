use libc::c_ulong;

use crate::device::Device;
use crate::error::PoolError;

const BITS_PER_WORD: usize = c_ulong::BITS as usize;

/// A bitmap over NUMA node ids, in the layout the `mbind` and
/// `set_mempolicy` syscalls expect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMask {
    words: Vec<c_ulong>,
}

impl NodeMask {
    pub fn new() -> Self {
        NodeMask { words: vec![0] }
    }

    /// Builds the mask for an arena's device list. Every device must be
    /// NUMA-backed and the whole list must share one page size.
    pub fn from_devices(devices: &[Device]) -> Result<Self, PoolError> {
        let mut mask = NodeMask::new();
        let mut page_kb = None;
        for dev in devices {
            match page_kb {
                None => page_kb = Some(dev.page_kb()),
                Some(kb) if kb != dev.page_kb() => return Err(PoolError::MixedPageSizes),
                Some(_) => {}
            }
            mask.set(dev.numa_id());
        }
        if page_kb.is_none() {
            return Err(PoolError::MixedPageSizes);
        }
        Ok(mask)
    }

    pub fn set(&mut self, node: u32) {
        let word = node as usize / BITS_PER_WORD;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (node as usize % BITS_PER_WORD);
    }

    pub fn is_set(&self, node: u32) -> bool {
        let word = node as usize / BITS_PER_WORD;
        self.words.get(word).is_some_and(|w| w & (1 << (node as usize % BITS_PER_WORD)) != 0)
    }

    pub fn as_ptr(&self) -> *const c_ulong {
        self.words.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut c_ulong {
        self.words.as_mut_ptr()
    }

    /// Bit capacity, passed as `maxnode`.
    pub fn maxnode(&self) -> c_ulong {
        (self.words.len() * BITS_PER_WORD) as c_ulong
    }

    pub fn nodes(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &w)| {
            (0..BITS_PER_WORD)
                .filter(move |bit| w & (1 << bit) != 0)
                .map(move |bit| (wi * BITS_PER_WORD + bit) as u32)
        })
    }
}

impl Default for NodeMask {
    fn default() -> Self {
        NodeMask::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    #[test]
    fn set_and_query() {
        let mut mask = NodeMask::new();
        mask.set(0);
        mask.set(65);
        assert!(mask.is_set(0));
        assert!(!mask.is_set(1));
        assert!(mask.is_set(65));
        assert_eq!(mask.nodes().collect::<Vec<_>>(), vec![0, 65]);
        assert!(mask.maxnode() >= 66);
    }

    #[test]
    fn from_devices_requires_one_page_size() {
        let a = Device::Dram { node: 0, page_kb: 4 };
        let b = Device::Dram { node: 1, page_kb: 2048 };
        assert!(NodeMask::from_devices(&[a, b]).is_err());
        assert!(NodeMask::from_devices(&[]).is_err());

        let mask = NodeMask::from_devices(&[a]).unwrap();
        assert!(mask.is_set(0));
        assert!(!mask.is_set(1));
    }
}
