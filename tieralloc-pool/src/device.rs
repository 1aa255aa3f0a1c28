use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::ptr;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use libc::c_void;
use log::debug;

use crate::error::PoolError;
use crate::nodemask::NodeMask;
use crate::sys;

/// NUMA distance from a CPU to its own node's memory.
const NEAR_DRAM: u32 = 10;
/// On Knights Landing the compute tile nearest an HBM node always reports
/// this distance; anything else keeps malloc away from the MCDRAM.
const NEAR_KNL_HBM: u32 = 31;
const NEAR_POWERPC_HBM: u32 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceTag {
    Dram,
    KnlHbm,
    PowerPcHbm,
}

impl DeviceTag {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceTag::Dram => "DRAM",
            DeviceTag::KnlHbm => "KNL_HBM",
            DeviceTag::PowerPcHbm => "POWERPC_HBM",
        }
    }
}

impl FromStr for DeviceTag {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "DRAM" => Ok(DeviceTag::Dram),
            "KNL_HBM" => Ok(DeviceTag::KnlHbm),
            "POWERPC_HBM" => Ok(DeviceTag::PowerPcHbm),
            _ => Err(()),
        }
    }
}

impl fmt::Display for DeviceTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One memory pool: a NUMA node at a particular page size, classified by
/// the kind of silicon behind it. Discovered once at startup, never
/// mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Dram { node: u32, page_kb: u32 },
    KnlHbm { node: u32, compute_node: i32, page_kb: u32 },
    PowerPcHbm { node: u32, page_kb: u32 },
}

impl Device {
    pub fn tag(&self) -> DeviceTag {
        match self {
            Device::Dram { .. } => DeviceTag::Dram,
            Device::KnlHbm { .. } => DeviceTag::KnlHbm,
            Device::PowerPcHbm { .. } => DeviceTag::PowerPcHbm,
        }
    }

    pub fn numa_id(&self) -> u32 {
        match *self {
            Device::Dram { node, .. }
            | Device::KnlHbm { node, .. }
            | Device::PowerPcHbm { node, .. } => node,
        }
    }

    /// Page size in KiB.
    pub fn page_kb(&self) -> u32 {
        match *self {
            Device::Dram { page_kb, .. }
            | Device::KnlHbm { page_kb, .. }
            | Device::PowerPcHbm { page_kb, .. } => page_kb,
        }
    }

    /// The compute node a thread should run on to be near this device.
    pub fn compute_node(&self) -> u32 {
        match *self {
            Device::KnlHbm { compute_node, .. } if compute_node >= 0 => compute_node as u32,
            _ => self.numa_id(),
        }
    }

    pub fn uses_base_pages(&self) -> bool {
        self.page_kb() == base_page_kb()
    }

    /// Total capacity of this pool in KiB, from sysfs.
    pub fn capacity_kb(&self) -> io::Result<u64> {
        let node = self.numa_id();
        if self.uses_base_pages() {
            let text = fs::read_to_string(node_path(node, "meminfo"))?;
            parse_meminfo_kb(&text, "MemTotal")
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no MemTotal"))
        } else {
            let pages = read_hugepage_count(node, self.page_kb(), "nr_hugepages")?;
            Ok(pages * self.page_kb() as u64)
        }
    }

    /// Currently free capacity in KiB, from sysfs.
    pub fn avail_kb(&self) -> io::Result<u64> {
        let node = self.numa_id();
        if self.uses_base_pages() {
            let text = fs::read_to_string(node_path(node, "meminfo"))?;
            parse_meminfo_kb(&text, "MemFree")
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no MemFree"))
        } else {
            let pages = read_hugepage_count(node, self.page_kb(), "free_hugepages")?;
            Ok(pages * self.page_kb() as u64)
        }
    }

    /// Distance from the calling thread's CPU to this device's node.
    pub fn model_distance(&self) -> io::Result<u32> {
        let from = sys::current_node()?;
        let row = fs::read_to_string(node_path(from, "distance"))?;
        parse_distance_row(&row)
            .get(self.numa_id() as usize)
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "node missing in distance row"))
    }

    /// True iff this device is co-located with the calling thread, per the
    /// tier's characteristic NUMA distance.
    pub fn is_near(&self) -> bool {
        let near = match self.tag() {
            DeviceTag::Dram => NEAR_DRAM,
            DeviceTag::KnlHbm => NEAR_KNL_HBM,
            DeviceTag::PowerPcHbm => NEAR_POWERPC_HBM,
        };
        self.model_distance().map(|d| d == near).unwrap_or(false)
    }

    /// Migrates the calling thread to this device's compute node.
    pub fn pin(&self) -> io::Result<()> {
        let node = self.compute_node();
        let text = fs::read_to_string(node_path(node, "cpulist"))?;
        let cpus = parse_cpulist(text.trim());
        if cpus.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "node has no CPUs"));
        }
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            for cpu in cpus {
                libc::CPU_SET(cpu as usize, &mut set);
            }
            if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// One-shot allocation bound to this device, outside any arena.
    pub fn alloc(&self, size: usize) -> Result<*mut u8, PoolError> {
        let mut mask = NodeMask::new();
        mask.set(self.numa_id());
        let mut old_mode = 0;
        let mut old_mask = NodeMask::new();
        old_mask.set(0);
        let _ = sys::get_mempolicy(&mut old_mode, old_mask.as_mut_ptr(), old_mask.maxnode());
        sys::set_mempolicy(sys::MPOL_BIND, mask.as_ptr(), mask.maxnode()).map_err(PoolError::Bind)?;

        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        if !self.uses_base_pages() {
            let shift = self.page_kb().trailing_zeros() as i32 + 10;
            flags |= libc::MAP_HUGETLB | (shift << sys::MAP_HUGE_SHIFT);
        }
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        let _ = sys::set_mempolicy(old_mode, old_mask.as_ptr(), old_mask.maxnode());
        if ptr == libc::MAP_FAILED {
            return Err(PoolError::Mmap(io::Error::last_os_error()));
        }
        Ok(ptr as *mut u8)
    }

    /// Releases an allocation made with [`Device::alloc`]. Huge-page
    /// mappings are unmapped in whole-page multiples.
    ///
    /// # Safety
    ///
    /// `ptr`/`size` must describe a live mapping from [`Device::alloc`].
    pub unsafe fn free(&self, ptr: *mut u8, size: usize) {
        let len = if self.uses_base_pages() {
            size
        } else {
            let page = self.page_kb() as usize * 1024;
            size.div_ceil(page) * page
        };
        libc::munmap(ptr as *mut c_void, len);
    }
}

/// Rebinds `[ptr, ptr + size)` to `dst`, moving already-present pages.
///
/// # Safety
///
/// The range must be a live mapping owned by the caller.
pub unsafe fn move_range(dst: &Device, ptr: *mut u8, size: usize) -> Result<(), PoolError> {
    let mut mask = NodeMask::new();
    mask.set(dst.numa_id());
    sys::mbind(
        ptr as *mut c_void,
        size,
        sys::MPOL_BIND,
        mask.as_ptr(),
        mask.maxnode(),
        sys::MPOL_MF_MOVE,
    )
    .map_err(PoolError::Bind)
}

/// The ordered set of devices discovered at startup: per memory node, one
/// entry at the base page size followed by one per configured huge-page
/// size.
#[derive(Debug, Clone, Default)]
pub struct DeviceList {
    pub devices: Vec<Device>,
}

impl DeviceList {
    /// First device matching `tag` and `page_kb` (0 matches any page
    /// size), skipping `exclude`.
    pub fn find(&self, tag: DeviceTag, page_kb: u32, exclude: Option<&Device>) -> Option<&Device> {
        self.devices.iter().find(|d| {
            d.tag() == tag
                && (page_kb == 0 || d.page_kb() == page_kb)
                && exclude != Some(*d)
        })
    }

    /// First base-page device on the given NUMA node.
    pub fn find_numa(&self, node: u32) -> Option<&Device> {
        self.devices
            .iter()
            .find(|d| d.numa_id() == node && d.uses_base_pages())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

fn node_path(node: u32, leaf: &str) -> String {
    format!("/sys/devices/system/node/node{node}/{leaf}")
}

pub(crate) fn base_page_kb() -> u32 {
    (sys::page_size() / 1024) as u32
}

/// Pulls a `kB` quantity out of a node meminfo blob, e.g.
/// `Node 0 MemTotal:       32657848 kB`.
fn parse_meminfo_kb(text: &str, field: &str) -> Option<u64> {
    let needle = format!("{field}:");
    for line in text.lines() {
        let mut toks = line.split_whitespace();
        // "Node <n> <field>: <value> kB"
        if toks.next() != Some("Node") {
            continue;
        }
        let _node = toks.next()?;
        if toks.next() != Some(needle.as_str()) {
            continue;
        }
        return toks.next()?.parse().ok();
    }
    None
}

fn read_hugepage_count(node: u32, page_kb: u32, leaf: &str) -> io::Result<u64> {
    let path = format!(
        "/sys/devices/system/node/node{node}/hugepages/hugepages-{page_kb}kB/{leaf}"
    );
    let text = fs::read_to_string(path)?;
    text.trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad hugepage count"))
}

fn parse_distance_row(row: &str) -> Vec<u32> {
    row.split_whitespace().filter_map(|t| t.parse().ok()).collect()
}

/// Expands a kernel cpulist such as `0-3,8,10-11`.
fn parse_cpulist(list: &str) -> Vec<u32> {
    let mut cpus = Vec::new();
    for part in list.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = part.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) {
                cpus.extend(lo..=hi);
            }
        } else if let Ok(cpu) = part.parse() {
            cpus.push(cpu);
        }
    }
    cpus
}

/// Huge-page sizes configured in the kernel, in KiB, from the per-size
/// directories under /sys/kernel/mm/hugepages.
fn hugepage_sizes_kb(dir: &Path) -> Vec<u32> {
    let mut sizes = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return sizes;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(kb) = parse_hugepage_dirname(&name) {
            sizes.push(kb);
        }
    }
    sizes.sort_unstable();
    sizes
}

fn parse_hugepage_dirname(name: &str) -> Option<u32> {
    name.strip_prefix("hugepages-")?.strip_suffix("kB")?.parse().ok()
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        fn is_knights_landing() -> bool {
            // Family 6 model 0x57: model in CPUID leaf 1 bits 4..8,
            // extended model bits 16..20.
            let leaf = unsafe { std::arch::x86_64::__cpuid(1) };
            let model = (leaf.eax >> 4) & 0xf;
            let ext_model = (leaf.eax >> 16) & 0xf;
            model == 0x7 && ext_model == 0x5
        }
    } else {
        fn is_knights_landing() -> bool {
            false
        }
    }
}

struct NodeTopology {
    /// Memory-backed node ids, ascending.
    memory_nodes: Vec<u32>,
    /// Nodes with at least one CPU.
    compute_nodes: Vec<u32>,
    /// Distance matrix rows for the memory nodes, keyed by node id.
    distances: Vec<(u32, Vec<u32>)>,
    huge_kb: Vec<u32>,
}

fn read_topology() -> io::Result<NodeTopology> {
    let mut memory_nodes = Vec::new();
    let mut compute_nodes = Vec::new();
    let mut distances = Vec::new();

    let mut node_ids: Vec<u32> = Vec::new();
    for entry in fs::read_dir("/sys/devices/system/node")?.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(id) = name.strip_prefix("node").and_then(|s| s.parse().ok()) {
            node_ids.push(id);
        }
    }
    node_ids.sort_unstable();

    for node in node_ids {
        let meminfo = fs::read_to_string(node_path(node, "meminfo")).unwrap_or_default();
        let has_memory = parse_meminfo_kb(&meminfo, "MemTotal").unwrap_or(0) > 0;
        let cpulist = fs::read_to_string(node_path(node, "cpulist")).unwrap_or_default();
        if !parse_cpulist(cpulist.trim()).is_empty() {
            compute_nodes.push(node);
        }
        if has_memory {
            memory_nodes.push(node);
            let row = fs::read_to_string(node_path(node, "distance")).unwrap_or_default();
            distances.push((node, parse_distance_row(&row)));
        }
    }

    Ok(NodeTopology {
        memory_nodes,
        compute_nodes,
        distances,
        huge_kb: hugepage_sizes_kb(Path::new("/sys/kernel/mm/hugepages")),
    })
}

fn classify(topo: &NodeTopology) -> Vec<Device> {
    let base_kb = base_page_kb();
    let mut devices = Vec::new();
    let mut hbm_nodes: Vec<u32> = Vec::new();

    let cpuless =
        |node: u32| -> bool { !topo.compute_nodes.contains(&node) };

    if cfg!(target_arch = "x86_64") && is_knights_landing() {
        for &node in &topo.memory_nodes {
            if !cpuless(node) {
                continue;
            }
            // The peer at the KNL near-HBM distance is this pool's tile.
            let compute_node = topo
                .distances
                .iter()
                .find(|(n, _)| *n == node)
                .and_then(|(_, row)| {
                    row.iter().position(|&d| d == NEAR_KNL_HBM).map(|j| j as i32)
                })
                .unwrap_or(-1);
            devices.push(Device::KnlHbm { node, compute_node, page_kb: base_kb });
            for &kb in &topo.huge_kb {
                devices.push(Device::KnlHbm { node, compute_node, page_kb: kb });
            }
            hbm_nodes.push(node);
        }
    } else if cfg!(any(target_arch = "powerpc", target_arch = "powerpc64")) {
        for &node in &topo.memory_nodes {
            if !cpuless(node) {
                continue;
            }
            devices.push(Device::PowerPcHbm { node, page_kb: base_kb });
            for &kb in &topo.huge_kb {
                devices.push(Device::PowerPcHbm { node, page_kb: kb });
            }
            hbm_nodes.push(node);
        }
    }

    for &node in &topo.memory_nodes {
        if hbm_nodes.contains(&node) {
            continue;
        }
        devices.push(Device::Dram { node, page_kb: base_kb });
        for &kb in &topo.huge_kb {
            devices.push(Device::Dram { node, page_kb: kb });
        }
    }

    devices
}

static DEVICES: OnceLock<DeviceList> = OnceLock::new();
static INIT_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Discovers the machine's memory pools. Idempotent and reference-counted:
/// repeated calls return the same list; pair each call with a
/// [`fini`]. The list lives until process exit.
pub fn init() -> io::Result<&'static DeviceList> {
    INIT_COUNT.fetch_add(1, Ordering::AcqRel);
    if let Some(list) = DEVICES.get() {
        return Ok(list);
    }
    let topo = read_topology()?;
    let devices = classify(&topo);
    debug!(
        "discovered {} memory devices over {} NUMA nodes",
        devices.len(),
        topo.memory_nodes.len()
    );
    Ok(DEVICES.get_or_init(|| DeviceList { devices }))
}

/// Balances an [`init`] call. The device list itself is never freed before
/// process exit; the count only tracks outstanding users.
pub fn fini() {
    let _ = INIT_COUNT.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_parsing() {
        let text = "Node 1 MemTotal:       32657848 kB\n\
                    Node 1 MemFree:        30470144 kB\n\
                    Node 1 MemUsed:         2187704 kB\n";
        assert_eq!(parse_meminfo_kb(text, "MemTotal"), Some(32657848));
        assert_eq!(parse_meminfo_kb(text, "MemFree"), Some(30470144));
        assert_eq!(parse_meminfo_kb(text, "Shmem"), None);
    }

    #[test]
    fn hugepage_dirnames() {
        assert_eq!(parse_hugepage_dirname("hugepages-2048kB"), Some(2048));
        assert_eq!(parse_hugepage_dirname("hugepages-1048576kB"), Some(1048576));
        assert_eq!(parse_hugepage_dirname("something-else"), None);
    }

    #[test]
    fn cpulist_parsing() {
        assert_eq!(parse_cpulist("0-3,8,10-11"), vec![0, 1, 2, 3, 8, 10, 11]);
        assert_eq!(parse_cpulist(""), Vec::<u32>::new());
        assert_eq!(parse_cpulist("5"), vec![5]);
    }

    #[test]
    fn distance_rows() {
        assert_eq!(parse_distance_row("10 21 31 41"), vec![10, 21, 31, 41]);
    }

    #[test]
    fn device_queries() {
        let d = Device::KnlHbm { node: 4, compute_node: 1, page_kb: 4 };
        assert_eq!(d.numa_id(), 4);
        assert_eq!(d.compute_node(), 1);
        assert_eq!(d.tag(), DeviceTag::KnlHbm);

        let d = Device::Dram { node: 0, page_kb: 2048 };
        assert_eq!(d.compute_node(), 0);
        assert!(!d.uses_base_pages());
    }

    #[test]
    fn find_in_list() {
        let list = DeviceList {
            devices: vec![
                Device::Dram { node: 0, page_kb: 4 },
                Device::Dram { node: 0, page_kb: 2048 },
                Device::Dram { node: 1, page_kb: 4 },
            ],
        };
        let first = list.find(DeviceTag::Dram, 0, None).unwrap();
        assert_eq!(first.numa_id(), 0);
        let huge = list.find(DeviceTag::Dram, 2048, None).unwrap();
        assert_eq!(huge.page_kb(), 2048);
        let second = list.find(DeviceTag::Dram, 4, Some(first)).unwrap();
        assert_eq!(second.numa_id(), 1);
        assert!(list.find(DeviceTag::KnlHbm, 0, None).is_none());
        assert_eq!(list.find_numa(1).unwrap().numa_id(), 1);
    }

    #[test]
    fn classification_marks_cpuless_nodes() {
        let topo = NodeTopology {
            memory_nodes: vec![0, 1],
            compute_nodes: vec![0],
            distances: vec![(0, vec![10, 21]), (1, vec![21, 10])],
            huge_kb: vec![2048],
        };
        let devices = classify(&topo);
        // Whatever the architecture, every memory node shows up with a
        // base-page entry followed by one per huge-page size.
        assert_eq!(devices.len(), 4);
        for node in [0u32, 1] {
            let pages: Vec<u32> = devices
                .iter()
                .filter(|d| d.numa_id() == node)
                .map(|d| d.page_kb())
                .collect();
            assert_eq!(pages, vec![base_page_kb(), 2048]);
        }
    }
}
