//! The tracker and the site-to-arena router: one process-wide [`Runtime`]
//! owns the arena table, the global extent registry, the per-site routing
//! state, and the allocation-record map. The allocation entry points at
//! the bottom are what instrumented call sites invoke.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use log::{error, warn};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tieralloc_pool::{Arena, BindPolicy, Device, DeviceList, ExtentCallback, ExtentList};

use crate::config::{ArenaLayout, Options};
use crate::error::ConfigError;

pub(crate) static RUNTIME: OnceLock<Arc<Runtime>> = OnceLock::new();

std::thread_local! {
    static THREAD_INDEX: Cell<usize> = const { Cell::new(usize::MAX) };
    /// The arena index the current thread is about to allocate into. The
    /// extent callback reads this to attribute extents that show up while
    /// the owning arena is still being created.
    static PENDING_INDEX: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// One arena as the router sees it: the pool-level arena plus the sites
/// living in it and the allocation-record byte count.
pub struct ArenaInfo {
    pub index: usize,
    pub arena: Arc<Arena>,
    /// Net bytes outstanding per the allocation-record map. Only
    /// maintained when the allocs profiler is on.
    pub size: AtomicUsize,
    pub sites: Mutex<Vec<u32>>,
}

pub struct Runtime {
    pub(crate) opts: Options,
    pub(crate) devices: &'static DeviceList,
    pub(crate) upper_device: Option<Device>,
    pub(crate) lower_device: Option<Device>,
    default_device: RwLock<Device>,
    isolate_device: Option<Device>,
    /// Site placements read from the guidance file.
    site_devices: FxHashMap<u32, Device>,

    site_arenas: Vec<AtomicI64>,
    site_bigs: Vec<AtomicBool>,
    device_arenas: Mutex<FxHashMap<Device, usize>>,

    /// Every live extent in the process, attributed to router arena
    /// indices. Read-scanned by the profilers every interval.
    pub(crate) extents: RwLock<ExtentList>,

    pub(crate) arenas: RwLock<Vec<Option<Arc<ArenaInfo>>>>,
    /// One past the highest arena index ever created.
    pub(crate) max_index_plus1: AtomicUsize,
    arena_create_lock: Mutex<()>,
    arena_counter: AtomicUsize,
    thread_counter: AtomicUsize,
    /// Pool arena id → router index, for extent attribution.
    pool_to_index: RwLock<FxHashMap<u32, usize>>,

    /// ptr → (arena index, size); routes `free` accounting back to the
    /// owning arena without touching pointer metadata.
    alloc_records: RwLock<FxHashMap<usize, (usize, usize)>>,
    pub(crate) track_allocs: bool,
}

impl Runtime {
    pub(crate) fn new(opts: Options, devices: &'static DeviceList) -> Result<Self, ConfigError> {
        if devices.is_empty() {
            return Err(ConfigError::Discovery(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no memory devices",
            )));
        }

        let resolve = |var: &'static str, node: Option<u32>| -> Result<Option<Device>, ConfigError> {
            match node {
                None => Ok(None),
                Some(node) => devices
                    .find_numa(node)
                    .copied()
                    .map(Some)
                    .ok_or(ConfigError::NoSuchNode { var, node }),
            }
        };

        let upper_device = resolve("SH_UPPER_NODE", opts.upper_node)?;
        let lower_device = resolve("SH_LOWER_NODE", opts.lower_node)?;
        let default_device = match resolve("SH_DEFAULT_NODE", opts.default_node)? {
            Some(dev) => dev,
            None => *devices
                .devices
                .iter()
                .find(|d| d.tag() == tieralloc_pool::DeviceTag::Dram && d.uses_base_pages())
                .unwrap_or(&devices.devices[0]),
        };
        let isolate_device = resolve("SH_PROFILE_ONE_NODE", opts.isolate_node)?;

        let mut site_devices = FxHashMap::default();
        for &(site, node) in &opts.guidance {
            let dev = devices
                .find_numa(node)
                .copied()
                .ok_or(ConfigError::NoSuchNode { var: "SH_GUIDANCE_FILE", node })?;
            site_devices.insert(site, dev);
        }

        // Big sites claim indices above the per-thread small space.
        let counter_base =
            if opts.layout == ArenaLayout::BigSmallArenas { opts.max_threads } else { 0 };

        let num_sites = opts.max_sites + 1;
        Ok(Runtime {
            devices,
            upper_device,
            lower_device,
            default_device: RwLock::new(default_device),
            isolate_device,
            site_devices,
            site_arenas: (0..num_sites).map(|_| AtomicI64::new(-1)).collect(),
            site_bigs: (0..num_sites).map(|_| AtomicBool::new(false)).collect(),
            device_arenas: Mutex::new(FxHashMap::default()),
            extents: RwLock::new(ExtentList::new()),
            arenas: RwLock::new((0..opts.max_arenas).map(|_| None).collect()),
            max_index_plus1: AtomicUsize::new(0),
            arena_create_lock: Mutex::new(()),
            arena_counter: AtomicUsize::new(counter_base),
            thread_counter: AtomicUsize::new(0),
            pool_to_index: RwLock::new(FxHashMap::default()),
            alloc_records: RwLock::new(FxHashMap::default()),
            track_allocs: opts.allocs.is_some(),
            opts,
        })
    }

    pub(crate) fn default_device(&self) -> Device {
        *self.default_device.read()
    }

    pub(crate) fn set_default_device(&self, device: Device) {
        *self.default_device.write() = device;
    }

    /// Lazily assigns the calling thread its process-unique index.
    fn thread_index(&self) -> usize {
        THREAD_INDEX.with(|slot| {
            let cur = slot.get();
            if cur != usize::MAX {
                return cur;
            }
            let index = self.thread_counter.fetch_add(1, Ordering::Relaxed);
            assert!(
                index < self.opts.max_threads,
                "thread count exceeded SH_MAX_THREADS ({})",
                self.opts.max_threads
            );
            slot.set(index);
            index
        })
    }

    /// The device a fresh arena for `site` should bind to: the isolation
    /// override, else the guidance file's choice, else the default.
    fn site_device(&self, site: u32) -> Device {
        if self.opts.isolate_site == Some(site) {
            if let Some(dev) = self.isolate_device {
                return dev;
            }
        }
        self.site_devices.get(&site).copied().unwrap_or_else(|| self.default_device())
    }

    /// Stable small offset for a device, for the per-device layouts.
    fn device_offset(&self, device: Device) -> usize {
        let mut map = self.device_arenas.lock();
        let next = map.len();
        *map.entry(device).or_insert(next)
    }

    fn arenas_per_thread(&self) -> usize {
        self.devices.len().max(1)
    }

    /// Memoized per-site arena index; the first toucher reserves the next
    /// counter value.
    fn site_arena_index(&self, site: u32) -> usize {
        let slot = &self.site_arenas[site as usize];
        let cur = slot.load(Ordering::Relaxed);
        if cur >= 0 {
            return cur as usize;
        }
        let fresh = self.arena_counter.fetch_add(1, Ordering::Relaxed);
        match slot.compare_exchange(-1, fresh as i64, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => fresh,
            // Another thread won the site; its index sticks, ours becomes
            // a hole in the index space.
            Err(winner) => winner as usize,
        }
    }

    /// Routes a site to its arena index per the configured layout,
    /// creating the arena on first use. Publishes the index in the
    /// thread's pending slot before any allocator call can fire hooks.
    pub(crate) fn get_arena_index(&self, site: u32, size: usize) -> usize {
        let index = match self.opts.layout {
            ArenaLayout::OneArena => 0,
            ArenaLayout::ExclusiveArenas => self.thread_index(),
            ArenaLayout::ExclusiveDeviceArenas => {
                let device = self.site_device(site);
                self.thread_index() * self.arenas_per_thread() + self.device_offset(device)
            }
            ArenaLayout::SharedSiteArenas => self.site_arena_index(site),
            ArenaLayout::BigSmallArenas => {
                let big = size >= self.opts.big_small_threshold
                    || self.site_bigs[site as usize].load(Ordering::Relaxed);
                if big {
                    // Once big, always big: the site's data belongs
                    // together even when later requests are small.
                    self.site_bigs[site as usize].store(true, Ordering::Relaxed);
                    self.site_arena_index(site)
                } else {
                    self.thread_index()
                }
            }
        };

        let index = if index >= self.opts.max_arenas {
            warn!("arena index {index} overflows SH_MAX_ARENAS; wrapping");
            index % self.opts.max_arenas
        } else {
            index
        };

        PENDING_INDEX.with(|slot| slot.set(index));

        let needs_create = match &self.arenas.read()[index] {
            None => true,
            Some(info) => !info.sites.lock().contains(&site),
        };
        if needs_create {
            let _guard = self.arena_create_lock.lock();
            self.create_arena(index, site);
        }

        index
    }

    /// Creates the arena at `index` bound to the site's device, or
    /// attaches one more site to an existing arena. Caller holds the
    /// creation lock.
    fn create_arena(&self, index: usize, site: u32) {
        if let Some(info) = self.arenas.read()[index].clone() {
            let mut sites = info.sites.lock();
            if !sites.contains(&site) {
                assert!(
                    self.opts.max_sites_per_arena == 0
                        || sites.len() < self.opts.max_sites_per_arena,
                    "arena {index} already holds {} sites; raise SH_MAX_SITES_PER_ARENA",
                    sites.len()
                );
                sites.push(site);
            }
            return;
        }

        let device = self.site_device(site);
        let arena = match Arena::create(0, BindPolicy::Relaxed, false, &[device]) {
            Ok(arena) => arena,
            Err(e) => {
                error!("creating arena {index} for site {site} failed: {e}");
                return;
            }
        };
        let info = Arc::new(ArenaInfo {
            index,
            arena,
            size: AtomicUsize::new(0),
            sites: Mutex::new(vec![site]),
        });
        self.pool_to_index.write().insert(info.arena.id(), index);
        self.arenas.write()[index] = Some(info);
        self.max_index_plus1.fetch_max(index + 1, Ordering::Relaxed);
    }

    pub(crate) fn arena(&self, index: usize) -> Option<Arc<ArenaInfo>> {
        self.arenas.read().get(index).cloned().flatten()
    }

    /// Snapshot of the arena table up to the highest created index.
    pub(crate) fn arena_snapshot(&self) -> Vec<Option<Arc<ArenaInfo>>> {
        let limit = self.max_index_plus1.load(Ordering::Relaxed);
        self.arenas.read()[..limit].to_vec()
    }

    fn record_alloc(&self, ptr: usize, size: usize, index: usize) {
        if let Some(info) = self.arena(index) {
            info.size.fetch_add(size, Ordering::Relaxed);
        }
        self.alloc_records.write().insert(ptr, (index, size));
    }

    fn record_free(&self, ptr: usize) {
        let record = self.alloc_records.write().remove(&ptr);
        match record {
            Some((index, size)) => {
                if let Some(info) = self.arena(index) {
                    info.size.fetch_sub(size, Ordering::Relaxed);
                }
            }
            None => warn!("freed pointer {ptr:#x} has no allocation record"),
        }
    }
}

/// Feeds pool-level extent events into the runtime's global registry.
pub(crate) struct RegistryBridge(pub Arc<Runtime>);

impl ExtentCallback for RegistryBridge {
    fn created(&self, arena: &Arena, start: usize, end: usize) {
        let rt = &self.0;
        let index = rt.pool_to_index.read().get(&arena.id()).copied().or_else(|| {
            let pending = PENDING_INDEX.with(|slot| slot.get());
            (pending != usize::MAX).then_some(pending)
        });
        match index {
            Some(index) => rt.extents.write().insert(start, end, index as u32),
            None => error!("extent {start:#x}..{end:#x} has no arena attribution"),
        }
    }

    fn destroyed(&self, _arena: &Arena, start: usize, _end: usize) {
        self.0.extents.write().delete(start);
    }
}

fn runtime() -> Option<&'static Arc<Runtime>> {
    RUNTIME.get()
}

/// Allocates `size` bytes for allocation site `site`. Site 0 (and any
/// call before [`crate::init`]) goes straight to the underlying
/// allocator.
///
/// # Safety
///
/// The returned memory is uninitialized and never zero-guaranteed; free
/// it through [`free`].
pub unsafe fn alloc(site: u32, size: usize) -> *mut u8 {
    let Some(rt) = runtime() else {
        return tieralloc_pool::global_alloc(size);
    };
    if site == 0 || site as usize > rt.opts.max_sites || size == 0 {
        return tieralloc_pool::global_alloc(size);
    }
    let index = rt.get_arena_index(site, size);
    let Some(info) = rt.arena(index) else {
        return tieralloc_pool::global_alloc(size);
    };
    let ptr = info.arena.alloc(size);
    if rt.track_allocs && !ptr.is_null() {
        rt.record_alloc(ptr as usize, size, index);
    }
    ptr
}

/// # Safety
///
/// As [`alloc`]; the product `nmemb * size` must not overflow.
pub unsafe fn calloc(site: u32, nmemb: usize, size: usize) -> *mut u8 {
    let total = nmemb * size;
    let ptr = alloc(site, total);
    if !ptr.is_null() {
        std::ptr::write_bytes(ptr, 0, total);
    }
    ptr
}

/// # Safety
///
/// `align` must be a power of two; free through [`free`].
pub unsafe fn aligned_alloc(site: u32, align: usize, size: usize) -> *mut u8 {
    let Some(rt) = runtime() else {
        return tieralloc_pool::global_aligned_alloc(align, size);
    };
    if site == 0 || site as usize > rt.opts.max_sites || size == 0 {
        return tieralloc_pool::global_aligned_alloc(align, size);
    }
    let index = rt.get_arena_index(site, size);
    let Some(info) = rt.arena(index) else {
        return tieralloc_pool::global_aligned_alloc(align, size);
    };
    let ptr = info.arena.alloc_aligned(size, align);
    if rt.track_allocs && !ptr.is_null() {
        rt.record_alloc(ptr as usize, size, index);
    }
    ptr
}

/// # Safety
///
/// As [`aligned_alloc`].
pub unsafe fn memalign(site: u32, align: usize, size: usize) -> *mut u8 {
    aligned_alloc(site, align, size)
}

/// # Safety
///
/// As [`aligned_alloc`]; `out` must be valid for writes.
pub unsafe fn posix_memalign(site: u32, out: &mut *mut u8, align: usize, size: usize) -> i32 {
    *out = aligned_alloc(site, align, size);
    0
}

/// # Safety
///
/// `ptr` must be null or a live allocation from this allocator.
pub unsafe fn realloc(site: u32, ptr: *mut u8, size: usize) -> *mut u8 {
    let Some(rt) = runtime() else {
        return tieralloc_pool::global_realloc(ptr, size);
    };
    if site == 0 || site as usize > rt.opts.max_sites {
        return tieralloc_pool::global_realloc(ptr, size);
    }
    if size == 0 {
        free(ptr);
        return std::ptr::null_mut();
    }
    if ptr.is_null() {
        return alloc(site, size);
    }
    let index = rt.get_arena_index(site, size);
    let Some(info) = rt.arena(index) else {
        return tieralloc_pool::global_realloc(ptr, size);
    };
    let new_ptr = info.arena.realloc(ptr, size);
    if rt.track_allocs && !new_ptr.is_null() {
        rt.record_free(ptr as usize);
        rt.record_alloc(new_ptr as usize, size, index);
    }
    new_ptr
}

/// # Safety
///
/// `ptr` must be null or a live allocation from this allocator.
pub unsafe fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    if let Some(rt) = runtime() {
        if rt.track_allocs {
            rt.record_free(ptr as usize);
        }
    }
    tieralloc_pool::global_free(ptr);
}

/// # Safety
///
/// As [`free`]; `size` must match the original request.
pub unsafe fn sized_free(ptr: *mut u8, _size: usize) {
    free(ptr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;

    fn runtime_with(opts: Options) -> Option<Runtime> {
        let devices = match tieralloc_pool::init() {
            Ok(d) if !d.is_empty() => d,
            _ => {
                eprintln!("skipping: no devices");
                return None;
            }
        };
        Some(Runtime::new(opts, devices).unwrap())
    }

    #[test]
    fn one_arena_layout_routes_everything_to_zero() {
        let opts = Options { layout: ArenaLayout::OneArena, ..Options::default() };
        let Some(rt) = runtime_with(opts) else { return };
        assert_eq!(rt.get_arena_index(5, 64), 0);
        assert_eq!(rt.get_arena_index(9, 1 << 20), 0);
        let info = rt.arena(0).unwrap();
        let sites = info.sites.lock().clone();
        assert_eq!(sites, vec![5, 9]);
    }

    #[test]
    fn shared_site_layout_is_stable_per_site() {
        let Some(rt) = runtime_with(Options::default()) else { return };
        let a = rt.get_arena_index(7, 64);
        let b = rt.get_arena_index(8, 64);
        assert_ne!(a, b);
        assert_eq!(rt.get_arena_index(7, 4096), a);
        assert_eq!(rt.arena(a).unwrap().sites.lock().clone(), vec![7]);
    }

    #[test]
    fn big_small_layout_splits_the_index_space() {
        let opts = Options {
            layout: ArenaLayout::BigSmallArenas,
            big_small_threshold: 1024,
            max_threads: 16,
            ..Options::default()
        };
        let Some(rt) = runtime_with(opts) else { return };

        let small = rt.get_arena_index(3, 64);
        assert!(small < 16);
        let big = rt.get_arena_index(4, 4096);
        assert!(big >= 16);
        // Once big, always big, even for small requests.
        assert_eq!(rt.get_arena_index(4, 8), big);
    }

    #[test]
    fn guidance_binds_fresh_arenas() {
        let devices = match tieralloc_pool::init() {
            Ok(d) if !d.is_empty() => d,
            _ => return,
        };
        let node = devices.devices[0].numa_id();
        let opts = Options { guidance: vec![(42, node)], ..Options::default() };
        let rt = Runtime::new(opts, devices).unwrap();
        let index = rt.get_arena_index(42, 64);
        let info = rt.arena(index).unwrap();
        assert_eq!(info.arena.devices()[0].numa_id(), node);
    }

    #[test]
    fn allocation_records_follow_the_pointer() {
        let mut opts = Options::default();
        opts.allocs = Some(1);
        let Some(rt) = runtime_with(opts) else { return };

        let index = rt.get_arena_index(11, 64);
        rt.record_alloc(0x1000, 64, index);
        rt.record_alloc(0x2000, 128, index);
        let info = rt.arena(index).unwrap();
        assert_eq!(info.size.load(Ordering::Relaxed), 192);
        rt.record_free(0x1000);
        assert_eq!(info.size.load(Ordering::Relaxed), 128);
    }
}
