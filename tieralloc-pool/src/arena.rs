use std::ffi::CString;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use libc::{c_int, c_uint, c_void};
use log::{error, warn};
use parking_lot::{Mutex, RwLock};
use tikv_jemalloc_sys as je;

use crate::device::Device;
use crate::error::PoolError;
use crate::extent::ExtentList;
use crate::nodemask::NodeMask;
use crate::sys::{self, BindPolicy};

// MALLOCX_* encodings from jemalloc.h: low 6 bits carry lg(align), bits
// 8.. carry the tcache id, bits 20.. carry arena index + 1.
const MALLOCX_TCACHE_NONE: c_int = 0x100;

fn mallocx_flags(arena_ind: u32, align: usize) -> c_int {
    let mut flags = MALLOCX_TCACHE_NONE | (((arena_ind as c_int) + 1) << 20);
    if align > 1 {
        flags |= align.trailing_zeros() as c_int;
    }
    flags
}

/// The hook vector handed to jemalloc. `hooks` must stay the first field:
/// jemalloc sees a plain `extent_hooks_t *`, and the callbacks cast it
/// back to recover the owning arena through the weak reference.
#[repr(C)]
struct HookVec {
    hooks: ExtentHooks,
    arena: Weak<Arena>,
}

/// jemalloc's `extent_hooks_t`, laid out by hand the way the kernel-facing
/// structs in this crate are. Booleans returned by the fallible hooks mean
/// "failed" per the jemalloc convention.
#[repr(C)]
struct ExtentHooks {
    alloc: Option<
        unsafe extern "C" fn(
            *mut ExtentHooks,
            *mut c_void,
            usize,
            usize,
            *mut bool,
            *mut bool,
            c_uint,
        ) -> *mut c_void,
    >,
    dalloc: Option<unsafe extern "C" fn(*mut ExtentHooks, *mut c_void, usize, bool, c_uint) -> bool>,
    destroy: Option<unsafe extern "C" fn(*mut ExtentHooks, *mut c_void, usize, bool, c_uint)>,
    commit: Option<
        unsafe extern "C" fn(*mut ExtentHooks, *mut c_void, usize, usize, usize, c_uint) -> bool,
    >,
    decommit: Option<
        unsafe extern "C" fn(*mut ExtentHooks, *mut c_void, usize, usize, usize, c_uint) -> bool,
    >,
    purge_lazy: Option<
        unsafe extern "C" fn(*mut ExtentHooks, *mut c_void, usize, usize, usize, c_uint) -> bool,
    >,
    purge_forced: Option<
        unsafe extern "C" fn(*mut ExtentHooks, *mut c_void, usize, usize, usize, c_uint) -> bool,
    >,
    split: Option<
        unsafe extern "C" fn(*mut ExtentHooks, *mut c_void, usize, usize, usize, bool, c_uint) -> bool,
    >,
    merge: Option<
        unsafe extern "C" fn(
            *mut ExtentHooks,
            *mut c_void,
            usize,
            *mut c_void,
            usize,
            bool,
            c_uint,
        ) -> bool,
    >,
}

const HOOK_FNS: ExtentHooks = ExtentHooks {
    alloc: Some(hook_alloc),
    dalloc: Some(hook_dalloc),
    destroy: Some(hook_destroy),
    commit: Some(hook_commit),
    decommit: Some(hook_decommit),
    purge_lazy: None,
    purge_forced: None,
    split: Some(hook_split),
    merge: Some(hook_merge),
};

/// Observer for extent creation/destruction across all arenas. Methods run
/// with the owning arena's lock held; implementations must not call back
/// into the arena.
pub trait ExtentCallback: Send + Sync {
    fn created(&self, arena: &Arena, start: usize, end: usize);
    fn destroyed(&self, arena: &Arena, start: usize, end: usize);
}

static EXTENT_CALLBACK: RwLock<Option<Arc<dyn ExtentCallback>>> = RwLock::new(None);
static ARENAS: Mutex<Vec<Arc<Arena>>> = Mutex::new(Vec::new());
static NEXT_ARENA_ID: AtomicU32 = AtomicU32::new(0);

/// Installs (or clears) the process-wide extent observer.
pub fn set_extent_callback(cb: Option<Arc<dyn ExtentCallback>>) {
    *EXTENT_CALLBACK.write() = cb;
}

fn notify_created(arena: &Arena, start: usize, end: usize) {
    if let Some(cb) = EXTENT_CALLBACK.read().as_ref() {
        cb.created(arena, start, end);
    }
}

fn notify_destroyed(arena: &Arena, start: usize, end: usize) {
    if let Some(cb) = EXTENT_CALLBACK.read().as_ref() {
        cb.destroyed(arena, start, end);
    }
}

struct ArenaState {
    devices: Vec<Device>,
    nodemask: NodeMask,
    size: usize,
    max_size: usize,
    extents: ExtentList,
    /// Anonymous backing when negative; otherwise a shared file mapping.
    fd: RawFd,
    fd_offset: u64,
    /// First errno observed during a migration pass.
    err: i32,
}

/// An allocator sub-pool whose every page is bound to a fixed device set.
/// jemalloc asks for OS memory through the extent hooks; we answer with
/// mappings bound to the arena's node mask and track each as an extent.
pub struct Arena {
    hooks: Box<HookVec>,
    id: u32,
    arena_ind: AtomicU32,
    policy: BindPolicy,
    /// Rebinds update the policy without forcing page moves.
    move_lazy: bool,
    state: Mutex<ArenaState>,
}

// HookVec's raw-pointer-free contents are shareable; jemalloc only ever
// reads the function pointers.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Creates an arena bound to `devices` (which must share one page
    /// size). `max_size` of 0 means unlimited.
    pub fn create(
        max_size: usize,
        policy: BindPolicy,
        move_lazy: bool,
        devices: &[Device],
    ) -> Result<Arc<Arena>, PoolError> {
        Self::create_inner(max_size, policy, move_lazy, devices, -1, 0)
    }

    /// Like [`Arena::create`], but extents are shared mappings of `fd`
    /// starting at `offset`.
    pub fn create_backed(
        max_size: usize,
        policy: BindPolicy,
        move_lazy: bool,
        devices: &[Device],
        fd: RawFd,
        offset: u64,
    ) -> Result<Arc<Arena>, PoolError> {
        Self::create_inner(max_size, policy, move_lazy, devices, fd, offset)
    }

    fn create_inner(
        max_size: usize,
        policy: BindPolicy,
        move_lazy: bool,
        devices: &[Device],
        fd: RawFd,
        offset: u64,
    ) -> Result<Arc<Arena>, PoolError> {
        let nodemask = NodeMask::from_devices(devices)?;
        let arena = Arc::new_cyclic(|weak: &Weak<Arena>| Arena {
            hooks: Box::new(HookVec { hooks: HOOK_FNS, arena: weak.clone() }),
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            arena_ind: AtomicU32::new(u32::MAX),
            policy,
            move_lazy,
            state: Mutex::new(ArenaState {
                devices: devices.to_vec(),
                nodemask,
                size: 0,
                max_size,
                extents: ExtentList::new(),
                // jemalloc allocates a few internal extents while the
                // arena is being created; those must stay anonymous, so
                // the backing fd is installed afterwards.
                fd: -1,
                fd_offset: 0,
                err: 0,
            }),
        });

        let mut ind: c_uint = 0;
        let mut ind_len = mem::size_of::<c_uint>();
        let mut hooks_ptr: *const ExtentHooks = &arena.hooks.hooks;
        let err = unsafe {
            je::mallctl(
                c"arenas.create".as_ptr(),
                &mut ind as *mut c_uint as *mut c_void,
                &mut ind_len,
                &mut hooks_ptr as *mut *const ExtentHooks as *mut c_void,
                mem::size_of::<*const ExtentHooks>(),
            )
        };
        if err != 0 {
            return Err(PoolError::Mallctl("arenas.create", err));
        }
        arena.arena_ind.store(ind, Ordering::Release);

        {
            let mut state = arena.state.lock();
            state.fd = fd;
            state.fd_offset = offset;
        }

        ARENAS.lock().push(arena.clone());
        Ok(arena)
    }

    /// Stable process-unique identity, independent of the jemalloc index.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn arena_index(&self) -> u32 {
        self.arena_ind.load(Ordering::Acquire)
    }

    pub fn policy(&self) -> BindPolicy {
        self.policy
    }

    /// Sum of live extent bytes.
    pub fn size(&self) -> usize {
        self.state.lock().size
    }

    pub fn max_size(&self) -> usize {
        self.state.lock().max_size
    }

    pub fn devices(&self) -> Vec<Device> {
        self.state.lock().devices.clone()
    }

    pub fn extent_count(&self) -> usize {
        self.state.lock().extents.len()
    }

    pub fn alloc(self: &Arc<Arena>, size: usize) -> *mut u8 {
        if size == 0 {
            return unsafe { je::malloc(0) as *mut u8 };
        }
        let flags = mallocx_flags(self.arena_index(), 0);
        unsafe { je::mallocx(size, flags) as *mut u8 }
    }

    pub fn alloc_aligned(self: &Arc<Arena>, size: usize, align: usize) -> *mut u8 {
        if size == 0 {
            return unsafe { je::malloc(0) as *mut u8 };
        }
        let flags = mallocx_flags(self.arena_index(), align);
        unsafe { je::mallocx(size, flags) as *mut u8 }
    }

    /// # Safety
    ///
    /// `ptr` must be null or owned by this allocator.
    pub unsafe fn realloc(self: &Arc<Arena>, ptr: *mut u8, size: usize) -> *mut u8 {
        if size == 0 {
            global_free(ptr);
            return ptr::null_mut();
        }
        if ptr.is_null() {
            return self.alloc(size);
        }
        let flags = mallocx_flags(self.arena_index(), 0);
        je::rallocx(ptr as *mut c_void, size, flags) as *mut u8
    }

    /// Rebinds every extent to a new device set. The new devices must
    /// share the arena's current page size. On any per-extent failure the
    /// previous mask is restored, extents already moved are moved back,
    /// and the first errno is surfaced.
    pub fn set_devices(&self, devices: &[Device]) -> Result<(), PoolError> {
        let new_mask = NodeMask::from_devices(devices)?;
        let mut state = self.state.lock();
        let cur_kb = state.devices.first().map(|d| d.page_kb());
        if cur_kb != devices.first().map(|d| d.page_kb()) {
            return Err(PoolError::MixedPageSizes);
        }

        let old_mask = mem::replace(&mut state.nodemask, new_mask);
        state.err = 0;
        self.move_extents(&mut state);

        if state.err != 0 {
            let err = state.err;
            state.nodemask = old_mask;
            state.err = 0;
            self.move_extents(&mut state);
            return Err(PoolError::Migration(err));
        }
        state.devices = devices.to_vec();
        Ok(())
    }

    /// Rebinds every live extent against the current mask. First errno
    /// lands in `state.err`.
    fn move_extents(&self, state: &mut ArenaState) {
        let flags = if self.move_lazy { 0 } else { sys::MPOL_MF_MOVE };
        let (mode, mask_ptr, maxnode) = match self.policy {
            BindPolicy::Default => (sys::MPOL_DEFAULT, ptr::null(), 0),
            policy => (policy.mpol(), state.nodemask.as_ptr(), state.nodemask.maxnode()),
        };
        let extents: Vec<(usize, usize)> =
            state.extents.iter().map(|(s, e, _)| (s, e)).collect();
        for (start, end) in extents {
            let res = sys::mbind(start as *mut c_void, end - start, mode, mask_ptr, maxnode, flags);
            if let Err(e) = res {
                if state.err == 0 {
                    state.err = e.raw_os_error().unwrap_or(libc::EINVAL);
                }
            }
        }
    }

    /// Destroys the arena: drops it from the process arena list, then
    /// tears down the jemalloc arena, which dallocs every surviving extent
    /// through the hooks. The arena memory itself is freed when the last
    /// reference drops, strictly after jemalloc is done with the hooks.
    pub fn destroy(self: Arc<Arena>) -> Result<(), PoolError> {
        ARENAS.lock().retain(|a| !Arc::ptr_eq(a, &self));

        let name = CString::new(format!("arena.{}.destroy", self.arena_index())).unwrap();
        let err = unsafe {
            je::mallctl(name.as_ptr(), ptr::null_mut(), ptr::null_mut(), ptr::null_mut(), 0)
        };
        if err != 0 {
            return Err(PoolError::Mallctl("arena.<i>.destroy", err));
        }

        let mut state = self.state.lock();
        state.extents.clear();
        state.size = 0;
        Ok(())
    }

    /// The mmap + bind path behind the alloc hook.
    fn extent_alloc(
        &self,
        new_addr: *mut c_void,
        size: usize,
        alignment: usize,
    ) -> Result<*mut c_void, PoolError> {
        let mut state = self.state.lock();
        if state.max_size > 0 && state.size + size > state.max_size {
            return Err(PoolError::MaxSizeExceeded);
        }

        let mut old_mode: c_int = 0;
        let mut old_mask = NodeMask::new();
        old_mask.set(1023);
        let _ = sys::get_mempolicy(&mut old_mode, old_mask.as_mut_ptr(), old_mask.maxnode());

        let (mode, mask_ptr, maxnode) = match self.policy {
            BindPolicy::Default => (sys::MPOL_DEFAULT, ptr::null(), 0),
            policy => (policy.mpol(), state.nodemask.as_ptr(), state.nodemask.maxnode()),
        };
        sys::set_mempolicy(mode, mask_ptr, maxnode).map_err(PoolError::Bind)?;

        let restore = |old_mode: c_int, old_mask: &NodeMask| {
            let mask_ptr = if old_mode == sys::MPOL_DEFAULT { ptr::null() } else { old_mask.as_ptr() };
            let maxnode = if old_mode == sys::MPOL_DEFAULT { 0 } else { old_mask.maxnode() };
            let _ = sys::set_mempolicy(old_mode, mask_ptr, maxnode);
        };

        let (mm_flags, fd, offset) = if state.fd < 0 {
            (libc::MAP_ANONYMOUS | libc::MAP_PRIVATE, -1, 0)
        } else {
            // Successive extents occupy successive ranges of the backing
            // file, starting at the arena's configured offset.
            (libc::MAP_SHARED, state.fd, (state.fd_offset + state.size as u64) as libc::off_t)
        };

        let mut base = unsafe {
            libc::mmap(new_addr, size, libc::PROT_READ | libc::PROT_WRITE, mm_flags, fd, offset)
        };
        if base == libc::MAP_FAILED {
            let e = io::Error::last_os_error();
            restore(old_mode, &old_mask);
            return Err(PoolError::Mmap(e));
        }

        if alignment > 1 && (base as usize) % alignment != 0 {
            // Alignment missed: over-allocate by `alignment` and trim the
            // leading and trailing slack.
            unsafe { libc::munmap(base, size) };
            if !new_addr.is_null() {
                restore(old_mode, &old_mask);
                return Err(PoolError::Mmap(io::Error::from_raw_os_error(libc::EINVAL)));
            }
            base = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    size + alignment,
                    libc::PROT_READ | libc::PROT_WRITE,
                    mm_flags,
                    fd,
                    offset,
                )
            };
            if base == libc::MAP_FAILED {
                let e = io::Error::last_os_error();
                restore(old_mode, &old_mask);
                return Err(PoolError::Mmap(e));
            }
            let n = base as usize;
            let aligned = n + alignment - (n % alignment);
            let lead = aligned - n;
            let tail = alignment - lead;
            unsafe {
                if lead > 0 {
                    libc::munmap(n as *mut c_void, lead);
                }
                if tail > 0 {
                    libc::munmap((aligned + size) as *mut c_void, tail);
                }
            }
            base = aligned as *mut c_void;
        }

        if let Err(e) =
            sys::mbind(base, size, mode, mask_ptr, maxnode, sys::MPOL_MF_MOVE)
        {
            unsafe { libc::munmap(base, size) };
            restore(old_mode, &old_mask);
            return Err(PoolError::Bind(e));
        }

        let start = base as usize;
        state.extents.insert(start, start + size, self.id);
        state.size += size;
        if state.fd >= 0 {
            // Extend (never shrink) the backing file to cover the mapping.
            let wanted = state.fd_offset + state.size as u64;
            unsafe {
                let cur = libc::lseek(state.fd, 0, libc::SEEK_END);
                if cur >= 0 && (cur as u64) < wanted {
                    libc::ftruncate(state.fd, wanted as libc::off_t);
                    libc::fsync(state.fd);
                }
            }
        }
        notify_created(self, start, start + size);

        restore(old_mode, &old_mask);
        Ok(base)
    }

    /// The partial-release search behind the dalloc hook. jemalloc may ask
    /// to release a range smaller or larger than any single extent we
    /// mapped (alignment over-allocation), so walk `(target, leftover)`
    /// across the registry. Returns true on failure, per the hook
    /// convention.
    fn extent_dalloc(&self, addr: *mut c_void, size: usize) -> bool {
        let mut state = self.state.lock();
        let mut target = addr as usize;
        let mut leftover = size;

        while leftover > 0 {
            enum Found {
                Whole { start: usize, end: usize },
                Partial { start: usize, end: usize },
            }
            let found = state.extents.iter().find_map(|(start, end, _)| {
                if start == target && target + leftover >= end {
                    Some(Found::Whole { start, end })
                } else if target >= start && target + leftover <= end {
                    Some(Found::Partial { start, end })
                } else {
                    None
                }
            });

            match found {
                Some(Found::Whole { start, end }) => {
                    state.extents.delete(start);
                    notify_destroyed(self, start, end);
                    if unsafe { libc::munmap(start as *mut c_void, end - start) } != 0 {
                        error!("munmap of {:#x}..{:#x} failed", start, end);
                        return true;
                    }
                    state.size -= end - start;
                    leftover -= end - start;
                    target = end;
                }
                Some(Found::Partial { start, end }) => {
                    let free_start = target;
                    let free_end = target + leftover;
                    state.extents.delete(start);
                    notify_destroyed(self, start, end);
                    if free_start > start {
                        state.extents.insert(start, free_start, self.id);
                        notify_created(self, start, free_start);
                    }
                    if free_end < end {
                        state.extents.insert(free_end, end, self.id);
                        notify_created(self, free_end, end);
                    }
                    if unsafe { libc::munmap(free_start as *mut c_void, leftover) } != 0 {
                        error!("munmap of {:#x}..{:#x} failed", free_start, free_end);
                        return true;
                    }
                    state.size -= leftover;
                    leftover = 0;
                }
                None => {
                    warn!(
                        "dalloc of {:#x} found no containing extent ({} bytes unreleased)",
                        target, leftover
                    );
                    return true;
                }
            }
        }
        false
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Arena")
            .field("id", &self.id)
            .field("arena_ind", &self.arena_ind.load(Ordering::Relaxed))
            .field("policy", &self.policy)
            .field("size", &state.size)
            .field("extents", &state.extents.len())
            .field("devices", &state.devices)
            .finish()
    }
}

/// Every live arena, in creation order.
pub fn arenas_list() -> Vec<Arc<Arena>> {
    ARENAS.lock().clone()
}

/// The arena owning `ptr`, resolved through jemalloc's `arenas.lookup`.
pub fn lookup(ptr: *mut u8) -> Result<Arc<Arena>, PoolError> {
    static LOOKUP_MIB: OnceMib = OnceMib::new();
    let mib = LOOKUP_MIB.get(c"arenas.lookup")?;

    let mut ind: c_uint = 0;
    let mut ind_len = mem::size_of::<c_uint>();
    let mut key = ptr as *mut c_void;
    let err = unsafe {
        je::mallctlbymib(
            mib.as_ptr(),
            mib.len(),
            &mut ind as *mut c_uint as *mut c_void,
            &mut ind_len,
            &mut key as *mut *mut c_void as *mut c_void,
            mem::size_of::<*mut c_void>(),
        )
    };
    if err != 0 {
        return Err(PoolError::Mallctl("arenas.lookup", err));
    }
    ARENAS
        .lock()
        .iter()
        .find(|a| a.arena_index() == ind)
        .cloned()
        .ok_or(PoolError::UnknownArena)
}

struct OnceMib {
    mib: Mutex<Option<[usize; 2]>>,
}

impl OnceMib {
    const fn new() -> Self {
        OnceMib { mib: Mutex::new(None) }
    }

    fn get(&self, name: &std::ffi::CStr) -> Result<[usize; 2], PoolError> {
        let mut guard = self.mib.lock();
        if let Some(mib) = *guard {
            return Ok(mib);
        }
        let mut mib = [0usize; 2];
        let mut len = mib.len();
        let err = unsafe { je::mallctlnametomib(name.as_ptr(), mib.as_mut_ptr(), &mut len) };
        if err != 0 {
            return Err(PoolError::Mallctl("mallctlnametomib", err));
        }
        *guard = Some(mib);
        Ok(mib)
    }
}

std::thread_local! {
    static DEFAULT_ARENA: std::cell::RefCell<Option<Arc<Arena>>> =
        const { std::cell::RefCell::new(None) };
}

/// Sets the calling thread's default arena for [`default_alloc`].
pub fn set_default(arena: Option<Arc<Arena>>) {
    DEFAULT_ARENA.with(|slot| *slot.borrow_mut() = arena);
}

pub fn get_default() -> Option<Arc<Arena>> {
    DEFAULT_ARENA.with(|slot| slot.borrow().clone())
}

/// Allocates from the thread's default arena, or from plain jemalloc when
/// none is set.
pub fn default_alloc(size: usize) -> *mut u8 {
    match get_default() {
        Some(arena) => arena.alloc(size),
        None => unsafe { je::malloc(size) as *mut u8 },
    }
}

/// Plain jemalloc allocation, outside any bound arena.
pub fn global_alloc(size: usize) -> *mut u8 {
    unsafe { je::malloc(size) as *mut u8 }
}

pub fn global_calloc(nmemb: usize, size: usize) -> *mut u8 {
    unsafe { je::calloc(nmemb, size) as *mut u8 }
}

pub fn global_aligned_alloc(align: usize, size: usize) -> *mut u8 {
    unsafe { je::aligned_alloc(align, size) as *mut u8 }
}

/// # Safety
///
/// `ptr` must be null or owned by jemalloc.
pub unsafe fn global_realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    je::realloc(ptr as *mut c_void, size) as *mut u8
}

/// Frees any pointer owned by jemalloc, bound arena or not.
///
/// # Safety
///
/// `ptr` must be owned by jemalloc and not yet freed.
pub unsafe fn global_free(ptr: *mut u8) {
    if !ptr.is_null() {
        je::dallocx(ptr as *mut c_void, MALLOCX_TCACHE_NONE);
    }
}

fn arena_of(h: *mut ExtentHooks) -> Option<Arc<Arena>> {
    let hv = unsafe { &*(h as *const HookVec) };
    hv.arena.upgrade()
}

unsafe extern "C" fn hook_alloc(
    h: *mut ExtentHooks,
    new_addr: *mut c_void,
    size: usize,
    alignment: usize,
    zero: *mut bool,
    commit: *mut bool,
    _arena_ind: c_uint,
) -> *mut c_void {
    // Mappings here are never zero-guaranteed and never commit-tracked.
    *zero = false;
    *commit = false;
    let Some(arena) = arena_of(h) else {
        return ptr::null_mut();
    };
    match arena.extent_alloc(new_addr, size, alignment) {
        Ok(base) => base,
        Err(e) => {
            warn!("extent allocation of {size} bytes failed: {e}");
            ptr::null_mut()
        }
    }
}

unsafe extern "C" fn hook_dalloc(
    h: *mut ExtentHooks,
    addr: *mut c_void,
    size: usize,
    _committed: bool,
    _arena_ind: c_uint,
) -> bool {
    let Some(arena) = arena_of(h) else {
        return true;
    };
    arena.extent_dalloc(addr, size)
}

unsafe extern "C" fn hook_destroy(
    h: *mut ExtentHooks,
    addr: *mut c_void,
    size: usize,
    committed: bool,
    arena_ind: c_uint,
) {
    hook_dalloc(h, addr, size, committed, arena_ind);
}

unsafe extern "C" fn hook_commit(
    _h: *mut ExtentHooks,
    _addr: *mut c_void,
    _size: usize,
    _offset: usize,
    _length: usize,
    _arena_ind: c_uint,
) -> bool {
    // Extents are mapped read/write up front, so commit is a no-op.
    false
}

unsafe extern "C" fn hook_decommit(
    _h: *mut ExtentHooks,
    _addr: *mut c_void,
    _size: usize,
    _offset: usize,
    _length: usize,
    _arena_ind: c_uint,
) -> bool {
    // Refused: pages stay committed until dalloc.
    true
}

unsafe extern "C" fn hook_split(
    _h: *mut ExtentHooks,
    _addr: *mut c_void,
    _size: usize,
    _size_a: usize,
    _size_b: usize,
    _committed: bool,
    _arena_ind: c_uint,
) -> bool {
    // Extents are tracked whole; partial frees are reconstructed in
    // dalloc by searching the registry.
    true
}

unsafe extern "C" fn hook_merge(
    _h: *mut ExtentHooks,
    _addr_a: *mut c_void,
    _size_a: usize,
    _addr_b: *mut c_void,
    _size_b: usize,
    _committed: bool,
    _arena_ind: c_uint,
) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mallocx_flag_encoding() {
        // Arena 0, no alignment: tcache-none plus arena bits.
        assert_eq!(mallocx_flags(0, 0), 0x100 | (1 << 20));
        // lg(4096) in the low six bits.
        assert_eq!(mallocx_flags(0, 4096) & 0x3f, 12);
        assert_eq!(mallocx_flags(3, 0) >> 20, 4);
    }

    #[test]
    fn hook_vector_has_hooks_first() {
        // jemalloc casts our HookVec pointer to extent_hooks_t; the hook
        // table must sit at offset zero.
        assert_eq!(std::mem::offset_of!(HookVec, hooks), 0);
    }
}
