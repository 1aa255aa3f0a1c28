#![allow(unused)]

use std::io;

use libc::{c_int, c_long, c_ulong, c_void, syscall, SYS_get_mempolicy, SYS_getcpu, SYS_mbind,
    SYS_set_mempolicy};

pub const MPOL_DEFAULT: c_int = 0;
pub const MPOL_PREFERRED: c_int = 1;
pub const MPOL_BIND: c_int = 2;
pub const MPOL_INTERLEAVE: c_int = 3;

pub const MPOL_MF_STRICT: c_ulong = 1 << 0;
pub const MPOL_MF_MOVE: c_ulong = 1 << 1;
pub const MPOL_MF_MOVE_ALL: c_ulong = 1 << 2;

pub const MAP_HUGE_SHIFT: c_int = 26;

/// Binding policy for an arena's pages, mapped onto the kernel's
/// memory-policy modes at mmap/mbind time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindPolicy {
    /// Hard node mask (`MPOL_BIND`); allocation fails rather than spill.
    Strict,
    /// Preferred node mask (`MPOL_PREFERRED`); the kernel may spill.
    Relaxed,
    /// No policy (`MPOL_DEFAULT`).
    Default,
}

impl BindPolicy {
    pub fn mpol(self) -> c_int {
        match self {
            BindPolicy::Strict => MPOL_BIND,
            BindPolicy::Relaxed => MPOL_PREFERRED,
            BindPolicy::Default => MPOL_DEFAULT,
        }
    }
}

fn check(ret: c_long) -> io::Result<()> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub fn set_mempolicy(mode: c_int, nodemask: *const c_ulong, maxnode: c_ulong) -> io::Result<()> {
    check(unsafe { syscall(SYS_set_mempolicy, mode, nodemask, maxnode) })
}

pub fn get_mempolicy(
    mode: &mut c_int,
    nodemask: *mut c_ulong,
    maxnode: c_ulong,
) -> io::Result<()> {
    check(unsafe {
        syscall(
            SYS_get_mempolicy,
            mode as *mut c_int,
            nodemask,
            maxnode,
            std::ptr::null::<c_void>(),
            0usize,
        )
    })
}

pub fn mbind(
    addr: *mut c_void,
    len: usize,
    mode: c_int,
    nodemask: *const c_ulong,
    maxnode: c_ulong,
    flags: c_ulong,
) -> io::Result<()> {
    check(unsafe { syscall(SYS_mbind, addr, len, mode, nodemask, maxnode, flags) })
}

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// NUMA node of the CPU the calling thread is currently running on.
pub fn current_node() -> io::Result<u32> {
    let mut cpu: libc::c_uint = 0;
    let mut node: libc::c_uint = 0;
    check(unsafe {
        syscall(
            SYS_getcpu,
            &mut cpu as *mut libc::c_uint,
            &mut node as *mut libc::c_uint,
            std::ptr::null_mut::<c_void>(),
        )
    })?;
    Ok(node)
}
