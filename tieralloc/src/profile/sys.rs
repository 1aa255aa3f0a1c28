#![allow(unused)]

use std::fmt;
use std::io;

use libc::{c_int, c_long, c_ulong, pid_t, syscall, SYS_gettid, SYS_perf_event_open,
    SYS_timer_create, SYS_timer_delete, SYS_timer_settime};

#[cfg(target_endian = "big")]
macro_rules! flag {
    ($nth:expr) => {
        (1 << 63) >> $nth
    };
}

#[cfg(target_endian = "little")]
macro_rules! flag {
    ($nth:expr) => {
        1 << $nth
    };
}

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_RAW: u32 = 4;

pub const PERF_ATTR_FLAG_DISABLED: u64 = flag!(0);
pub const PERF_ATTR_FLAG_EXCLUDE_KERNEL: u64 = flag!(5);
pub const PERF_ATTR_FLAG_EXCLUDE_HV: u64 = flag!(6);
pub const PERF_ATTR_FLAG_MMAP: u64 = flag!(8);
pub const PERF_ATTR_FLAG_FREQ: u64 = flag!(10);
pub const PERF_ATTR_FLAG_TASK: u64 = flag!(13);
/// `precise_ip` occupies two bits after the watermark flag; value 2 asks
/// for samples with zero skid, which address classification depends on.
pub const PERF_ATTR_FLAG_PRECISE_IP_2: u64 = 2 << 15;

pub const PERF_RECORD_SAMPLE: u32 = 9;

pub const PERF_SAMPLE_ADDR: u64 = 1 << 3;

mod ioctl {
    use libc::c_ulong;

    #[cfg(not(any(
        target_arch = "mips",
        target_arch = "mips64",
        target_arch = "powerpc",
        target_arch = "powerpc64"
    )))]
    mod arch {
        use libc::c_ulong;

        pub const IOC_SIZEBITS: c_ulong = 14;
        pub const IOC_NONE: c_ulong = 0;
    }

    #[cfg(any(
        target_arch = "mips",
        target_arch = "mips64",
        target_arch = "powerpc",
        target_arch = "powerpc64"
    ))]
    mod arch {
        use libc::c_ulong;

        pub const IOC_SIZEBITS: c_ulong = 13;
        pub const IOC_NONE: c_ulong = 1;
    }

    pub use self::arch::*;

    pub const IOC_NRSHIFT: c_ulong = 0;
    pub const IOC_NRBITS: c_ulong = 8;
    pub const IOC_TYPEBITS: c_ulong = 8;
    pub const IOC_TYPESHIFT: c_ulong = IOC_NRSHIFT + IOC_NRBITS;
    pub const IOC_SIZESHIFT: c_ulong = IOC_TYPESHIFT + IOC_TYPEBITS;
    pub const IOC_DIRSHIFT: c_ulong = IOC_SIZESHIFT + IOC_SIZEBITS;
}

macro_rules! ioc {
    ($dir:expr, $kind:expr, $nr:expr, $size:expr) => {
        ($dir << ioctl::IOC_DIRSHIFT)
            | (($kind as c_ulong) << ioctl::IOC_TYPESHIFT)
            | ($nr << ioctl::IOC_NRSHIFT)
            | ($size << ioctl::IOC_SIZESHIFT)
    };
}

macro_rules! io {
    ($kind:expr, $nr:expr) => {
        ioc!(ioctl::IOC_NONE, $kind, $nr, 0)
    };
}

pub const PERF_EVENT_IOC_ENABLE: c_ulong = io!(b'$', 0);
pub const PERF_EVENT_IOC_DISABLE: c_ulong = io!(b'$', 1);
pub const PERF_EVENT_IOC_RESET: c_ulong = io!(b'$', 3);

#[repr(C)]
pub struct PerfEventAttr {
    pub kind: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period_or_freq: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events_or_watermark: u32,
    pub bp_type: u32,
    pub bp_addr_or_config: u64,
    pub bp_len_or_config: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clock_id: i32,
}

#[repr(C)]
pub struct PerfEventMmapPage {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub reserved: [u8; 118 * 8 + 4],
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub aux_head: u64,
    pub aux_tail: u64,
    pub aux_offset: u64,
    pub aux_size: u64,
}

#[derive(Debug)]
#[repr(C)]
pub struct PerfEventHeader {
    pub kind: u32,
    pub misc: u16,
    pub size: u16,
}

pub fn sys_perf_event_open(
    attr: &PerfEventAttr,
    pid: pid_t,
    cpu: c_int,
    group_fd: c_int,
    flags: c_ulong,
) -> c_int {
    unsafe {
        syscall(
            SYS_perf_event_open,
            attr as *const _,
            pid,
            cpu,
            group_fd,
            flags,
        ) as c_int
    }
}

pub const SIGEV_THREAD_ID: c_int = 4;

/// The kernel's sigevent layout (the libc crate hides the thread-id arm of
/// the union). 64 bytes total on 64-bit.
#[repr(C)]
pub struct KernelSigevent {
    pub sigev_value: usize,
    pub sigev_signo: c_int,
    pub sigev_notify: c_int,
    pub sigev_tid: c_int,
    pad: [c_int; 11],
}

impl KernelSigevent {
    /// Fires `signo` at the thread `tid` on every timer expiry.
    pub fn thread_signal(signo: c_int, tid: pid_t) -> Self {
        KernelSigevent {
            sigev_value: 0,
            sigev_signo: signo,
            sigev_notify: SIGEV_THREAD_ID,
            sigev_tid: tid as c_int,
            pad: [0; 11],
        }
    }
}

pub fn gettid() -> pid_t {
    unsafe { syscall(SYS_gettid) as pid_t }
}

fn check(ret: c_long) -> io::Result<()> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub fn timer_create(clockid: c_int, sev: &KernelSigevent) -> io::Result<c_int> {
    let mut timer_id: c_int = 0;
    check(unsafe {
        syscall(SYS_timer_create, clockid, sev as *const KernelSigevent, &mut timer_id)
    })?;
    Ok(timer_id)
}

pub fn timer_settime_interval(timer_id: c_int, period_ns: u64) -> io::Result<()> {
    let spec = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: (period_ns / 1_000_000_000) as libc::time_t,
            tv_nsec: (period_ns % 1_000_000_000) as libc::c_long,
        },
        it_value: libc::timespec {
            tv_sec: (period_ns / 1_000_000_000) as libc::time_t,
            tv_nsec: (period_ns % 1_000_000_000) as libc::c_long,
        },
    };
    check(unsafe {
        syscall(SYS_timer_settime, timer_id, 0, &spec as *const libc::itimerspec,
            std::ptr::null_mut::<libc::itimerspec>())
    })
}

pub fn timer_delete(timer_id: c_int) -> io::Result<()> {
    check(unsafe { syscall(SYS_timer_delete, timer_id) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_sizes() {
        assert_eq!(std::mem::size_of::<PerfEventMmapPage>(), 1088);
        assert_eq!(std::mem::size_of::<PerfEventHeader>(), 8);
        assert_eq!(std::mem::size_of::<KernelSigevent>(), 64);
        // Version-3 perf attr; older kernels than that are out of scope.
        assert_eq!(std::mem::size_of::<PerfEventAttr>(), 96);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn ioctl_encoding_matches_the_kernel() {
        assert_eq!(PERF_EVENT_IOC_ENABLE, 9216);
        assert_eq!(PERF_EVENT_IOC_DISABLE, 9217);
        assert_eq!(PERF_EVENT_IOC_RESET, 9219);
    }
}
