//! Thin owners for perf file descriptors: a sampling fd with its mmap'd
//! ring buffer, and a plain counting fd for the IMC profilers.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{fence, Ordering};

use libc::{c_ulong, c_void, pid_t};

use super::event::EventEncoding;
use super::sys::*;
use crate::error::ProfileError;

/// A sampling perf event for the calling thread, recording faulting data
/// addresses into a ring buffer.
pub struct PerfSampler {
    fd: RawFd,
    buffer: *mut u8,
    /// Ring bytes, excluding the leading metadata page.
    size: u64,
    pagesize: usize,
}

// The buffer is only touched from the owning profiler thread.
unsafe impl Send for PerfSampler {}

impl PerfSampler {
    pub fn open(
        name: &str,
        encoding: &EventEncoding,
        sample_period: u64,
        ring_pages: usize,
    ) -> Result<Self, ProfileError> {
        let mut attr: PerfEventAttr = unsafe { mem::zeroed() };
        attr.kind = encoding.type_id;
        attr.config = encoding.config;
        attr.size = mem::size_of::<PerfEventAttr>() as u32;
        attr.sample_period_or_freq = sample_period;
        attr.sample_type = PERF_SAMPLE_ADDR;
        attr.flags = PERF_ATTR_FLAG_DISABLED
            | PERF_ATTR_FLAG_EXCLUDE_KERNEL
            | PERF_ATTR_FLAG_EXCLUDE_HV
            | PERF_ATTR_FLAG_MMAP
            | PERF_ATTR_FLAG_TASK
            | PERF_ATTR_FLAG_PRECISE_IP_2;

        let fd = sys_perf_event_open(&attr, 0, -1, -1, 0);
        if fd < 0 {
            return Err(ProfileError::PerfOpen {
                name: name.to_owned(),
                source: io::Error::last_os_error(),
            });
        }

        // perf requires a power-of-two ring size plus one metadata page.
        let pagesize = page_size();
        let pages = ring_pages.next_power_of_two().max(1);
        let full = pagesize * (pages + 1);
        let buffer = unsafe {
            libc::mmap(
                ptr::null_mut(),
                full,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if buffer == libc::MAP_FAILED {
            let e = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(ProfileError::RingBuffer(e));
        }

        Ok(PerfSampler {
            fd,
            buffer: buffer as *mut u8,
            size: (pagesize * pages) as u64,
            pagesize,
        })
    }

    pub fn reset_and_enable(&self) {
        unsafe {
            libc::ioctl(self.fd, PERF_EVENT_IOC_RESET as c_ulong as _, 0);
            libc::ioctl(self.fd, PERF_EVENT_IOC_ENABLE as c_ulong as _, 0);
        }
    }

    pub fn disable(&self) {
        unsafe {
            libc::ioctl(self.fd, PERF_EVENT_IOC_DISABLE as c_ulong as _, 0);
        }
    }

    fn read_wrapped(&self, offset: u64, out: &mut [u8]) {
        let base = unsafe { self.buffer.add(self.pagesize) };
        for (i, byte) in out.iter_mut().enumerate() {
            let off = (offset + i as u64) % self.size;
            *byte = unsafe { ptr::read(base.add(off as usize)) };
        }
    }

    /// Walks every record between `data_tail` and `data_head`, visiting
    /// the sampled address of each `PERF_RECORD_SAMPLE`, then publishes
    /// `data_tail = head` per the kernel's ring protocol.
    pub fn drain(&mut self, mut visit: impl FnMut(u64)) {
        let meta = self.buffer as *mut PerfEventMmapPage;
        let head = unsafe { ptr::read_volatile(&(*meta).data_head) };
        fence(Ordering::Acquire);
        // Only we ever write the tail; no fence needed to read it back.
        let mut pos = unsafe { ptr::read_volatile(&(*meta).data_tail) };

        while pos < head {
            let mut header_bytes = [0u8; 8];
            self.read_wrapped(pos % self.size, &mut header_bytes);
            let kind = u32::from_ne_bytes(header_bytes[0..4].try_into().unwrap());
            let size = u16::from_ne_bytes(header_bytes[6..8].try_into().unwrap());
            if size == 0 {
                break;
            }
            if kind == PERF_RECORD_SAMPLE && size as usize >= 16 {
                let mut addr_bytes = [0u8; 8];
                self.read_wrapped((pos + 8) % self.size, &mut addr_bytes);
                let addr = u64::from_ne_bytes(addr_bytes);
                if addr != 0 {
                    visit(addr);
                }
            }
            pos += size as u64;
        }

        fence(Ordering::Release);
        unsafe { ptr::write_volatile(&mut (*meta).data_tail, head) };
    }
}

impl Drop for PerfSampler {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.buffer as *mut c_void, self.size as usize + self.pagesize);
            libc::close(self.fd);
        }
    }
}

/// A counting perf event, optionally pinned to a CPU and system-wide.
pub struct CounterFd {
    fd: RawFd,
}

impl CounterFd {
    /// `pid` of -1 with a concrete `cpu` opens a system-wide counter on
    /// that CPU, which is what the memory-controller PMUs require.
    pub fn open(
        name: &str,
        encoding: &EventEncoding,
        pid: pid_t,
        cpu: i32,
    ) -> Result<Self, ProfileError> {
        let mut attr: PerfEventAttr = unsafe { mem::zeroed() };
        attr.kind = encoding.type_id;
        attr.config = encoding.config;
        attr.size = mem::size_of::<PerfEventAttr>() as u32;
        attr.flags = PERF_ATTR_FLAG_DISABLED;

        let fd = sys_perf_event_open(&attr, pid, cpu, -1, 0);
        if fd < 0 {
            return Err(ProfileError::PerfOpen {
                name: name.to_owned(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(CounterFd { fd })
    }

    pub fn enable(&self) {
        unsafe {
            libc::ioctl(self.fd, PERF_EVENT_IOC_ENABLE as c_ulong as _, 0);
        }
    }

    pub fn disable(&self) {
        unsafe {
            libc::ioctl(self.fd, PERF_EVENT_IOC_DISABLE as c_ulong as _, 0);
        }
    }

    pub fn reset(&self) {
        unsafe {
            libc::ioctl(self.fd, PERF_EVENT_IOC_RESET as c_ulong as _, 0);
        }
    }

    pub fn read(&self) -> io::Result<u64> {
        let mut value: u64 = 0;
        let n = unsafe {
            libc::read(self.fd, &mut value as *mut u64 as *mut c_void, mem::size_of::<u64>())
        };
        if n != mem::size_of::<u64>() as isize {
            return Err(io::Error::last_os_error());
        }
        Ok(value)
    }
}

impl Drop for CounterFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
