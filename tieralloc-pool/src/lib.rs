//! Memory-pool discovery and device-bound jemalloc arenas.
//!
//! Machines with heterogeneous memory expose each pool as a NUMA node with
//! its own latency, bandwidth, capacity and page size. This crate
//! enumerates those pools as [`Device`]s, and builds [`Arena`]s on top of
//! jemalloc's extent-hook extension point so that every page an arena ever
//! maps is bound to the arena's device set, every mapping is tracked as an
//! extent, and a live arena can be migrated wholesale to a different
//! device set.

mod arena;
mod device;
mod error;
mod extent;
mod nodemask;
pub mod sys;

pub use arena::{
    arenas_list, default_alloc, get_default, global_aligned_alloc, global_alloc, global_calloc,
    global_free, global_realloc, lookup, set_default, set_extent_callback, Arena, ExtentCallback,
};
pub use device::{fini, init, move_range, Device, DeviceList, DeviceTag};
pub use error::PoolError;
pub use extent::{ExtentList, Slot};
pub use nodemask::NodeMask;
pub use sys::BindPolicy;
