//! Site-aware tiered memory allocation.
//!
//! Machines with more than one kind of memory expose each pool as a NUMA
//! node; the fast pools are scarce, the slow ones abundant. tieralloc
//! routes each instrumented allocation site to a jemalloc arena bound to
//! a chosen pool, tracks every OS mapping those arenas create, and
//! optionally runs a sampling profiler whose online controller promotes
//! the hot sites onto fast memory and demotes the cold ones as the
//! program runs.
//!
//! Call [`init`] once near the start of the program (configuration is
//! read from `SH_*` environment variables), route allocations through
//! [`alloc`] and friends with a nonzero site id, and call [`shutdown`]
//! at exit to stop the profiler and write the profile file. Site 0 is
//! untagged and bypasses routing entirely.
//!
//! The low-level device and arena API lives in the `tieralloc-pool`
//! crate, re-exported here as [`pool`].

pub mod config;
pub mod error;
pub mod guidance;
pub mod packing;
pub mod parsing;
pub mod profile;
mod runtime;

pub use tieralloc_pool as pool;

use std::fs::File;
use std::sync::Arc;

use log::error;
use parking_lot::Mutex;

use config::Options;
use error::ConfigError;
use profile::data::ApplicationProfile;
use runtime::{RegistryBridge, RUNTIME};

pub use runtime::{
    aligned_alloc, alloc, calloc, free, memalign, posix_memalign, realloc, sized_free,
};

static PROFILER: Mutex<Option<profile::Profiler>> = Mutex::new(None);

fn init_logger(opts: &Options) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if let Some(path) = &opts.log_file {
        match File::create(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("cannot open SH_LOG_FILE {}: {e}", path.display()),
        }
    }
    // The host application may already own the logger; that's fine.
    let _ = builder.try_init();
}

/// Initializes the runtime from the environment: discovers memory
/// devices, builds the tracker, and starts the profiling master when any
/// profiler is enabled. Idempotent; configuration problems are fatal and
/// leave the allocator un-routed (every call passes through to jemalloc).
pub fn init() -> Result<(), ConfigError> {
    if RUNTIME.get().is_some() {
        return Ok(());
    }

    let opts = Options::from_env()?;
    init_logger(&opts);

    let devices = tieralloc_pool::init().map_err(ConfigError::Discovery)?;
    let profiling = opts.pebs.is_some()
        || opts.rss.is_some()
        || opts.extent_size.is_some()
        || opts.allocs.is_some()
        || opts.bw.is_some()
        || opts.latency.is_some()
        || opts.online.is_some();

    let rt = Arc::new(runtime::Runtime::new(opts, devices)?);
    if RUNTIME.set(rt.clone()).is_err() {
        // Lost a racing init; the winner's runtime is the one.
        return Ok(());
    }
    tieralloc_pool::set_extent_callback(Some(Arc::new(RegistryBridge(rt.clone()))));

    if profiling {
        let profiler = profile::start(rt)?;
        *PROFILER.lock() = Some(profiler);
    }
    Ok(())
}

/// Stops the profiling master (draining the interval in flight), writes
/// the profile to `SH_PROFILE_OUTPUT_FILE` if configured, and detaches
/// from the pool layer. Allocations made earlier can still be freed.
pub fn shutdown() {
    let Some(rt) = RUNTIME.get() else {
        return;
    };

    if let Some(mut profiler) = PROFILER.lock().take() {
        profiler.stop();
        if let Some(path) = &rt.opts.profile_output {
            let profile = profiler.profile.read();
            match File::create(path) {
                Ok(mut file) => {
                    if let Err(e) = parsing::write_profile(
                        &profile,
                        &mut file,
                        rt.opts.print_profile_intervals,
                    ) {
                        error!("writing {} failed: {e}", path.display());
                    }
                }
                Err(e) => error!("cannot create {}: {e}", path.display()),
            }
        }
    }

    tieralloc_pool::set_extent_callback(None);
    tieralloc_pool::fini();
}

/// The folded profile collected so far, when profiling is running.
pub fn current_profile() -> Option<ApplicationProfile> {
    PROFILER.lock().as_ref().map(|p| p.profile.read().clone())
}
