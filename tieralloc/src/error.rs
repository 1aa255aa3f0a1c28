use std::io;

use thiserror::Error;

/// Rejected or inconsistent configuration. All of these are fatal at
/// [`crate::init`] time; nothing is half-started.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: unrecognized value {value:?}")]
    BadValue { var: &'static str, value: String },

    #[error("{var}: {source}")]
    Io {
        var: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{var}: no device on NUMA node {node}")]
    NoSuchNode { var: &'static str, node: u32 },

    #[error("SH_MAX_ARENAS may not exceed {max}")]
    TooManyArenas { max: usize },

    #[error("guidance file: {0}")]
    Guidance(String),

    #[error("the online approach requires access-sample profiling plus a capacity profiler")]
    OnlineNeedsProfilers,

    #[error("event {0:?} is not in SH_PROFILE_ALL_EVENTS")]
    UnknownOnlineEvent(String),

    #[error("device discovery failed: {0}")]
    Discovery(#[source] io::Error),

    #[error("profiler startup failed: {0}")]
    Profiling(#[from] ProfileError),
}

/// Profiler setup and sampling errors. Setup errors are fatal; per-interval
/// I/O hiccups are logged and under-report instead.
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("cannot encode event {name:?}: {reason}")]
    EventEncoding { name: String, reason: String },

    #[error("perf_event_open for {name:?} failed: {source}")]
    PerfOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot map the sample ring buffer: {0}")]
    RingBuffer(#[source] io::Error),

    #[error("cannot open the resident-page oracle: {0}")]
    PagemapOpen(#[source] io::Error),

    #[error("malformed profile data: {0}")]
    Parse(String),

    #[error("profiler setup: {0}")]
    Setup(String),

    #[error("{0}")]
    Io(#[from] io::Error),
}
