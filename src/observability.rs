//! Process-wide gate counters.
//!
//! Counters only: no peer identities, addresses or clock readings are kept
//! here. The build script enforces that.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ErrorKind;

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservabilityLevel {
    OBS_NONE,
    OBS_SAFE,
    OBS_DEV,
}

#[cfg(feature = "obs_none")]
pub const OBS_LEVEL: ObservabilityLevel = ObservabilityLevel::OBS_NONE;

#[cfg(feature = "obs_dev")]
pub const OBS_LEVEL: ObservabilityLevel = ObservabilityLevel::OBS_DEV;

#[cfg(all(not(feature = "obs_none"), not(feature = "obs_dev")))]
pub const OBS_LEVEL: ObservabilityLevel = ObservabilityLevel::OBS_SAFE;

pub const OBS_ENABLED: bool = !matches!(OBS_LEVEL, ObservabilityLevel::OBS_NONE);

static SESSIONS_OPENED: AtomicU64 = AtomicU64::new(0);
static SESSIONS_ACCEPTED: AtomicU64 = AtomicU64::new(0);
static SESSIONS_REJECTED: AtomicU64 = AtomicU64::new(0);
static SESSIONS_TIMED_OUT: AtomicU64 = AtomicU64::new(0);
static SECURITY_VIOLATIONS: AtomicU64 = AtomicU64::new(0);
static PACKETS_SENT: AtomicU64 = AtomicU64::new(0);
static PACKETS_RECEIVED: AtomicU64 = AtomicU64::new(0);

const ERROR_KINDS: usize = 5;
static ERRORS_BY_KIND: [AtomicU64; ERROR_KINDS] = [const { AtomicU64::new(0) }; ERROR_KINDS];

#[inline]
fn bump(counter: &AtomicU64) {
    if OBS_ENABLED {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[inline]
pub fn record_session_opened() {
    bump(&SESSIONS_OPENED);
}

#[inline]
pub fn record_session_accepted() {
    bump(&SESSIONS_ACCEPTED);
}

#[inline]
pub fn record_session_rejected() {
    bump(&SESSIONS_REJECTED);
}

#[inline]
pub fn record_session_timed_out() {
    bump(&SESSIONS_TIMED_OUT);
}

#[inline]
pub fn record_packet_sent() {
    bump(&PACKETS_SENT);
}

#[inline]
pub fn record_packet_received() {
    bump(&PACKETS_RECEIVED);
}

#[inline]
pub fn record_error(kind: ErrorKind) {
    let idx = match kind {
        ErrorKind::Protocol => 0,
        ErrorKind::Security => 1,
        ErrorKind::Timeout => 2,
        ErrorKind::Token => 3,
        ErrorKind::Infrastructure => 4,
    };
    bump(&ERRORS_BY_KIND[idx]);
    if kind == ErrorKind::Security {
        bump(&SECURITY_VIOLATIONS);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub sessions_opened: u64,
    pub sessions_accepted: u64,
    pub sessions_rejected: u64,
    pub sessions_timed_out: u64,
    pub security_violations: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub errors_by_kind: [u64; ERROR_KINDS],
}

pub fn snapshot() -> Snapshot {
    let mut errors_by_kind = [0u64; ERROR_KINDS];
    for (slot, counter) in errors_by_kind.iter_mut().zip(ERRORS_BY_KIND.iter()) {
        *slot = counter.load(Ordering::Relaxed);
    }
    Snapshot {
        sessions_opened: SESSIONS_OPENED.load(Ordering::Relaxed),
        sessions_accepted: SESSIONS_ACCEPTED.load(Ordering::Relaxed),
        sessions_rejected: SESSIONS_REJECTED.load(Ordering::Relaxed),
        sessions_timed_out: SESSIONS_TIMED_OUT.load(Ordering::Relaxed),
        security_violations: SECURITY_VIOLATIONS.load(Ordering::Relaxed),
        packets_sent: PACKETS_SENT.load(Ordering::Relaxed),
        packets_received: PACKETS_RECEIVED.load(Ordering::Relaxed),
        errors_by_kind,
    }
}
