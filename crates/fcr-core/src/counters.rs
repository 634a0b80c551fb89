//! Process-wide monotonic counters for observability hooks.
//!
//! A lock-free concurrent map behind a process-wide `once_cell::sync::Lazy`
//! singleton — the same `dashmap` + `once_cell` pairing this codebase family
//! uses elsewhere for a contended, write-heavy, no-single-owner table.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicI64, Ordering};

static COUNTERS: Lazy<DashMap<String, AtomicI64>> = Lazy::new(DashMap::new);

/// Increment `name` by `delta` (may be negative), creating it at 0 first.
pub fn increment(name: &str, delta: i64) {
    COUNTERS
        .entry(name.to_string())
        .or_insert_with(|| AtomicI64::new(0))
        .fetch_add(delta, Ordering::Relaxed);
}

/// Increment `name` by 1.
pub fn incr(name: &str) {
    increment(name, 1);
}

/// Set `name` to an absolute value.
pub fn set(name: &str, value: i64) {
    COUNTERS
        .entry(name.to_string())
        .or_insert_with(|| AtomicI64::new(0))
        .store(value, Ordering::Relaxed);
}

/// Read the current value of `name`, or 0 if it has never been touched.
pub fn get(name: &str) -> i64 {
    COUNTERS
        .get(name)
        .map(|v| v.load(Ordering::Relaxed))
        .unwrap_or(0)
}

/// Snapshot all counters as `(name, value)` pairs, for the metrics exporter.
pub fn snapshot() -> Vec<(String, i64)> {
    COUNTERS
        .iter()
        .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
        .collect()
}

/// Counter name for a session being opened.
pub const SESSIONS_OPENED: &str = "fcr.sessions.opened";
/// Counter name for a session being evicted (close, idle, or owner disconnect).
pub const SESSIONS_EVICTED: &str = "fcr.sessions.evicted";
/// Counter name for the number of currently live sessions.
pub const SESSIONS_ACTIVE: &str = "fcr.sessions.active";
/// Counter name prefix for per-vendor command counts; call with `vendor_counter(name)`.
pub fn vendor_counter(vendor: &str) -> String {
    format!("fcr.vendor.{}.commands", vendor)
}
/// Counter name prefix for per-error-code counts; call with `error_counter(code)`.
pub fn error_counter(code: crate::error::FcrErrorCode) -> String {
    format!("fcr.errors.{}", code.as_u16())
}
