//! Lightweight process-wide counters for cache events and compile time.
//!
//! Counters accumulate until drained with [`take_cache_events`] / [`take_compile_times`]; callers
//! that want isolated numbers should drain once before the region they measure.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompileStat {
    pub calls: u64,
    pub total: Duration,
}

#[derive(Default)]
struct Counters {
    cache_events: HashMap<&'static str, u64>,
    compile: HashMap<&'static str, CompileStat>,
}

static COUNTERS: Lazy<Mutex<Counters>> = Lazy::new(|| Mutex::new(Counters::default()));

fn counters() -> &'static Mutex<Counters> {
    &COUNTERS
}

#[inline]
pub fn cache_event(name: &'static str) {
    let mut counters = counters().lock().expect("profiling counters poisoned");
    *counters.cache_events.entry(name).or_default() += 1;
}

/// Times the enclosing scope under `name` when dropped.
#[must_use = "the scope is timed until the guard is dropped"]
pub struct ScopeGuard {
    name: &'static str,
    started: Instant,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        let mut counters = counters().lock().expect("profiling counters poisoned");
        let stat = counters.compile.entry(self.name).or_default();
        stat.calls += 1;
        stat.total += elapsed;
    }
}

#[inline]
pub fn compile_scope(name: &'static str) -> ScopeGuard {
    ScopeGuard {
        name,
        started: Instant::now(),
    }
}

pub fn take_cache_events() -> HashMap<&'static str, u64> {
    let mut counters = counters().lock().expect("profiling counters poisoned");
    std::mem::take(&mut counters.cache_events)
}

pub fn take_compile_times() -> HashMap<&'static str, CompileStat> {
    let mut counters = counters().lock().expect("profiling counters poisoned");
    std::mem::take(&mut counters.compile)
}
