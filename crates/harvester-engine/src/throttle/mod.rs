//! Per-bin fetch throttling.
//!
//! Each active `(group, bin)` pair owns three independent limiters: a
//! connection-count gate, a byte-rate bucket, and a fetch-start schedule.
//! A byte-limited bin admits one fetch at a time. Documents resolving to several bins take their slots in ascending
//! bin-name order.

pub mod byte_rate;
pub mod fetch_rate;

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use regex::Regex;

use harvester_types::connection::ThrottleBinDescription;

use crate::cancel::{CancellationToken, WAIT_SLICE};

pub use byte_rate::ByteBucket;
pub use fetch_rate::FetchSchedule;

#[derive(Debug, thiserror::Error)]
pub enum ThrottleError {
    #[error("throttle acquisition cancelled")]
    Cancelled,
    #[error("invalid throttle bin pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
    #[error("throttle lock poisoned")]
    LockPoisoned,
}

/// Limits of one bin. `None` is unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BinLimits {
    pub max_open_connections: Option<u32>,
    pub max_kb_per_second: Option<u64>,
    pub max_fetches_per_minute: Option<u32>,
}

impl From<&ThrottleBinDescription> for BinLimits {
    fn from(desc: &ThrottleBinDescription) -> Self {
        Self {
            max_open_connections: desc.max_open_connections,
            max_kb_per_second: desc.max_kb_per_second,
            max_fetches_per_minute: desc.max_fetches_per_minute,
        }
    }
}

/// Bin name produced by `pattern` for `identifier`: the first capture group
/// when the pattern has one, otherwise the pattern text.
#[must_use]
pub fn bin_name(pattern: &Regex, identifier: &str) -> Option<String> {
    let captures = pattern.captures(identifier)?;
    Some(match captures.get(1) {
        Some(group) => group.as_str().to_string(),
        None => pattern.as_str().to_string(),
    })
}

// ---------------------------------------------------------------------------
// One bin
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct BinState {
    max_open: Option<u32>,
    open: u32,
    bytes: Option<ByteBucket>,
    byte_fetch_in_flight: bool,
    fetches: Option<FetchSchedule>,
}

impl BinState {
    fn new(limits: BinLimits, now: Instant) -> Self {
        let mut state = Self {
            max_open: None,
            open: 0,
            bytes: None,
            byte_fetch_in_flight: false,
            fetches: None,
        };
        state.apply(limits, now);
        state
    }

    fn apply(&mut self, limits: BinLimits, now: Instant) {
        self.max_open = limits.max_open_connections;
        self.bytes = match (self.bytes.take(), limits.max_kb_per_second) {
            (_, None) => None,
            (Some(mut bucket), Some(kb)) => {
                bucket.set_rate(kb, now);
                Some(bucket)
            }
            (None, Some(kb)) => Some(ByteBucket::new(kb, now)),
        };
        self.fetches = match (self.fetches.take(), limits.max_fetches_per_minute) {
            (_, None) => None,
            (Some(mut schedule), Some(n)) => {
                schedule.set_rate(n);
                Some(schedule)
            }
            (None, Some(n)) => Some(FetchSchedule::new(n)),
        };
    }

    fn is_unused(&self, now: Instant) -> bool {
        self.open == 0
            && !self.bytes.as_ref().is_some_and(ByteBucket::in_deficit)
            && self.fetches.as_ref().map_or(true, |f| f.is_idle(now))
    }
}

#[derive(Debug)]
struct BinThrottle {
    name: String,
    limits: Mutex<BinLimits>,
    state: Mutex<BinState>,
    wake: Condvar,
}

impl BinThrottle {
    fn new(name: String, limits: BinLimits) -> Self {
        Self {
            name,
            limits: Mutex::new(limits),
            state: Mutex::new(BinState::new(limits, Instant::now())),
            wake: Condvar::new(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BinState>, ThrottleError> {
        self.state.lock().map_err(|_| ThrottleError::LockPoisoned)
    }

    fn update_limits(&self, limits: BinLimits) -> Result<(), ThrottleError> {
        let mut current = self.limits.lock().map_err(|_| ThrottleError::LockPoisoned)?;
        if *current != limits {
            tracing::debug!(bin = %self.name, ?limits, "Updating throttle limits");
            *current = limits;
            self.lock()?.apply(limits, Instant::now());
            self.wake.notify_all();
        }
        Ok(())
    }

    /// Take a connection slot, then wait for the fetch-start reservation
    /// and for the byte bucket to leave deficit with no fetch in flight.
    /// Returns whether the byte slot was taken.
    fn acquire(&self, cancel: &CancellationToken) -> Result<bool, ThrottleError> {
        let mut state = self.lock()?;
        loop {
            if state.max_open.map_or(true, |max| state.open < max) {
                state.open += 1;
                break;
            }
            if cancel.is_cancelled() {
                return Err(ThrottleError::Cancelled);
            }
            state = self
                .wake
                .wait_timeout(state, WAIT_SLICE)
                .map_err(|_| ThrottleError::LockPoisoned)?
                .0;
        }

        let start = state
            .fetches
            .as_mut()
            .map(|schedule| schedule.reserve(Instant::now()));
        loop {
            let now = Instant::now();
            let fetch_wait = start.map_or(Duration::ZERO, |s| s.saturating_duration_since(now));
            let byte_wait = state
                .bytes
                .as_mut()
                .map_or(Duration::ZERO, |b| b.ready_at(now).saturating_duration_since(now));
            let byte_busy = state.bytes.is_some() && state.byte_fetch_in_flight;
            let wait = fetch_wait.max(byte_wait);
            if wait.is_zero() && !byte_busy {
                let byte_slot = state.bytes.is_some();
                state.byte_fetch_in_flight |= byte_slot;
                return Ok(byte_slot);
            }
            if cancel.is_cancelled() {
                state.open = state.open.saturating_sub(1);
                if let (Some(start), Some(schedule)) = (start, state.fetches.as_mut()) {
                    schedule.release(start);
                }
                self.wake.notify_all();
                return Err(ThrottleError::Cancelled);
            }
            let slice = if wait.is_zero() { WAIT_SLICE } else { wait.min(WAIT_SLICE) };
            state = self
                .wake
                .wait_timeout(state, slice)
                .map_err(|_| ThrottleError::LockPoisoned)?
                .0;
        }
    }

    fn release(&self, byte_slot: bool, bytes: Option<u64>) {
        if let Ok(mut state) = self.state.lock() {
            state.open = state.open.saturating_sub(1);
            if byte_slot {
                state.byte_fetch_in_flight = false;
            }
            if let (Some(bytes), Some(bucket)) = (bytes, state.bytes.as_mut()) {
                bucket.charge(bytes, Instant::now());
            }
        }
        self.wake.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Permit
// ---------------------------------------------------------------------------

/// Slots held for one fetch. [`finish`](Self::finish) charges the bytes
/// fetched; dropping without finishing releases without charging.
#[derive(Debug)]
pub struct ThrottlePermit {
    /// Each held bin, and whether it holds that bin's byte slot.
    bins: Vec<(Arc<BinThrottle>, bool)>,
}

impl ThrottlePermit {
    #[must_use]
    pub fn bins(&self) -> Vec<&str> {
        self.bins.iter().map(|(b, _)| b.name.as_str()).collect()
    }

    pub fn finish(mut self, bytes: u64) {
        for (bin, byte_slot) in self.bins.drain(..) {
            bin.release(byte_slot, Some(bytes));
        }
    }
}

impl Drop for ThrottlePermit {
    fn drop(&mut self) {
        for (bin, byte_slot) in self.bins.drain(..) {
            bin.release(byte_slot, None);
        }
    }
}

// ---------------------------------------------------------------------------
// ThrottleManager
// ---------------------------------------------------------------------------

type BinKey = (String, String);

#[derive(Debug, Default)]
pub struct ThrottleManager {
    bins: Mutex<HashMap<BinKey, Arc<BinThrottle>>>,
    patterns: Mutex<HashMap<String, Regex>>,
}

impl ThrottleManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn compiled(&self, pattern: &str) -> Result<Regex, ThrottleError> {
        let mut patterns = self.patterns.lock().map_err(|_| ThrottleError::LockPoisoned)?;
        if let Some(regex) = patterns.get(pattern) {
            return Ok(regex.clone());
        }
        let regex = Regex::new(pattern).map_err(|source| ThrottleError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        patterns.insert(pattern.to_string(), regex.clone());
        Ok(regex)
    }

    /// First-match bin for `identifier`; `None` is unthrottled.
    ///
    /// # Errors
    ///
    /// `InvalidPattern` for a description that does not compile.
    pub fn resolve_bin(
        &self,
        identifier: &str,
        descriptions: &[ThrottleBinDescription],
    ) -> Result<Option<String>, ThrottleError> {
        for desc in descriptions {
            if let Some(name) = bin_name(&self.compiled(&desc.bin_regex)?, identifier) {
                return Ok(Some(name));
            }
        }
        Ok(None)
    }

    /// Every distinct bin `identifier` falls in, ascending by name. A bin
    /// produced by several descriptions takes the limits of the first.
    ///
    /// # Errors
    ///
    /// `InvalidPattern` for a description that does not compile.
    pub fn resolve_bins(
        &self,
        identifier: &str,
        descriptions: &[ThrottleBinDescription],
    ) -> Result<Vec<(String, BinLimits)>, ThrottleError> {
        let mut bins: Vec<(String, BinLimits)> = Vec::new();
        for desc in descriptions {
            if let Some(name) = bin_name(&self.compiled(&desc.bin_regex)?, identifier) {
                if !bins.iter().any(|(existing, _)| *existing == name) {
                    bins.push((name, BinLimits::from(desc)));
                }
            }
        }
        bins.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(bins)
    }

    fn bin(&self, group: &str, name: &str, limits: BinLimits) -> Result<Arc<BinThrottle>, ThrottleError> {
        let bin = {
            let mut bins = self.bins.lock().map_err(|_| ThrottleError::LockPoisoned)?;
            Arc::clone(
                bins.entry((group.to_string(), name.to_string()))
                    .or_insert_with(|| Arc::new(BinThrottle::new(name.to_string(), limits))),
            )
        };
        bin.update_limits(limits)?;
        Ok(bin)
    }

    /// Acquire every bin slot for one fetch of `identifier`, blocking
    /// until all limiters admit it.
    ///
    /// # Errors
    ///
    /// `Cancelled` (slots already taken are released), `InvalidPattern`,
    /// or `LockPoisoned`.
    pub fn acquire(
        &self,
        group: &str,
        identifier: &str,
        descriptions: &[ThrottleBinDescription],
        cancel: &CancellationToken,
    ) -> Result<ThrottlePermit, ThrottleError> {
        let mut permit = ThrottlePermit { bins: Vec::new() };
        for (name, limits) in self.resolve_bins(identifier, descriptions)? {
            let bin = self.bin(group, &name, limits)?;
            // On error the permit drops and releases what it holds.
            let byte_slot = bin.acquire(cancel)?;
            permit.bins.push((bin, byte_slot));
        }
        Ok(permit)
    }

    /// Drop state for bins nobody holds and with nothing left to pace.
    /// Returns how many were dropped.
    pub fn free_unused(&self) -> usize {
        let Ok(mut bins) = self.bins.lock() else {
            return 0;
        };
        let now = Instant::now();
        let before = bins.len();
        bins.retain(|_, bin| {
            Arc::strong_count(bin) > 1 || bin.state.lock().map_or(true, |s| !s.is_unused(now))
        });
        before - bins.len()
    }

    #[must_use]
    pub fn active_bins(&self) -> usize {
        self.bins.lock().map_or(0, |b| b.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn desc(pattern: &str) -> ThrottleBinDescription {
        ThrottleBinDescription::new(pattern)
    }

    #[test]
    fn bin_name_prefers_capture_group() {
        let host = Regex::new(r"^https?://([^/]+)/").unwrap();
        assert_eq!(bin_name(&host, "http://site-a/x").as_deref(), Some("site-a"));
        let plain = Regex::new(r"\.pdf$").unwrap();
        assert_eq!(bin_name(&plain, "a.pdf").as_deref(), Some(r"\.pdf$"));
        assert_eq!(bin_name(&plain, "a.txt"), None);
    }

    #[test]
    fn resolve_bin_is_first_match() {
        let manager = ThrottleManager::new();
        let descs = [desc(r"^/docs/(\w+)/"), desc(r"^/(\w+)/")];
        assert_eq!(
            manager.resolve_bin("/docs/eng/a.txt", &descs).unwrap().as_deref(),
            Some("eng")
        );
        assert_eq!(manager.resolve_bin("x", &descs).unwrap(), None);
    }

    #[test]
    fn resolve_bins_sorted_and_distinct() {
        let manager = ThrottleManager::new();
        let descs = [desc(r"^/(zeta)/"), desc(r"^/zeta/(alpha)"), desc("zeta")];
        let bins: Vec<String> = manager
            .resolve_bins("/zeta/alpha", &descs)
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(bins, ["alpha", "zeta"]);
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let manager = ThrottleManager::new();
        assert!(matches!(
            manager.resolve_bin("x", &[desc("(")]),
            Err(ThrottleError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn unmatched_document_is_unthrottled() {
        let manager = ThrottleManager::new();
        let permit = manager
            .acquire("files", "/tmp/x", &[desc("^/data/")], &CancellationToken::new())
            .unwrap();
        assert!(permit.bins().is_empty());
        assert_eq!(manager.active_bins(), 0);
    }

    #[test]
    fn connection_limit_blocks_second_fetch() {
        let manager = Arc::new(ThrottleManager::new());
        let mut d = desc("^/data/");
        d.max_open_connections = Some(1);
        let descs = vec![d];
        let cancel = CancellationToken::new();
        let first = manager.acquire("files", "/data/a", &descs, &cancel).unwrap();

        let waiter = {
            let manager = Arc::clone(&manager);
            let descs = descs.clone();
            thread::spawn(move || {
                let start = Instant::now();
                let permit = manager.acquire("files", "/data/b", &descs, &CancellationToken::new());
                (permit.is_ok(), start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(100));
        first.finish(10);
        let (ok, waited) = waiter.join().unwrap();
        assert!(ok);
        assert!(waited >= Duration::from_millis(90));
    }

    #[test]
    fn cancelled_acquire_releases_earlier_bins() {
        let manager = ThrottleManager::new();
        let mut a = desc("^(a)");
        a.max_open_connections = Some(1);
        let mut b = desc("^a(b)");
        b.max_open_connections = Some(1);
        let live = CancellationToken::new();
        let held_b = manager.acquire("g", "ab", &[b.clone()], &live).unwrap();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert!(matches!(
            manager.acquire("g", "ab", &[a.clone(), b], &cancelled),
            Err(ThrottleError::Cancelled)
        ));
        // "a" was taken first and given back when "b" failed.
        let only_a = manager.acquire("g", "ab", &[a], &cancelled).unwrap();
        assert_eq!(only_a.bins(), ["a"]);
        drop(held_b);
    }

    #[test]
    fn limits_update_in_place() {
        let manager = ThrottleManager::new();
        let cancel = CancellationToken::new();
        let mut d = desc("^/data/");
        d.max_open_connections = Some(1);
        let held = manager.acquire("files", "/data/a", &[d.clone()], &cancel).unwrap();
        d.max_open_connections = Some(2);
        let second = manager.acquire("files", "/data/b", &[d], &cancel).unwrap();
        assert_eq!(manager.active_bins(), 1);
        drop(held);
        drop(second);
    }

    #[test]
    fn free_unused_drops_idle_bins() {
        let manager = ThrottleManager::new();
        let cancel = CancellationToken::new();
        let mut d = desc("^/data/");
        d.max_open_connections = Some(4);
        let permit = manager.acquire("files", "/data/a", &[d], &cancel).unwrap();
        assert_eq!(manager.free_unused(), 0);
        drop(permit);
        assert_eq!(manager.free_unused(), 1);
        assert_eq!(manager.active_bins(), 0);
    }

    #[test]
    fn concurrent_fetches_stay_within_byte_rate() {
        const FETCH: u64 = 16 * 1024;
        let manager = Arc::new(ThrottleManager::new());
        let mut d = desc("^/data/");
        d.max_kb_per_second = Some(64);
        let descs = vec![d];

        let workers: Vec<_> = (0..4)
            .map(|i| {
                let manager = Arc::clone(&manager);
                let descs = descs.clone();
                thread::spawn(move || {
                    let permit = manager
                        .acquire("files", &format!("/data/{i}"), &descs, &CancellationToken::new())
                        .unwrap();
                    let started = Instant::now();
                    thread::sleep(Duration::from_millis(100));
                    permit.finish(FETCH);
                    started
                })
            })
            .collect();
        let mut starts: Vec<Instant> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        starts.sort();

        let rate = 64.0 * 1024.0;
        let slack = 2.0 * 1024.0;
        for (i, start) in starts.iter().enumerate() {
            let window = start.duration_since(starts[0]).as_secs_f64();
            #[allow(clippy::cast_precision_loss)]
            let admitted_before = (i as u64 * FETCH) as f64;
            assert!(
                admitted_before <= rate * window + slack,
                "fetch {i} started {window}s in after {admitted_before} bytes"
            );
        }
        assert!(starts[1] - starts[0] >= Duration::from_millis(100));
    }

    #[test]
    fn cancelled_acquire_returns_its_fetch_slot() {
        let manager = ThrottleManager::new();
        let mut d = desc("^/data/");
        d.max_fetches_per_minute = Some(600); // one per 100ms
        let live = CancellationToken::new();
        let start = Instant::now();
        manager.acquire("files", "/data/a", &[d.clone()], &live).unwrap().finish(0);

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert!(matches!(
            manager.acquire("files", "/data/b", &[d.clone()], &cancelled),
            Err(ThrottleError::Cancelled)
        ));

        manager.acquire("files", "/data/c", &[d], &live).unwrap().finish(0);
        assert!(start.elapsed() < Duration::from_millis(190));
    }

    #[test]
    fn fetch_rate_paces_starts() {
        let manager = ThrottleManager::new();
        let cancel = CancellationToken::new();
        let mut d = desc("^/data/");
        d.max_fetches_per_minute = Some(600); // one per 100ms
        let start = Instant::now();
        for i in 0..3 {
            manager
                .acquire("files", &format!("/data/{i}"), &[d.clone()], &cancel)
                .unwrap()
                .finish(0);
        }
        assert!(start.elapsed() >= Duration::from_millis(190));
    }
}
