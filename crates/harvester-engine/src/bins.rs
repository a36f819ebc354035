//! Bin fairness: document priorities drawn from per-bin counters so the
//! scheduler interleaves bins instead of draining one at a time.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use harvester_state::{StateBackend, StateError};
use rand::Rng;
use std::time::Duration;

use crate::cancel::CancellationToken;

const OUTER_RETRY_BASE_MS: u64 = 50;
const OUTER_RETRY_MAX_MS: u64 = 2_000;

#[derive(Debug, thiserror::Error)]
pub enum BinError {
    #[error("bin allocation cancelled")]
    Cancelled,
    #[error(transparent)]
    State(#[from] StateError),
    #[error("bin tracker lock poisoned")]
    LockPoisoned,
}

#[derive(Debug, Default)]
struct Preload {
    requested: usize,
    values: VecDeque<f64>,
}

type BinKey = (String, String);

pub struct BinFairnessTracker {
    store: Arc<dyn StateBackend>,
    minimum_depth: Mutex<f64>,
    preloaded: Mutex<HashMap<BinKey, Preload>>,
}

impl BinFairnessTracker {
    #[must_use]
    pub fn new(store: Arc<dyn StateBackend>) -> Self {
        Self {
            store,
            minimum_depth: Mutex::new(0.0),
            preloaded: Mutex::new(HashMap::new()),
        }
    }

    fn depth(&self) -> Result<MutexGuard<'_, f64>, BinError> {
        self.minimum_depth.lock().map_err(|_| BinError::LockPoisoned)
    }

    fn preloads(&self) -> Result<MutexGuard<'_, HashMap<BinKey, Preload>>, BinError> {
        self.preloaded.lock().map_err(|_| BinError::LockPoisoned)
    }

    #[must_use]
    pub fn minimum_depth(&self) -> f64 {
        self.minimum_depth.lock().map_or(0.0, |d| *d)
    }

    /// Raise the depth to the lowest priority still queued.
    ///
    /// # Errors
    ///
    /// `LockPoisoned` only.
    pub fn assess_minimum_depth(&self, lowest_pending: Option<f64>) -> Result<(), BinError> {
        if let Some(lowest) = lowest_pending {
            let mut depth = self.depth()?;
            if lowest > *depth {
                *depth = lowest;
            }
        }
        Ok(())
    }

    /// Allocate `count` consecutive priorities for a bin, starting no lower
    /// than the minimum depth plus `bias`.
    ///
    /// The store retries contended transactions itself; if it still gives
    /// up, the whole allocation is retried here after a jittered delay
    /// until it succeeds or `cancel` fires.
    ///
    /// # Errors
    ///
    /// `Cancelled`, or a non-retryable store error.
    pub fn grab_next(
        &self,
        connector_class: &str,
        bin: &str,
        bias: f64,
        count: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<f64>, BinError> {
        let starting = *self.depth()? + bias;
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(BinError::Cancelled);
            }
            match self
                .store
                .grab_bin_values(connector_class, bin, starting, count)
            {
                Ok(values) => return Ok(values),
                Err(err) if err.is_retryable() => {
                    attempt = attempt.saturating_add(1);
                    let nominal = OUTER_RETRY_BASE_MS
                        .saturating_mul(1u64 << attempt.min(10))
                        .min(OUTER_RETRY_MAX_MS);
                    let delay = rand::rng().random_range(nominal / 2..=nominal);
                    tracing::warn!(
                        connector_class,
                        bin,
                        attempt,
                        delay_ms = delay,
                        error = %err,
                        "Bin allocation aborted, retrying"
                    );
                    if cancel.sleep(Duration::from_millis(delay)) {
                        return Err(BinError::Cancelled);
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Note that `count` more values will be asked for from this bin.
    ///
    /// # Errors
    ///
    /// `LockPoisoned` only.
    pub fn preload(&self, connector_class: &str, bin: &str, count: usize) -> Result<(), BinError> {
        let mut preloads = self.preloads()?;
        preloads
            .entry((connector_class.to_string(), bin.to_string()))
            .or_default()
            .requested += count;
        Ok(())
    }

    /// Take one value, fetching every outstanding preload request for the
    /// bin in a single allocation when none are buffered.
    ///
    /// # Errors
    ///
    /// As [`grab_next`](Self::grab_next).
    pub fn grab_preloaded(
        &self,
        connector_class: &str,
        bin: &str,
        bias: f64,
        cancel: &CancellationToken,
    ) -> Result<f64, BinError> {
        let key = (connector_class.to_string(), bin.to_string());
        let wanted = {
            let mut preloads = self.preloads()?;
            let entry = preloads.entry(key.clone()).or_default();
            if let Some(value) = entry.values.pop_front() {
                entry.requested = entry.requested.saturating_sub(1);
                return Ok(value);
            }
            let wanted = entry.requested.max(1);
            entry.requested = 0;
            wanted
        };

        // Allocated outside the lock; another thread may have refilled in
        // the meantime, which only means some values are used later.
        let values = self.grab_next(connector_class, bin, bias, wanted, cancel)?;
        let mut preloads = self.preloads()?;
        let entry = preloads.entry(key).or_default();
        entry.values.extend(values);
        entry.values.pop_front().ok_or(BinError::State(StateError::corrupt(
            "bin allocation returned no values",
        )))
    }

    /// Forget buffered values and the depth.
    pub fn reset(&self) {
        if let Ok(mut preloads) = self.preloaded.lock() {
            preloads.clear();
        }
        if let Ok(mut depth) = self.minimum_depth.lock() {
            *depth = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvester_state::SqliteStateBackend;

    fn tracker() -> BinFairnessTracker {
        BinFairnessTracker::new(Arc::new(SqliteStateBackend::in_memory().unwrap()))
    }

    #[test]
    fn bins_interleave() {
        let bins = tracker();
        let cancel = CancellationToken::new();
        let a = bins.grab_next("fs", "a", 0.0, 3, &cancel).unwrap();
        let b = bins.grab_next("fs", "b", 0.0, 3, &cancel).unwrap();
        assert_eq!(a, [0.0, 1.0, 2.0]);
        assert_eq!(b, [0.0, 1.0, 2.0]);
        assert_eq!(bins.grab_next("fs", "a", 0.0, 1, &cancel).unwrap(), [3.0]);
    }

    #[test]
    fn depth_lifts_new_bins_level_with_queued_work() {
        let bins = tracker();
        let cancel = CancellationToken::new();
        bins.assess_minimum_depth(Some(40.0)).unwrap();
        bins.assess_minimum_depth(Some(10.0)).unwrap();
        assert!((bins.minimum_depth() - 40.0).abs() < f64::EPSILON);
        assert_eq!(bins.grab_next("fs", "late", 0.0, 1, &cancel).unwrap(), [40.0]);
    }

    #[test]
    fn bias_pushes_starting_value_back() {
        let bins = tracker();
        let cancel = CancellationToken::new();
        assert_eq!(bins.grab_next("fs", "x", 5.0, 2, &cancel).unwrap(), [5.0, 6.0]);
    }

    #[test]
    fn preloads_are_served_from_one_allocation() {
        let bins = tracker();
        let cancel = CancellationToken::new();
        bins.preload("fs", "a", 3).unwrap();
        let got: Vec<f64> = (0..3)
            .map(|_| bins.grab_preloaded("fs", "a", 0.0, &cancel).unwrap())
            .collect();
        assert_eq!(got, [0.0, 1.0, 2.0]);
        // The counter moved by three in one step.
        assert_eq!(bins.grab_next("fs", "a", 0.0, 1, &cancel).unwrap(), [3.0]);
    }

    #[test]
    fn grab_preloaded_without_preload_takes_one() {
        let bins = tracker();
        let cancel = CancellationToken::new();
        assert!((bins.grab_preloaded("fs", "z", 0.0, &cancel).unwrap()).abs() < f64::EPSILON);
        assert_eq!(bins.grab_next("fs", "z", 0.0, 1, &cancel).unwrap(), [1.0]);
    }

    #[test]
    fn cancelled_grab_returns_cancelled() {
        let bins = tracker();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            bins.grab_next("fs", "a", 0.0, 1, &cancel),
            Err(BinError::Cancelled)
        ));
    }

    #[test]
    fn reset_clears_depth_and_buffers() {
        let bins = tracker();
        let cancel = CancellationToken::new();
        bins.assess_minimum_depth(Some(9.0)).unwrap();
        bins.preload("fs", "a", 4).unwrap();
        bins.grab_preloaded("fs", "a", 0.0, &cancel).unwrap();
        bins.reset();
        assert!(bins.minimum_depth().abs() < f64::EPSILON);
        // Buffered values 10..12 are gone; the counter continues after them.
        assert_eq!(bins.grab_preloaded("fs", "a", 0.0, &cancel).unwrap(), 13.0);
    }
}
