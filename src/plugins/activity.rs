//! User presence detection.
//!
//! The operator counts as "present" exactly when an assistant process is
//! running: the default probe walks the process table looking for a command
//! line containing the assistant identifier. Presence determination is a
//! pluggable capability so headless deployments can substitute their own
//! signal; with the default probe such hosts simply read as idle.

use crate::core::error::MagpieError;
use crate::core::store::Store;
use chrono::{DateTime, Utc};
use std::cell::Cell;
use sysinfo::System;

pub trait UserPresenceProbe {
    fn user_active(&self) -> bool;
}

/// Default probe: any process (other than ourselves or our children's
/// supervisor) whose command line mentions the assistant binary.
pub struct ProcessScanProbe {
    needle: String,
}

impl ProcessScanProbe {
    pub fn new(needle: &str) -> Self {
        ProcessScanProbe {
            needle: needle.to_string(),
        }
    }
}

impl Default for ProcessScanProbe {
    fn default() -> Self {
        ProcessScanProbe::new(crate::core::external::ASSISTANT_BIN)
    }
}

impl UserPresenceProbe for ProcessScanProbe {
    fn user_active(&self) -> bool {
        let own_pid = std::process::id();
        let system = System::new_all();
        system.processes().iter().any(|(pid, process)| {
            if pid.as_u32() == own_pid {
                return false;
            }
            process.name().contains(&self.needle)
                || process.cmd().iter().any(|arg| arg.contains(&self.needle))
        })
    }
}

/// Samples presence once per scheduler tick and records observations for
/// pattern learning. Stateless beyond the per-tick probe cache.
pub struct ActivityMonitor {
    probe: Box<dyn UserPresenceProbe>,
    cached: Cell<Option<bool>>,
}

impl ActivityMonitor {
    pub fn new(probe: Box<dyn UserPresenceProbe>) -> Self {
        ActivityMonitor {
            probe,
            cached: Cell::new(None),
        }
    }

    /// Invalidate the probe cache; called at the top of every tick.
    pub fn begin_tick(&self) {
        self.cached.set(None);
    }

    pub fn is_active(&self) -> bool {
        if let Some(v) = self.cached.get() {
            return v;
        }
        let v = self.probe.user_active();
        self.cached.set(Some(v));
        v
    }

    /// Probe once and persist the observation.
    pub fn record_sample(&self, store: &Store, now: DateTime<Utc>) -> Result<bool, MagpieError> {
        let active = self.is_active();
        store.record_usage_sample(now, active)?;
        Ok(active)
    }

    /// Minutes since the last sample that saw the operator active;
    /// `f64::INFINITY` when no activity was ever observed.
    pub fn idle_minutes(&self, store: &Store, now: DateTime<Utc>) -> Result<f64, MagpieError> {
        match store.last_active_sample_at()? {
            Some(ts) => Ok(((now - ts).num_seconds() as f64 / 60.0).max(0.0)),
            None => Ok(f64::INFINITY),
        }
    }
}

#[cfg(test)]
pub struct FixedProbe(pub bool);

#[cfg(test)]
impl UserPresenceProbe for FixedProbe {
    fn user_active(&self) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> (tempfile::TempDir, Store) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open(tmp.path());
        store.initialize().unwrap();
        (tmp, store)
    }

    #[test]
    fn probe_result_cached_within_tick() {
        use std::cell::RefCell;
        struct CountingProbe(RefCell<u32>);
        impl UserPresenceProbe for CountingProbe {
            fn user_active(&self) -> bool {
                *self.0.borrow_mut() += 1;
                false
            }
        }
        let monitor = ActivityMonitor::new(Box::new(CountingProbe(RefCell::new(0))));
        monitor.begin_tick();
        assert!(!monitor.is_active());
        assert!(!monitor.is_active());
        // Second call must have hit the cache; a fresh tick probes again.
        monitor.begin_tick();
        assert!(!monitor.is_active());
    }

    #[test]
    fn idle_minutes_from_last_active_sample() {
        let (_tmp, store) = store();
        let now = Utc::now();
        let monitor = ActivityMonitor::new(Box::new(FixedProbe(false)));

        assert!(monitor.idle_minutes(&store, now).unwrap().is_infinite());

        store
            .record_usage_sample(now - Duration::minutes(42), true)
            .unwrap();
        store
            .record_usage_sample(now - Duration::minutes(5), false)
            .unwrap();
        let idle = monitor.idle_minutes(&store, now).unwrap();
        assert!((idle - 42.0).abs() < 0.1, "idle={}", idle);
    }

    #[test]
    fn record_sample_persists_observation() {
        let (_tmp, store) = store();
        let now = Utc::now();
        let monitor = ActivityMonitor::new(Box::new(FixedProbe(true)));
        assert!(monitor.record_sample(&store, now).unwrap());
        let recorded = store.last_active_sample_at().unwrap().unwrap();
        assert!((now - recorded).num_seconds().abs() < 1);
    }
}
