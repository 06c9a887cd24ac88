//! ---
//! kormit_section: "01-core-functionality"
//! kormit_subsection: "module"
//! kormit_type: "source"
//! kormit_scope: "code"
//! kormit_description: "Shared primitives and utilities for the control plane."
//! kormit_version: "v0.0.0-prealpha"
//! kormit_owner: "tbd"
//! ---
use std::fmt::Debug;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;

/// Source of wall-clock timestamps stamped onto entities.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward by `delta`.
    pub fn advance(&self, delta: ChronoDuration) {
        let mut now = self.now.lock();
        *now += delta;
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock() = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
