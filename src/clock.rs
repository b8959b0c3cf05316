//! Time source shared by the cache, journal, and inode table.
//!
//! Two clocks drive the engine: a microsecond clock (since process start)
//! for access times and flush thresholds, and a millisecond-since-epoch
//! clock for inode creation stamps. In test mode both are replaced by a
//! single counter that increments on every call, which makes access-time
//! ordering and threshold arithmetic reproducible.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug)]
enum Source {
    Real { startup: Instant },
    Counter { tick: Cell<u64> },
}

/// Cloneable handle to the engine's time source.
#[derive(Clone, Debug)]
pub struct Clock(Rc<Source>);

impl Clock {
    /// Wall-clock time source. Microseconds are measured from this call.
    pub fn real() -> Self {
        Clock(Rc::new(Source::Real {
            startup: Instant::now(),
        }))
    }

    /// Deterministic counter. Every call to either accessor returns the
    /// next integer, shared across all clones of the handle.
    pub fn counter() -> Self {
        Clock(Rc::new(Source::Counter { tick: Cell::new(0) }))
    }

    /// Microseconds since startup, or the next counter value.
    pub fn now(&self) -> u64 {
        match &*self.0 {
            Source::Real { startup } => startup.elapsed().as_micros() as u64,
            Source::Counter { tick } => {
                tick.set(tick.get() + 1);
                tick.get()
            }
        }
    }

    /// Milliseconds since the Unix epoch, or the next counter value.
    /// Used for inode creation times.
    pub fn now_epoch_ms(&self) -> u64 {
        match &*self.0 {
            Source::Real { .. } => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            Source::Counter { tick } => {
                tick.set(tick.get() + 1);
                tick.get()
            }
        }
    }
}
