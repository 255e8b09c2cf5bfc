use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, NaiveDate};

use crate::model::{Minutes, Ms, SlotWindow};

/// Time source injected into the engine. All "now" comparisons go through
/// this so behavior is reproducible in tests.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Ms;
}

/// Wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Ms {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as Ms
    }
}

/// Hand-advanced clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: Ms) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: Ms) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, delta: Ms) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Ms {
        self.now.load(Ordering::SeqCst)
    }
}

/// Calendar date of an instant. Salon-local time is the engine clock's
/// calendar; no timezone conversion anywhere.
pub fn date_of(ms: Ms) -> NaiveDate {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.date_naive())
        .unwrap_or(NaiveDate::MIN)
}

/// Instant of a given minute-of-day on a date.
pub fn instant_of(date: NaiveDate, minute: Minutes) -> Ms {
    // Minute-of-day is validated below 1440 everywhere it is produced.
    let time = chrono::NaiveTime::from_num_seconds_from_midnight_opt(u32::from(minute) * 60, 0)
        .expect("minute-of-day below 1440");
    date.and_time(time).and_utc().timestamp_millis()
}

/// Instant at which a slot window opens.
pub fn slot_start_ms(window: &SlotWindow) -> Ms {
    instant_of(window.date, window.start)
}
