use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, NaiveDate};

use crate::model::Ms;

/// Injected time source. Decides which slots are still bookable, the default
/// expansion window and the change cutoff.
pub trait Clock: Send + Sync {
    fn now(&self) -> Ms;

    fn today(&self) -> NaiveDate {
        DateTime::from_timestamp_millis(self.now())
            .map(|dt| dt.date_naive())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Ms {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as Ms)
            .unwrap_or(0)
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug, Default)]
pub struct FixedClock {
    now: AtomicI64,
}

impl FixedClock {
    pub fn new(now: Ms) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    /// Clock pinned to midnight of `date`.
    pub fn at_date(date: NaiveDate) -> Self {
        Self::new(date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc().timestamp_millis())
    }

    pub fn set(&self, now: Ms) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Ms) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Ms {
        self.now.load(Ordering::SeqCst)
    }
}
