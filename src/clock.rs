//! Timestamps and the pull-based policy clock
//!
//! Time-driven rules (auto-consent, expiry, SLA flags) are computed at read
//! time against a [`Clock`], never via background timers. Production code
//! uses [`SystemClock`]; tests inject a [`FixedClock`] and advance it by
//! hand, which makes every time-dependent decision replayable.

use chrono::{DateTime, TimeZone, Utc};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp(DateTime<Utc>);

impl TimeStamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .unwrap()
            .into()
    }

    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn plus_days(&self, days: i64) -> Self {
        Self(self.0 + chrono::Duration::days(days))
    }

    pub fn minus_days(&self, days: i64) -> Self {
        Self(self.0 - chrono::Duration::days(days))
    }
}

impl From<DateTime<Utc>> for TimeStamp {
    fn from(value: DateTime<Utc>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// Read-only time source. `elapsed_days` truncates toward zero, so a window
/// "expires" strictly after the full number of days has passed.
pub trait Clock: Send + Sync {
    fn now(&self) -> TimeStamp;

    fn elapsed_days(&self, since: &TimeStamp) -> i64 {
        (self.now().to_datetime_utc() - since.to_datetime_utc()).num_days()
    }

    fn has_expired(&self, since: &TimeStamp, window_days: i64) -> bool {
        self.elapsed_days(since) > window_days
    }
}

// lets callers keep a handle on an injected clock (advance it mid-test)
// while the engine owns another
impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> TimeStamp {
        (**self).now()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimeStamp {
        TimeStamp::now()
    }
}

/// Settable clock for tests. Interior mutability so a test can advance time
/// without re-building the engine that holds it.
#[derive(Debug)]
pub struct FixedClock {
    now: std::sync::Mutex<TimeStamp>,
}

impl FixedClock {
    pub fn new(now: TimeStamp) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    pub fn set(&self, now: TimeStamp) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance_days(&self, days: i64) {
        let mut guard = self.now.lock().unwrap();
        *guard = guard.plus_days(days);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> TimeStamp {
        self.now.lock().unwrap().clone()
    }
}
