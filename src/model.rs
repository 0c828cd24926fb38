use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds.
pub type Ms = i64;

pub type ActorId = Ulid;
pub type SlotId = Ulid;
pub type BookingId = Ulid;

// ── Money ────────────────────────────────────────────────────────

/// Fixed-point amount in cents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(i64);

impl Money {
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub const fn cents(self) -> i64 {
        self.0
    }

    /// Parse a non-negative decimal amount with at most two fractional digits
    /// (`"50"`, `"49.5"`, `"49.50"`).
    pub fn parse(input: &str) -> Result<Self, ParseMoneyError> {
        let s = input.trim();
        let bad = || ParseMoneyError(input.to_string());
        let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
        if (whole.is_empty() && frac.is_empty())
            || frac.len() > 2
            || !whole.bytes().all(|b| b.is_ascii_digit())
            || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(bad());
        }
        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| bad())?
        };
        let frac: i64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().map_err(|_| bad())? * 10,
            _ => frac.parse().map_err(|_| bad())?,
        };
        whole
            .checked_mul(100)
            .and_then(|c| c.checked_add(frac))
            .map(Self)
            .ok_or_else(bad)
    }

    /// Prorate an hourly rate over `minutes`, rounded down to the cent.
    pub fn for_minutes(hourly: Money, minutes: i64) -> Money {
        Money(hourly.0.saturating_mul(minutes) / 60)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseMoneyError(pub String);

impl fmt::Display for ParseMoneyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid amount: {:?}", self.0)
    }
}

impl std::error::Error for ParseMoneyError {}

// ── TimeRange ────────────────────────────────────────────────────

/// Half-open interval `[start, end)` on a single calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeRange {
    date: NaiveDate,
    start: NaiveTime,
    end: NaiveTime,
}

impl TimeRange {
    pub fn new(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Result<Self, InvalidRange> {
        if start >= end {
            return Err(InvalidRange { start, end });
        }
        Ok(Self { date, start, end })
    }

    /// Construct from bounds already known to be ordered (sub-ranges of a valid range).
    pub(crate) fn within(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "TimeRange start must be before end");
        Self { date, start, end }
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn start(&self) -> NaiveTime {
        self.start
    }

    pub fn end(&self) -> NaiveTime {
        self.end
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    /// Strict overlap: abutting ranges do not overlap.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.date == other.date && self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains(&self, other: &TimeRange) -> bool {
        self.date == other.date && self.start <= other.start && other.end <= self.end
    }

    /// Wall-clock start as Unix ms. Dates and times are provider-local and
    /// compared against the clock as if they were UTC.
    pub fn start_ms(&self) -> Ms {
        self.date.and_time(self.start).and_utc().timestamp_millis()
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}-{}",
            self.date,
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid range: start {} is not before end {}",
            self.start.format("%H:%M:%S"),
            self.end.format("%H:%M:%S")
        )
    }
}

impl std::error::Error for InvalidRange {}

// ── DateWindow ───────────────────────────────────────────────────

/// Half-open window of calendar dates `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date.succ_opt().unwrap_or(date),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }

    pub fn len_days(&self) -> i64 {
        (self.end - self.start).num_days().max(0)
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d < end)
    }
}

/// 0 = Sunday … 6 = Saturday.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

// ── Actors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Publishes availability.
    Provider,
    /// Books provider time.
    Requester,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Provider => f.write_str("provider"),
            Role::Requester => f.write_str("requester"),
        }
    }
}

/// Verified caller identity, passed explicitly into every engine call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: ActorId,
    pub role: Role,
}

impl Actor {
    pub fn provider(id: ActorId) -> Self {
        Self { id, role: Role::Provider }
    }

    pub fn requester(id: ActorId) -> Self {
        Self { id, role: Role::Requester }
    }
}

// ── Slots, rules, bookings ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilitySlot {
    pub id: SlotId,
    pub provider_id: ActorId,
    pub range: TimeRange,
    pub hourly_rate: Money,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyScheduleRule {
    pub provider_id: ActorId,
    /// 0 = Sunday … 6 = Saturday.
    pub day_of_week: u8,
    pub enabled: bool,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub hourly_rate: Money,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub slot_id: SlotId,
    pub requester_id: ActorId,
    pub range: TimeRange,
    pub status: BookingStatus,
    pub created_at: Ms,
}

impl Booking {
    /// Pending and Confirmed bookings occupy their range; Cancelled ones do not.
    pub fn is_active(&self) -> bool {
        !matches!(self.status, BookingStatus::Cancelled)
    }
}

/// Flat event enum. This is the WAL record format and the
/// payload broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotCreated {
        slot: AvailabilitySlot,
    },
    SlotRemoved {
        id: SlotId,
        provider_id: ActorId,
    },
    ScheduleReplaced {
        provider_id: ActorId,
        rules: Vec<WeeklyScheduleRule>,
    },
    BookingConfirmed {
        booking: Booking,
        provider_id: ActorId,
    },
    BookingCancelled {
        id: BookingId,
        slot_id: SlotId,
        requester_id: ActorId,
        provider_id: ActorId,
        cancelled_by: ActorId,
        at: Ms,
    },
    /// Old booking cancelled and replacement confirmed in one record.
    BookingRescheduled {
        from: BookingId,
        from_slot: SlotId,
        from_provider_id: ActorId,
        booking: Booking,
        provider_id: ActorId,
        at: Ms,
    },
}

impl Event {
    /// Provider whose availability the event touches.
    pub fn provider_id(&self) -> ActorId {
        match self {
            Event::SlotCreated { slot } => slot.provider_id,
            Event::SlotRemoved { provider_id, .. }
            | Event::ScheduleReplaced { provider_id, .. }
            | Event::BookingConfirmed { provider_id, .. }
            | Event::BookingCancelled { provider_id, .. }
            | Event::BookingRescheduled { provider_id, .. } => *provider_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn t(s: &str) -> NaiveTime {
        NaiveTime::parse_from_str(s, "%H:%M").unwrap()
    }

    fn r(date: &str, start: &str, end: &str) -> TimeRange {
        TimeRange::new(d(date), t(start), t(end)).unwrap()
    }

    #[test]
    fn range_rejects_empty_and_inverted() {
        assert!(TimeRange::new(d("2026-11-02"), t("10:00"), t("10:00")).is_err());
        let err = TimeRange::new(d("2026-11-02"), t("11:00"), t("10:00")).unwrap_err();
        assert_eq!(err.start, t("11:00"));
        assert!(err.to_string().contains("not before"));
    }

    #[test]
    fn range_duration() {
        assert_eq!(r("2026-11-02", "09:00", "17:00").duration_minutes(), 480);
        assert_eq!(r("2026-11-02", "09:15", "09:45").duration_minutes(), 30);
    }

    #[test]
    fn range_overlap_is_strict() {
        let a = r("2026-11-02", "09:00", "10:00");
        let b = r("2026-11-02", "09:30", "10:30");
        let c = r("2026-11-02", "10:00", "11:00");
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // abutting
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn range_overlap_requires_same_date() {
        let a = r("2026-11-02", "09:00", "10:00");
        let b = r("2026-11-03", "09:00", "10:00");
        assert!(!a.overlaps(&b));
        assert!(!a.contains(&b));
    }

    #[test]
    fn range_contains() {
        let outer = r("2026-11-02", "09:00", "17:00");
        assert!(outer.contains(&r("2026-11-02", "09:00", "10:00")));
        assert!(outer.contains(&outer));
        assert!(!outer.contains(&r("2026-11-02", "08:30", "09:30")));
        assert!(!r("2026-11-02", "09:00", "10:00").contains(&r("2026-11-02", "09:30", "10:30")));
    }

    #[test]
    fn range_start_ms_uses_wall_clock() {
        let range = r("1970-01-02", "01:00", "02:00");
        assert_eq!(range.start_ms(), 25 * 3_600_000);
    }

    #[test]
    fn money_parse_and_display() {
        assert_eq!(Money::parse("50").unwrap(), Money::from_cents(5000));
        assert_eq!(Money::parse("49.5").unwrap(), Money::from_cents(4950));
        assert_eq!(Money::parse(" 49.05 ").unwrap(), Money::from_cents(4905));
        assert_eq!(Money::parse(".75").unwrap(), Money::from_cents(75));
        assert!(Money::parse("").is_err());
        assert!(Money::parse("1.234").is_err());
        assert!(Money::parse("-5").is_err());
        assert!(Money::parse("abc").is_err());
        assert_eq!(Money::from_cents(4905).to_string(), "49.05");
    }

    #[test]
    fn money_prorates_hourly_rate() {
        let rate = Money::from_cents(5000);
        assert_eq!(Money::for_minutes(rate, 60), Money::from_cents(5000));
        assert_eq!(Money::for_minutes(rate, 30), Money::from_cents(2500));
        assert_eq!(Money::for_minutes(Money::from_cents(100), 1), Money::from_cents(1));
    }

    #[test]
    fn window_iterates_half_open() {
        let w = DateWindow::new(d("2026-11-01"), d("2026-11-04"));
        let days: Vec<_> = w.days().collect();
        assert_eq!(days, vec![d("2026-11-01"), d("2026-11-02"), d("2026-11-03")]);
        assert_eq!(w.len_days(), 3);
        assert!(w.contains(d("2026-11-03")));
        assert!(!w.contains(d("2026-11-04")));
        assert_eq!(DateWindow::single(d("2026-11-01")).days().count(), 1);
    }

    #[test]
    fn day_of_week_starts_on_sunday() {
        assert_eq!(day_of_week(d("2026-11-01")), 0); // Sunday
        assert_eq!(day_of_week(d("2026-11-02")), 1); // Monday
        assert_eq!(day_of_week(d("2026-11-07")), 6); // Saturday
    }

    #[test]
    fn cancelled_booking_is_inactive() {
        let mut b = Booking {
            id: Ulid::new(),
            slot_id: Ulid::new(),
            requester_id: Ulid::new(),
            range: r("2026-11-02", "10:00", "11:00"),
            status: BookingStatus::Pending,
            created_at: 0,
        };
        assert!(b.is_active());
        b.status = BookingStatus::Confirmed;
        assert!(b.is_active());
        b.status = BookingStatus::Cancelled;
        assert!(!b.is_active());
    }

    #[test]
    fn event_survives_wal_encoding() {
        let event = Event::SlotCreated {
            slot: AvailabilitySlot {
                id: Ulid::new(),
                provider_id: Ulid::new(),
                range: r("2026-11-02", "09:00", "17:00"),
                hourly_rate: Money::from_cents(5000),
                created_at: 1_700_000_000_000,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
