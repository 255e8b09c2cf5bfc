use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only instant type.
pub type Ms = i64;

/// Minute of the salon-local day, `0..1440`.
pub type Minutes = u16;

pub const MINUTES_PER_DAY: Minutes = 1440;

/// Set of working weekdays as a bitmask (bit 0 = Monday).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, day: Weekday) {
        self.0 |= 1 << day.num_days_from_monday();
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Days in Monday-first order.
    pub fn days(&self) -> Vec<Weekday> {
        [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ]
        .into_iter()
        .filter(|d| self.contains(*d))
        .collect()
    }
}

impl FromIterator<Weekday> for WeekdaySet {
    fn from_iter<I: IntoIterator<Item = Weekday>>(iter: I) -> Self {
        let mut set = Self::empty();
        for day in iter {
            set.insert(day);
        }
        set
    }
}

/// A salon's weekly working calendar. Validated before every write; the
/// engine is the single source of truth for these invariants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalonSchedule {
    pub working_days: WeekdaySet,
    pub start_time: Minutes,
    pub end_time: Minutes,
    pub break_start_time: Minutes,
    pub break_end_time: Minutes,
    /// Slot length in minutes.
    pub slot_duration: u16,
    /// Max concurrent active bookings per slot window.
    pub max_bookings_per_slot: u32,
}

impl SalonSchedule {
    /// Check `start < break_start <= break_end < end` plus positivity.
    /// Returns the name of the violated invariant.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.end_time > MINUTES_PER_DAY
            || self.start_time >= MINUTES_PER_DAY
            || self.break_start_time >= MINUTES_PER_DAY
            || self.break_end_time > MINUTES_PER_DAY
        {
            return Err("time of day out of range");
        }
        if self.slot_duration == 0 {
            return Err("slot_duration must be positive");
        }
        if self.max_bookings_per_slot == 0 {
            return Err("max_bookings_per_slot must be at least 1");
        }
        if self.start_time >= self.break_start_time {
            return Err("start_time must be before break_start_time");
        }
        if self.break_start_time > self.break_end_time {
            return Err("break_start_time must not be after break_end_time");
        }
        if self.break_end_time >= self.end_time {
            return Err("break_end_time must be before end_time");
        }
        Ok(())
    }

    /// Zero-length break means no break.
    pub fn has_break(&self) -> bool {
        self.break_start_time < self.break_end_time
    }

    pub fn is_working_day(&self, date: NaiveDate) -> bool {
        self.working_days.contains(date.weekday())
    }
}

/// A bookable window derived from a schedule for one date. Never persisted
/// on its own; identity is `(salon_id, date, start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotWindow {
    pub date: NaiveDate,
    pub start: Minutes,
    pub end: Minutes,
}

impl SlotWindow {
    pub fn new(date: NaiveDate, start: Minutes, end: Minutes) -> Self {
        debug_assert!(start < end, "SlotWindow start must be before end");
        Self { date, start, end }
    }

    pub fn duration(&self) -> u16 {
        self.end - self.start
    }

    /// True if `[self.start, self.end)` intersects `[start, end)`.
    pub fn intersects(&self, start: Minutes, end: Minutes) -> bool {
        self.start < end && start < self.end
    }

    pub fn key(&self, salon_id: Ulid) -> SlotKey {
        SlotKey {
            salon_id,
            date: self.date,
            start: self.start,
        }
    }
}

/// Ledger key: one serialization unit per slot window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub salon_id: Ulid,
    pub date: NaiveDate,
    pub start: Minutes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Requested,
    Confirmed,
    Cancelled,
    Expired,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Requested => "requested",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BookingStatus::Requested)
    }
}

/// One capacity unit claimed in a slot window. Written only by the allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub salon_id: Ulid,
    pub window: SlotWindow,
    pub customer_id: Ulid,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub held_until: Ms,
}

impl Booking {
    /// Whether this booking counts against capacity from a reader's view:
    /// Confirmed, or Requested with a live hold. Availability treats a
    /// lapsed hold as free; the allocator records the expiry transition
    /// before admitting a booking into the freed unit.
    pub fn is_active(&self, now: Ms) -> bool {
        match self.status {
            BookingStatus::Confirmed => true,
            BookingStatus::Requested => self.held_until > now,
            BookingStatus::Cancelled | BookingStatus::Expired => false,
        }
    }
}

/// All booking attempts against one slot window, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct SlotLedger {
    pub bookings: Vec<Booking>,
}

impl SlotLedger {
    pub fn active_count(&self, now: Ms) -> u32 {
        self.bookings.iter().filter(|b| b.is_active(now)).count() as u32
    }

    /// Bookings in a capacity-holding status, lapsed or not. The allocator
    /// checks this count so `Requested + Confirmed <= capacity` holds on
    /// the raw statuses, not just the time-adjusted view.
    pub fn booked_count(&self) -> u32 {
        self.bookings
            .iter()
            .filter(|b| {
                matches!(
                    b.status,
                    BookingStatus::Requested | BookingStatus::Confirmed
                )
            })
            .count() as u32
    }

    pub fn confirmed_count(&self) -> u32 {
        self.bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Confirmed)
            .count() as u32
    }

    pub fn find(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn find_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }
}

/// Per-salon schedule state guarded by the schedule lock. The version is
/// mirrored in an atomic on the owning `Salon` for lock-free reads.
#[derive(Debug, Clone)]
pub struct SalonState {
    pub id: Ulid,
    pub schedule: SalonSchedule,
    pub version: u64,
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ScheduleSet {
        salon_id: Ulid,
        working_days: WeekdaySet,
        start_time: Minutes,
        end_time: Minutes,
        break_start_time: Minutes,
        break_end_time: Minutes,
        slot_duration: u16,
        max_bookings_per_slot: u32,
        version: u64,
    },
    BookingRequested {
        id: Ulid,
        salon_id: Ulid,
        date: NaiveDate,
        start: Minutes,
        end: Minutes,
        customer_id: Ulid,
        created_at: Ms,
        held_until: Ms,
    },
    BookingConfirmed {
        id: Ulid,
        salon_id: Ulid,
    },
    BookingCancelled {
        id: Ulid,
        salon_id: Ulid,
    },
    BookingExpired {
        id: Ulid,
        salon_id: Ulid,
    },
}

impl Event {
    pub fn salon_id(&self) -> Ulid {
        match self {
            Event::ScheduleSet { salon_id, .. }
            | Event::BookingRequested { salon_id, .. }
            | Event::BookingConfirmed { salon_id, .. }
            | Event::BookingCancelled { salon_id, .. }
            | Event::BookingExpired { salon_id, .. } => *salon_id,
        }
    }

    pub fn schedule_set(salon_id: Ulid, schedule: &SalonSchedule, version: u64) -> Self {
        Event::ScheduleSet {
            salon_id,
            working_days: schedule.working_days,
            start_time: schedule.start_time,
            end_time: schedule.end_time,
            break_start_time: schedule.break_start_time,
            break_end_time: schedule.break_end_time,
            slot_duration: schedule.slot_duration,
            max_bookings_per_slot: schedule.max_bookings_per_slot,
            version,
        }
    }

    pub fn booking_requested(booking: &Booking) -> Self {
        Event::BookingRequested {
            id: booking.id,
            salon_id: booking.salon_id,
            date: booking.window.date,
            start: booking.window.start,
            end: booking.window.end,
            customer_id: booking.customer_id,
            created_at: booking.created_at,
            held_until: booking.held_until,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAvailability {
    pub window: SlotWindow,
    pub remaining: u32,
}
