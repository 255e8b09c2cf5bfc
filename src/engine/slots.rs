use chrono::NaiveDate;

use crate::model::{SalonSchedule, SlotWindow};

// ── Slot generation ──────────────────────────────────────────────

/// Derive the bookable windows of `schedule` on `date`. Pure and
/// deterministic: same inputs always yield the same sequence.
///
/// The cursor walks from `start_time` in `slot_duration` steps. A candidate
/// window that intersects a non-empty break is dropped whole (never
/// truncated) and the cursor resumes at `break_end_time`; a final partial
/// slot is dropped. A closed weekday yields nothing.
pub fn generate(schedule: &SalonSchedule, date: NaiveDate) -> Vec<SlotWindow> {
    if !schedule.is_working_day(date) {
        return Vec::new();
    }

    let dur = u32::from(schedule.slot_duration);
    let end_of_day = u32::from(schedule.end_time);
    let mut windows = Vec::new();
    let mut cursor = u32::from(schedule.start_time);

    while cursor + dur <= end_of_day {
        let window = SlotWindow::new(date, cursor as u16, (cursor + dur) as u16);
        if schedule.has_break()
            && window.intersects(schedule.break_start_time, schedule.break_end_time)
        {
            cursor = u32::from(schedule.break_end_time);
            continue;
        }
        windows.push(window);
        cursor += dur;
    }

    windows
}

/// True if `window` is one of the windows `schedule` generates for its date.
/// Used by the allocator to reject stale windows after a schedule edit.
pub fn contains_window(schedule: &SalonSchedule, window: &SlotWindow) -> bool {
    generate(schedule, window.date).iter().any(|w| w == window)
}
