use std::time::Duration;

use crate::limits::*;
use crate::model::*;

use super::{EngineError, SlotLedger};

/// The requested range must lie inside the slot.
pub(crate) fn check_within(slot: &AvailabilitySlot, requested: &TimeRange) -> Result<(), EngineError> {
    if !slot.range.contains(requested) {
        return Err(EngineError::OutOfBounds {
            slot_id: slot.id,
            slot_range: slot.range,
            requested: *requested,
        });
    }
    Ok(())
}

/// Re-check under exclusivity. `ignoring` excludes a booking being moved.
pub(crate) fn check_free(
    ledger: &SlotLedger,
    requested: &TimeRange,
    ignoring: Option<BookingId>,
) -> Result<(), EngineError> {
    if let Some(existing) = ledger.first_conflict(requested, ignoring) {
        return Err(EngineError::SlotConflict(existing));
    }
    if ledger.active().count() >= MAX_BOOKINGS_PER_SLOT {
        return Err(EngineError::LimitExceeded("too many bookings on slot"));
    }
    Ok(())
}

/// Changes are refused once the booking is closer than `cutoff` to its start.
pub(crate) fn check_change_window(booking: &Booking, now: Ms, cutoff: Duration) -> Result<(), EngineError> {
    let cutoff_ms = cutoff.as_millis() as Ms;
    if booking.range.start_ms() - now < cutoff_ms {
        return Err(EngineError::ChangeWindowClosed(booking.id));
    }
    Ok(())
}

pub(crate) fn validate_query_window(window: &DateWindow) -> Result<(), EngineError> {
    if window.len_days() > MAX_QUERY_WINDOW_DAYS {
        return Err(EngineError::LimitExceeded("date window too wide"));
    }
    Ok(())
}

pub(crate) fn validate_expansion_window(window: &DateWindow) -> Result<(), EngineError> {
    if window.len_days() > MAX_EXPANSION_DAYS {
        return Err(EngineError::LimitExceeded("expansion window too wide"));
    }
    Ok(())
}
