use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Shape checks on a candidate interval. `future_start` is set only when the
/// request carries a new `from_reserve`; stored starts are never re-checked
/// against the clock.
pub(crate) fn validate_interval(span: &Span, future_start: bool, now: Ms) -> Result<(), EngineError> {
    if !span.is_ordered() {
        return Err(EngineError::IntervalInvalid(
            "from_reserve must be strictly before to_reserve",
        ));
    }
    if future_start && span.start <= now {
        return Err(EngineError::IntervalInvalid("from_reserve must be in the future"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_RESERVATION_DURATION_MS {
        return Err(EngineError::LimitExceeded("reservation too long"));
    }
    Ok(())
}

/// Ids of reservations in `rs` overlapping `span`, skipping `exclude`.
pub(crate) fn conflicting_ids(
    rs: &RoomState,
    span: &Span,
    exclude: Option<ReservationId>,
) -> Vec<ReservationId> {
    rs.overlapping(span)
        .filter(|r| Some(r.id) != exclude)
        .map(|r| r.id)
        .collect()
}

pub(crate) fn check_no_conflict(
    rs: &RoomState,
    span: &Span,
    exclude: Option<ReservationId>,
) -> Result<(), EngineError> {
    let conflicting = conflicting_ids(rs, span, exclude);
    if conflicting.is_empty() {
        return Ok(());
    }
    metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
    Err(EngineError::IntervalConflict {
        room_id: rs.room.id,
        conflicting,
    })
}
