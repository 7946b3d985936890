//! Read-side store queries. No authorization here; the booking operations
//! in `reservations.rs` gate these.

use crate::model::*;

use super::conflict::conflicting_ids;
use super::{Engine, EngineError, SharedRoomState};

impl Engine {
    /// Reservations in `room_id` overlapping `[from, to]`, minus `exclude`.
    pub async fn conflicting_reservations(
        &self,
        room_id: RoomId,
        span: Span,
        exclude: Option<ReservationId>,
    ) -> Result<Vec<Reservation>, EngineError> {
        let rs = self
            .get_room_state(room_id)
            .ok_or(EngineError::room_not_found(room_id))?;
        let guard = rs.read().await;
        if guard.deleted {
            return Err(EngineError::room_not_found(room_id));
        }
        Ok(conflicting_ids(&guard, &span, exclude)
            .into_iter()
            .filter_map(|id| guard.get_reservation(id).copied())
            .collect())
    }

    /// Reservations in `room_id` with `to_reserve > now`, by start time.
    pub async fn future_reservations(&self, room_id: RoomId, now: Ms) -> Result<Vec<Reservation>, EngineError> {
        let rs = self
            .get_room_state(room_id)
            .ok_or(EngineError::room_not_found(room_id))?;
        let guard = rs.read().await;
        if guard.deleted {
            return Err(EngineError::room_not_found(room_id));
        }
        Ok(guard
            .reservations
            .iter()
            .filter(|r| r.span.end > now)
            .copied()
            .collect())
    }

    pub async fn reservations_by_owner(&self, owner_id: UserId) -> Vec<Reservation> {
        let mut found = self.collect_reservations(|r| r.owner_id == owner_id).await;
        found.sort_by_key(|r| r.id);
        found
    }

    pub async fn all_reservations(&self) -> Vec<Reservation> {
        let mut found = self.collect_reservations(|_| true).await;
        found.sort_by_key(|r| r.id);
        found
    }

    /// Non-throwing lookup.
    pub async fn get_reservation(&self, id: ReservationId) -> Option<Reservation> {
        let rs = self.get_room_state(self.room_for_reservation(id)?)?;
        let guard = rs.read().await;
        guard.get_reservation(id).copied()
    }

    async fn collect_reservations(&self, keep: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        let shared: Vec<SharedRoomState> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut found = Vec::new();
        for rs in shared {
            let guard = rs.read().await;
            found.extend(guard.reservations.iter().filter(|r| keep(r)).copied());
        }
        found
    }
}
