use tracing::{debug, info};

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, now_ms, validate_interval};
use super::policy::{require_active, require_admin, require_can_modify};
use super::{Engine, EngineError};

impl Engine {
    pub async fn create_reservation(
        &self,
        identity: &Identity,
        room_id: RoomId,
        from_reserve: Ms,
        to_reserve: Ms,
    ) -> Result<Reservation, EngineError> {
        self.create_reservation_at(identity, room_id, Span::new(from_reserve, to_reserve), now_ms())
            .await
    }

    pub(super) async fn create_reservation_at(
        &self,
        identity: &Identity,
        room_id: RoomId,
        span: Span,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        require_active(identity)?;
        validate_interval(&span, true, now)?;

        let _gate = self.begin_write().await;
        let rs = self
            .get_room_state(room_id)
            .ok_or(EngineError::room_not_found(room_id))?;
        let mut guard = rs.write().await;
        if guard.deleted {
            return Err(EngineError::room_not_found(room_id));
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many reservations in meeting room"));
        }
        if let Err(e) = check_no_conflict(&guard, &span, None) {
            debug!("reservation in room {room_id} rejected: {e}");
            return Err(e);
        }

        let reservation = Reservation {
            id: self.next_reservation_id(),
            room_id,
            owner_id: identity.id,
            span,
        };
        let event = Event::ReservationCreated {
            id: reservation.id,
            room_id,
            owner_id: identity.id,
            span,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(
            "reservation {} created in room {room_id} by user {}",
            reservation.id, identity.id
        );
        Ok(reservation)
    }

    pub async fn update_reservation(
        &self,
        identity: &Identity,
        id: ReservationId,
        patch: ReservationPatch,
    ) -> Result<Reservation, EngineError> {
        self.update_reservation_at(identity, id, patch, now_ms()).await
    }

    pub(super) async fn update_reservation_at(
        &self,
        identity: &Identity,
        id: ReservationId,
        patch: ReservationPatch,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        require_active(identity)?;

        let _gate = self.begin_write().await;
        let (existing, mut guard) = self.resolve_reservation_write(id).await?;
        require_can_modify(&existing, identity)?;
        if patch.is_empty() {
            return Ok(existing);
        }

        let span = patch.apply(existing.span);
        validate_interval(&span, patch.from_reserve.is_some(), now)?;
        if let Err(e) = check_no_conflict(&guard, &span, Some(id)) {
            debug!("update of reservation {id} rejected: {e}");
            return Err(e);
        }

        let event = Event::ReservationUpdated {
            id,
            room_id: existing.room_id,
            span,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("reservation {id} moved to [{}, {}]", span.start, span.end);
        Ok(Reservation { span, ..existing })
    }

    pub async fn delete_reservation(
        &self,
        identity: &Identity,
        id: ReservationId,
    ) -> Result<Reservation, EngineError> {
        require_active(identity)?;

        let _gate = self.begin_write().await;
        let (existing, mut guard) = self.resolve_reservation_write(id).await?;
        require_can_modify(&existing, identity)?;

        let event = Event::ReservationDeleted {
            id,
            room_id: existing.room_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("reservation {id} deleted by user {}", identity.id);
        Ok(existing)
    }

    // ── Reads ────────────────────────────────────────────

    /// Reservations of a room that have not ended yet.
    pub async fn list_future_reservations_for_room(
        &self,
        identity: &Identity,
        room_id: RoomId,
    ) -> Result<Vec<Reservation>, EngineError> {
        require_active(identity)?;
        self.future_reservations(room_id, now_ms()).await
    }

    pub async fn list_all_reservations(&self, identity: &Identity) -> Result<Vec<Reservation>, EngineError> {
        require_admin(identity)?;
        Ok(self.all_reservations().await)
    }

    pub async fn list_my_reservations(&self, identity: &Identity) -> Result<Vec<Reservation>, EngineError> {
        require_active(identity)?;
        Ok(self.reservations_by_owner(identity.id).await)
    }
}
