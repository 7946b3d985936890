//! Who may do what. Pure functions over `Identity`; no locking.

use crate::model::{Identity, Reservation};

use super::EngineError;

/// Every operation needs a live account.
pub(crate) fn require_active(identity: &Identity) -> Result<(), EngineError> {
    if identity.is_active {
        Ok(())
    } else {
        Err(EngineError::Unauthenticated)
    }
}

pub(crate) fn require_admin(identity: &Identity) -> Result<(), EngineError> {
    require_active(identity)?;
    if identity.is_superuser {
        Ok(())
    } else {
        Err(EngineError::Forbidden("administrator privileges required"))
    }
}

pub fn can_modify(reservation: &Reservation, requester: &Identity) -> bool {
    requester.is_superuser || reservation.owner_id == requester.id
}

pub(crate) fn require_can_modify(
    reservation: &Reservation,
    requester: &Identity,
) -> Result<(), EngineError> {
    if can_modify(reservation, requester) {
        Ok(())
    } else {
        Err(EngineError::Forbidden("only the owner or an administrator may change this reservation"))
    }
}
