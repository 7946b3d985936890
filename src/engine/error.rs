use crate::model::{ReservationId, RoomId};

/// What a `NotFound` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Room,
    Reservation,
    User,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entity::Room => f.write_str("meeting room"),
            Entity::Reservation => f.write_str("reservation"),
            Entity::User => f.write_str("user"),
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    NotFound { entity: Entity, id: i64 },
    DuplicateName(String),
    DuplicateEmail(String),
    /// `from >= to`, or `from <= now`.
    IntervalInvalid(&'static str),
    IntervalConflict {
        room_id: RoomId,
        conflicting: Vec<ReservationId>,
    },
    Forbidden(&'static str),
    Unauthenticated,
    /// Request shape rejected before any lookup (empty name, weak password, ...).
    Invalid(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn room_not_found(id: RoomId) -> Self {
        EngineError::NotFound { entity: Entity::Room, id }
    }

    pub fn reservation_not_found(id: ReservationId) -> Self {
        EngineError::NotFound { entity: Entity::Reservation, id }
    }

    pub fn user_not_found(id: i64) -> Self {
        EngineError::NotFound { entity: Entity::User, id }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "not_found",
            EngineError::DuplicateName(_) => "duplicate_name",
            EngineError::DuplicateEmail(_) => "duplicate_email",
            EngineError::IntervalInvalid(_) => "interval_invalid",
            EngineError::IntervalConflict { .. } => "interval_conflict",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::Unauthenticated => "unauthenticated",
            EngineError::Invalid(_) => "invalid",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound { entity, id } => write!(f, "{entity} {id} not found"),
            EngineError::DuplicateName(name) => {
                write!(f, "a meeting room named {name:?} already exists")
            }
            EngineError::DuplicateEmail(email) => {
                write!(f, "a user with e-mail {email:?} already exists")
            }
            EngineError::IntervalInvalid(reason) => write!(f, "invalid interval: {reason}"),
            EngineError::IntervalConflict { room_id, conflicting } => {
                write!(
                    f,
                    "meeting room {room_id} is already booked for this interval (reservations {conflicting:?})"
                )
            }
            EngineError::Forbidden(reason) => write!(f, "forbidden: {reason}"),
            EngineError::Unauthenticated => write!(f, "not authenticated"),
            EngineError::Invalid(reason) => write!(f, "invalid request: {reason}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
