use serde::{Deserialize, Serialize};

/// Unix milliseconds. Timestamps carry no zone.
pub type Ms = i64;

pub type RoomId = i64;
pub type ReservationId = i64;
pub type UserId = i64;

/// Closed interval `[start, end]`. Two spans that share an endpoint overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn is_ordered(&self) -> bool {
        self.start < self.end
    }

    /// `self.start <= other.end && self.end >= other.start`
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start <= other.end && self.end >= other.start
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub room_id: RoomId,
    pub owner_id: UserId,
    pub span: Span,
}

impl Reservation {
    pub fn from_reserve(&self) -> Ms {
        self.span.start
    }

    pub fn to_reserve(&self) -> Ms {
        self.span.end
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub email: String,
    /// Argon2 PHC string. The plain password is never kept.
    pub password_hash: String,
    pub is_active: bool,
    pub is_superuser: bool,
}

impl User {
    pub fn identity(&self) -> Identity {
        Identity {
            id: self.id,
            is_active: self.is_active,
            is_superuser: self.is_superuser,
        }
    }
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("password_hash", &"<redacted>")
            .field("is_active", &self.is_active)
            .field("is_superuser", &self.is_superuser)
            .finish()
    }
}

/// The authenticated caller of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub id: UserId,
    pub is_active: bool,
    pub is_superuser: bool,
}

// ── Patches ──────────────────────────────────────────────────────
//
// `None` means "leave unchanged". For nullable columns the inner option
// carries the new value, so `Some(None)` clears it.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
}

impl RoomPatch {
    pub fn apply(&self, room: &Room) -> Room {
        let mut merged = room.clone();
        if let Some(name) = &self.name {
            merged.name = name.clone();
        }
        if let Some(description) = &self.description {
            merged.description = description.clone();
        }
        merged
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReservationPatch {
    pub from_reserve: Option<Ms>,
    pub to_reserve: Option<Ms>,
}

impl ReservationPatch {
    pub fn is_empty(&self) -> bool {
        self.from_reserve.is_none() && self.to_reserve.is_none()
    }

    pub fn apply(&self, span: Span) -> Span {
        Span::new(
            self.from_reserve.unwrap_or(span.start),
            self.to_reserve.unwrap_or(span.end),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserPatch {
    pub password: Option<String>,
    pub is_active: Option<bool>,
    pub is_superuser: Option<bool>,
}

impl UserPatch {
    /// True when the patch only touches fields a user may change on themselves.
    pub fn is_self_service(&self) -> bool {
        self.is_active.is_none() && self.is_superuser.is_none()
    }

    /// Merges the flags. A new password is hashed and set by the engine.
    pub fn apply(&self, user: &User) -> User {
        let mut merged = user.clone();
        if let Some(is_active) = self.is_active {
            merged.is_active = is_active;
        }
        if let Some(is_superuser) = self.is_superuser {
            merged.is_superuser = is_superuser;
        }
        merged
    }
}

// ── Per-room state ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    /// Set under the write lock when the room is deleted, so writers that
    /// looked the room up before the delete see it as gone.
    pub deleted: bool,
    /// Sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            deleted: false,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: ReservationId) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn get_reservation(&self, id: ReservationId) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Reservations whose span overlaps `query` under the closed-interval rule.
    /// Everything at index >= right_bound starts after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start <= query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end >= query.start)
    }
}

/// WAL record format. Flat, one variant per committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: UserId,
        email: String,
        password_hash: String,
        is_superuser: bool,
    },
    UserUpdated {
        id: UserId,
        password_hash: String,
        is_active: bool,
        is_superuser: bool,
    },
    RoomCreated {
        id: RoomId,
        name: String,
        description: Option<String>,
    },
    RoomUpdated {
        id: RoomId,
        name: String,
        description: Option<String>,
    },
    /// Removes the room and every reservation it holds.
    RoomDeleted {
        id: RoomId,
    },
    ReservationCreated {
        id: ReservationId,
        room_id: RoomId,
        owner_id: UserId,
        span: Span,
    },
    ReservationUpdated {
        id: ReservationId,
        room_id: RoomId,
        span: Span,
    },
    ReservationDeleted {
        id: ReservationId,
        room_id: RoomId,
    },
    /// First record of a compacted log: the next id of each sequence, so ids
    /// of deleted rows are never handed out again.
    SequencesReserved {
        next_user: UserId,
        next_room: RoomId,
        next_reservation: ReservationId,
    },
}
