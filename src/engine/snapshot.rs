use std::collections::{BTreeMap, HashMap};

use crate::model::*;

use super::apply_to_room;

/// Lock-free image of the whole engine. Replay folds the log into one;
/// compaction turns one back into the shortest log that rebuilds it.
#[derive(Debug)]
pub(super) struct Snapshot {
    pub users: BTreeMap<UserId, User>,
    pub rooms: BTreeMap<RoomId, RoomState>,
    pub reservation_to_room: HashMap<ReservationId, RoomId>,
    pub next_user: UserId,
    pub next_room: RoomId,
    pub next_reservation: ReservationId,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            users: BTreeMap::new(),
            rooms: BTreeMap::new(),
            reservation_to_room: HashMap::new(),
            next_user: 1,
            next_room: 1,
            next_reservation: 1,
        }
    }
}

impl Snapshot {
    pub fn from_events(events: &[Event]) -> Self {
        let mut snapshot = Self::default();
        for event in events {
            snapshot.apply(event);
        }
        snapshot
    }

    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::UserRegistered { id, email, password_hash, is_superuser } => {
                self.users.insert(
                    *id,
                    User {
                        id: *id,
                        email: email.clone(),
                        password_hash: password_hash.clone(),
                        is_active: true,
                        is_superuser: *is_superuser,
                    },
                );
                self.next_user = self.next_user.max(id + 1);
            }
            Event::UserUpdated { id, password_hash, is_active, is_superuser } => {
                if let Some(user) = self.users.get_mut(id) {
                    user.password_hash = password_hash.clone();
                    user.is_active = *is_active;
                    user.is_superuser = *is_superuser;
                }
            }
            Event::RoomCreated { id, name, description } => {
                let room = Room { id: *id, name: name.clone(), description: description.clone() };
                self.rooms.insert(*id, RoomState::new(room));
                self.next_room = self.next_room.max(id + 1);
            }
            Event::RoomDeleted { id } => {
                if let Some(rs) = self.rooms.remove(id) {
                    for r in &rs.reservations {
                        self.reservation_to_room.remove(&r.id);
                    }
                }
            }
            Event::ReservationCreated { id, room_id, .. } => {
                if let Some(rs) = self.rooms.get_mut(room_id) {
                    apply_to_room(rs, event);
                    self.reservation_to_room.insert(*id, *room_id);
                }
                self.next_reservation = self.next_reservation.max(id + 1);
            }
            Event::ReservationDeleted { id, room_id } => {
                if let Some(rs) = self.rooms.get_mut(room_id) {
                    apply_to_room(rs, event);
                }
                self.reservation_to_room.remove(id);
            }
            Event::RoomUpdated { id: room_id, .. } | Event::ReservationUpdated { room_id, .. } => {
                if let Some(rs) = self.rooms.get_mut(room_id) {
                    apply_to_room(rs, event);
                }
            }
            Event::SequencesReserved { next_user, next_room, next_reservation } => {
                self.next_user = self.next_user.max(*next_user);
                self.next_room = self.next_room.max(*next_room);
                self.next_reservation = self.next_reservation.max(*next_reservation);
            }
        }
    }

    /// Minimal event list that replays to this snapshot.
    pub fn to_events(&self) -> Vec<Event> {
        let mut events = vec![Event::SequencesReserved {
            next_user: self.next_user,
            next_room: self.next_room,
            next_reservation: self.next_reservation,
        }];
        for user in self.users.values() {
            events.push(Event::UserRegistered {
                id: user.id,
                email: user.email.clone(),
                password_hash: user.password_hash.clone(),
                is_superuser: user.is_superuser,
            });
            if !user.is_active {
                events.push(Event::UserUpdated {
                    id: user.id,
                    password_hash: user.password_hash.clone(),
                    is_active: false,
                    is_superuser: user.is_superuser,
                });
            }
        }
        for rs in self.rooms.values() {
            events.push(Event::RoomCreated {
                id: rs.room.id,
                name: rs.room.name.clone(),
                description: rs.room.description.clone(),
            });
            for r in &rs.reservations {
                events.push(Event::ReservationCreated {
                    id: r.id,
                    room_id: r.room_id,
                    owner_id: r.owner_id,
                    span: r.span,
                });
            }
        }
        events
    }
}
