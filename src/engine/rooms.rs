use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::limits::*;
use crate::model::*;

use super::policy::{require_active, require_admin};
use super::{Engine, EngineError, SharedRoomState};

impl Engine {
    fn validate_room_name(&self, name: &str) -> Result<(), EngineError> {
        if name.is_empty() {
            return Err(EngineError::Invalid("meeting room name must not be empty".into()));
        }
        if name.chars().count() > self.max_room_name_len {
            return Err(EngineError::Invalid(format!(
                "meeting room name longer than {} characters",
                self.max_room_name_len
            )));
        }
        Ok(())
    }

    fn validate_description(description: Option<&str>) -> Result<(), EngineError> {
        match description {
            Some(d) if d.len() > MAX_DESCRIPTION_LEN => {
                Err(EngineError::LimitExceeded("description too long"))
            }
            _ => Ok(()),
        }
    }

    pub async fn create_room(
        &self,
        identity: &Identity,
        name: String,
        description: Option<String>,
    ) -> Result<Room, EngineError> {
        require_admin(identity)?;
        self.validate_room_name(&name)?;
        Self::validate_description(description.as_deref())?;

        let _gate = self.begin_write().await;
        let mut names = self.room_names.lock().await;
        if names.contains_key(&name) {
            return Err(EngineError::DuplicateName(name));
        }
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many meeting rooms"));
        }

        let id = self.next_room_id();
        let event = Event::RoomCreated {
            id,
            name: name.clone(),
            description: description.clone(),
        };
        self.wal_append(&event).await?;
        let room = Room { id, name, description };
        self.rooms.insert(id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
        names.insert(room.name.clone(), id);
        info!("room {id} created: {:?}", room.name);
        Ok(room)
    }

    pub async fn get_room(&self, identity: &Identity, id: RoomId) -> Result<Room, EngineError> {
        require_active(identity)?;
        let rs = self.get_room_state(id).ok_or(EngineError::room_not_found(id))?;
        let guard = rs.read().await;
        if guard.deleted {
            return Err(EngineError::room_not_found(id));
        }
        Ok(guard.room.clone())
    }

    /// Snapshot of every room, ordered by id.
    pub async fn list_rooms(&self, identity: &Identity) -> Result<Vec<Room>, EngineError> {
        require_active(identity)?;
        let shared: Vec<SharedRoomState> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut rooms = Vec::with_capacity(shared.len());
        for rs in shared {
            let guard = rs.read().await;
            if !guard.deleted {
                rooms.push(guard.room.clone());
            }
        }
        rooms.sort_by_key(|r| r.id);
        Ok(rooms)
    }

    pub async fn update_room(
        &self,
        identity: &Identity,
        id: RoomId,
        patch: RoomPatch,
    ) -> Result<Room, EngineError> {
        require_admin(identity)?;
        if let Some(name) = &patch.name {
            self.validate_room_name(name)?;
        }
        if let Some(description) = &patch.description {
            Self::validate_description(description.as_deref())?;
        }

        let _gate = self.begin_write().await;
        let mut names = self.room_names.lock().await;
        let rs = self.get_room_state(id).ok_or(EngineError::room_not_found(id))?;
        let mut guard = rs.write().await;
        if guard.deleted {
            return Err(EngineError::room_not_found(id));
        }

        let merged = patch.apply(&guard.room);
        if merged == guard.room {
            return Ok(merged);
        }
        // A rename is checked against every other room; keeping one's own name is fine.
        if let Some(&owner) = names.get(&merged.name)
            && owner != id
        {
            return Err(EngineError::DuplicateName(merged.name));
        }

        let old_name = guard.room.name.clone();
        let event = Event::RoomUpdated {
            id,
            name: merged.name.clone(),
            description: merged.description.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        if old_name != merged.name {
            names.remove(&old_name);
            names.insert(merged.name.clone(), id);
        }
        info!("room {id} updated");
        Ok(merged)
    }

    /// Remove the room and every reservation in it as one log record.
    pub async fn delete_room(&self, identity: &Identity, id: RoomId) -> Result<Room, EngineError> {
        require_admin(identity)?;

        let _gate = self.begin_write().await;
        let mut names = self.room_names.lock().await;
        let rs = self.get_room_state(id).ok_or(EngineError::room_not_found(id))?;
        let mut guard = rs.write().await;
        if guard.deleted {
            return Err(EngineError::room_not_found(id));
        }

        let event = Event::RoomDeleted { id };
        self.persist_and_apply(&mut guard, &event).await?;
        let dropped = std::mem::take(&mut guard.reservations);
        for r in &dropped {
            self.reservation_to_room.remove(&r.id);
        }
        self.rooms.remove(&id);
        names.remove(&guard.room.name);
        info!("room {id} deleted with {} reservations", dropped.len());
        Ok(guard.room.clone())
    }
}
