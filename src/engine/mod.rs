mod conflict;
mod error;
mod password;
pub mod policy;
mod queries;
mod reservations;
mod rooms;
mod snapshot;
#[cfg(test)]
mod tests;
mod users;

pub use error::{EngineError, Entity};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock, RwLockReadGuard};
use tracing::info;

use crate::model::*;
use crate::wal::Wal;

use snapshot::Snapshot;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

/// Settings the engine needs at open time.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub wal_path: PathBuf,
    pub max_room_name_len: usize,
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    info!("WAL writer stopped: {}", wal.path().display());
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes don't leak
    // into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// Apply a room-scoped event to its RoomState (caller holds the lock).
/// Room create/delete and user events live above this level.
pub(super) fn apply_to_room(rs: &mut RoomState, event: &Event) {
    match event {
        Event::RoomUpdated { name, description, .. } => {
            rs.room.name = name.clone();
            rs.room.description = description.clone();
        }
        Event::ReservationCreated { id, room_id, owner_id, span } => {
            rs.insert_reservation(Reservation {
                id: *id,
                room_id: *room_id,
                owner_id: *owner_id,
                span: *span,
            });
        }
        Event::ReservationUpdated { id, span, .. } => {
            if let Some(mut r) = rs.remove_reservation(*id) {
                r.span = *span;
                rs.insert_reservation(r);
            }
        }
        Event::ReservationDeleted { id, .. } => {
            rs.remove_reservation(*id);
        }
        Event::RoomDeleted { .. } => rs.deleted = true,
        Event::UserRegistered { .. }
        | Event::UserUpdated { .. }
        | Event::RoomCreated { .. }
        | Event::SequencesReserved { .. } => {}
    }
}

pub struct Engine {
    pub(super) rooms: DashMap<RoomId, SharedRoomState>,
    /// Name → room id. Held across every name check and the insert/rename
    /// that follows it.
    pub(super) room_names: Mutex<HashMap<String, RoomId>>,
    /// Reverse lookup: reservation id → room id.
    pub(super) reservation_to_room: DashMap<ReservationId, RoomId>,
    pub(super) users: DashMap<UserId, User>,
    /// E-mail → user id. Serializes all user writes.
    pub(super) user_emails: Mutex<HashMap<String, UserId>>,
    /// Writers hold it shared for the whole mutation; the compactor takes it
    /// exclusively so its snapshot never misses an acknowledged write.
    pub(super) write_gate: RwLock<()>,
    next_user: AtomicI64,
    next_room: AtomicI64,
    next_reservation: AtomicI64,
    pub(super) max_room_name_len: usize,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl Engine {
    /// Replay the log at `config.wal_path` and start the WAL writer task.
    /// Must be called inside a tokio runtime.
    pub fn open(config: EngineConfig) -> io::Result<Self> {
        let events = Wal::recover(&config.wal_path)?;
        let wal = Wal::open(&config.wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let snapshot = Snapshot::from_events(&events);
        info!(
            "replayed {} events from {}: {} users, {} rooms, {} reservations",
            events.len(),
            config.wal_path.display(),
            snapshot.users.len(),
            snapshot.rooms.len(),
            snapshot.reservation_to_room.len(),
        );
        Ok(Self::from_snapshot(snapshot, &config, wal_tx))
    }

    fn from_snapshot(snapshot: Snapshot, config: &EngineConfig, wal_tx: mpsc::Sender<WalCommand>) -> Self {
        let room_names = snapshot
            .rooms
            .values()
            .map(|rs| (rs.room.name.clone(), rs.room.id))
            .collect();
        let user_emails = snapshot
            .users
            .values()
            .map(|u| (u.email.clone(), u.id))
            .collect();
        Self {
            rooms: snapshot
                .rooms
                .into_iter()
                .map(|(id, rs)| (id, Arc::new(RwLock::new(rs))))
                .collect(),
            room_names: Mutex::new(room_names),
            reservation_to_room: snapshot.reservation_to_room.into_iter().collect(),
            users: snapshot.users.into_iter().collect(),
            user_emails: Mutex::new(user_emails),
            write_gate: RwLock::new(()),
            next_user: AtomicI64::new(snapshot.next_user),
            next_room: AtomicI64::new(snapshot.next_room),
            next_reservation: AtomicI64::new(snapshot.next_reservation),
            max_room_name_len: config.max_room_name_len,
            wal_tx,
        }
    }

    pub(super) fn next_user_id(&self) -> UserId {
        self.next_user.fetch_add(1, Ordering::Relaxed)
    }

    pub(super) fn next_room_id(&self) -> RoomId {
        self.next_room.fetch_add(1, Ordering::Relaxed)
    }

    pub(super) fn next_reservation_id(&self) -> ReservationId {
        self.next_reservation.fetch_add(1, Ordering::Relaxed)
    }

    /// Shared side of the write gate. Taken first, before any other lock.
    pub(super) async fn begin_write(&self) -> RwLockReadGuard<'_, ()> {
        self.write_gate.read().await
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) fn get_room_state(&self, id: RoomId) -> Option<SharedRoomState> {
        self.rooms.get(&id).map(|e| e.value().clone())
    }

    pub(super) fn room_for_reservation(&self, id: ReservationId) -> Option<RoomId> {
        self.reservation_to_room.get(&id).map(|e| *e.value())
    }

    /// WAL-append + apply for a room-scoped event, keeping the reservation
    /// index in step. Caller holds the room's write lock.
    pub(super) async fn persist_and_apply(&self, rs: &mut RoomState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_room(rs, event);
        match event {
            Event::ReservationCreated { id, room_id, .. } => {
                self.reservation_to_room.insert(*id, *room_id);
            }
            Event::ReservationDeleted { id, .. } => {
                self.reservation_to_room.remove(id);
            }
            _ => {}
        }
        Ok(())
    }

    /// Lookup reservation → room, acquire the room's write lock, and confirm
    /// both are still there once the lock is held.
    pub(super) async fn resolve_reservation_write(
        &self,
        id: ReservationId,
    ) -> Result<(Reservation, tokio::sync::OwnedRwLockWriteGuard<RoomState>), EngineError> {
        let room_id = self
            .room_for_reservation(id)
            .ok_or(EngineError::reservation_not_found(id))?;
        let rs = self
            .get_room_state(room_id)
            .ok_or(EngineError::reservation_not_found(id))?;
        let guard = rs.write_owned().await;
        if guard.deleted {
            return Err(EngineError::reservation_not_found(id));
        }
        let reservation = *guard
            .get_reservation(id)
            .ok_or(EngineError::reservation_not_found(id))?;
        Ok((reservation, guard))
    }

    // ── Compaction ───────────────────────────────────────

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the log as the minimal event list for the current state.
    /// Blocks writers for the duration.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;
        let snapshot = self.snapshot().await;
        let events = snapshot.to_events();
        let event_count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("compacted WAL to {event_count} events");
        Ok(())
    }

    async fn snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot {
            next_user: self.next_user.load(Ordering::Relaxed),
            next_room: self.next_room.load(Ordering::Relaxed),
            next_reservation: self.next_reservation.load(Ordering::Relaxed),
            ..Snapshot::default()
        };
        for entry in self.users.iter() {
            snapshot.users.insert(*entry.key(), entry.value().clone());
        }
        let shared: Vec<SharedRoomState> = self.rooms.iter().map(|e| e.value().clone()).collect();
        for rs in shared {
            let guard = rs.read().await;
            if guard.deleted {
                continue;
            }
            for r in &guard.reservations {
                snapshot.reservation_to_room.insert(r.id, r.room_id);
            }
            snapshot.rooms.insert(guard.room.id, guard.clone());
        }
        snapshot
    }
}
