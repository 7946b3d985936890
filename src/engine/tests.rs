use super::*;
use super::conflict::now_ms;
use crate::limits::*;

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir()
        .join("roomd_test_engine")
        .join(ulid::Ulid::new().to_string());
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(name)
}

fn open(path: &PathBuf) -> Engine {
    Engine::open(EngineConfig {
        wal_path: path.clone(),
        max_room_name_len: DEFAULT_MAX_ROOM_NAME_LEN,
    })
    .unwrap()
}

const ADMIN: Identity = Identity { id: 1, is_active: true, is_superuser: true };

/// Engine with an administrator (id 1) and two regular users.
async fn seeded(name: &str) -> (Engine, PathBuf, Identity, Identity) {
    let path = test_wal_path(name);
    let engine = open(&path);
    let admin = engine.ensure_superuser("root@example.com", "rootpw").await.unwrap().unwrap();
    assert_eq!(admin.identity(), ADMIN);
    let alice = engine
        .register_user(&ADMIN, "alice@example.com".into(), "alicepw".into(), false)
        .await
        .unwrap();
    let bob = engine
        .register_user(&ADMIN, "bob@example.com".into(), "bobpw".into(), false)
        .await
        .unwrap();
    (engine, path, alice.identity(), bob.identity())
}

/// A whole hour at least two hours from now.
fn future_base() -> Ms {
    (now_ms() / H + 3) * H
}

// ── Rooms ────────────────────────────────────────────────

#[tokio::test]
async fn create_and_list_rooms() {
    let (engine, _, alice, _) = seeded("rooms_list.wal").await;
    let blue = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    let red = engine
        .create_room(&ADMIN, "Red".into(), Some("4th floor".into()))
        .await
        .unwrap();
    assert_ne!(blue.id, red.id);

    let rooms = engine.list_rooms(&alice).await.unwrap();
    assert_eq!(rooms, vec![blue.clone(), red]);
    assert_eq!(engine.get_room(&alice, blue.id).await.unwrap(), blue);
}

#[tokio::test]
async fn duplicate_room_name_rejected() {
    let (engine, ..) = seeded("rooms_dup.wal").await;
    engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    let err = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap_err();
    assert!(matches!(err, EngineError::DuplicateName(ref n) if n == "Blue"));
    // Case-sensitive exact match.
    engine.create_room(&ADMIN, "blue".into(), None).await.unwrap();
}

#[tokio::test]
async fn room_name_validation() {
    let (engine, ..) = seeded("rooms_name.wal").await;
    assert!(matches!(
        engine.create_room(&ADMIN, String::new(), None).await,
        Err(EngineError::Invalid(_))
    ));
    let long = "x".repeat(DEFAULT_MAX_ROOM_NAME_LEN + 1);
    assert!(matches!(
        engine.create_room(&ADMIN, long, None).await,
        Err(EngineError::Invalid(_))
    ));
    let exact = "x".repeat(DEFAULT_MAX_ROOM_NAME_LEN);
    engine.create_room(&ADMIN, exact, None).await.unwrap();
}

#[tokio::test]
async fn room_writes_require_admin() {
    let (engine, _, alice, _) = seeded("rooms_admin.wal").await;
    assert!(matches!(
        engine.create_room(&alice, "Blue".into(), None).await,
        Err(EngineError::Forbidden(_))
    ));
    let room = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    assert!(matches!(
        engine.update_room(&alice, room.id, RoomPatch::default()).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine.delete_room(&alice, room.id).await,
        Err(EngineError::Forbidden(_))
    ));
}

#[tokio::test]
async fn rename_checks_other_rooms_only() {
    let (engine, ..) = seeded("rooms_rename.wal").await;
    let blue = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    engine.create_room(&ADMIN, "Red".into(), None).await.unwrap();

    // Keeping its own name while changing the description is fine.
    let same = RoomPatch {
        name: Some("Blue".into()),
        description: Some(Some("quiet".into())),
    };
    let updated = engine.update_room(&ADMIN, blue.id, same).await.unwrap();
    assert_eq!(updated.description.as_deref(), Some("quiet"));

    let clash = RoomPatch { name: Some("Red".into()), description: None };
    assert!(matches!(
        engine.update_room(&ADMIN, blue.id, clash).await,
        Err(EngineError::DuplicateName(_))
    ));

    let rename = RoomPatch { name: Some("Navy".into()), description: None };
    engine.update_room(&ADMIN, blue.id, rename).await.unwrap();
    // The old name is free again.
    engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    assert!(matches!(
        engine.create_room(&ADMIN, "Navy".into(), None).await,
        Err(EngineError::DuplicateName(_))
    ));
}

#[tokio::test]
async fn missing_room_is_not_found() {
    let (engine, _, alice, _) = seeded("rooms_missing.wal").await;
    assert!(matches!(
        engine.get_room(&alice, 404).await,
        Err(EngineError::NotFound { entity: Entity::Room, id: 404 })
    ));
    assert!(matches!(
        engine.update_room(&ADMIN, 404, RoomPatch::default()).await,
        Err(EngineError::NotFound { .. })
    ));
    assert!(matches!(engine.delete_room(&ADMIN, 404).await, Err(EngineError::NotFound { .. })));
    assert!(matches!(
        engine.create_reservation(&alice, 404, future_base(), future_base() + H).await,
        Err(EngineError::NotFound { entity: Entity::Room, .. })
    ));
}

#[tokio::test]
async fn delete_room_cascades_to_reservations() {
    let (engine, _, alice, bob) = seeded("rooms_cascade.wal").await;
    let t = future_base();
    let blue = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    let red = engine.create_room(&ADMIN, "Red".into(), None).await.unwrap();
    let r1 = engine.create_reservation(&alice, blue.id, t, t + H).await.unwrap();
    let r2 = engine.create_reservation(&bob, blue.id, t + 2 * H, t + 3 * H).await.unwrap();
    let keep = engine.create_reservation(&bob, red.id, t, t + H).await.unwrap();

    let deleted = engine.delete_room(&ADMIN, blue.id).await.unwrap();
    assert_eq!(deleted.id, blue.id);

    assert!(engine.get_reservation(r1.id).await.is_none());
    assert!(engine.get_reservation(r2.id).await.is_none());
    assert!(engine.list_my_reservations(&alice).await.unwrap().is_empty());
    assert_eq!(engine.list_all_reservations(&ADMIN).await.unwrap(), vec![keep]);
    assert!(matches!(
        engine.delete_reservation(&alice, r1.id).await,
        Err(EngineError::NotFound { entity: Entity::Reservation, .. })
    ));
    assert!(matches!(
        engine.list_future_reservations_for_room(&alice, blue.id).await,
        Err(EngineError::NotFound { .. })
    ));
    // Name is reusable.
    engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
}

// ── Reservations ─────────────────────────────────────────

#[tokio::test]
async fn create_sets_owner_from_requester() {
    let (engine, _, alice, _) = seeded("res_owner.wal").await;
    let t = future_base();
    let room = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    let r = engine.create_reservation(&alice, room.id, t, t + H).await.unwrap();
    assert_eq!(r.owner_id, alice.id);
    assert_eq!(r.room_id, room.id);
    assert_eq!((r.from_reserve(), r.to_reserve()), (t, t + H));
    assert_eq!(engine.get_reservation(r.id).await, Some(r));
}

#[tokio::test]
async fn overlapping_create_rejected() {
    let (engine, _, alice, bob) = seeded("res_overlap.wal").await;
    let t = future_base();
    let room = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    let first = engine.create_reservation(&alice, room.id, t, t + H).await.unwrap();

    match engine.create_reservation(&bob, room.id, t + 30 * M, t + 2 * H).await {
        Err(EngineError::IntervalConflict { room_id, conflicting }) => {
            assert_eq!(room_id, room.id);
            assert_eq!(conflicting, vec![first.id]);
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    // Enclosing and enclosed intervals conflict too.
    assert!(engine.create_reservation(&bob, room.id, t - M, t + H + M).await.is_err());
    assert!(engine.create_reservation(&bob, room.id, t + M, t + 2 * M).await.is_err());
}

#[tokio::test]
async fn touching_boundary_conflicts_one_ms_later_does_not() {
    let (engine, _, alice, bob) = seeded("res_touch.wal").await;
    let t = future_base();
    let room = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    engine.create_reservation(&alice, room.id, t, t + H).await.unwrap();

    assert!(matches!(
        engine.create_reservation(&bob, room.id, t + H, t + 2 * H).await,
        Err(EngineError::IntervalConflict { .. })
    ));
    assert!(matches!(
        engine.create_reservation(&bob, room.id, t - H, t).await,
        Err(EngineError::IntervalConflict { .. })
    ));
    engine.create_reservation(&bob, room.id, t + H + 1, t + 2 * H).await.unwrap();
    engine.create_reservation(&bob, room.id, t - H, t - 1).await.unwrap();
}

#[tokio::test]
async fn same_interval_in_different_rooms_is_fine() {
    let (engine, _, alice, bob) = seeded("res_rooms.wal").await;
    let t = future_base();
    let blue = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    let red = engine.create_room(&ADMIN, "Red".into(), None).await.unwrap();
    engine.create_reservation(&alice, blue.id, t, t + H).await.unwrap();
    engine.create_reservation(&bob, red.id, t, t + H).await.unwrap();
}

#[tokio::test]
async fn interval_validity() {
    let (engine, _, alice, _) = seeded("res_validity.wal").await;
    let room = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    let now = 10 * H;
    let at = |from, to| Span::new(from, to);

    for span in [at(now + H, now + H), at(now + 2 * H, now + H), at(now, now + H), at(now - H, now + H)] {
        assert!(matches!(
            engine.create_reservation_at(&alice, room.id, span, now).await,
            Err(EngineError::IntervalInvalid(_))
        ));
    }
    engine
        .create_reservation_at(&alice, room.id, at(now + 1, now + H), now)
        .await
        .unwrap();
}

#[tokio::test]
async fn invalid_interval_reported_before_missing_room() {
    let (engine, _, alice, _) = seeded("res_order.wal").await;
    let t = future_base();
    assert!(matches!(
        engine.create_reservation(&alice, 404, t + H, t).await,
        Err(EngineError::IntervalInvalid(_))
    ));
}

#[tokio::test]
async fn update_excludes_itself_from_conflicts() {
    let (engine, _, alice, _) = seeded("res_self.wal").await;
    let t = future_base();
    let room = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    let r = engine.create_reservation(&alice, room.id, t, t + H).await.unwrap();

    let extend = ReservationPatch { from_reserve: None, to_reserve: Some(t + 2 * H) };
    let updated = engine.update_reservation(&alice, r.id, extend).await.unwrap();
    assert_eq!(updated.span, Span::new(t, t + 2 * H));
    assert_eq!(updated.owner_id, alice.id);

    // Identical interval is accepted too.
    let same = ReservationPatch { from_reserve: Some(t), to_reserve: Some(t + 2 * H) };
    engine.update_reservation(&alice, r.id, same).await.unwrap();
}

#[tokio::test]
async fn update_into_neighbour_conflicts() {
    let (engine, _, alice, bob) = seeded("res_update_conflict.wal").await;
    let t = future_base();
    let room = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    let mine = engine.create_reservation(&alice, room.id, t, t + H).await.unwrap();
    let theirs = engine.create_reservation(&bob, room.id, t + 2 * H, t + 3 * H).await.unwrap();

    let touch = ReservationPatch { from_reserve: None, to_reserve: Some(t + 2 * H) };
    match engine.update_reservation(&alice, mine.id, touch).await {
        Err(EngineError::IntervalConflict { conflicting, .. }) => assert_eq!(conflicting, vec![theirs.id]),
        other => panic!("expected conflict, got {other:?}"),
    }
    // Rejected update leaves the stored interval alone.
    assert_eq!(engine.get_reservation(mine.id).await.unwrap().span, mine.span);

    let gap = ReservationPatch { from_reserve: None, to_reserve: Some(t + 2 * H - 1) };
    engine.update_reservation(&alice, mine.id, gap).await.unwrap();
}

#[tokio::test]
async fn update_validates_merged_interval() {
    let (engine, _, alice, _) = seeded("res_update_merge.wal").await;
    let t = future_base();
    let room = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    let r = engine.create_reservation(&alice, room.id, t, t + H).await.unwrap();

    let before_start = ReservationPatch { from_reserve: None, to_reserve: Some(t) };
    assert!(matches!(
        engine.update_reservation(&alice, r.id, before_start).await,
        Err(EngineError::IntervalInvalid(_))
    ));
    let past = ReservationPatch { from_reserve: Some(now_ms() - H), to_reserve: None };
    assert!(matches!(
        engine.update_reservation(&alice, r.id, past).await,
        Err(EngineError::IntervalInvalid(_))
    ));
}

#[tokio::test]
async fn started_reservation_may_still_extend_its_end() {
    let (engine, _, alice, _) = seeded("res_started.wal").await;
    let room = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    let created_at = 10 * H;
    let r = engine
        .create_reservation_at(&alice, room.id, Span::new(created_at + M, created_at + H), created_at)
        .await
        .unwrap();

    // Later the reservation has started; moving only the end is allowed.
    let later = created_at + 30 * M;
    let extend = ReservationPatch { from_reserve: None, to_reserve: Some(created_at + 2 * H) };
    let updated = engine.update_reservation_at(&alice, r.id, extend, later).await.unwrap();
    assert_eq!(updated.span, Span::new(created_at + M, created_at + 2 * H));

    // Re-sending the stored start counts as a new start and is re-checked.
    let resend = ReservationPatch { from_reserve: Some(created_at + M), to_reserve: None };
    assert!(matches!(
        engine.update_reservation_at(&alice, r.id, resend, later).await,
        Err(EngineError::IntervalInvalid(_))
    ));
}

#[tokio::test]
async fn only_owner_or_admin_may_modify() {
    let (engine, _, alice, bob) = seeded("res_ownership.wal").await;
    let t = future_base();
    let room = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    let r = engine.create_reservation(&alice, room.id, t, t + H).await.unwrap();

    let patch = ReservationPatch { from_reserve: None, to_reserve: Some(t + 2 * H) };
    assert!(matches!(
        engine.update_reservation(&bob, r.id, patch).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine.delete_reservation(&bob, r.id).await,
        Err(EngineError::Forbidden(_))
    ));

    let updated = engine.update_reservation(&ADMIN, r.id, patch).await.unwrap();
    assert_eq!(updated.owner_id, alice.id, "owner survives an admin edit");
    let deleted = engine.delete_reservation(&ADMIN, r.id).await.unwrap();
    assert_eq!(deleted.id, r.id);
    assert!(engine.get_reservation(r.id).await.is_none());
}

#[tokio::test]
async fn forbidden_reported_before_interval_problems() {
    let (engine, _, alice, bob) = seeded("res_forbidden_first.wal").await;
    let t = future_base();
    let room = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    let r = engine.create_reservation(&alice, room.id, t, t + H).await.unwrap();
    let broken = ReservationPatch { from_reserve: Some(t + 2 * H), to_reserve: Some(t) };
    assert!(matches!(
        engine.update_reservation(&bob, r.id, broken).await,
        Err(EngineError::Forbidden(_))
    ));
}

#[tokio::test]
async fn missing_reservation_is_not_found() {
    let (engine, _, alice, _) = seeded("res_missing.wal").await;
    assert!(matches!(
        engine.update_reservation(&alice, 77, ReservationPatch::default()).await,
        Err(EngineError::NotFound { entity: Entity::Reservation, id: 77 })
    ));
    assert!(matches!(
        engine.delete_reservation(&alice, 77).await,
        Err(EngineError::NotFound { entity: Entity::Reservation, id: 77 })
    ));
    assert_eq!(engine.get_reservation(77).await, None);
}

#[tokio::test]
async fn freed_slot_can_be_rebooked() {
    let (engine, _, alice, bob) = seeded("res_rebook.wal").await;
    let t = future_base();
    let room = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    let r = engine.create_reservation(&alice, room.id, t, t + H).await.unwrap();
    assert!(engine.create_reservation(&bob, room.id, t, t + H).await.is_err());
    engine.delete_reservation(&alice, r.id).await.unwrap();
    engine.create_reservation(&bob, room.id, t, t + H).await.unwrap();
}

// ── Reads ────────────────────────────────────────────────

#[tokio::test]
async fn my_reservations_empty_for_new_user() {
    let (engine, _, alice, _) = seeded("reads_empty.wal").await;
    assert!(engine.list_my_reservations(&alice).await.unwrap().is_empty());
}

#[tokio::test]
async fn my_reservations_only_mine() {
    let (engine, _, alice, bob) = seeded("reads_mine.wal").await;
    let t = future_base();
    let blue = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    let red = engine.create_room(&ADMIN, "Red".into(), None).await.unwrap();
    let a1 = engine.create_reservation(&alice, blue.id, t, t + H).await.unwrap();
    engine.create_reservation(&bob, blue.id, t + 2 * H, t + 3 * H).await.unwrap();
    let a2 = engine.create_reservation(&alice, red.id, t, t + H).await.unwrap();

    assert_eq!(engine.list_my_reservations(&alice).await.unwrap(), vec![a1, a2]);
    assert_eq!(engine.list_my_reservations(&bob).await.unwrap().len(), 1);
}

#[tokio::test]
async fn future_reservations_skip_finished_ones() {
    let (engine, _, alice, _) = seeded("reads_future.wal").await;
    let room = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    let created_at = 10 * H;
    let early = engine
        .create_reservation_at(&alice, room.id, Span::new(created_at + M, created_at + H), created_at)
        .await
        .unwrap();
    let late = engine
        .create_reservation_at(&alice, room.id, Span::new(created_at + 2 * H, created_at + 3 * H), created_at)
        .await
        .unwrap();

    let all = engine.future_reservations(room.id, created_at).await.unwrap();
    assert_eq!(all, vec![early, late]);
    // `to_reserve > now` is strict.
    let at_end = engine.future_reservations(room.id, created_at + H).await.unwrap();
    assert_eq!(at_end, vec![late]);
}

#[tokio::test]
async fn list_all_reservations_is_admin_only() {
    let (engine, _, alice, _) = seeded("reads_all.wal").await;
    assert!(matches!(
        engine.list_all_reservations(&alice).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(engine.list_all_reservations(&ADMIN).await.unwrap().is_empty());
}

#[tokio::test]
async fn conflicting_reservations_query() {
    let (engine, _, alice, _) = seeded("reads_conflicts.wal").await;
    let t = future_base();
    let room = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    let a = engine.create_reservation(&alice, room.id, t, t + H).await.unwrap();
    let b = engine.create_reservation(&alice, room.id, t + 2 * H, t + 3 * H).await.unwrap();

    let hits = engine
        .conflicting_reservations(room.id, Span::new(t + H, t + 2 * H), None)
        .await
        .unwrap();
    assert_eq!(hits, vec![a, b]);
    let hits = engine
        .conflicting_reservations(room.id, Span::new(t + H, t + 2 * H), Some(a.id))
        .await
        .unwrap();
    assert_eq!(hits, vec![b]);
}

#[tokio::test]
async fn inactive_identity_is_unauthenticated() {
    let (engine, _, alice, _) = seeded("reads_inactive.wal").await;
    let gone = Identity { is_active: false, ..alice };
    assert!(matches!(engine.list_rooms(&gone).await, Err(EngineError::Unauthenticated)));
    assert!(matches!(
        engine.list_my_reservations(&gone).await,
        Err(EngineError::Unauthenticated)
    ));
}

// ── Users ────────────────────────────────────────────────

#[tokio::test]
async fn ensure_superuser_is_idempotent() {
    let (engine, ..) = seeded("users_bootstrap.wal").await;
    assert!(engine.ensure_superuser("root@example.com", "otherpw").await.unwrap().is_none());
    let root = engine.authenticate("root@example.com", "rootpw").await.unwrap();
    assert!(root.is_superuser);
    assert!(matches!(
        engine.authenticate("root@example.com", "otherpw").await,
        Err(EngineError::Unauthenticated)
    ));
}

#[tokio::test]
async fn register_rules() {
    let (engine, _, alice, _) = seeded("users_register.wal").await;
    assert!(matches!(
        engine
            .register_user(&alice, "carol@example.com".into(), "carolpw".into(), false)
            .await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine
            .register_user(&ADMIN, "alice@example.com".into(), "another".into(), false)
            .await,
        Err(EngineError::DuplicateEmail(_))
    ));
    assert!(matches!(
        engine.register_user(&ADMIN, "carol@example.com".into(), "pw".into(), false).await,
        Err(EngineError::Invalid(_))
    ));
    assert!(matches!(
        engine
            .register_user(&ADMIN, "carol@example.com".into(), "carol@example.com!".into(), false)
            .await,
        Err(EngineError::Invalid(_))
    ));
    let carol = engine
        .register_user(&ADMIN, "carol@example.com".into(), "carolpw".into(), false)
        .await
        .unwrap();
    assert!(carol.is_active);
    assert!(!carol.is_superuser);
}

#[tokio::test]
async fn users_change_own_password_only() {
    let (engine, _, alice, bob) = seeded("users_update.wal").await;
    let new_pw = UserPatch { password: Some("newalicepw".into()), ..UserPatch::default() };
    engine.update_user(&alice, alice.id, new_pw.clone()).await.unwrap();
    assert_eq!(engine.authenticate("alice@example.com", "newalicepw").await.unwrap(), alice);
    assert!(matches!(
        engine.authenticate("alice@example.com", "alicepw").await,
        Err(EngineError::Unauthenticated)
    ));

    assert!(matches!(
        engine.update_user(&bob, alice.id, new_pw).await,
        Err(EngineError::Forbidden(_))
    ));
    let promote = UserPatch { is_superuser: Some(true), ..UserPatch::default() };
    assert!(matches!(
        engine.update_user(&alice, alice.id, promote.clone()).await,
        Err(EngineError::Forbidden(_))
    ));
    let promoted = engine.update_user(&ADMIN, alice.id, promote).await.unwrap();
    assert!(promoted.is_superuser);
}

#[tokio::test]
async fn deactivated_user_keeps_reservations() {
    let (engine, _, alice, _) = seeded("users_deactivate.wal").await;
    let t = future_base();
    let room = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    engine.create_reservation(&alice, room.id, t, t + H).await.unwrap();

    let off = UserPatch { is_active: Some(false), ..UserPatch::default() };
    let user = engine.update_user(&ADMIN, alice.id, off).await.unwrap();
    assert!(!user.is_active);
    assert_eq!(engine.list_all_reservations(&ADMIN).await.unwrap().len(), 1);
    assert!(engine.list_my_reservations(&user.identity()).await.is_err());
}

#[tokio::test]
async fn list_users_scoped_by_role() {
    let (engine, _, alice, _) = seeded("users_list.wal").await;
    assert_eq!(engine.list_users(&ADMIN).unwrap().len(), 3);
    let mine = engine.list_users(&alice).unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id, alice.id);
    assert!(matches!(engine.get_user(&alice, ADMIN.id), Err(EngineError::Forbidden(_))));
    assert!(matches!(engine.get_user(&ADMIN, 999), Err(EngineError::NotFound { .. })));
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_creates_at_most_one_wins() {
    let (engine, _, alice, bob) = seeded("conc_identical.wal").await;
    let engine = Arc::new(engine);
    let t = future_base();
    let room_id = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap().id;

    let mut handles = Vec::new();
    for i in 0..32 {
        let eng = engine.clone();
        let who = if i % 2 == 0 { alice } else { bob };
        handles.push(tokio::spawn(async move {
            eng.create_reservation(&who, room_id, t, t + H).await
        }));
    }
    let mut wins = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => wins += 1,
            Err(EngineError::IntervalConflict { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(engine.list_all_reservations(&ADMIN).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_creates_leave_no_overlap() {
    let (engine, _, alice, _) = seeded("conc_overlap.wal").await;
    let engine = Arc::new(engine);
    let t = future_base();
    let room_id = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap().id;

    // Staggered half-hour offsets: many candidates overlap their neighbours.
    let mut handles = Vec::new();
    for i in 0..40 {
        let eng = engine.clone();
        let start = t + i * 30 * M;
        handles.push(tokio::spawn(async move {
            eng.create_reservation(&alice, room_id, start, start + H).await
        }));
    }
    for h in handles {
        let _ = h.await.unwrap();
    }

    let booked = engine.future_reservations(room_id, now_ms()).await.unwrap();
    assert!(!booked.is_empty());
    for pair in booked.windows(2) {
        assert!(!pair[0].span.overlaps(&pair[1].span), "{pair:?} overlap");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_updates_cannot_collide() {
    let (engine, _, alice, bob) = seeded("conc_update.wal").await;
    let engine = Arc::new(engine);
    let t = future_base();
    let room = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    let a = engine.create_reservation(&alice, room.id, t, t + H).await.unwrap();
    let b = engine.create_reservation(&bob, room.id, t + 4 * H, t + 5 * H).await.unwrap();

    // Both try to move into the same free slot.
    let target = ReservationPatch { from_reserve: Some(t + 2 * H), to_reserve: Some(t + 3 * H) };
    let (ea, eb) = (engine.clone(), engine.clone());
    let ha = tokio::spawn(async move { ea.update_reservation(&alice, a.id, target).await });
    let hb = tokio::spawn(async move { eb.update_reservation(&bob, b.id, target).await });
    let results = [ha.await.unwrap(), hb.await.unwrap()];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_same_name_rooms_at_most_one_wins() {
    let (engine, ..) = seeded("conc_names.wal").await;
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.create_room(&ADMIN, "Boardroom".into(), None).await
        }));
    }
    let mut wins = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => wins += 1,
            Err(EngineError::DuplicateName(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(engine.list_rooms(&ADMIN).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_renames_to_same_name() {
    let (engine, ..) = seeded("conc_rename.wal").await;
    let engine = Arc::new(engine);
    let mut ids = Vec::new();
    for i in 0..8 {
        ids.push(engine.create_room(&ADMIN, format!("R{i}"), None).await.unwrap().id);
    }
    let mut handles = Vec::new();
    for id in ids {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            let patch = RoomPatch { name: Some("Atrium".into()), description: None };
            eng.update_room(&ADMIN, id, patch).await
        }));
    }
    let wins = futures::future::join_all(handles)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(Ok(_))))
        .count();
    assert_eq!(wins, 1);
    let rooms = engine.list_rooms(&ADMIN).await.unwrap();
    assert_eq!(rooms.iter().filter(|r| r.name == "Atrium").count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn booking_racing_room_delete_leaves_no_orphan() {
    let (engine, _, alice, _) = seeded("conc_delete.wal").await;
    let engine = Arc::new(engine);
    let t = future_base();

    for round in 0..20 {
        let room_id = engine
            .create_room(&ADMIN, format!("Temp{round}"), None)
            .await
            .unwrap()
            .id;
        let eb = engine.clone();
        let ed = engine.clone();
        let book = tokio::spawn(async move { eb.create_reservation(&alice, room_id, t, t + H).await });
        let delete = tokio::spawn(async move { ed.delete_room(&ADMIN, room_id).await });
        let booked = book.await.unwrap();
        delete.await.unwrap().unwrap();

        if let Ok(r) = booked {
            assert!(engine.get_reservation(r.id).await.is_none());
        }
    }
    assert!(engine.list_all_reservations(&ADMIN).await.unwrap().is_empty());
    assert!(engine.reservation_to_room.is_empty());
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let (engine, path, alice, bob) = seeded("durable_restart.wal").await;
    let t = future_base();
    let blue = engine.create_room(&ADMIN, "Blue".into(), Some("2nd".into())).await.unwrap();
    let red = engine.create_room(&ADMIN, "Red".into(), None).await.unwrap();
    let a = engine.create_reservation(&alice, blue.id, t, t + H).await.unwrap();
    let b = engine.create_reservation(&bob, red.id, t, t + H).await.unwrap();
    let patch = ReservationPatch { from_reserve: None, to_reserve: Some(t + 2 * H) };
    let a = engine.update_reservation(&alice, a.id, patch).await.unwrap();
    engine.delete_room(&ADMIN, red.id).await.unwrap();
    drop(engine);

    let engine = open(&path);
    assert_eq!(engine.list_rooms(&alice).await.unwrap(), vec![blue.clone()]);
    assert_eq!(engine.list_all_reservations(&ADMIN).await.unwrap(), vec![a]);
    assert!(engine.get_reservation(b.id).await.is_none());
    assert_eq!(engine.authenticate("bob@example.com", "bobpw").await.unwrap(), bob);

    // Uniqueness and conflicts hold against replayed state, and ids keep growing.
    assert!(matches!(
        engine.create_room(&ADMIN, "Blue".into(), None).await,
        Err(EngineError::DuplicateName(_))
    ));
    assert!(engine.create_reservation(&bob, blue.id, t + H, t + 3 * H).await.is_err());
    let next = engine.create_reservation(&bob, blue.id, t + 3 * H, t + 4 * H).await.unwrap();
    assert!(next.id > b.id);
    let room = engine.create_room(&ADMIN, "Green".into(), None).await.unwrap();
    assert!(room.id > red.id);
}

#[tokio::test]
async fn wal_never_holds_plain_passwords() {
    let (engine, path, alice, _) = seeded("no_plain_passwords.wal").await;
    let new_pw = UserPatch { password: Some("rotated-secret".into()), ..UserPatch::default() };
    engine.update_user(&alice, alice.id, new_pw).await.unwrap();
    engine.compact_wal().await.unwrap();
    let after_compact = UserPatch { password: Some("second-secret".into()), ..UserPatch::default() };
    engine.update_user(&alice, alice.id, after_compact).await.unwrap();
    drop(engine);

    let bytes = std::fs::read(&path).unwrap();
    let contains = |needle: &str| bytes.windows(needle.len()).any(|w| w == needle.as_bytes());
    for secret in ["rootpw", "alicepw", "bobpw", "rotated-secret", "second-secret"] {
        assert!(!contains(secret), "{secret} written to the WAL");
    }
    assert!(contains("$argon2id$"));

    let engine = open(&path);
    assert_eq!(engine.authenticate("alice@example.com", "second-secret").await.unwrap(), alice);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn group_commit_batches_appends() {
    let (engine, path, alice, _) = seeded("group_commit.wal").await;
    let engine = Arc::new(engine);
    let t = future_base();

    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            let room = eng.create_room(&ADMIN, format!("R{i}"), None).await?;
            eng.create_reservation(&alice, room.id, t, t + H).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    drop(engine);

    let engine2 = open(&path);
    assert_eq!(engine2.list_rooms(&ADMIN).await.unwrap().len(), n);
    assert_eq!(engine2.list_all_reservations(&ADMIN).await.unwrap().len(), n);
}

#[tokio::test]
async fn wal_appends_since_compact_through_channel() {
    let (engine, ..) = seeded("appends_counter.wal").await;
    assert_eq!(engine.wal_appends_since_compact().await, 3);

    let room = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    engine.delete_room(&ADMIN, room.id).await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 5);

    // Rejected writes never reach the log.
    let _ = engine.create_room(&ADMIN, String::new(), None).await;
    assert_eq!(engine.wal_appends_since_compact().await, 5);
}

#[tokio::test]
async fn compact_wal_preserves_state() {
    let (engine, path, alice, bob) = seeded("compact_state.wal").await;
    let t = future_base();
    let blue = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    let doomed = engine.create_room(&ADMIN, "Doomed".into(), None).await.unwrap();
    for i in 0..10 {
        let r = engine
            .create_reservation(&alice, blue.id, t + i * 2 * H, t + i * 2 * H + H)
            .await
            .unwrap();
        if i % 2 == 0 {
            engine.delete_reservation(&alice, r.id).await.unwrap();
        }
    }
    engine.create_reservation(&bob, doomed.id, t, t + H).await.unwrap();
    let last = engine.create_reservation(&bob, blue.id, t + 40 * H, t + 41 * H).await.unwrap();
    engine.delete_room(&ADMIN, doomed.id).await.unwrap();
    let off = UserPatch { is_active: Some(false), ..UserPatch::default() };
    engine.update_user(&ADMIN, bob.id, off).await.unwrap();

    let before = engine.list_all_reservations(&ADMIN).await.unwrap();
    let size_before = std::fs::metadata(&path).unwrap().len();
    engine.compact_wal().await.unwrap();
    let size_after = std::fs::metadata(&path).unwrap().len();
    assert!(size_after < size_before, "compacted WAL ({size_after}) should be smaller than {size_before}");
    assert_eq!(engine.wal_appends_since_compact().await, 0);

    // Writes after compaction land in the new file.
    let after_compact = engine.create_reservation(&alice, blue.id, t + 50 * H, t + 51 * H).await.unwrap();
    drop(engine);

    let engine = open(&path);
    let mut expected = before;
    expected.push(after_compact);
    assert_eq!(engine.list_all_reservations(&ADMIN).await.unwrap(), expected);
    assert!(!engine.user_by_email("bob@example.com").await.unwrap().is_active);
    // Deleted ids are not handed out again.
    let fresh = engine.create_reservation(&alice, blue.id, t + 60 * H, t + 61 * H).await.unwrap();
    assert!(fresh.id > after_compact.id && fresh.id > last.id);
    let room = engine.create_room(&ADMIN, "Doomed".into(), None).await.unwrap();
    assert!(room.id > doomed.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compaction_during_writes_loses_nothing() {
    let (engine, path, alice, _) = seeded("compact_race.wal").await;
    let engine = Arc::new(engine);
    let t = future_base();
    let room_id = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap().id;

    let writer = {
        let eng = engine.clone();
        tokio::spawn(async move {
            let mut ids = Vec::new();
            for i in 0..50 {
                let r = eng
                    .create_reservation(&alice, room_id, t + i * 2 * H, t + i * 2 * H + H)
                    .await
                    .unwrap();
                ids.push(r.id);
            }
            ids
        })
    };
    for _ in 0..5 {
        engine.compact_wal().await.unwrap();
        tokio::task::yield_now().await;
    }
    let ids = writer.await.unwrap();
    drop(engine);

    let engine = open(&path);
    let replayed: Vec<ReservationId> = engine
        .list_my_reservations(&alice)
        .await
        .unwrap()
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(replayed, ids);
}

// ── Limits ───────────────────────────────────────────────

#[tokio::test]
async fn reservation_duration_limit() {
    let (engine, _, alice, _) = seeded("limits_duration.wal").await;
    let t = future_base();
    let room = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    assert!(matches!(
        engine
            .create_reservation(&alice, room.id, t, t + MAX_RESERVATION_DURATION_MS + 1)
            .await,
        Err(EngineError::LimitExceeded(_))
    ));
    engine
        .create_reservation(&alice, room.id, t, t + MAX_RESERVATION_DURATION_MS)
        .await
        .unwrap();
}

#[tokio::test]
async fn timestamps_past_2100_are_rejected() {
    let (engine, _, alice, _) = seeded("limits_year.wal").await;
    let room = engine.create_room(&ADMIN, "Blue".into(), None).await.unwrap();
    let late = MAX_VALID_TIMESTAMP_MS - 3_600_000;
    assert!(matches!(
        engine.create_reservation(&alice, room.id, late, MAX_VALID_TIMESTAMP_MS + 1).await,
        Err(EngineError::LimitExceeded(_))
    ));
    engine
        .create_reservation(&alice, room.id, late, MAX_VALID_TIMESTAMP_MS)
        .await
        .unwrap();
}

#[tokio::test]
async fn description_limit() {
    let (engine, ..) = seeded("limits_description.wal").await;
    let long = "d".repeat(MAX_DESCRIPTION_LEN + 1);
    assert!(matches!(
        engine.create_room(&ADMIN, "Blue".into(), Some(long)).await,
        Err(EngineError::LimitExceeded(_))
    ));
}

#[tokio::test]
async fn configured_room_name_limit() {
    let path = test_wal_path("limits_name_config.wal");
    let engine = Engine::open(EngineConfig { wal_path: path, max_room_name_len: 4 }).unwrap();
    assert!(engine.create_room(&ADMIN, "Blue".into(), None).await.is_ok());
    assert!(matches!(
        engine.create_room(&ADMIN, "Green".into(), None).await,
        Err(EngineError::Invalid(_))
    ));
}
