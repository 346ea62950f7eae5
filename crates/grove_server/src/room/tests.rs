use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use grove_data::{
    DropEntry, DropTable, Foothold, GameData, ItemInfo, LifeInfo, LifeKind, MapInfo,
    MapReactorInfo, MonsterStats, Point, ReactorEvent, ReactorEventKind, ReactorInfo,
    ReactorState,
};
use grove_protocol::opcode::SendOpcode;
use pretty_assertions::assert_eq;

use super::*;
use crate::character::Character;
use crate::script::{ScriptManagers, ScriptOp, ScriptResult, TableEngine};
use crate::session::WriteRequest;
use crate::user::User;

const MAP_ID: u32 = 100000000;
const MOB_ID: u32 = 100100;
const MOB_HP: i32 = 8;
const REACTOR_ID: u32 = 2000;
const PLAIN_ITEM: u32 = 4000000;
const QUEST_ITEM: u32 = 4031013;

/// 62_500 per million times the x16 server rate is exactly one
/// guaranteed drop with no residual.
const ONE_GUARANTEED: i32 = 62_500;

fn test_data(drops: Vec<DropEntry>) -> Arc<GameData> {
    let mut data = GameData::default();
    data.insert_map(MapInfo {
        id: MAP_ID,
        forced_return: None,
        nearest_town: MAP_ID,
        seat_count: 2,
        portals: vec![],
        lives: vec![LifeInfo {
            kind: LifeKind::Mob,
            id: MOB_ID,
            pos: Point::new(100, 100),
            fh: 7,
            cy: 0,
            rx0: 0,
            rx1: 0,
            flipped: false,
        }],
        reactors: vec![MapReactorInfo {
            id: REACTOR_ID,
            pos: Point::new(300, 100),
        }],
        footholds: vec![Foothold {
            id: 7,
            p1: Point::new(-1000, 120),
            p2: Point::new(1000, 120),
        }],
    });
    data.insert_monster(MonsterStats {
        id: MOB_ID,
        hp: MOB_HP,
        exp: 20,
    });
    data.insert_monster_drops(MOB_ID, DropTable { entries: drops });
    data.insert_item(ItemInfo {
        id: PLAIN_ITEM,
        quest: false,
        slot_max: 100,
        price: 0,
    });
    data.insert_item(ItemInfo {
        id: QUEST_ITEM,
        quest: true,
        slot_max: 100,
        price: 0,
    });
    // Hit, hit, hit, broken.
    data.insert_reactor(ReactorInfo {
        id: REACTOR_ID,
        action: Some("oak_barrel".to_owned()),
        states: vec![
            ReactorState {
                events: vec![ReactorEvent {
                    kind: ReactorEventKind::Hit,
                    next_state: 1,
                }],
            },
            ReactorState {
                events: vec![ReactorEvent {
                    kind: ReactorEventKind::Hit,
                    next_state: 2,
                }],
            },
            ReactorState {
                events: vec![ReactorEvent {
                    kind: ReactorEventKind::Hit,
                    next_state: 3,
                }],
            },
            ReactorState { events: vec![] },
        ],
    });
    Arc::new(data)
}

fn plain_drop_table() -> Vec<DropEntry> {
    vec![DropEntry {
        item_id: PLAIN_ITEM,
        quest_id: None,
        min: 1,
        max: 1,
        chance: ONE_GUARANTEED,
    }]
}

struct TestMember {
    member: Rc<RoomMember>,
    rx: flume::Receiver<WriteRequest>,
    /// Kept alive so warp requests from the map never error.
    _actor_rx: flume::Receiver<ActorCommand>,
}

impl TestMember {
    fn frames(&self) -> Vec<Bytes> {
        self.rx
            .try_iter()
            .filter_map(|w| match w {
                WriteRequest::Frame(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    fn opcodes(&self) -> Vec<u16> {
        self.frames().iter().map(crate::packets::opcode_of).collect()
    }
}

fn make_room(data: &Arc<GameData>, reactor_scripts: Arc<TableEngine>) -> Rc<Room> {
    Room::create(
        data.clone(),
        Arc::new(crate::events::EventManager::new()),
        reactor_scripts,
        MAP_ID,
    )
    .unwrap()
}

fn join(room: &Room, data: &Arc<GameData>, chr_id: u32) -> TestMember {
    let (session, rx) = crate::session::Session::channel();
    session.set_id(chr_id);
    let chr = Character::new(chr_id, format!("chr{chr_id}"), MAP_ID);
    let user = Rc::new(RefCell::new(User::new(
        session,
        data.clone(),
        Arc::new(ScriptManagers::table_driven()),
        chr,
    )));
    let (actor_tx, actor_rx) = flume::unbounded();
    match room.join(user, actor_tx) {
        RoomJoin::Joined(member) => TestMember {
            member,
            rx,
            _actor_rx: actor_rx,
        },
        RoomJoin::Redirect { .. } => panic!("unexpected redirect"),
    }
}

fn kill_hits() -> Vec<i32> {
    vec![MOB_HP]
}

/// Runs a test body inside a current-thread runtime and `LocalSet`, the
/// environment room timers expect.
fn run_local(f: impl std::future::Future<Output = ()>) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap();
    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(f));
}


#[test]
fn join_announces_world_then_newcomer() {
    run_local(async {
        let data = test_data(plain_drop_table());
        let room = make_room(&data, Arc::new(TableEngine::new()));

        let a = join(&room, &data, 1);
        let a_ops = a.opcodes();
        assert!(a_ops.contains(&(SendOpcode::SpawnMonster as u16)));
        // The first player also becomes the controller of every monster.
        assert!(a_ops.contains(&(SendOpcode::SpawnMonsterController as u16)));
        assert!(a_ops.contains(&(SendOpcode::SpawnReactor as u16)));

        let b = join(&room, &data, 2);
        let b_ops = b.opcodes();
        assert!(b_ops.contains(&(SendOpcode::SpawnPlayer as u16)));
        assert!(b_ops.contains(&(SendOpcode::SpawnMonster as u16)));
        // Monsters already have a controller; B controls nothing.
        assert!(!b_ops.contains(&(SendOpcode::SpawnMonsterController as u16)));

        // A hears about B.
        assert!(a.opcodes().contains(&(SendOpcode::SpawnPlayer as u16)));
        assert!(room.map.borrow().controller_invariant_holds());
    });
}

#[test]
fn kill_broadcasts_and_drops_loot_to_everyone() {
    run_local(async {
        let data = test_data(plain_drop_table());
        let room = make_room(&data, Arc::new(TableEngine::new()));
        let a = join(&room, &data, 1);
        let b = join(&room, &data, 2);
        a.frames();
        b.frames();

        let oid = room.map.borrow().monster_oids()[0];
        let killed = room.attack(
            &a.member,
            AttackKind::CloseRange,
            0,
            0,
            0,
            0,
            0,
            4,
            1,
            vec![oid],
            kill_hits(),
        );
        assert_eq!(killed, vec![MOB_ID]);

        let a_ops = a.opcodes();
        let b_ops = b.opcodes();
        assert!(a_ops.contains(&(SendOpcode::KillMonster as u16)));
        assert!(b_ops.contains(&(SendOpcode::KillMonster as u16)));
        // The attack animation goes to others only; the hp bar to the
        // attacker only.
        assert!(b_ops.contains(&(SendOpcode::UpdatePlayer as u16)));
        assert!(!a_ops.contains(&(SendOpcode::UpdatePlayer as u16)));
        assert!(a_ops.contains(&(SendOpcode::MonsterHp as u16)));

        // Loot landed and is visible to both members.
        assert!(a_ops.contains(&(SendOpcode::DropObject as u16)));
        assert!(b_ops.contains(&(SendOpcode::DropObject as u16)));
        let drop_oid = room.map.borrow().drop_oids()[0];
        assert!(a.member.can_see(drop_oid));
        assert!(b.member.can_see(drop_oid));
        assert!(room.map.borrow().controller_invariant_holds());

        // The drop snapped from (monster.y - 85) onto the foothold below.
        let drop = room.map.borrow_mut().drop(drop_oid).unwrap();
        assert_eq!(drop.pos.y, 120);
    });
}

#[test]
fn quest_locked_drops_stay_invisible_without_the_quest() {
    run_local(async {
        let data = test_data(vec![DropEntry {
            item_id: QUEST_ITEM,
            quest_id: Some(2044),
            min: 1,
            max: 1,
            chance: ONE_GUARANTEED,
        }]);
        let room = make_room(&data, Arc::new(TableEngine::new()));
        let a = join(&room, &data, 1);
        let b = join(&room, &data, 2);
        a.member.user().borrow_mut().quest_items.insert(QUEST_ITEM);
        a.frames();
        b.frames();

        let oid = room.map.borrow().monster_oids()[0];
        room.attack(
            &a.member,
            AttackKind::CloseRange,
            0,
            0,
            0,
            0,
            0,
            4,
            1,
            vec![oid],
            kill_hits(),
        );

        let drop_oid = room.map.borrow().drop_oids()[0];
        assert!(a.member.can_see(drop_oid));
        assert!(!b.member.can_see(drop_oid));
        assert!(a.opcodes().contains(&(SendOpcode::DropObject as u16)));
        assert!(!b.opcodes().contains(&(SendOpcode::DropObject as u16)));

        // And B cannot pick it up either: the pickup path checks visibility.
        room.pick_up(&b.member, drop_oid);
        assert!(!room.map.borrow().drop_oids().is_empty());
    });
}

#[test]
fn attacking_takes_over_monster_control() {
    run_local(async {
        let data = test_data(plain_drop_table());
        let room = make_room(&data, Arc::new(TableEngine::new()));
        let a = join(&room, &data, 1);
        let b = join(&room, &data, 2);
        a.frames();
        b.frames();

        let oid = room.map.borrow().monster_oids()[0];
        room.attack(
            &b.member,
            AttackKind::CloseRange,
            0,
            0,
            0,
            0,
            0,
            4,
            1,
            vec![oid],
            vec![1],
        );

        // A (the old controller) is told to let go; B takes over.
        assert!(a.opcodes().contains(&(SendOpcode::SpawnMonsterController as u16)));
        assert!(b.opcodes().contains(&(SendOpcode::SpawnMonsterController as u16)));
        assert!(room.map.borrow().controller_invariant_holds());
    });
}

#[test]
fn leaving_hands_monsters_to_the_next_controller() {
    run_local(async {
        let data = test_data(plain_drop_table());
        let room = make_room(&data, Arc::new(TableEngine::new()));
        let a = join(&room, &data, 1);
        let b = join(&room, &data, 2);
        a.frames();
        b.frames();

        room.leave(&a.member);
        assert!(b.opcodes().contains(&(SendOpcode::SpawnMonsterController as u16)));
        assert!(room.map.borrow().controller_invariant_holds());
        assert_eq!(room.member_count(), 1);
    });
}

#[test]
fn fixup_drops_stale_oids_before_applying_damage() {
    run_local(async {
        let data = test_data(plain_drop_table());
        let room = make_room(&data, Arc::new(TableEngine::new()));
        let a = join(&room, &data, 1);
        a.frames();

        let oid = room.map.borrow().monster_oids()[0];
        let killed = room.attack(
            &a.member,
            AttackKind::CloseRange,
            0,
            0,
            0,
            0,
            0,
            4,
            1,
            vec![0xFFFF_1234, oid],
            vec![MOB_HP, MOB_HP],
        );
        assert_eq!(killed, vec![MOB_ID]);
    });
}

#[tokio::test(start_paused = true)]
async fn reactor_breaks_and_respawns() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let data = test_data(plain_drop_table());
            let scripts = Arc::new(TableEngine::new());
            scripts.register("oak_barrel", vec![ScriptOp::End(ScriptResult::Success)]);
            let room = make_room(&data, scripts);
            let a = join(&room, &data, 1);
            let b = join(&room, &data, 2);
            a.frames();
            b.frames();

            let reactor_oid = room.map.borrow().reactor_oids()[0];

            assert!(room.hit_reactor(&a.member, reactor_oid, 0));
            assert!(room.hit_reactor(&a.member, reactor_oid, 0));
            let changes = b
                .opcodes()
                .iter()
                .filter(|&&op| op == SendOpcode::ChangeReactorState as u16)
                .count();
            assert_eq!(changes, 2);

            // Third hit breaks it: the script succeeds and the reactor is
            // destroyed.
            assert!(room.hit_reactor(&a.member, reactor_oid, 0));
            assert!(b.opcodes().contains(&(SendOpcode::DestroyReactor as u16)));

            // Three seconds later it is back in state 0.
            tokio::time::sleep(Duration::from_secs(4)).await;
            assert!(b.opcodes().contains(&(SendOpcode::SpawnReactor as u16)));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn player_meso_drop_expires_after_five_minutes() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let data = test_data(plain_drop_table());
            let room = make_room(&data, Arc::new(TableEngine::new()));
            let a = join(&room, &data, 1);
            let b = join(&room, &data, 2);
            a.frames();
            b.frames();

            room.player_drop(&a.member, DropPayload::Meso(300));
            assert!(a.opcodes().contains(&(SendOpcode::DropObject as u16)));
            assert!(b.opcodes().contains(&(SendOpcode::DropObject as u16)));
            assert_eq!(room.map.borrow().drop_oids().len(), 1);

            tokio::time::sleep(Duration::from_secs(301)).await;
            assert!(a.opcodes().contains(&(SendOpcode::RemoveDrop as u16)));
            assert!(b.opcodes().contains(&(SendOpcode::RemoveDrop as u16)));
            assert!(room.map.borrow().drop_oids().is_empty());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn exclusive_drops_open_up_after_fifteen_seconds() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let data = test_data(plain_drop_table());
            let room = make_room(&data, Arc::new(TableEngine::new()));
            let a = join(&room, &data, 1);
            let b = join(&room, &data, 2);
            a.frames();
            b.frames();

            let oid = room.map.borrow().monster_oids()[0];
            room.attack(
                &a.member,
                AttackKind::CloseRange,
                0,
                0,
                0,
                0,
                0,
                4,
                1,
                vec![oid],
                kill_hits(),
            );
            let drop_oid = room.map.borrow().drop_oids()[0];

            assert!(room.map.borrow_mut().can_pick_up(&a.member.player, drop_oid));
            assert!(!room.map.borrow_mut().can_pick_up(&b.member.player, drop_oid));

            tokio::time::sleep(Duration::from_secs(16)).await;
            assert!(room.map.borrow_mut().can_pick_up(&b.member.player, drop_oid));

            // And after the despawn window the batch is gone entirely.
            tokio::time::sleep(Duration::from_secs(286)).await;
            assert!(room.map.borrow().drop_oids().is_empty());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn multi_drop_batches_defer_the_kill_until_settled() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            // Two guaranteed drops: the kill is deferred until the batch
            // finishes falling.
            let data = test_data(vec![
                DropEntry {
                    item_id: PLAIN_ITEM,
                    quest_id: None,
                    min: 1,
                    max: 1,
                    chance: ONE_GUARANTEED,
                },
                DropEntry {
                    item_id: PLAIN_ITEM,
                    quest_id: None,
                    min: 1,
                    max: 1,
                    chance: ONE_GUARANTEED,
                },
            ]);
            let room = make_room(&data, Arc::new(TableEngine::new()));
            let a = join(&room, &data, 1);
            a.frames();

            let oid = room.map.borrow().monster_oids()[0];
            let killed = room.attack(
                &a.member,
                AttackKind::CloseRange,
                0,
                0,
                0,
                0,
                0,
                4,
                1,
                vec![oid],
                kill_hits(),
            );
            assert_eq!(killed, vec![MOB_ID]);

            // Only the first drop is out; the corpse is still standing in
            // the object table as the drop origin.
            assert_eq!(room.map.borrow().drop_oids().len(), 1);
            assert!(!a.opcodes().contains(&(SendOpcode::KillMonster as u16)));

            tokio::time::sleep(Duration::from_millis(250)).await;
            assert_eq!(room.map.borrow().drop_oids().len(), 2);
            assert!(a.opcodes().contains(&(SendOpcode::KillMonster as u16)));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn auto_pickup_of_the_final_drop_waits_for_convert() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let data = test_data(vec![
                DropEntry {
                    item_id: PLAIN_ITEM,
                    quest_id: None,
                    min: 1,
                    max: 1,
                    chance: ONE_GUARANTEED,
                },
                DropEntry {
                    item_id: PLAIN_ITEM,
                    quest_id: None,
                    min: 1,
                    max: 1,
                    chance: ONE_GUARANTEED,
                },
            ]);
            let room = make_room(&data, Arc::new(TableEngine::new()));
            let a = join(&room, &data, 1);
            a.member.user().borrow_mut().toggle_auto_pickup();
            a.frames();

            let oid = room.map.borrow().monster_oids()[0];
            room.attack(
                &a.member,
                AttackKind::CloseRange,
                0,
                0,
                0,
                0,
                0,
                4,
                1,
                vec![oid],
                kill_hits(),
            );

            // First drop was vacuumed the moment it appeared.
            assert_eq!(a.member.user().borrow().chr.item_quantity(PLAIN_ITEM), 1);

            // After the batch settles, the final drop is picked up too,
            // and the deferred kill has happened by then.
            tokio::time::sleep(Duration::from_millis(250)).await;
            assert_eq!(a.member.user().borrow().chr.item_quantity(PLAIN_ITEM), 2);
            assert!(a.opcodes().contains(&(SendOpcode::KillMonster as u16)));
            assert!(room.map.borrow().drop_oids().is_empty());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn respawn_refills_toward_the_target_count() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let data = test_data(plain_drop_table());
            let room = make_room(&data, Arc::new(TableEngine::new()));
            let a = join(&room, &data, 1);
            a.frames();

            let oid = room.map.borrow().monster_oids()[0];
            room.attack(
                &a.member,
                AttackKind::CloseRange,
                0,
                0,
                0,
                0,
                0,
                4,
                1,
                vec![oid],
                kill_hits(),
            );
            assert!(room.map.borrow().monster_oids().is_empty());

            // The respawn timer runs every ten seconds from first join.
            tokio::time::sleep(Duration::from_secs(11)).await;
            assert_eq!(room.map.borrow().monster_oids().len(), 1);
            assert!(a.opcodes().contains(&(SendOpcode::SpawnMonster as u16)));
            assert!(room.map.borrow().controller_invariant_holds());
        })
        .await;
}

const PLATFORM: u32 = 600010004;

fn platform_data() -> Arc<GameData> {
    let mut data = GameData::default();
    data.insert_map(MapInfo {
        id: PLATFORM,
        forced_return: None,
        nearest_town: PLATFORM,
        seat_count: 0,
        portals: vec![],
        lives: vec![],
        reactors: vec![],
        footholds: vec![],
    });
    Arc::new(data)
}

#[test]
fn departure_warps_waiting_members() {
    run_local(async {
        let data = platform_data();
        let events = Arc::new(crate::events::EventManager::new());
        let room = Room::create(
            data.clone(),
            events.clone(),
            Arc::new(TableEngine::new()),
            PLATFORM,
        )
        .unwrap();

        let a = join(&room, &data, 1);
        a.frames();

        // The subway departs: everyone on the platform rides along.
        events.set_property(EventKind::Subway, PROPERTY_SAILING, 2);
        room.on_event();
        assert!(matches!(
            a._actor_rx.try_recv(),
            Ok(ActorCommand::Warp {
                map: 600010005,
                portal: 0
            })
        ));
    });
}

#[test]
fn joining_a_departed_platform_redirects_to_the_ride() {
    let data = platform_data();
    let events = Arc::new(crate::events::EventManager::new());
    events.set_property(EventKind::Subway, PROPERTY_SAILING, 2);
    let room = Room::create(
        data.clone(),
        events,
        Arc::new(TableEngine::new()),
        PLATFORM,
    )
    .unwrap();

    let (session, _rx) = crate::session::Session::channel();
    session.set_id(9);
    let user = Rc::new(RefCell::new(User::new(
        session,
        data,
        Arc::new(ScriptManagers::table_driven()),
        Character::new(9, "late".to_owned(), PLATFORM),
    )));
    let (actor_tx, _actor_rx) = flume::unbounded();
    match room.join(user, actor_tx) {
        RoomJoin::Redirect { map } => assert_eq!(map, 600010005),
        RoomJoin::Joined(_) => panic!("should have been redirected"),
    }
}

#[test]
fn seats_are_exclusive() {
    run_local(async {
        let data = test_data(plain_drop_table());
        let room = make_room(&data, Arc::new(TableEngine::new()));
        let a = join(&room, &data, 1);
        let b = join(&room, &data, 2);

        assert!(room.sit(&a.member, 0));
        assert_eq!(a.member.seat.get(), Some(0));
        // B lands on the same seat: accepted but not seated.
        assert!(room.sit(&b.member, 0));
        assert_eq!(b.member.seat.get(), None);

        // A stands; B can now take it.
        assert!(room.sit(&a.member, u16::MAX));
        assert!(room.sit(&b.member, 0));
        assert_eq!(b.member.seat.get(), Some(0));
    });
}

#[test]
fn out_of_range_seat_is_a_ban() {
    run_local(async {
        let data = test_data(plain_drop_table());
        let room = make_room(&data, Arc::new(TableEngine::new()));
        let a = join(&room, &data, 1);
        assert!(!room.sit(&a.member, 99));
        assert!(!a.member.session().is_open());
    });
}
