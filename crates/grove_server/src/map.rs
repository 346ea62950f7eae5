//! The authoritative per-map simulation.
//!
//! A [`Map`] owns every object on it: monsters and their spawners, NPCs,
//! reactors, settled and still-falling drop batches, and the per-map
//! projection of each player. All mutation happens on the worker thread
//! that owns the enclosing room; the map writes packets straight to its
//! players' sessions, the way every change is observed.
//!
//! Bookkeeping follows a swap-with-last discipline: monsters, players and
//! drop batches live in dense arrays, and every relocation patches the
//! back-references kept by the object table, the controller heap and the
//! owning players.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use grove_data::{DropTable, GameData, LifeKind, Point};
use rand::rngs::SmallRng;
use rand::Rng;
use tracing::warn;

use crate::character::{Equipment, ItemStack};
use crate::controller::{ControllerHeap, NodeIndex};
use crate::events::{EventKind, EventManager, PROPERTY_SAILING};
use crate::object::{MapObject, ObjectKind, ObjectTable};
use crate::packets;
use crate::room::RoomMember;

/// How long a fresh batch is pickup-locked to its owner.
const EXCLUSIVE_INTERVAL: Duration = Duration::from_secs(15);
/// Exclusive flip to the batch despawning.
const EXPIRE_INTERVAL: Duration = Duration::from_secs(285);
/// Full lifetime of a player-originated drop.
const PLAYER_DROP_INTERVAL: Duration = Duration::from_secs(300);
/// Cadence of a multi-drop batch hitting the ground.
const NEXT_DROP_INTERVAL: Duration = Duration::from_millis(200);
/// Regular respawn cadence.
const RESPAWN_INTERVAL: Duration = Duration::from_secs(10);
/// A broken reactor comes back after this.
const REACTOR_RESPAWN_INTERVAL: Duration = Duration::from_secs(3);

/// Index of a player within the map's player array, kept behind a shared
/// cell so the array can compact without anyone holding a stale index.
pub type PlayerHandle = Rc<Cell<usize>>;

/// Timer callbacks delivered back into the map by the owning room.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapTimerEvent {
    Respawn,
    ExclusiveExpired,
    DropExpired,
    NextDrop(u64),
    RespawnReactor(u32),
}

/// Arms one-shot timers on the owning worker.
pub trait MapScheduler {
    fn once(&self, delay: Duration, event: MapTimerEvent) -> TimerHandle;
}

/// A cancellable timer. Dropping the handle cancels the timer.
pub struct TimerHandle {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl TimerHandle {
    pub fn new(task: tokio::task::JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    /// A handle with nothing behind it, for schedulers that track firing
    /// themselves.
    pub fn detached() -> Self {
        Self { task: None }
    }
}

impl std::ops::Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Npc {
    pub oid: u32,
    pub id: u32,
    pub x: i16,
    pub y: i16,
    pub fh: u16,
    pub cy: i16,
    pub rx0: i16,
    pub rx1: i16,
    pub flipped: bool,
}

#[derive(Clone, Debug)]
pub enum DropPayload {
    Meso(i32),
    Item {
        /// Quest that makes this drop visible, for quest-exclusive items.
        quest: Option<u16>,
        stack: ItemStack,
    },
    Equip(Equipment),
}

#[derive(Clone, Debug)]
pub struct MapDrop {
    pub oid: u32,
    pub pos: Point,
    pub payload: DropPayload,
}

impl MapDrop {
    pub fn item_id(&self) -> Option<u32> {
        match &self.payload {
            DropPayload::Meso(_) => None,
            DropPayload::Item { stack, .. } => Some(stack.item_id),
            DropPayload::Equip(equip) => Some(equip.item_id),
        }
    }
}

struct Spawner {
    id: u32,
    pos: Point,
    fh: u16,
}

struct MapMonster {
    oid: u32,
    id: u32,
    pos: Point,
    fh: u16,
    stance: u8,
    hp: i32,
    spawner_index: Option<usize>,
    controller: Option<usize>,
    index_in_controller: usize,
}

struct BossMonster {
    oid: u32,
    id: u32,
    pos: Point,
    fh: u16,
    hp: i32,
    controller: Option<usize>,
}

struct Reactor {
    oid: u32,
    id: u32,
    pos: Point,
    state: u8,
    /// Suppresses destruction while the reactor's loot is still falling.
    keep_alive: bool,
    /// Pending respawn after a break.
    respawn_hold: Option<TimerHandle>,
}

/// A settled batch of drops on the ground.
struct DropBatch {
    drops: Vec<MapDrop>,
    timer: Option<TimerHandle>,
    owner: Option<usize>,
    index_in_player: usize,
    owner_id: u32,
    exclusive: bool,
}

/// A batch whose drops are still appearing one by one.
struct DroppingBatch {
    id: u64,
    drops: Vec<MapDrop>,
    current: usize,
    timer: Option<TimerHandle>,
    owner: Option<usize>,
    index_in_player: usize,
    owner_id: u32,
    dropper_oid: u32,
}

struct MapPlayer {
    member: Rc<RoomMember>,
    handle: PlayerHandle,
    heap_node: NodeIndex,
    /// Monsters this player controls, as monster-array indices.
    monsters: Vec<usize>,
    /// Settled batches this player owns, as batch-array indices.
    drops: Vec<usize>,
    /// Dropping batches this player owns, by batch id.
    droppings: Vec<u64>,
}

/// Result of applying an attack to one oid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DamageOutcome {
    /// The oid no longer names a live monster.
    Invalid,
    Damaged,
    Killed { mob_id: u32 },
}

/// Result of a reactor hit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReactorHitOutcome {
    /// Not a reactor: the client is making oids up.
    Invalid,
    /// State advanced (or nothing matched); any broadcast already sent.
    Handled,
    /// The reactor reached a terminal state; run its action script.
    Broken { action: String },
}

/// Admission decision for [`Map::join`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    /// Transit map in the wrong phase: send the player here instead.
    Redirect { map: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Boat,
    Train,
    Genie,
    Subway,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportStage {
    /// Shows/hides the vehicle as it docks and departs.
    Dock,
    /// Players wait here; departure warps them onto the transit map.
    AwaitingDeparture { destination: u32 },
    /// Players ride here; arrival warps them to the far dock.
    EnRoute { destination: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportRole {
    pub kind: TransportKind,
    pub event: EventKind,
    pub stage: TransportStage,
}

/// Which transport (if any) a map participates in, and how.
pub fn transport_role(map: u32) -> Option<TransportRole> {
    use TransportKind::*;
    use TransportStage::*;

    let role = |kind, event, stage| Some(TransportRole { kind, event, stage });
    match map {
        101000300 | 200000111 => role(Boat, EventKind::Boat, Dock),
        101000301 => role(Boat, EventKind::Boat, AwaitingDeparture { destination: 200090010 }),
        200000112 => role(Boat, EventKind::Boat, AwaitingDeparture { destination: 200090000 }),
        _ if map / 10 == 20009001 => role(Boat, EventKind::Boat, EnRoute { destination: 200000100 }),
        _ if map / 10 == 20009000 => role(Boat, EventKind::Boat, EnRoute { destination: 101000300 }),

        200000121 | 220000110 => role(Train, EventKind::Train, Dock),
        200000122 => role(Train, EventKind::Train, AwaitingDeparture { destination: 200090100 }),
        220000111 => role(Train, EventKind::Train, AwaitingDeparture { destination: 200090110 }),
        200090100 => role(Train, EventKind::Train, EnRoute { destination: 220000110 }),
        200090110 => role(Train, EventKind::Train, EnRoute { destination: 200000100 }),

        200000151 | 260000100 => role(Genie, EventKind::Genie, Dock),
        200000152 => role(Genie, EventKind::Genie, AwaitingDeparture { destination: 200090400 }),
        260000110 => role(Genie, EventKind::Genie, AwaitingDeparture { destination: 200090410 }),
        200090400 => role(Genie, EventKind::Genie, EnRoute { destination: 260000100 }),
        200090410 => role(Genie, EventKind::Genie, EnRoute { destination: 200000100 }),

        103000100 | 600010001 => role(Subway, EventKind::Subway, Dock),
        600010004 => role(Subway, EventKind::Subway, AwaitingDeparture { destination: 600010005 }),
        600010002 => role(Subway, EventKind::Subway, AwaitingDeparture { destination: 600010003 }),
        600010005 => role(Subway, EventKind::Subway, EnRoute { destination: 600010001 }),
        600010003 => role(Subway, EventKind::Subway, EnRoute { destination: 103000100 }),

        _ => None,
    }
}

/// Every map with a designated area boss.
pub const AREA_BOSS_MAPS: [u32; 26] = [
    100040105, 100040106, 101030404, 104000400, 105090310, 107000300, 110040000, 200010300,
    220050000, 220050100, 220050200, 221040301, 222010310, 230020100, 240040401, 250010304,
    250010504, 251010102, 260010201, 261030000, 677000001, 677000003, 677000005, 677000007,
    677000009, 677000012,
];

/// Designated area-boss spawns, keyed by map.
pub fn area_boss_config(map: u32) -> Option<(u32, Point)> {
    let p = Point::new;
    Some(match map {
        100040105 => (5220002, p(456, 278)),
        100040106 => (5220002, p(474, 278)),
        101030404 => (3220000, p(800, 1280)),
        104000400 => (2220000, p(279, -496)),
        105090310 => (8220008, p(-626, -604)),
        107000300 => (6220000, p(90, 119)),
        110040000 => (5220001, p(-400, 140)),
        200010300 => (8220000, p(208, 83)),
        220050000 => (5220003, p(-300, 1030)),
        220050100 => (5220003, p(-385, 1030)),
        220050200 => (5220003, p(0, 1030)),
        221040301 => (6220001, p(-4224, 776)),
        222010310 => (7220001, p(-150, 33)),
        230020100 => (4220001, p(-350, 520)),
        240040401 => (8220003, p(0, 1125)),
        250010304 => (7220000, p(-450, 390)),
        250010504 => (7220002, p(150, 540)),
        251010102 => (5220004, p(560, 50)),
        260010201 => (3220001, p(645, 275)),
        261030000 => (8220002, p(-450, 180)),
        677000001 => (9400612, p(461, 61)),
        677000003 => (9400610, p(467, 0)),
        677000005 => (9400609, p(201, 80)),
        677000007 => (9400611, p(171, 50)),
        677000009 => (9400613, p(251, -841)),
        677000012 => (9400633, p(842, 0)),
        _ => return None,
    })
}

fn boss_notice(mob_id: u32) -> &'static str {
    match mob_id {
        2220000 => "A cool breeze was felt when Mano appeared.",
        3220000 => "Stumpy has appeared with a stumping sound that rings the Stone Mountain.",
        3220001 => "Deo slowly appeared out of the sand dust.",
        4220001 => "A strange shell has appeared from a grove of seaweed.",
        5220001 => "A strange turban shell has appeared on the beach.",
        5220002 => "Faust appeared amidst the blue fog.",
        5220003 => "Tick-Tock Tick-Tock! Timer makes it's presence known.",
        5220004 => "From the mists surrounding the herb garden, the gargantuous Giant Centipede appears.",
        6220000 => "The huge crocodile Dyle has come out from the swamp.",
        6220001 => "Zeno has appeared with a heavy sound of machinery.",
        7220000 => "Tae Roon has appeared with a soft whistling sound.",
        7220001 => "As the moon light dims, a long fox cry can be heard and the presence of the old fox can be felt.",
        7220002 => "The ghostly air around here has become stronger. The unpleasant sound of a cat crying can be heard.",
        8220000 => "Eliza has appeared with a black whirlwind.",
        8220002 => "Kimera has appeared out of the darkness of the underground with a glitter in her eyes.",
        8220003 => "Leviathan emerges from the canyon and the cold icy wind blows.",
        8220008 => "Slowly, a suspicious food stand opens up on a strangely remote place.",
        9400609 => "Andras has appeared.",
        9400610 => "Amdusias has appeared.",
        9400611 => "Crocell has appeared.",
        9400612 => "Marbas has appeared.",
        9400613 => "Valefor has appeared.",
        9400633 => "Astaroth has appeared.",
        _ => "An ominous presence fills the area.",
    }
}

pub struct Map {
    id: u32,
    data: Arc<GameData>,
    events: Arc<EventManager>,
    scheduler: Rc<dyn MapScheduler>,
    rng: SmallRng,

    objects: ObjectTable,
    npcs: Vec<Npc>,
    spawners: Vec<Spawner>,
    monsters: Vec<MapMonster>,
    /// Spawner indices whose monster died; respawn picks from here.
    dead: Vec<usize>,
    heap: ControllerHeap,
    players: Vec<MapPlayer>,
    respawn_timer: Option<TimerHandle>,

    reactors: Vec<Reactor>,

    dropping_batches: Vec<DroppingBatch>,
    next_dropping_id: u64,
    drop_batches: Vec<DropBatch>,
    batch_start: usize,

    occupied_seats: Vec<bool>,

    transport: Option<TransportRole>,
    boss_spawner: Option<(u32, Point, u16)>,
    boss: Option<BossMonster>,
}

impl Map {
    pub fn new(
        data: Arc<GameData>,
        events: Arc<EventManager>,
        scheduler: Rc<dyn MapScheduler>,
        id: u32,
        rng: SmallRng,
    ) -> Option<Self> {
        let info = data.map_info(id)?;

        let mut map = Self {
            id,
            objects: ObjectTable::new(),
            npcs: Vec::new(),
            spawners: Vec::new(),
            monsters: Vec::new(),
            dead: Vec::new(),
            heap: ControllerHeap::new(),
            players: Vec::new(),
            respawn_timer: None,
            reactors: Vec::new(),
            dropping_batches: Vec::new(),
            next_dropping_id: 0,
            drop_batches: Vec::new(),
            batch_start: 0,
            occupied_seats: vec![false; usize::from(info.seat_count)],
            transport: transport_role(id),
            boss_spawner: None,
            boss: None,
            rng,
            scheduler,
            events,
            data: data.clone(),
        };

        let info = data.map_info(id)?;
        for life in &info.lives {
            match life.kind {
                LifeKind::Npc => {
                    let object = map.objects.allocate()?;
                    object.kind = ObjectKind::Npc;
                    object.index = map.npcs.len();
                    let oid = object.oid;
                    map.npcs.push(Npc {
                        oid,
                        id: life.id,
                        x: life.pos.x,
                        y: life.pos.y,
                        fh: life.fh,
                        cy: life.cy,
                        rx0: life.rx0,
                        rx1: life.rx1,
                        flipped: life.flipped,
                    });
                }
                LifeKind::Mob => {
                    map.spawners.push(Spawner {
                        id: life.id,
                        pos: life.pos,
                        fh: life.fh,
                    });
                }
            }
        }

        for (index, spawner) in map.spawners.iter().enumerate() {
            let hp = data.monster_stats(spawner.id).map_or(1, |s| s.hp);
            let object = map.objects.allocate()?;
            object.kind = ObjectKind::Monster;
            object.index = index;
            map.monsters.push(MapMonster {
                oid: object.oid,
                id: spawner.id,
                pos: spawner.pos,
                fh: spawner.fh,
                stance: 0,
                hp,
                spawner_index: Some(index),
                controller: None,
                index_in_controller: 0,
            });
        }

        for reactor in &info.reactors {
            let object = map.objects.allocate()?;
            object.kind = ObjectKind::Reactor;
            object.index = map.reactors.len();
            let oid = object.oid;
            map.reactors.push(Reactor {
                oid,
                id: reactor.id,
                pos: reactor.pos,
                state: 0,
                keep_alive: false,
                respawn_hold: None,
            });
        }

        if let Some((mob_id, pos)) = area_boss_config(id) {
            let fh_id = map
                .data
                .foothold_tree(id)
                .and_then(|tree| tree.find_below(pos))
                .map_or(0, |f| f.id);
            map.boss_spawner = Some((mob_id, pos, fh_id));
            if map.events.area_boss_claim(id) {
                map.spawn_boss(false);
            }
        }

        Some(map)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Whether the room must outlive its members (a live boss or loot
    /// still in flight).
    pub fn keep_alive(&self) -> bool {
        self.boss.is_some()
            || !self.dropping_batches.is_empty()
            || self.drop_batches[self.batch_start..]
                .iter()
                .any(|b| !b.drops.is_empty())
    }

    fn broadcast(&self, packet: bytes::Bytes) {
        for player in &self.players {
            player.member.write(packet.clone());
        }
    }

    // ---- join / leave -------------------------------------------------

    /// Admits a player, announcing the whole visible state of the map to
    /// them and them to everyone else.
    pub fn join(&mut self, member: Rc<RoomMember>, handle: PlayerHandle) -> JoinOutcome {
        if let Some(role) = self.transport {
            let state = self.events.property(role.event, PROPERTY_SAILING);
            match role.stage {
                TransportStage::AwaitingDeparture { destination } if state == 2 => {
                    return JoinOutcome::Redirect { map: destination };
                }
                TransportStage::EnRoute { destination } if state != 2 => {
                    return JoinOutcome::Redirect { map: destination };
                }
                _ => {}
            }
        }

        let chr_id = member.chr_id();
        let index = self.players.len();
        handle.set(index);

        // The first player on the map adopts every live monster and arms
        // the respawn clock.
        let first = self.heap.is_empty();
        let mut adopted = Vec::new();
        if first {
            for (i, monster) in self.monsters.iter_mut().enumerate() {
                if monster.hp > 0 {
                    monster.controller = Some(index);
                    monster.index_in_controller = adopted.len();
                    adopted.push(i);
                }
            }
            self.respawn_timer = Some(self.scheduler.once(RESPAWN_INTERVAL, MapTimerEvent::Respawn));
        }

        self.players.push(MapPlayer {
            member: member.clone(),
            handle,
            heap_node: 0,
            monsters: adopted,
            drops: Vec::new(),
            droppings: Vec::new(),
        });

        let count = self.players[index].monsters.len();
        let players = &mut self.players;
        self.heap
            .push(count, index, &mut |slot, node| players[slot].heap_node = node);

        // Everyone already here, to the newcomer.
        for player in &self.players[..index] {
            let user = player.member.user();
            let pose = player.member.pose();
            member.write(packets::add_player(
                &user.borrow().chr,
                pose.0,
                pose.1,
                pose.2,
                pose.3,
            ));
        }

        for npc in &self.npcs {
            member.write(packets::spawn_npc(npc));
            member.write(packets::spawn_npc_controller(npc));
        }

        for monster in &self.monsters {
            if monster.hp > 0 {
                member.write(packets::spawn_monster(
                    monster.oid,
                    monster.id,
                    monster.pos.x,
                    monster.pos.y,
                    monster.fh,
                    false,
                ));
            }
        }
        for &i in &self.players[index].monsters {
            let monster = &self.monsters[i];
            member.write(packets::spawn_monster_controller(
                monster.oid,
                false,
                monster.id,
                monster.pos.x,
                monster.pos.y,
                monster.fh,
                false,
            ));
        }

        // Reactors still showing something; terminal-state reactors are
        // invisible until they respawn.
        for reactor in &self.reactors {
            let visible = self
                .data
                .reactor_info(reactor.id)
                .and_then(|info| info.state(reactor.state))
                .is_some_and(|state| !state.events.is_empty());
            if visible {
                member.write(packets::spawn_reactor(
                    reactor.oid,
                    reactor.id,
                    reactor.pos,
                    reactor.state,
                ));
            }
        }

        // Existing loot. Batches this character dropped before (e.g. a
        // relog) become theirs again.
        for i in self.batch_start..self.drop_batches.len() {
            let reclaim = self.drop_batches[i].owner_id == chr_id
                && !self.drop_batches[i].drops.is_empty();
            if reclaim {
                self.drop_batches[i].owner = Some(index);
                self.drop_batches[i].index_in_player = self.players[index].drops.len();
                self.players[index].drops.push(i);
            }
            for drop in &self.drop_batches[i].drops {
                self.announce_drop_to(&member, drop, self.drop_batches[i].owner_id, 2, drop.pos, 0, false);
            }
        }
        let dropping_ids: Vec<u64> = self.dropping_batches.iter().map(|b| b.id).collect();
        for id in dropping_ids {
            let Some(batch_index) = self.dropping_index(id) else {
                continue;
            };
            if self.dropping_batches[batch_index].owner_id == chr_id {
                self.dropping_batches[batch_index].owner = Some(index);
                self.dropping_batches[batch_index].index_in_player =
                    self.players[index].droppings.len();
                self.players[index].droppings.push(id);
            }
            let owner_id = self.dropping_batches[batch_index].owner_id;
            for i in 0..self.dropping_batches[batch_index].current {
                let drop = self.dropping_batches[batch_index].drops[i].clone();
                self.announce_drop_to(&member, &drop, owner_id, 2, drop.pos, 0, false);
            }
        }

        if let Some(boss) = &mut self.boss {
            member.write(packets::spawn_monster(
                boss.oid, boss.id, boss.pos.x, boss.pos.y, boss.fh, false,
            ));
            if boss.controller.is_none() {
                boss.controller = Some(index);
                member.write(packets::spawn_monster_controller(
                    boss.oid, false, boss.id, boss.pos.x, boss.pos.y, boss.fh, false,
                ));
            }
        }

        // And the newcomer to everyone else.
        {
            let user = member.user();
            let pose = member.pose();
            let packet =
                packets::add_player(&user.borrow().chr, pose.0, pose.1, pose.2, pose.3);
            for player in &self.players[..index] {
                player.member.write(packet.clone());
            }
        }

        JoinOutcome::Joined
    }

    /// Removes a player, handing their monsters to the next controller.
    pub fn leave(&mut self, handle: &PlayerHandle) {
        let index = handle.get();
        if index >= self.players.len() {
            return;
        }

        let heap_node = self.players[index].heap_node;
        {
            let players = &mut self.players;
            self.heap
                .remove(heap_node, &mut |slot, node| players[slot].heap_node = node);
        }

        let monsters = std::mem::take(&mut self.players[index].monsters);
        let drops = std::mem::take(&mut self.players[index].drops);
        let droppings = std::mem::take(&mut self.players[index].droppings);

        if let Some(next) = self.heap.top() {
            let next_member = self.players[next].member.clone();
            for &i in &monsters {
                let position = self.players[next].monsters.len();
                self.players[next].monsters.push(i);
                self.monsters[i].controller = Some(next);
                self.monsters[i].index_in_controller = position;
            }
            for &i in &self.players[next].monsters {
                let monster = &self.monsters[i];
                next_member.write(packets::spawn_monster_controller(
                    monster.oid,
                    false,
                    monster.id,
                    monster.pos.x,
                    monster.pos.y,
                    monster.fh,
                    false,
                ));
            }

            if let Some(boss) = &mut self.boss {
                if boss.controller == Some(index) {
                    boss.controller = Some(next);
                    next_member.write(packets::spawn_monster_controller(
                        boss.oid, false, boss.id, boss.pos.x, boss.pos.y, boss.fh, false,
                    ));
                }
            }
        } else {
            for &i in &monsters {
                self.monsters[i].controller = None;
            }
            if let Some(boss) = &mut self.boss {
                boss.controller = None;
            }
            self.respawn_timer = None;
        }

        for i in drops {
            self.drop_batches[i].owner = None;
        }
        for id in droppings {
            if let Some(i) = self.dropping_index(id) {
                self.dropping_batches[i].owner = None;
            }
        }

        let chr_id = self.players[index].member.chr_id();
        self.players.swap_remove(index);
        if index < self.players.len() {
            // Patch everything that referenced the relocated player.
            self.players[index].handle.set(index);
            let node = self.players[index].heap_node;
            self.heap.set_player(node, index);
            let monsters: Vec<usize> = self.players[index].monsters.clone();
            for i in monsters {
                self.monsters[i].controller = Some(index);
            }
            let drops: Vec<usize> = self.players[index].drops.clone();
            for i in drops {
                self.drop_batches[i].owner = Some(index);
            }
            let droppings: Vec<u64> = self.players[index].droppings.clone();
            for id in droppings {
                if let Some(i) = self.dropping_index(id) {
                    self.dropping_batches[i].owner = Some(index);
                }
            }
            if let Some(boss) = &mut self.boss {
                if boss.controller == Some(self.players.len()) {
                    boss.controller = Some(index);
                }
            }
        }

        self.broadcast(packets::remove_player(chr_id));
    }

    pub fn member_of(&self, handle: &PlayerHandle) -> Rc<RoomMember> {
        self.players[handle.get()].member.clone()
    }

    /// Live monster oids, oldest first. Inspection surface.
    pub fn monster_oids(&self) -> Vec<u32> {
        self.monsters
            .iter()
            .filter(|m| m.hp > 0)
            .map(|m| m.oid)
            .collect()
    }

    /// Reactor oids, in placement order. Inspection surface.
    pub fn reactor_oids(&self) -> Vec<u32> {
        self.reactors.iter().map(|r| r.oid).collect()
    }

    /// Oids of every drop currently on the ground. Inspection surface.
    pub fn drop_oids(&self) -> Vec<u32> {
        let mut oids = Vec::new();
        for batch in &self.drop_batches[self.batch_start..] {
            oids.extend(batch.drops.iter().map(|d| d.oid));
        }
        for batch in &self.dropping_batches {
            oids.extend(batch.drops[..batch.current].iter().map(|d| d.oid));
        }
        oids
    }

    /// Checks the controller bookkeeping invariant: every controlled
    /// monster appears exactly once, at the index it thinks it holds, in
    /// the array of the player it names.
    pub fn controller_invariant_holds(&self) -> bool {
        let mut referenced = 0;
        for (slot, player) in self.players.iter().enumerate() {
            for (position, &monster) in player.monsters.iter().enumerate() {
                let m = &self.monsters[monster];
                if m.controller != Some(slot) || m.index_in_controller != position {
                    return false;
                }
                referenced += 1;
            }
        }
        let controlled = self
            .monsters
            .iter()
            .filter(|m| m.controller.is_some())
            .count();
        referenced == controlled
    }

    // ---- monsters -----------------------------------------------------

    pub fn monster_exists(&mut self, oid: u32, mob_id: u32) -> bool {
        let Some(object) = self.objects.get(oid) else {
            return false;
        };
        match object.kind {
            ObjectKind::Monster => {
                let index = object.index;
                self.monsters[index].id == mob_id && self.monsters[index].hp > 0
            }
            ObjectKind::Boss => self.boss.as_ref().is_some_and(|b| b.id == mob_id && b.hp > 0),
            _ => false,
        }
    }

    pub fn is_monster(&mut self, oid: u32) -> bool {
        self.objects
            .get(oid)
            .is_some_and(|o| matches!(o.kind, ObjectKind::Monster | ObjectKind::Boss))
    }

    pub fn npc_id(&mut self, oid: u32) -> Option<u32> {
        let object = self.objects.get(oid)?;
        if object.kind != ObjectKind::Npc {
            return None;
        }
        let index = object.index;
        Some(self.npcs[index].id)
    }

    pub fn npcs(&self) -> &[Npc] {
        &self.npcs
    }

    /// Applies one attack's hits on `oid` by the player at `attacker`.
    ///
    /// Control moves to the attacker if someone else held it. When the
    /// monster dies, loot is rolled and dropped; the corpse is removed
    /// immediately unless a multi-drop batch still needs it as the drop
    /// origin.
    pub fn damage_monster_by(
        &mut self,
        attacker: &PlayerHandle,
        oid: u32,
        damage: &[i32],
    ) -> DamageOutcome {
        let attacker = attacker.get();
        let Some(object) = self.objects.get(oid) else {
            return DamageOutcome::Invalid;
        };
        let object = *object;
        if !matches!(object.kind, ObjectKind::Monster | ObjectKind::Boss) {
            return DamageOutcome::Invalid;
        }

        let is_boss = object.kind == ObjectKind::Boss;
        let (hp, max_hp, mob_id, pos) = if is_boss {
            let Some(boss) = &self.boss else {
                return DamageOutcome::Invalid;
            };
            (
                boss.hp,
                self.data.monster_stats(boss.id).map_or(boss.hp, |s| s.hp),
                boss.id,
                boss.pos,
            )
        } else {
            let monster = &self.monsters[object.index];
            (
                monster.hp,
                self.data.monster_stats(monster.id).map_or(monster.hp, |s| s.hp),
                monster.id,
                monster.pos,
            )
        };
        if hp <= 0 {
            return DamageOutcome::Invalid;
        }

        self.switch_controller(&object, attacker);

        let mut hp = hp;
        for &hit in damage {
            if hp <= 0 {
                break;
            }
            hp -= hit;
        }
        let hp = hp.max(0);
        if is_boss {
            if let Some(boss) = &mut self.boss {
                boss.hp = hp;
            }
        } else {
            self.monsters[object.index].hp = hp;
        }

        let percent = ((i64::from(hp) * 100 / i64::from(max_hp.max(1))).clamp(0, 100)) as u8;
        self.players[attacker]
            .member
            .write(packets::monster_hp(oid, percent));

        if hp > 0 {
            return DamageOutcome::Damaged;
        }

        // Dead: detach from its controller before the loot pipeline runs.
        self.detach_controller(&object);

        let table = self.data.monster_drops(mob_id).cloned();
        let drop_count = match table {
            Some(table) => {
                let drops = self.roll_drops(&table);
                let count = drops.len();
                self.create_drop_batch(Some(attacker), object, pos, drops);
                count
            }
            None => 0,
        };
        if drop_count <= 1 {
            self.kill_monster(oid);
        }

        DamageOutcome::Killed { mob_id }
    }

    /// Kills every live monster on behalf of `player` (script surface).
    pub fn kill_all_by(&mut self, player: &PlayerHandle) -> Vec<u32> {
        let oids: Vec<(u32, i32)> = self
            .monsters
            .iter()
            .filter(|m| m.hp > 0)
            .map(|m| (m.oid, m.hp))
            .collect();

        let mut killed = Vec::new();
        for (oid, hp) in oids {
            if let DamageOutcome::Killed { mob_id } = self.damage_monster_by(player, oid, &[hp]) {
                killed.push(mob_id);
            }
        }
        killed
    }

    /// Accepts a controller's movement report for its monster.
    pub fn move_monster(
        &mut self,
        controller: &PlayerHandle,
        oid: u32,
        x: i16,
        y: i16,
        fh: u16,
        stance: u8,
    ) -> bool {
        let index = controller.get();
        let Some(object) = self.objects.get(oid) else {
            return false;
        };
        let object = *object;
        match object.kind {
            ObjectKind::Monster => {
                let monster = &mut self.monsters[object.index];
                if monster.hp <= 0 || monster.controller != Some(index) {
                    return false;
                }
                monster.pos = Point::new(x, y);
                monster.fh = fh;
                monster.stance = stance;
                true
            }
            ObjectKind::Boss => match &mut self.boss {
                Some(boss) if boss.controller == Some(index) && boss.hp > 0 => {
                    boss.pos = Point::new(x, y);
                    boss.fh = fh;
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }

    fn switch_controller(&mut self, object: &MapObject, attacker: usize) {
        if object.kind == ObjectKind::Boss {
            let Some(boss) = &mut self.boss else {
                return;
            };
            if boss.controller == Some(attacker) {
                return;
            }
            let old = boss.controller.replace(attacker);
            let (oid, id, pos, fh) = (boss.oid, boss.id, boss.pos, boss.fh);
            if let Some(old) = old {
                self.players[old]
                    .member
                    .write(packets::remove_monster_controller(oid));
            }
            self.players[attacker].member.write(
                packets::spawn_monster_controller(oid, false, id, pos.x, pos.y, fh, false),
            );
            return;
        }

        let index = object.index;
        if self.monsters[index].controller == Some(attacker) {
            return;
        }

        let old = self.monsters[index].controller;
        if let Some(old) = old {
            // Swap-with-last inside the old controller's array.
            let position = self.monsters[index].index_in_controller;
            let list = &mut self.players[old].monsters;
            list.swap_remove(position);
            if position < list.len() {
                let moved = list[position];
                self.monsters[moved].index_in_controller = position;
            }
        }

        let position = self.players[attacker].monsters.len();
        self.players[attacker].monsters.push(index);
        self.monsters[index].controller = Some(attacker);
        self.monsters[index].index_in_controller = position;

        let (oid, id, pos, fh) = {
            let m = &self.monsters[index];
            (m.oid, m.id, m.pos, m.fh)
        };
        if let Some(old) = old {
            self.players[old]
                .member
                .write(packets::remove_monster_controller(oid));
        }
        self.players[attacker]
            .member
            .write(packets::spawn_monster_controller(
                oid, false, id, pos.x, pos.y, fh, false,
            ));
    }

    fn detach_controller(&mut self, object: &MapObject) {
        if object.kind == ObjectKind::Boss {
            if let Some(boss) = &mut self.boss {
                boss.controller = None;
            }
            return;
        }

        let index = object.index;
        if let Some(controller) = self.monsters[index].controller.take() {
            let position = self.monsters[index].index_in_controller;
            let list = &mut self.players[controller].monsters;
            list.swap_remove(position);
            if position < list.len() {
                let moved = list[position];
                self.monsters[moved].index_in_controller = position;
            }
        }
    }

    /// Removes a dead monster from the map and tells everyone.
    fn kill_monster(&mut self, oid: u32) {
        let Some(object) = self.objects.get(oid) else {
            return;
        };
        let object = *object;
        match object.kind {
            ObjectKind::Monster => {
                let index = object.index;
                if let Some(spawner) = self.monsters[index].spawner_index {
                    self.dead.push(spawner);
                }
                self.monsters.swap_remove(index);
                if index < self.monsters.len() {
                    let moved_oid = self.monsters[index].oid;
                    if let Some(moved) = self.objects.get(moved_oid) {
                        moved.index = index;
                    }
                    if let Some(controller) = self.monsters[index].controller {
                        let position = self.monsters[index].index_in_controller;
                        self.players[controller].monsters[position] = index;
                    }
                }
                self.objects.free(oid);
                self.broadcast(packets::kill_monster(oid, true));
            }
            ObjectKind::Boss => {
                self.objects.free(oid);
                self.boss = None;
                self.broadcast(packets::kill_monster(oid, true));
            }
            _ => {}
        }
    }

    // ---- respawn ------------------------------------------------------

    fn respawn(&mut self) {
        let target = ((0.7 + 0.05 * (self.players.len().min(6) as f64))
            * self.spawners.len() as f64)
            .ceil() as usize;

        let Some(controller) = self.heap.top() else {
            return;
        };

        let mut spawned = Vec::new();
        while self.monsters.len() < target && !self.dead.is_empty() {
            let pick = self.rng.gen_range(0..self.dead.len());
            let spawner_index = self.dead.swap_remove(pick);
            let spawner = &self.spawners[spawner_index];
            let hp = self.data.monster_stats(spawner.id).map_or(1, |s| s.hp);

            let Some(object) = self.objects.allocate() else {
                warn!(map = self.id, "object ids exhausted during respawn");
                self.dead.push(spawner_index);
                break;
            };
            object.kind = ObjectKind::Monster;
            object.index = self.monsters.len();
            let oid = object.oid;

            let position = self.players[controller].monsters.len();
            self.players[controller].monsters.push(self.monsters.len());
            self.monsters.push(MapMonster {
                oid,
                id: spawner.id,
                pos: spawner.pos,
                fh: spawner.fh,
                stance: 0,
                hp,
                spawner_index: Some(spawner_index),
                controller: Some(controller),
                index_in_controller: position,
            });
            spawned.push(self.monsters.len() - 1);
        }

        if !spawned.is_empty() {
            let players = &mut self.players;
            self.heap
                .inc(spawned.len(), &mut |slot, node| players[slot].heap_node = node);

            for &i in &spawned {
                let m = &self.monsters[i];
                self.broadcast(packets::spawn_monster(
                    m.oid, m.id, m.pos.x, m.pos.y, m.fh, true,
                ));
            }
            let member = self.players[controller].member.clone();
            for &i in &spawned {
                let m = &self.monsters[i];
                member.write(packets::spawn_monster_controller(
                    m.oid, false, m.id, m.pos.x, m.pos.y, m.fh, true,
                ));
            }
        }

        self.respawn_timer = Some(self.scheduler.once(RESPAWN_INTERVAL, MapTimerEvent::Respawn));
    }

    // ---- boss ---------------------------------------------------------

    fn spawn_boss(&mut self, announce: bool) {
        let Some((mob_id, pos, fh)) = self.boss_spawner else {
            return;
        };
        let hp = self.data.monster_stats(mob_id).map_or(1, |s| s.hp);
        let Some(object) = self.objects.allocate() else {
            return;
        };
        object.kind = ObjectKind::Boss;
        let oid = object.oid;

        let controller = self.heap.top();
        self.boss = Some(BossMonster {
            oid,
            id: mob_id,
            pos,
            fh,
            hp,
            controller,
        });

        self.broadcast(packets::spawn_monster(oid, mob_id, pos.x, pos.y, fh, true));
        if let Some(controller) = controller {
            self.players[controller]
                .member
                .write(packets::spawn_monster_controller(
                    oid, false, mob_id, pos.x, pos.y, fh, true,
                ));
        }
        if announce {
            self.broadcast(packets::server_notice(boss_notice(mob_id)));
        }
    }

    /// Area-boss reset: re-register and respawn the boss if it is gone.
    pub fn on_area_boss_reset(&mut self) {
        if self.boss_spawner.is_some() && self.events.area_boss_claim(self.id) && self.boss.is_none()
        {
            self.spawn_boss(true);
        }
    }

    // ---- reactors -----------------------------------------------------

    /// Advances a reactor's state machine on a client hit.
    pub fn hit_reactor(&mut self, oid: u32, stance: u8) -> ReactorHitOutcome {
        let Some(object) = self.objects.get(oid) else {
            return ReactorHitOutcome::Invalid;
        };
        if object.kind != ObjectKind::Reactor {
            return ReactorHitOutcome::Invalid;
        }
        let index = object.index;

        let reactor_id = self.reactors[index].id;
        let Some(info) = self.data.reactor_info(reactor_id) else {
            return ReactorHitOutcome::Handled;
        };

        let state = self.reactors[index].state;
        if info.state(state).map_or(true, |s| s.events.is_empty()) {
            return ReactorHitOutcome::Handled;
        }
        let Some(next) = info.hit_transition(state) else {
            return ReactorHitOutcome::Handled;
        };

        self.reactors[index].state = next;
        if info.state(next).is_some_and(|s| !s.events.is_empty()) {
            let reactor = &self.reactors[index];
            self.broadcast(packets::change_reactor_state(
                reactor.oid,
                reactor.state,
                reactor.pos,
                stance,
            ));
            return ReactorHitOutcome::Handled;
        }

        match &info.action {
            Some(action) => ReactorHitOutcome::Broken {
                action: action.clone(),
            },
            // A terminal state with no script destroys the reactor
            // outright.
            None => {
                self.destroy_reactor(oid);
                ReactorHitOutcome::Handled
            }
        }
    }

    pub fn reactor_keep_alive(&mut self, oid: u32) -> bool {
        match self.objects.get(oid) {
            Some(object) if object.kind == ObjectKind::Reactor => {
                let index = object.index;
                self.reactors[index].keep_alive
            }
            _ => false,
        }
    }

    /// Breaks a reactor: despawns it client-side and arms the respawn.
    pub fn destroy_reactor(&mut self, oid: u32) {
        let Some(object) = self.objects.get(oid) else {
            return;
        };
        if object.kind != ObjectKind::Reactor {
            return;
        }
        let index = object.index;
        let reactor = &self.reactors[index];
        self.broadcast(packets::destroy_reactor(oid, reactor.state, reactor.pos));
        // The record stays; the timer resets it to state 0.
        let respawn = self
            .scheduler
            .once(REACTOR_RESPAWN_INTERVAL, MapTimerEvent::RespawnReactor(oid));
        self.reactors[index].respawn_hold = Some(respawn);
    }

    fn respawn_reactor(&mut self, oid: u32) {
        let Some(object) = self.objects.get(oid) else {
            return;
        };
        if object.kind != ObjectKind::Reactor {
            return;
        }
        let index = object.index;
        let reactor = &mut self.reactors[index];
        reactor.state = 0;
        reactor.keep_alive = false;
        reactor.respawn_hold = None;
        let packet = packets::spawn_reactor(reactor.oid, reactor.id, reactor.pos, 0);
        self.broadcast(packet);
    }

    // ---- loot ---------------------------------------------------------

    /// Rolls a drop table into concrete drops, applying the server rate.
    fn roll_drops(&mut self, table: &DropTable) -> Vec<MapDrop> {
        const SERVER_RATE: i32 = 16;
        const SCALE: i32 = 1_000_000;

        let mut drops = Vec::new();
        for entry in &table.entries {
            let chance = entry.chance.saturating_mul(SERVER_RATE);
            let guaranteed = chance / SCALE;
            let residual = chance % SCALE;
            let extra = i32::from(self.rng.gen_range(0..SCALE) < residual);

            let amount = |rng: &mut SmallRng| {
                if entry.max > entry.min {
                    rng.gen_range(entry.min..=entry.max)
                } else {
                    entry.min
                }
            };

            if entry.item_id == 0 {
                // Meso entries never multiply: one guaranteed pile at most.
                for _ in 0..(guaranteed.min(1) + extra) {
                    let value = amount(&mut self.rng);
                    drops.push(MapDrop {
                        oid: 0,
                        pos: Point::default(),
                        payload: DropPayload::Meso(value),
                    });
                }
            } else if entry.item_id / 1_000_000 == 1 {
                for _ in 0..(guaranteed + extra) {
                    let Some(info) = self.data.equip_info(entry.item_id) else {
                        continue;
                    };
                    drops.push(MapDrop {
                        oid: 0,
                        pos: Point::default(),
                        payload: DropPayload::Equip(Equipment::from_template(info)),
                    });
                }
            } else {
                for _ in 0..(guaranteed + extra) {
                    let quantity = amount(&mut self.rng).clamp(1, i32::from(i16::MAX)) as i16;
                    drops.push(MapDrop {
                        oid: 0,
                        pos: Point::default(),
                        payload: DropPayload::Item {
                            quest: entry.quest_id,
                            stack: ItemStack::new(entry.item_id, quantity),
                        },
                    });
                }
            }
        }
        drops
    }

    /// Landing position for a drop: snap `(x, y - 85)` onto the foothold
    /// below.
    fn drop_position(&self, p: Point) -> Point {
        match self.foothold_below(p) {
            Some(snapped) => snapped,
            None => p,
        }
    }

    fn foothold_below(&self, p: Point) -> Option<Point> {
        let tree = self.data.foothold_tree(self.id)?;
        let fh = tree.find_below(p)?;
        Some(Point::new(p.x, fh.y_at(p.x)?))
    }

    /// Lays a freshly rolled batch on the ground. Single drops settle
    /// immediately; larger batches appear one drop at a time and keep the
    /// dropper alive until the last one lands.
    fn create_drop_batch(
        &mut self,
        owner: Option<usize>,
        dropper: MapObject,
        origin: Point,
        mut drops: Vec<MapDrop>,
    ) {
        let count = drops.len();
        for (i, drop) in drops.iter_mut().enumerate() {
            let x = origin.x.saturating_add(((i as i32 - (count / 2) as i32) * 25) as i16);
            let p = Point::new(x, origin.y - 85);
            drop.pos = self.drop_position(p);
        }

        let owner_id = owner.map_or(0, |i| self.players[i].member.chr_id());

        if count > 1 {
            let id = self.next_dropping_id;
            self.next_dropping_id += 1;

            // The first drop lands immediately.
            let Some(object) = self.objects.allocate() else {
                return;
            };
            object.kind = ObjectKind::Dropping;
            object.index = self.dropping_batches.len();
            object.index2 = 0;
            drops[0].oid = object.oid;

            let timer = self.scheduler.once(NEXT_DROP_INTERVAL, MapTimerEvent::NextDrop(id));
            let first = drops[0].clone();

            if let Some(owner) = owner {
                let position = self.players[owner].droppings.len();
                self.players[owner].droppings.push(id);
                self.dropping_batches.push(DroppingBatch {
                    id,
                    drops,
                    current: 1,
                    timer: Some(timer),
                    owner: Some(owner),
                    index_in_player: position,
                    owner_id,
                    dropper_oid: dropper.oid,
                });
            } else {
                self.dropping_batches.push(DroppingBatch {
                    id,
                    drops,
                    current: 1,
                    timer: Some(timer),
                    owner: None,
                    index_in_player: 0,
                    owner_id,
                    dropper_oid: dropper.oid,
                });
            }

            // Loot triggered from a reactor script must not let the script
            // destroy the reactor while drops are still falling.
            if dropper.kind == ObjectKind::Reactor {
                self.reactors[dropper.index].keep_alive = true;
            }

            self.announce_drop(&first, owner_id, 1, origin, dropper.oid, false);
            self.try_auto_pickup(owner, &first);
        } else if count == 1 {
            let Some(object) = self.objects.allocate() else {
                return;
            };
            object.kind = ObjectKind::Drop;
            object.index = self.drop_batches.len();
            object.index2 = 0;
            drops[0].oid = object.oid;
            let first = drops[0].clone();

            let timer = self
                .scheduler
                .once(EXCLUSIVE_INTERVAL, MapTimerEvent::ExclusiveExpired);
            let batch_index = self.drop_batches.len();
            let index_in_player = owner.map_or(0, |i| self.players[i].drops.len());
            if let Some(owner) = owner {
                self.players[owner].drops.push(batch_index);
            }
            self.drop_batches.push(DropBatch {
                drops,
                timer: Some(timer),
                owner,
                index_in_player,
                owner_id,
                exclusive: true,
            });

            self.announce_drop(&first, owner_id, 1, origin, dropper.oid, false);
            self.try_auto_pickup(owner, &first);
        }
    }

    /// A player dropping something from their inventory: a settled,
    /// never-exclusive batch with the full five-minute lifetime.
    pub fn add_player_drop(&mut self, player: &PlayerHandle, payload: DropPayload) {
        let index = player.get();
        let member = self.players[index].member.clone();
        let origin = {
            let pose = member.pose();
            Point::new(pose.0, pose.1)
        };
        let pos = self.drop_position(Point::new(origin.x, origin.y - 85));

        let Some(object) = self.objects.allocate() else {
            return;
        };
        object.kind = ObjectKind::Drop;
        object.index = self.drop_batches.len();
        object.index2 = 0;
        let drop = MapDrop {
            oid: object.oid,
            pos,
            payload,
        };

        let timer = self
            .scheduler
            .once(PLAYER_DROP_INTERVAL, MapTimerEvent::DropExpired);
        let batch_index = self.drop_batches.len();
        let index_in_player = self.players[index].drops.len();
        self.players[index].drops.push(batch_index);
        let owner_id = member.chr_id();
        self.drop_batches.push(DropBatch {
            drops: vec![drop.clone()],
            timer: Some(timer),
            owner: Some(index),
            index_in_player,
            owner_id,
            exclusive: false,
        });

        self.announce_drop(&drop, owner_id, 2, origin, owner_id, true);
    }

    /// Loot a reactor script shakes out of its reactor.
    pub fn drop_from_reactor(&mut self, player: &PlayerHandle, reactor_oid: u32) {
        let Some(object) = self.objects.get(reactor_oid) else {
            return;
        };
        let object = *object;
        if object.kind != ObjectKind::Reactor {
            return;
        }
        let reactor_id = self.reactors[object.index].id;
        let pos = self.reactors[object.index].pos;
        let Some(table) = self.data.reactor_drops(reactor_id).cloned() else {
            return;
        };
        let drops = self.roll_drops(&table);
        self.create_drop_batch(Some(player.get()), object, pos, drops);
    }

    pub fn drop(&mut self, oid: u32) -> Option<MapDrop> {
        let object = self.objects.get(oid)?;
        let object = *object;
        match object.kind {
            ObjectKind::Drop => Some(self.drop_batches[object.index].drops[object.index2].clone()),
            ObjectKind::Dropping => {
                Some(self.dropping_batches[object.index].drops[object.index2].clone())
            }
            _ => None,
        }
    }

    /// Exclusivity check: a still-falling batch only serves its owner; a
    /// settled one opens up once the exclusive window lapses.
    pub fn can_pick_up(&mut self, player: &PlayerHandle, oid: u32) -> bool {
        let chr_id = self.players[player.get()].member.chr_id();
        let Some(object) = self.objects.get(oid) else {
            return false;
        };
        let object = *object;
        match object.kind {
            ObjectKind::Dropping => self.dropping_batches[object.index].owner_id == chr_id,
            ObjectKind::Drop => {
                let batch = &self.drop_batches[object.index];
                batch.owner_id == chr_id || !batch.exclusive
            }
            _ => false,
        }
    }

    /// Removes a drop (picked up by `chr_id`) and announces the pickup.
    pub fn remove_drop(&mut self, chr_id: u32, oid: u32) {
        let Some(object) = self.objects.get(oid) else {
            return;
        };
        let object = *object;

        match object.kind {
            ObjectKind::Drop => {
                let batch_index = object.index;
                let drop_index = object.index2;
                self.objects.free(oid);

                let batch = &mut self.drop_batches[batch_index];
                batch.drops.swap_remove(drop_index);
                if drop_index < batch.drops.len() {
                    let moved_oid = batch.drops[drop_index].oid;
                    if let Some(moved) = self.objects.get(moved_oid) {
                        moved.index2 = drop_index;
                    }
                }

                if self.drop_batches[batch_index].drops.is_empty() {
                    self.drop_batches[batch_index].timer = None;
                    self.detach_batch_owner(batch_index);
                    self.compact_drop_ring();
                }
            }
            ObjectKind::Dropping => {
                let batch_index = object.index;
                let drop_index = object.index2;
                self.objects.free(oid);

                let batch = &mut self.dropping_batches[batch_index];
                // Pull the last *landed* drop into the gap, then slide the
                // last unlanded one into the freed landed slot.
                batch.drops[drop_index] = batch.drops[batch.current - 1].clone();
                if drop_index != batch.current - 1 {
                    let moved_oid = batch.drops[drop_index].oid;
                    if let Some(moved) = self.objects.get(moved_oid) {
                        moved.index2 = drop_index;
                    }
                }
                let batch = &mut self.dropping_batches[batch_index];
                batch.current -= 1;
                let last = batch.drops.len() - 1;
                batch.drops.swap(batch.current, last);
                batch.drops.pop();
            }
            _ => return,
        }

        self.broadcast(packets::pickup_drop(oid, false, chr_id));
    }

    /// Vacuum every drop this player could pick up right now.
    pub fn pick_up_all(&mut self, player: &PlayerHandle) {
        let index = player.get();
        let chr_id = self.players[index].member.chr_id();
        let mut oids = Vec::new();
        for i in self.batch_start..self.drop_batches.len() {
            let batch = &self.drop_batches[i];
            if batch.owner_id == chr_id || !batch.exclusive {
                oids.extend(batch.drops.iter().map(|d| d.oid));
            }
        }
        for batch in &self.dropping_batches {
            if batch.owner_id == chr_id {
                oids.extend(batch.drops[..batch.current].iter().map(|d| d.oid));
            }
        }

        for oid in oids {
            let member = self.players[player.get()].member.clone();
            let Some(drop) = self.drop(oid) else {
                continue;
            };
            if member.auto_pickup(&drop) {
                self.remove_drop(chr_id, oid);
            }
        }
    }

    fn try_auto_pickup(&mut self, owner: Option<usize>, drop: &MapDrop) {
        let Some(owner) = owner else {
            return;
        };
        let member = self.players[owner].member.clone();
        if member.auto_pickup_enabled() && member.auto_pickup(drop) {
            self.remove_drop(member.chr_id(), drop.oid);
        }
    }

    fn detach_batch_owner(&mut self, batch_index: usize) {
        let Some(owner) = self.drop_batches[batch_index].owner.take() else {
            return;
        };
        let position = self.drop_batches[batch_index].index_in_player;
        let list = &mut self.players[owner].drops;
        list.swap_remove(position);
        if position < list.len() {
            let moved_batch = list[position];
            self.drop_batches[moved_batch].index_in_player = position;
        }
    }

    /// Advances the ring start past drained batches and compacts the
    /// backing storage when it runs mostly empty.
    fn compact_drop_ring(&mut self) {
        while self.batch_start < self.drop_batches.len()
            && self.drop_batches[self.batch_start].drops.is_empty()
        {
            self.batch_start += 1;
        }

        let live = self.drop_batches.len() - self.batch_start;
        if self.batch_start > 0 && live < self.drop_batches.capacity() / 4 {
            self.drop_batches.drain(..self.batch_start);
            self.batch_start = 0;
            self.drop_batches.shrink_to(live.max(1) * 2);

            for i in 0..self.drop_batches.len() {
                for j in 0..self.drop_batches[i].drops.len() {
                    let oid = self.drop_batches[i].drops[j].oid;
                    if let Some(object) = self.objects.get(oid) {
                        object.index = i;
                    }
                }
                if let Some(owner) = self.drop_batches[i].owner {
                    let position = self.drop_batches[i].index_in_player;
                    self.players[owner].drops[position] = i;
                }
            }
        }
    }

    fn dropping_index(&self, id: u64) -> Option<usize> {
        self.dropping_batches.iter().position(|b| b.id == id)
    }

    /// Announces a drop to everyone allowed to see it; quest-exclusive
    /// items only reach members holding the quest.
    fn announce_drop(
        &self,
        drop: &MapDrop,
        owner_id: u32,
        mode: u8,
        origin: Point,
        dropper_oid: u32,
        player_drop: bool,
    ) {
        for player in &self.players {
            self.announce_drop_to(
                &player.member,
                drop,
                owner_id,
                mode,
                origin,
                dropper_oid,
                player_drop,
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn announce_drop_to(
        &self,
        member: &RoomMember,
        drop: &MapDrop,
        owner_id: u32,
        mode: u8,
        origin: Point,
        dropper_oid: u32,
        player_drop: bool,
    ) {
        if let DropPayload::Item { stack, .. } = &drop.payload {
            let quest_locked = self
                .data
                .item_info(stack.item_id)
                .is_some_and(|info| info.quest);
            if quest_locked && !member.has_quest_item(stack.item_id) {
                return;
            }
        }

        let mode = if member.chr_id() == owner_id { 2 } else { mode };
        member.write(packets::drop_object(
            drop,
            owner_id,
            mode,
            origin,
            dropper_oid,
            player_drop,
        ));
        member.add_visible(drop.oid);
    }

    // ---- timers -------------------------------------------------------

    pub fn handle_timer(&mut self, event: MapTimerEvent) {
        match event {
            MapTimerEvent::Respawn => self.respawn(),
            MapTimerEvent::ExclusiveExpired => self.on_exclusive_expired(),
            MapTimerEvent::DropExpired => self.on_drop_expired(),
            MapTimerEvent::NextDrop(id) => self.on_next_drop(id),
            MapTimerEvent::RespawnReactor(oid) => self.respawn_reactor(oid),
        }
    }

    /// The oldest exclusive batch goes public and starts its despawn
    /// countdown.
    fn on_exclusive_expired(&mut self) {
        let found = self.drop_batches[self.batch_start..]
            .iter()
            .position(|b| b.exclusive)
            .map(|i| i + self.batch_start);
        let Some(index) = found else {
            return;
        };
        self.drop_batches[index].exclusive = false;
        self.drop_batches[index].timer =
            Some(self.scheduler.once(EXPIRE_INTERVAL, MapTimerEvent::DropExpired));
    }

    /// The batch at the ring's front despawns.
    fn on_drop_expired(&mut self) {
        if self.batch_start >= self.drop_batches.len() {
            return;
        }
        let index = self.batch_start;

        let drops = std::mem::take(&mut self.drop_batches[index].drops);
        for drop in &drops {
            self.broadcast(packets::remove_drop(drop.oid));
        }
        for drop in &drops {
            self.objects.free(drop.oid);
        }
        self.drop_batches[index].timer = None;
        self.detach_batch_owner(index);
        self.compact_drop_ring();
    }

    /// The next drop of a still-falling batch lands. The last one
    /// converts the batch into a settled exclusive batch and finally
    /// destroys the dropper.
    fn on_next_drop(&mut self, id: u64) {
        let Some(batch_index) = self.dropping_index(id) else {
            return;
        };

        let current = self.dropping_batches[batch_index].current;
        let Some(object) = self.objects.allocate() else {
            return;
        };
        object.kind = ObjectKind::Dropping;
        object.index = batch_index;
        object.index2 = current;
        let oid = object.oid;

        let (drop, owner, owner_id, dropper_oid) = {
            let batch = &mut self.dropping_batches[batch_index];
            batch.drops[current].oid = oid;
            batch.current += 1;
            (
                batch.drops[current].clone(),
                batch.owner,
                batch.owner_id,
                batch.dropper_oid,
            )
        };

        let origin = drop.pos;
        self.announce_drop(&drop, owner_id, 1, origin, dropper_oid, false);

        let more_to_come = {
            let batch = &self.dropping_batches[batch_index];
            batch.current < batch.drops.len()
        };
        if more_to_come {
            self.try_auto_pickup(owner, &drop);
            if let Some(batch_index) = self.dropping_index(id) {
                self.dropping_batches[batch_index].timer =
                    Some(self.scheduler.once(NEXT_DROP_INTERVAL, MapTimerEvent::NextDrop(id)));
            }
            return;
        }

        // Batch complete: convert to a settled exclusive batch.
        let Some(batch_index) = self.dropping_index(id) else {
            return;
        };
        let mut batch = self.dropping_batches.swap_remove(batch_index);
        batch.timer = None;
        if batch_index < self.dropping_batches.len() {
            for i in 0..self.dropping_batches[batch_index].current {
                let moved_oid = self.dropping_batches[batch_index].drops[i].oid;
                if let Some(object) = self.objects.get(moved_oid) {
                    object.index = batch_index;
                }
            }
        }

        if let Some(owner) = batch.owner {
            let position = batch.index_in_player;
            let list = &mut self.players[owner].droppings;
            list.swap_remove(position);
            if position < list.len() {
                let moved_id = list[position];
                if let Some(moved) = self.dropping_index(moved_id) {
                    self.dropping_batches[moved].index_in_player = position;
                }
            }
        }

        let new_index = self.drop_batches.len();
        for (i, drop) in batch.drops.iter().enumerate() {
            if let Some(object) = self.objects.get(drop.oid) {
                object.kind = ObjectKind::Drop;
                object.index = new_index;
                object.index2 = i;
            }
        }

        let index_in_player = batch.owner.map_or(0, |o| self.players[o].drops.len());
        if let Some(owner) = batch.owner {
            self.players[owner].drops.push(new_index);
        }
        let final_drop = batch.drops.last().cloned();
        self.drop_batches.push(DropBatch {
            drops: batch.drops,
            timer: Some(
                self.scheduler
                    .once(EXCLUSIVE_INTERVAL, MapTimerEvent::ExclusiveExpired),
            ),
            owner: batch.owner,
            index_in_player,
            owner_id: batch.owner_id,
            exclusive: true,
        });

        // The dropper finally goes: a reactor held alive by its loot, or
        // the monster whose kill was deferred.
        if let Some(object) = self.objects.get(batch.dropper_oid) {
            let kind = object.kind;
            match kind {
                ObjectKind::Reactor => self.destroy_reactor(batch.dropper_oid),
                ObjectKind::Monster | ObjectKind::Boss => self.kill_monster(batch.dropper_oid),
                _ => {}
            }
        }

        // Auto pickup of the final drop runs only after the batch has
        // settled and the dropper is gone.
        if let Some(drop) = final_drop {
            self.try_auto_pickup(batch.owner, &drop);
        }
    }

    // ---- seats --------------------------------------------------------

    pub fn seat_count(&self) -> u16 {
        self.occupied_seats.len() as u16
    }

    pub fn try_occupy_seat(&mut self, seat: u16) -> bool {
        match self.occupied_seats.get_mut(usize::from(seat)) {
            Some(occupied) if !*occupied => {
                *occupied = true;
                true
            }
            _ => false,
        }
    }

    pub fn release_seat(&mut self, seat: u16) {
        if let Some(occupied) = self.occupied_seats.get_mut(usize::from(seat)) {
            *occupied = false;
        }
    }

    // ---- transports ---------------------------------------------------

    /// Reacts to the map's transport event property changing.
    pub fn handle_transport_change(&mut self) {
        let Some(role) = self.transport else {
            return;
        };
        let state = self.events.property(role.event, PROPERTY_SAILING);

        match role.stage {
            TransportStage::Dock => {
                if state == 1 {
                    return;
                }
                let packet = match role.kind {
                    TransportKind::Subway => packets::play_sound("subway/whistle"),
                    _ => packets::boat(state == 0),
                };
                self.broadcast(packet);
            }
            TransportStage::AwaitingDeparture { destination } => {
                if state == 2 {
                    for player in &self.players {
                        player.member.close_script();
                        player.member.request_warp(destination, 0);
                    }
                }
            }
            TransportStage::EnRoute { destination } => {
                if state == 0 {
                    for player in &self.players {
                        player.member.close_script();
                        player.member.request_warp(destination, 0);
                    }
                }
            }
        }
    }
}
